use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::heap::{Heap, ValueId};
use crate::list;
use crate::node::{self, Printed, Value};
use crate::reader;
use crate::vm::Error;

/// Built-in operators. The discriminants are the stable indices stored in
/// `Value::Operator`; changing them changes the meaning of every parsed
/// operator atom.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Op {
    Quote = 0,
    Car = 1,
    Cdr = 2,
    AtomQ = 3,
    EqQ = 4,
    Cons = 5,
    Cond = 6,
    Assoc = 7,
    Subst = 8,
    NullQ = 9,
    PairQ = 10,
    CharQ = 11,
    BooleanQ = 12,
    StringQ = 13,
    NumberQ = 14,
    IntegerQ = 15,
    RealQ = 16,
    IntegerToReal = 17,
    RealToInteger = 18,
    IntegerToChar = 19,
    CharToInteger = 20,
    NumberToString = 21,
    StringToNumber = 22,
    StringToData = 23,
    DataToString = 24,
    Not = 25,
    Display = 26,
    Write = 27,
    Newline = 28,
    Plus = 29,
    Minus = 30,
    Times = 31,
    Divide = 32,
    Less = 33,
    Equal = 34,
    Bigger = 35,
    LessEqual = 36,
    BiggerEqual = 37,
    And = 38,
    Or = 39,
    Begin = 40,
    Define = 41,
    SetE = 42,
    Eval = 43,
    Lambda = 44,
    Macro = 45,
    Closure = 46,
    Apply = 47,
    Read = 48,
    CurrentEnvironment = 49,
    Load = 50,
    Unload = 51,
    MemAlloc = 52,
    MemRead = 53,
    MemWrite = 54,
    MemFill = 55,
    MemCopy = 56,
    MemAddr = 57,
}

/// Operator names, indexed by discriminant. This list is the external
/// surface: the reader resolves any matching token to an operator atom.
pub const OPERATOR_NAMES: [&str; 58] = [
    "quote",
    "car",
    "cdr",
    "atom?",
    "eq?",
    "cons",
    "cond",
    "assoc",
    "subst",
    "null?",
    "pair?",
    "char?",
    "boolean?",
    "string?",
    "number?",
    "integer?",
    "real?",
    "integer->real",
    "real->integer",
    "integer->char",
    "char->integer",
    "number->string",
    "string->number",
    "string->data",
    "data->string",
    "not",
    "display",
    "write",
    "newline",
    "+",
    "-",
    "*",
    "/",
    "<",
    "=",
    ">",
    "<=",
    ">=",
    "and",
    "or",
    "begin",
    "define",
    "set!",
    "eval",
    "lambda",
    "macro",
    "closure",
    "apply",
    "read",
    "current-environment",
    "load",
    "unload",
    "mem-alloc",
    "mem-read",
    "mem-write",
    "mem-fill",
    "mem-copy",
    "mem-addr",
];

impl Op {
    #[must_use]
    pub fn name(self) -> &'static str {
        OPERATOR_NAMES[u8::from(self) as usize]
    }

    /// Resolve a token to an operator, if it names one.
    #[must_use]
    pub fn from_name(token: &str) -> Option<Self> {
        OPERATOR_NAMES
            .iter()
            .position(|&name| name == token)
            .and_then(|index| Op::try_from(index as u8).ok())
    }
}

/// How the evaluator prepares arguments before invoking an operator.
/// This table is the single source of truth for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Evaluate all arguments left-to-right; require exactly this arity.
    Normal(u8),
    /// Evaluate all arguments; arity is the list length minus one.
    NormalX,
    /// Return the single argument verbatim.
    SpecialQuote,
    /// Walk `(test consequent…)` clauses in order.
    SpecialCond,
    /// Short-circuiting `and` / `or`.
    SpecialLogic,
    /// Evaluate a sequence; binding site for enclosed `define`s.
    SpecialBegin,
    /// Bind or mutate a symbol in the enclosing frame.
    SpecialDefine,
    /// Evaluate an already-evaluated expression in a given environment.
    SpecialEval,
    /// Look up a compiled-in library source and bind it.
    SpecialLoad,
    /// Produce a closure capturing the current environment.
    ImmediateLambda,
    /// Produce a macro value (no environment capture).
    ImmediateMacro,
    /// Already a closure; self-evaluating.
    ImmediateClosure,
}

#[must_use]
pub fn reduction(op: Op) -> Reduction {
    use Op::*;
    match op {
        Quote => Reduction::SpecialQuote,
        Cond => Reduction::SpecialCond,
        And | Or => Reduction::SpecialLogic,
        Begin => Reduction::SpecialBegin,
        Define | SetE => Reduction::SpecialDefine,
        Eval => Reduction::SpecialEval,
        Load | Unload => Reduction::SpecialLoad,
        Lambda => Reduction::ImmediateLambda,
        Macro => Reduction::ImmediateMacro,
        Closure => Reduction::ImmediateClosure,
        Assoc | Apply => Reduction::NormalX,
        Newline | Read | CurrentEnvironment => Reduction::Normal(0),
        Car | Cdr | AtomQ | NullQ | PairQ | CharQ | BooleanQ | StringQ | NumberQ | IntegerQ
        | RealQ | IntegerToReal | RealToInteger | IntegerToChar | CharToInteger
        | NumberToString | StringToNumber | StringToData | DataToString | Not | Display
        | Write | MemAlloc | MemRead | MemAddr => Reduction::Normal(1),
        EqQ | Cons | Plus | Minus | Times | Divide | Less | Equal | Bigger | LessEqual
        | BiggerEqual | MemWrite => Reduction::Normal(2),
        Subst | MemFill | MemCopy => Reduction::Normal(3),
    }
}

/// Numeric operand with the integer/real promotion applied on demand; the
/// stored operands are never mutated.
#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Real(f64),
}

fn numeric(heap: &Heap, op: Op, id: ValueId) -> Result<Num, Error> {
    match heap.value(id) {
        Value::Int(n) => Ok(Num::Int(*n)),
        Value::Real(r) => Ok(Num::Real(*r)),
        _ => Err(Error::TypeError {
            op: op.name(),
            expected: "number",
        }),
    }
}

fn arithmetic(heap: &mut Heap, op: Op, a: Num, b: Num) -> Result<ValueId, Error> {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => {
            let n = match op {
                Op::Plus => x.wrapping_add(y),
                Op::Minus => x.wrapping_sub(y),
                Op::Times => x.wrapping_mul(y),
                Op::Divide => {
                    if y == 0 {
                        return Err(Error::DivisionByZero);
                    }
                    x.wrapping_div(y)
                }
                _ => return Err(Error::UnknownOperator(op.name())),
            };
            Ok(heap.alloc_value(Value::Int(n)))
        }
        _ => {
            // Mixed operands: promote the integer side, compute in real.
            let (x, y) = (promote(a), promote(b));
            let r = match op {
                Op::Plus => x + y,
                Op::Minus => x - y,
                Op::Times => x * y,
                Op::Divide => {
                    if y == 0.0 {
                        return Err(Error::DivisionByZero);
                    }
                    x / y
                }
                _ => return Err(Error::UnknownOperator(op.name())),
            };
            Ok(heap.alloc_value(Value::Real(r)))
        }
    }
}

#[inline]
fn promote(n: Num) -> f64 {
    match n {
        Num::Int(x) => x as f64,
        Num::Real(x) => x,
    }
}

fn comparison(heap: &mut Heap, op: Op, a: Num, b: Num) -> Result<ValueId, Error> {
    let holds = match (a, b) {
        (Num::Int(x), Num::Int(y)) => match op {
            Op::Less => x < y,
            Op::Equal => x == y,
            Op::Bigger => x > y,
            Op::LessEqual => x <= y,
            Op::BiggerEqual => x >= y,
            _ => return Err(Error::UnknownOperator(op.name())),
        },
        _ => {
            let (x, y) = (promote(a), promote(b));
            match op {
                Op::Less => x < y,
                Op::Equal => x == y,
                Op::Bigger => x > y,
                Op::LessEqual => x <= y,
                Op::BiggerEqual => x >= y,
                _ => return Err(Error::UnknownOperator(op.name())),
            }
        }
    };
    Ok(heap.boolean(holds))
}

fn expect_int(heap: &Heap, op: Op, id: ValueId) -> Result<i64, Error> {
    match heap.value(id) {
        Value::Int(n) => Ok(*n),
        _ => Err(Error::TypeError {
            op: op.name(),
            expected: "integer",
        }),
    }
}

/// Apply a primitive whose arguments have already been evaluated.
/// `apply`, `eval`, `load` and `unload` re-enter the evaluator and are
/// handled by the VM's call frame instead of here.
pub fn apply_primitive(
    heap: &mut Heap,
    op: Op,
    args: &[ValueId],
    env: ValueId,
) -> Result<ValueId, Error> {
    use Op::*;
    match op {
        Car => list::car(heap, args[0]).ok_or(Error::TypeError {
            op: "car/cdr",
            expected: "non-empty list",
        }),
        Cdr => list::cdr(heap, args[0]).ok_or(Error::TypeError {
            op: "car/cdr",
            expected: "non-empty list",
        }),
        Cons => Ok(list::cons(heap, args[0], args[1])),
        AtomQ => {
            let atom = heap.value(args[0]).is_atom();
            Ok(heap.boolean(atom))
        }
        NullQ => {
            let null = matches!(heap.value(args[0]), Value::List(None));
            Ok(heap.boolean(null))
        }
        PairQ => {
            let pair = heap.value(args[0]).head().is_some();
            Ok(heap.boolean(pair))
        }
        EqQ => {
            let eq = node::equal(heap, args[0], args[1]);
            Ok(heap.boolean(eq))
        }
        CharQ => {
            let yes = matches!(heap.value(args[0]), Value::Char(_));
            Ok(heap.boolean(yes))
        }
        BooleanQ => {
            let yes = matches!(heap.value(args[0]), Value::Boolean(_));
            Ok(heap.boolean(yes))
        }
        StringQ => {
            let yes = matches!(heap.value(args[0]), Value::Str(_));
            Ok(heap.boolean(yes))
        }
        NumberQ => {
            let yes = heap.value(args[0]).is_numeric();
            Ok(heap.boolean(yes))
        }
        IntegerQ => {
            let yes = matches!(heap.value(args[0]), Value::Int(_));
            Ok(heap.boolean(yes))
        }
        RealQ => {
            let yes = matches!(heap.value(args[0]), Value::Real(_));
            Ok(heap.boolean(yes))
        }
        IntegerToReal => {
            let n = expect_int(heap, op, args[0])?;
            Ok(heap.alloc_value(Value::Real(n as f64)))
        }
        RealToInteger => match heap.value(args[0]) {
            // Demotion truncates toward zero.
            Value::Real(r) => {
                let n = *r as i64;
                Ok(heap.alloc_value(Value::Int(n)))
            }
            _ => Err(Error::TypeError {
                op: op.name(),
                expected: "real",
            }),
        },
        IntegerToChar => {
            let n = expect_int(heap, op, args[0])?;
            Ok(heap.alloc_value(Value::Char(n)))
        }
        CharToInteger => match heap.value(args[0]) {
            Value::Char(c) => {
                let n = *c;
                Ok(heap.alloc_value(Value::Int(n)))
            }
            _ => Err(Error::TypeError {
                op: op.name(),
                expected: "char",
            }),
        },
        NumberToString => {
            let text = match heap.value(args[0]) {
                Value::Int(n) => n.to_string(),
                Value::Real(r) => format!("{r:?}"),
                _ => {
                    return Err(Error::TypeError {
                        op: op.name(),
                        expected: "number",
                    });
                }
            };
            Ok(heap.alloc_value(Value::Str(text.into())))
        }
        StringToNumber => {
            let parsed = match heap.value(args[0]) {
                Value::Str(text) => {
                    if let Ok(n) = text.parse::<i64>() {
                        Some(Value::Int(n))
                    } else {
                        text.parse::<f64>().ok().map(Value::Real)
                    }
                }
                _ => None,
            };
            match parsed {
                Some(value) => Ok(heap.alloc_value(value)),
                None => Err(Error::TypeError {
                    op: op.name(),
                    expected: "numeric string",
                }),
            }
        }
        StringToData => {
            // Converted in place, not duplicated.
            let bytes = match heap.value_mut(args[0]) {
                Value::Str(text) => std::mem::take(text).into_boxed_bytes(),
                _ => {
                    return Err(Error::TypeError {
                        op: op.name(),
                        expected: "string",
                    });
                }
            };
            *heap.value_mut(args[0]) = Value::Data(bytes);
            heap.retain(args[0]);
            Ok(args[0])
        }
        DataToString => {
            let text = match heap.value_mut(args[0]) {
                Value::Data(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                _ => {
                    return Err(Error::TypeError {
                        op: op.name(),
                        expected: "data",
                    });
                }
            };
            *heap.value_mut(args[0]) = Value::Str(text.into());
            heap.retain(args[0]);
            Ok(args[0])
        }
        Not => match heap.value(args[0]) {
            Value::Boolean(b) => {
                let flipped = !*b;
                Ok(heap.boolean(flipped))
            }
            _ => Err(Error::TypeError {
                op: op.name(),
                expected: "boolean",
            }),
        },
        Plus | Minus | Times | Divide => {
            let a = numeric(heap, op, args[0])?;
            let b = numeric(heap, op, args[1])?;
            arithmetic(heap, op, a, b)
        }
        Less | Equal | Bigger | LessEqual | BiggerEqual => {
            let a = numeric(heap, op, args[0])?;
            let b = numeric(heap, op, args[1])?;
            comparison(heap, op, a, b)
        }
        Display | Write => {
            print!("{}", Printed::new(heap, args[0]));
            let empty = heap.empty();
            heap.retain(empty);
            Ok(empty)
        }
        Newline => {
            println!();
            let empty = heap.empty();
            heap.retain(empty);
            Ok(empty)
        }
        Read => {
            let mut stdin = std::io::stdin().lock();
            match reader::read_expression(&mut stdin) {
                Ok(Some(text)) => {
                    let mut scanner = crate::token::Scanner::new(&text);
                    reader::parse(heap, &mut scanner).map_err(|_| Error::BadRead)
                }
                Ok(None) => {
                    let empty = heap.empty();
                    heap.retain(empty);
                    Ok(empty)
                }
                Err(_) => Err(Error::BadRead),
            }
        }
        CurrentEnvironment => {
            heap.retain(env);
            Ok(env)
        }
        Assoc => match args.len() {
            2 => match list::lookup(heap, args[0], args[1]) {
                Some(value) => Ok(value),
                None => Ok(heap.boolean(false)),
            },
            3 => {
                if list::lookup_replace(heap, args[0], args[1], args[2]) {
                    heap.retain(args[2]);
                    Ok(args[2])
                } else {
                    Ok(heap.boolean(false))
                }
            }
            _ => Err(Error::ArityError {
                op: op.name(),
                expected: "2 or 3",
                found: args.len(),
            }),
        },
        Subst => Ok(list::substitute(heap, args[0], args[1], args[2])),
        #[cfg(feature = "raw-memory")]
        MemAlloc => {
            let n = expect_int(heap, op, args[0])?;
            let n = usize::try_from(n).map_err(|_| Error::TypeError {
                op: op.name(),
                expected: "non-negative integer",
            })?;
            Ok(heap.alloc_value(Value::Data(vec![0u8; n].into_boxed_slice())))
        }
        #[cfg(feature = "raw-memory")]
        MemAddr => match heap.value(args[0]) {
            Value::Data(bytes) => {
                let addr = bytes.as_ptr() as usize as i64;
                Ok(heap.alloc_value(Value::Int(addr)))
            }
            _ => Err(Error::TypeError {
                op: op.name(),
                expected: "data",
            }),
        },
        #[cfg(feature = "raw-memory")]
        MemFill => {
            let byte = expect_int(heap, op, args[1])? as u8;
            let n = usize::try_from(expect_int(heap, op, args[2])?).map_err(|_| {
                Error::TypeError {
                    op: op.name(),
                    expected: "non-negative integer",
                }
            })?;
            let filled = match heap.value_mut(args[0]) {
                Value::Data(bytes) if n <= bytes.len() => {
                    bytes[..n].fill(byte);
                    true
                }
                _ => false,
            };
            if filled {
                heap.retain(args[0]);
                Ok(args[0])
            } else {
                Err(Error::TypeError {
                    op: op.name(),
                    expected: "data of sufficient length",
                })
            }
        }
        #[cfg(feature = "raw-memory")]
        MemCopy => {
            let n = usize::try_from(expect_int(heap, op, args[2])?).map_err(|_| {
                Error::TypeError {
                    op: op.name(),
                    expected: "non-negative integer",
                }
            })?;
            let source: Vec<u8> = match heap.value(args[1]) {
                Value::Data(bytes) if n <= bytes.len() => bytes[..n].to_vec(),
                _ => {
                    return Err(Error::TypeError {
                        op: op.name(),
                        expected: "data of sufficient length",
                    });
                }
            };
            let copied = match heap.value_mut(args[0]) {
                Value::Data(bytes) if n <= bytes.len() => {
                    bytes[..n].copy_from_slice(&source);
                    true
                }
                _ => false,
            };
            if copied {
                heap.retain(args[0]);
                Ok(args[0])
            } else {
                Err(Error::TypeError {
                    op: op.name(),
                    expected: "data of sufficient length",
                })
            }
        }
        #[cfg(feature = "raw-memory")]
        MemRead => {
            let addr = expect_int(heap, op, args[0])?;
            let byte = unsafe { core::ptr::read_volatile(addr as usize as *const u8) };
            Ok(heap.alloc_value(Value::Char(i64::from(byte))))
        }
        #[cfg(feature = "raw-memory")]
        MemWrite => {
            let addr = expect_int(heap, op, args[0])?;
            let byte = match heap.value(args[1]) {
                Value::Char(c) => *c as u8,
                Value::Int(n) => *n as u8,
                _ => {
                    return Err(Error::TypeError {
                        op: op.name(),
                        expected: "char or integer",
                    });
                }
            };
            unsafe { core::ptr::write_volatile(addr as usize as *mut u8, byte) };
            Ok(heap.boolean(true))
        }
        #[cfg(not(feature = "raw-memory"))]
        MemAlloc | MemAddr | MemFill | MemCopy | MemRead | MemWrite => {
            Err(Error::Unsupported(op.name()))
        }
        Quote | Cond | And | Or | Begin | Define | SetE | Eval | Lambda | Macro | Closure
        | Apply | Load | Unload => Err(Error::UnknownOperator(op.name())),
    }
}

#[test]
fn test_operator_indices_round_trip() {
    for (index, name) in OPERATOR_NAMES.iter().enumerate() {
        let op = Op::try_from(index as u8).expect("every name has an operator");
        assert_eq!(op.name(), *name);
        assert_eq!(Op::from_name(name), Some(op));
    }
    assert_eq!(Op::from_name("no-such-operator"), None);
}

#[test]
fn test_reduction_arities() {
    assert_eq!(reduction(Op::Cons), Reduction::Normal(2));
    assert_eq!(reduction(Op::Newline), Reduction::Normal(0));
    assert_eq!(reduction(Op::Subst), Reduction::Normal(3));
    assert_eq!(reduction(Op::Apply), Reduction::NormalX);
    assert_eq!(reduction(Op::Quote), Reduction::SpecialQuote);
    assert_eq!(reduction(Op::Lambda), Reduction::ImmediateLambda);
}
