use std::{error, fmt, mem};

use crate::heap::{BoxId, Heap, ValueId};
use crate::library;
use crate::list;
use crate::node::Value;
use crate::ops::{self, Op, Reduction};
use crate::reader;
use crate::token::Scanner;

/// Bound on pending work items.
pub const EVAL_STACK_DEPTH: usize = 96;
/// Bound on evaluated results awaiting consumption.
pub const DATA_STACK_DEPTH: usize = 32;

/// Evaluation errors. These do not unwind anything themselves: the
/// evaluator clears its stacks and the REPL reports and resumes, with the
/// global environment intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    UnboundSymbol(Box<str>),
    TypeError {
        op: &'static str,
        expected: &'static str,
    },
    ArityError {
        op: &'static str,
        expected: &'static str,
        found: usize,
    },
    DivisionByZero,
    StackOverflow(&'static str),
    /// An operator reached a reduction path that has no entry for it.
    UnknownOperator(&'static str),
    EmptyApplication,
    BadRead,
    Unsupported(&'static str),
    UnknownLibrary(Box<str>),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnboundSymbol(name) => write!(f, "{name}: evaluation error"),
            Self::TypeError { op, expected } => {
                write!(f, "{op}: argument type error (expected {expected})")
            }
            Self::ArityError {
                op,
                expected,
                found,
            } => write!(
                f,
                "{op}: missing or extra arguments (expected {expected}, found {found})"
            ),
            Self::DivisionByZero => write!(f, "/: division by zero"),
            Self::StackOverflow(which) => {
                write!(f, "{which} stack overflow (rewrite deep recursion as tail calls)")
            }
            Self::UnknownOperator(op) => write!(f, "{op}: unknown reduction mode"),
            Self::EmptyApplication => write!(f, "(): evaluation error"),
            Self::BadRead => write!(f, "read: error reading expression"),
            Self::Unsupported(op) => write!(f, "{op}: no compiled support"),
            Self::UnknownLibrary(name) => write!(f, "load: no library entry for {name}"),
        }
    }
}

/// Expected-arity text for the fixed-arity reduction modes.
fn arity_name(n: u8) -> &'static str {
    match n {
        0 => "0",
        1 => "1",
        2 => "2",
        _ => "3",
    }
}

impl error::Error for Error {}

/// Which environment cell a `define` should mutate: the global cell, or
/// the env of the `begin` frame at the given stack index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Global,
    Frame(usize),
}

#[derive(Debug, Clone, Copy)]
enum FrameKind {
    /// Evaluate `input`; replaced by the appropriate kind on entry.
    Eval,
    /// The head of `input` is not yet an operator, closure or macro:
    /// evaluate it, rebuild the list, re-evaluate.
    First { waiting: bool },
    /// Consume `argc` evaluated results and invoke the primitive.
    Call { op: Op, argc: u8 },
    Cond { clause: Option<BoxId>, waiting: bool },
    Logic { conjunction: bool, rest: Option<BoxId>, waiting: bool },
    Define { mutate: bool, waiting: bool },
    /// Sequence evaluation; the context cell for enclosed `define`s.
    /// `owner` is the closure whose body this is, for tail folding.
    Begin {
        owner: Option<ValueId>,
        saved: Context,
        forms: Option<BoxId>,
        entered: bool,
    },
    /// Application of a closure or macro value.
    Apply { waiting: bool },
    /// Iterate forms; in discard mode each intermediate result is popped
    /// and the last form replaces this frame (tail position).
    EvalList {
        rest: Option<BoxId>,
        discard: bool,
        waiting: bool,
    },
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    kind: FrameKind,
    input: ValueId,
    env: ValueId,
}

/// Outcome of a primitive call frame.
enum Invoke {
    Push(ValueId),
    Tail { expr: ValueId, env: ValueId },
}

/// The evaluator: an explicit state machine over an evaluation stack of
/// frames and a data stack of results. Owns the global environment cell.
pub struct Vm {
    frames: Vec<Frame>,
    data: Vec<ValueId>,
    context: Context,
    global: ValueId,
}

impl Vm {
    #[must_use]
    pub fn new(heap: &mut Heap) -> Self {
        let empty = heap.empty();
        heap.retain(empty);
        Self {
            frames: Vec::new(),
            data: Vec::new(),
            context: Context::Global,
            global: empty,
        }
    }

    /// The global environment value. Mutated by top-level `define`s.
    #[inline]
    #[must_use]
    pub fn global_env(&self) -> ValueId {
        self.global
    }

    /// Evaluate one top-level expression against the global environment.
    /// The returned handle is owned by the caller. On error the stacks
    /// are cleared and the global environment is left intact.
    pub fn eval(&mut self, heap: &mut Heap, expr: ValueId) -> Result<ValueId, Error> {
        self.context = Context::Global;
        let global = self.global;
        let result = self.run(heap, expr, global);
        if result.is_err() {
            self.reset(heap);
        }
        result
    }

    fn run(&mut self, heap: &mut Heap, expr: ValueId, env: ValueId) -> Result<ValueId, Error> {
        self.push_frame(heap, FrameKind::Eval, expr, env)?;
        while !self.frames.is_empty() {
            self.step(heap)?;
        }
        Ok(self.take_data())
    }

    /// Clear both stacks, releasing every handle they hold, and point the
    /// context back at the global cell.
    pub fn reset(&mut self, heap: &mut Heap) {
        while let Some(frame) = self.frames.pop() {
            Self::release_frame(heap, frame);
        }
        while let Some(value) = self.data.pop() {
            heap.release(value);
        }
        self.context = Context::Global;
    }

    fn release_frame(heap: &mut Heap, frame: Frame) {
        if let FrameKind::Begin { owner: Some(owner), .. } = frame.kind {
            heap.release(owner);
        }
        heap.release(frame.input);
        heap.release(frame.env);
    }

    #[inline]
    fn context_env(&self) -> ValueId {
        match self.context {
            Context::Global => self.global,
            Context::Frame(index) => self.frames[index].env,
        }
    }

    /// Swap the value of the current context cell, taking ownership of
    /// the new reference.
    fn set_context_env(&mut self, heap: &mut Heap, env: ValueId) {
        let cell = match self.context {
            Context::Global => &mut self.global,
            Context::Frame(index) => &mut self.frames[index].env,
        };
        let old = mem::replace(cell, env);
        heap.release(old);
    }

    fn push_frame(
        &mut self,
        heap: &mut Heap,
        kind: FrameKind,
        input: ValueId,
        env: ValueId,
    ) -> Result<(), Error> {
        if self.frames.len() >= EVAL_STACK_DEPTH {
            return Err(Error::StackOverflow("evaluation"));
        }
        heap.retain(input);
        heap.retain(env);
        self.frames.push(Frame { kind, input, env });
        Ok(())
    }

    fn replace_top(&mut self, heap: &mut Heap, kind: FrameKind, input: ValueId, env: ValueId) {
        heap.retain(input);
        heap.retain(env);
        let index = self.frames.len() - 1;
        let old = mem::replace(&mut self.frames[index], Frame { kind, input, env });
        Self::release_frame(heap, old);
    }

    /// Change only the state of the top frame; no reference traffic.
    #[inline]
    fn morph_top(&mut self, kind: FrameKind) {
        let index = self.frames.len() - 1;
        self.frames[index].kind = kind;
    }

    fn pop_top(&mut self, heap: &mut Heap) {
        if let Some(frame) = self.frames.pop() {
            Self::release_frame(heap, frame);
        }
    }

    fn push_data(&mut self, heap: &mut Heap, value: ValueId) -> Result<(), Error> {
        if self.data.len() >= DATA_STACK_DEPTH {
            heap.release(value);
            return Err(Error::StackOverflow("data"));
        }
        self.data.push(value);
        Ok(())
    }

    fn take_data(&mut self) -> ValueId {
        self.data.pop().expect("data stack underflow")
    }

    fn step(&mut self, heap: &mut Heap) -> Result<(), Error> {
        let index = self.frames.len() - 1;
        let frame = self.frames[index];
        match frame.kind {
            FrameKind::Eval => self.step_eval(heap, frame),
            FrameKind::First { waiting } => self.step_first(heap, frame, waiting),
            FrameKind::Call { op, argc } => self.step_call(heap, frame, op, argc),
            FrameKind::Cond { clause, waiting } => self.step_cond(heap, frame, clause, waiting),
            FrameKind::Logic {
                conjunction,
                rest,
                waiting,
            } => self.step_logic(heap, frame, conjunction, rest, waiting),
            FrameKind::Define { mutate, waiting } => {
                self.step_define(heap, frame, mutate, waiting)
            }
            FrameKind::Begin {
                owner,
                saved,
                forms,
                entered,
            } => self.step_begin(heap, frame, owner, saved, forms, entered),
            FrameKind::Apply { waiting } => self.step_apply(heap, frame, waiting),
            FrameKind::EvalList {
                rest,
                discard,
                waiting,
            } => self.step_eval_list(heap, frame, rest, discard, waiting),
        }
    }

    fn step_eval(&mut self, heap: &mut Heap, frame: Frame) -> Result<(), Error> {
        let input = frame.input;
        if heap.value(input).is_symbol() {
            if let Some(value) = list::lookup(heap, input, frame.env) {
                self.pop_top(heap);
                return self.push_data(heap, value);
            }
            let Value::Symbol(name) = heap.value(input) else {
                unreachable!("symbol checked above");
            };
            return Err(Error::UnboundSymbol(name.clone()));
        }
        let head_link = match heap.value(input) {
            Value::List(None) => return Err(Error::EmptyApplication),
            Value::List(Some(link)) => *link,
            _ => {
                // Self-evaluating atom (numbers, strings, operators, ...).
                heap.retain(input);
                self.pop_top(heap);
                return self.push_data(heap, input);
            }
        };
        let head = heap.link(head_link).item;
        enum HeadKind {
            Operator(Op),
            Applicable,
            Unresolved,
            Unusable,
        }
        let head_kind = match heap.value(head) {
            Value::Operator(op) => HeadKind::Operator(*op),
            Value::Symbol(_) => HeadKind::Unresolved,
            Value::List(_) => match heap.value(head).list_operator(heap) {
                Some(Op::Closure) | Some(Op::Macro) => HeadKind::Applicable,
                _ => HeadKind::Unresolved,
            },
            _ => HeadKind::Unusable,
        };
        match head_kind {
            HeadKind::Operator(op) => self.dispatch_operator(heap, frame, op),
            HeadKind::Applicable => {
                self.morph_top(FrameKind::Apply { waiting: false });
                Ok(())
            }
            HeadKind::Unresolved => {
                self.morph_top(FrameKind::First { waiting: false });
                Ok(())
            }
            HeadKind::Unusable => Err(Error::TypeError {
                op: "apply",
                expected: "operator, closure or macro",
            }),
        }
    }

    fn dispatch_operator(&mut self, heap: &mut Heap, frame: Frame, op: Op) -> Result<(), Error> {
        let argc = list::len(heap, frame.input) - 1;
        match ops::reduction(op) {
            Reduction::Normal(n) => {
                if argc != n as usize {
                    return Err(Error::ArityError {
                        op: op.name(),
                        expected: arity_name(n),
                        found: argc,
                    });
                }
                self.schedule_call(heap, frame, op, n)
            }
            Reduction::NormalX => {
                let (valid, expected) = match op {
                    Op::Apply => (argc >= 2, "at least 2"),
                    Op::Assoc => (argc == 2 || argc == 3, "2 or 3"),
                    _ => (true, "any"),
                };
                if !valid || argc > u8::MAX as usize {
                    return Err(Error::ArityError {
                        op: op.name(),
                        expected,
                        found: argc,
                    });
                }
                self.schedule_call(heap, frame, op, argc as u8)
            }
            Reduction::SpecialQuote => {
                if argc != 1 {
                    return Err(Error::ArityError {
                        op: op.name(),
                        expected: "1",
                        found: argc,
                    });
                }
                let quoted = list::nth(heap, frame.input, 1).expect("arity checked");
                heap.retain(quoted);
                self.pop_top(heap);
                self.push_data(heap, quoted)
            }
            Reduction::SpecialCond => {
                let clause = heap.link(heap.value(frame.input).head().expect("non-empty")).next;
                self.morph_top(FrameKind::Cond {
                    clause,
                    waiting: false,
                });
                Ok(())
            }
            Reduction::SpecialLogic => {
                let rest = heap.link(heap.value(frame.input).head().expect("non-empty")).next;
                self.morph_top(FrameKind::Logic {
                    conjunction: op == Op::And,
                    rest,
                    waiting: false,
                });
                Ok(())
            }
            Reduction::SpecialBegin => {
                if argc < 1 {
                    return Err(Error::ArityError {
                        op: op.name(),
                        expected: "at least 1",
                        found: argc,
                    });
                }
                let forms = heap.link(heap.value(frame.input).head().expect("non-empty")).next;
                self.morph_top(FrameKind::Begin {
                    owner: None,
                    saved: self.context,
                    forms,
                    entered: false,
                });
                Ok(())
            }
            Reduction::SpecialDefine => {
                self.morph_top(FrameKind::Define {
                    mutate: op == Op::SetE,
                    waiting: false,
                });
                Ok(())
            }
            Reduction::SpecialEval => {
                if argc != 2 {
                    return Err(Error::ArityError {
                        op: op.name(),
                        expected: "2",
                        found: argc,
                    });
                }
                self.schedule_call(heap, frame, op, 2)
            }
            Reduction::SpecialLoad => {
                if argc != 1 {
                    return Err(Error::ArityError {
                        op: op.name(),
                        expected: "1",
                        found: argc,
                    });
                }
                self.schedule_call(heap, frame, op, 1)
            }
            Reduction::ImmediateLambda => {
                validate_procedure(heap, frame.input, op)?;
                let closure_op = heap.alloc_value(Value::Operator(Op::Closure));
                let closure = list::make3(heap, closure_op, frame.input, frame.env);
                heap.release(closure_op);
                self.pop_top(heap);
                self.push_data(heap, closure)
            }
            Reduction::ImmediateMacro => {
                validate_procedure(heap, frame.input, op)?;
                heap.retain(frame.input);
                self.pop_top(heap);
                self.push_data(heap, frame.input)
            }
            Reduction::ImmediateClosure => {
                heap.retain(frame.input);
                self.pop_top(heap);
                self.push_data(heap, frame.input)
            }
        }
    }

    /// Morph the current frame into a call and push the argument
    /// iterator above it.
    fn schedule_call(
        &mut self,
        heap: &mut Heap,
        frame: Frame,
        op: Op,
        argc: u8,
    ) -> Result<(), Error> {
        let args = heap.link(heap.value(frame.input).head().expect("non-empty")).next;
        self.morph_top(FrameKind::Call { op, argc });
        self.push_frame(
            heap,
            FrameKind::EvalList {
                rest: args,
                discard: false,
                waiting: false,
            },
            frame.input,
            frame.env,
        )
    }

    fn step_first(&mut self, heap: &mut Heap, frame: Frame, waiting: bool) -> Result<(), Error> {
        if !waiting {
            let head = heap.link(heap.value(frame.input).head().expect("non-empty")).item;
            self.morph_top(FrameKind::First { waiting: true });
            return self.push_frame(heap, FrameKind::Eval, head, frame.env);
        }
        let evaluated = self.take_data();
        // An operator head re-enters dispatch; a closure or macro head
        // goes straight to application. Anything else cannot be applied,
        // and re-evaluating it would not terminate.
        let next_kind = match heap.value(evaluated) {
            Value::Operator(_) => Some(FrameKind::Eval),
            Value::List(_) => match heap.value(evaluated).list_operator(heap) {
                Some(Op::Closure) | Some(Op::Macro) => Some(FrameKind::Apply { waiting: false }),
                _ => None,
            },
            _ => None,
        };
        let Some(next_kind) = next_kind else {
            heap.release(evaluated);
            return Err(Error::TypeError {
                op: "apply",
                expected: "operator, closure or macro",
            });
        };
        let rest = list::cdr(heap, frame.input).expect("non-empty list");
        let rebuilt = list::cons(heap, evaluated, rest);
        heap.release(evaluated);
        heap.release(rest);
        self.replace_top(heap, next_kind, rebuilt, frame.env);
        heap.release(rebuilt);
        Ok(())
    }

    fn step_call(&mut self, heap: &mut Heap, frame: Frame, op: Op, argc: u8) -> Result<(), Error> {
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.take_data());
        }
        args.reverse();
        let outcome = self.invoke(heap, op, &args, frame.env);
        for arg in args {
            heap.release(arg);
        }
        match outcome? {
            Invoke::Push(value) => {
                self.pop_top(heap);
                self.push_data(heap, value)
            }
            Invoke::Tail { expr, env } => {
                self.replace_top(heap, FrameKind::Eval, expr, env);
                heap.release(expr);
                heap.release(env);
                Ok(())
            }
        }
    }

    /// Primitive invocation. The operators that re-enter the evaluator
    /// (`eval`, `apply`, `load`, `unload`) turn into tail frames; the
    /// rest go through the primitive table.
    fn invoke(
        &mut self,
        heap: &mut Heap,
        op: Op,
        args: &[ValueId],
        env: ValueId,
    ) -> Result<Invoke, Error> {
        match op {
            Op::Eval => {
                heap.retain(args[0]);
                heap.retain(args[1]);
                Ok(Invoke::Tail {
                    expr: args[0],
                    env: args[1],
                })
            }
            Op::Apply => build_apply(heap, args, env),
            Op::Load => {
                let name = match heap.value(args[0]) {
                    Value::Symbol(name) => name.clone(),
                    _ => {
                        return Err(Error::TypeError {
                            op: "load",
                            expected: "symbol",
                        });
                    }
                };
                let source = library::find(&name).ok_or(Error::UnknownLibrary(name))?;
                let mut scanner = Scanner::new(source);
                let parsed = reader::parse(heap, &mut scanner).map_err(|_| Error::BadRead)?;
                let define_op = heap.alloc_value(Value::Operator(Op::Define));
                let expr = list::make3(heap, define_op, args[0], parsed);
                heap.release(define_op);
                heap.release(parsed);
                heap.retain(env);
                Ok(Invoke::Tail { expr, env })
            }
            Op::Unload => {
                let set_op = heap.alloc_value(Value::Operator(Op::SetE));
                let falsity = heap.boolean(false);
                let expr = list::make3(heap, set_op, args[0], falsity);
                heap.release(set_op);
                heap.release(falsity);
                heap.retain(env);
                Ok(Invoke::Tail { expr, env })
            }
            _ => ops::apply_primitive(heap, op, args, env).map(Invoke::Push),
        }
    }

    fn step_cond(
        &mut self,
        heap: &mut Heap,
        frame: Frame,
        clause: Option<BoxId>,
        waiting: bool,
    ) -> Result<(), Error> {
        if waiting {
            let result = self.take_data();
            let taken = matches!(heap.value(result), Value::Boolean(true));
            heap.release(result);
            let clause_link = clause.expect("waiting cond has a clause");
            if taken {
                let clause_val = heap.link(clause_link).item;
                let body = heap
                    .value(clause_val)
                    .head()
                    .and_then(|h| heap.link(h).next)
                    .expect("clause validated");
                if heap.link(body).next.is_none() {
                    // Single consequent: tail-schedule it.
                    let form = heap.link(body).item;
                    self.replace_top(heap, FrameKind::Eval, form, frame.env);
                } else {
                    // Multiple consequent forms run as a begin.
                    self.replace_top(
                        heap,
                        FrameKind::Begin {
                            owner: None,
                            saved: self.context,
                            forms: Some(body),
                            entered: false,
                        },
                        clause_val,
                        frame.env,
                    );
                }
                return Ok(());
            }
            let next = heap.link(clause_link).next;
            self.morph_top(FrameKind::Cond {
                clause: next,
                waiting: false,
            });
            return Ok(());
        }
        match clause {
            None => {
                // Clauses exhausted: the cond is the empty list.
                let empty = heap.empty();
                heap.retain(empty);
                self.pop_top(heap);
                self.push_data(heap, empty)
            }
            Some(link) => {
                let clause_val = heap.link(link).item;
                let Some(test_link) = heap.value(clause_val).head() else {
                    return Err(Error::TypeError {
                        op: "cond",
                        expected: "(test consequent...) clause",
                    });
                };
                if heap.link(test_link).next.is_none() {
                    return Err(Error::TypeError {
                        op: "cond",
                        expected: "(test consequent...) clause",
                    });
                }
                let test = heap.link(test_link).item;
                self.morph_top(FrameKind::Cond {
                    clause,
                    waiting: true,
                });
                self.push_frame(heap, FrameKind::Eval, test, frame.env)
            }
        }
    }

    fn step_logic(
        &mut self,
        heap: &mut Heap,
        frame: Frame,
        conjunction: bool,
        rest: Option<BoxId>,
        waiting: bool,
    ) -> Result<(), Error> {
        let op_name = if conjunction { "and" } else { "or" };
        if waiting {
            let result = self.take_data();
            let truth = match heap.value(result) {
                Value::Boolean(b) => *b,
                _ => {
                    heap.release(result);
                    return Err(Error::TypeError {
                        op: op_name,
                        expected: "boolean",
                    });
                }
            };
            heap.release(result);
            if conjunction != truth {
                // Short circuit: and saw #f, or saw #t.
                let value = heap.boolean(truth);
                self.pop_top(heap);
                return self.push_data(heap, value);
            }
            self.morph_top(FrameKind::Logic {
                conjunction,
                rest,
                waiting: false,
            });
            return Ok(());
        }
        match rest {
            None => {
                // Identity values for the empty case.
                let value = heap.boolean(conjunction);
                self.pop_top(heap);
                self.push_data(heap, value)
            }
            Some(link) => {
                let cell = heap.link(link);
                match cell.next {
                    None => {
                        // Tail-schedule the last form.
                        self.replace_top(heap, FrameKind::Eval, cell.item, frame.env);
                        Ok(())
                    }
                    Some(next) => {
                        self.morph_top(FrameKind::Logic {
                            conjunction,
                            rest: Some(next),
                            waiting: true,
                        });
                        self.push_frame(heap, FrameKind::Eval, cell.item, frame.env)
                    }
                }
            }
        }
    }

    fn step_define(
        &mut self,
        heap: &mut Heap,
        frame: Frame,
        mutate: bool,
        waiting: bool,
    ) -> Result<(), Error> {
        let op_name = if mutate { "set!" } else { "define" };
        if !waiting {
            let members = list::len(heap, frame.input);
            if members < 3 {
                return Err(Error::ArityError {
                    op: op_name,
                    expected: "2",
                    found: members - 1,
                });
            }
            let arg1 = list::nth(heap, frame.input, 1).expect("arity checked");
            let sugar = heap.value(arg1).head().is_some();
            if !sugar && members != 3 {
                return Err(Error::ArityError {
                    op: op_name,
                    expected: "2",
                    found: members - 1,
                });
            }
            let (sym, value_expr) = if sugar {
                if mutate {
                    return Err(Error::TypeError {
                        op: op_name,
                        expected: "symbol",
                    });
                }
                // (define (f p…) body…) expands to (define f (lambda (p…) body…))
                let sym = heap.link(heap.value(arg1).head().expect("sugar")).item;
                if !heap.value(sym).is_symbol() {
                    return Err(Error::TypeError {
                        op: op_name,
                        expected: "symbol",
                    });
                }
                let lambda_op = heap.alloc_value(Value::Operator(Op::Lambda));
                let params = list::cdr(heap, arg1).expect("non-empty list");
                let parts = list::elements(heap, frame.input);
                let mut items = vec![lambda_op, params];
                items.extend_from_slice(&parts[2..]);
                let value_expr = list::from_slice(heap, &items);
                heap.release(lambda_op);
                heap.release(params);
                (sym, value_expr)
            } else {
                if !heap.value(arg1).is_symbol() {
                    return Err(Error::TypeError {
                        op: op_name,
                        expected: "symbol",
                    });
                }
                let value_expr = list::nth(heap, frame.input, 2).expect("arity checked");
                heap.retain(value_expr);
                (arg1, value_expr)
            };
            if !mutate {
                // Pre-extend the context frame so the value expression can
                // refer to its own binding; the pair is replaced in place
                // once the value is known.
                let empty = heap.empty();
                let binding = list::make2(heap, sym, empty);
                let context = self.context_env();
                let extended = list::cons(heap, binding, context);
                heap.release(binding);
                self.set_context_env(heap, extended);
            }
            self.morph_top(FrameKind::Define {
                mutate,
                waiting: true,
            });
            let context = self.context_env();
            let scheduled = self.push_frame(heap, FrameKind::Eval, value_expr, context);
            heap.release(value_expr);
            return scheduled;
        }
        let value = self.take_data();
        let arg1 = list::nth(heap, frame.input, 1).expect("validated");
        let sym = match heap.value(arg1).head() {
            Some(head) => heap.link(head).item,
            None => arg1,
        };
        let context = self.context_env();
        let replaced = list::lookup_replace(heap, sym, context, value);
        heap.release(value);
        if !replaced {
            let Value::Symbol(name) = heap.value(sym) else {
                return Err(Error::TypeError {
                    op: op_name,
                    expected: "symbol",
                });
            };
            return Err(Error::UnboundSymbol(name.clone()));
        }
        heap.retain(context);
        self.pop_top(heap);
        self.push_data(heap, context)
    }

    fn step_begin(
        &mut self,
        heap: &mut Heap,
        frame: Frame,
        owner: Option<ValueId>,
        saved: Context,
        forms: Option<BoxId>,
        entered: bool,
    ) -> Result<(), Error> {
        let index = self.frames.len() - 1;
        if entered {
            // Body finished: its last result is on the data stack.
            self.context = saved;
            self.pop_top(heap);
            return Ok(());
        }
        debug_assert!(forms.is_some(), "begin bodies have at least one form");
        let saved = self.context;
        self.context = Context::Frame(index);
        // A sentinel binding separates this frame, so enclosed defines
        // extend it without touching the surrounding environment.
        let falsity = heap.falsity();
        let sentinel = list::make2(heap, falsity, falsity);
        let extended = list::cons(heap, sentinel, frame.env);
        heap.release(sentinel);
        let old = mem::replace(&mut self.frames[index].env, extended);
        heap.release(old);
        self.frames[index].kind = FrameKind::Begin {
            owner,
            saved,
            forms,
            entered: true,
        };
        let env = self.frames[index].env;
        self.push_frame(
            heap,
            FrameKind::EvalList {
                rest: forms,
                discard: true,
                waiting: false,
            },
            frame.input,
            env,
        )
    }

    fn step_apply(&mut self, heap: &mut Heap, frame: Frame, waiting: bool) -> Result<(), Error> {
        let callee = heap.link(heap.value(frame.input).head().expect("non-empty")).item;
        if !waiting {
            if heap.value(callee).list_operator(heap) == Some(Op::Macro) {
                return self.apply_macro(heap, frame, callee);
            }
            let args = heap.link(heap.value(frame.input).head().expect("non-empty")).next;
            self.morph_top(FrameKind::Apply { waiting: true });
            return self.push_frame(
                heap,
                FrameKind::EvalList {
                    rest: args,
                    discard: false,
                    waiting: false,
                },
                frame.input,
                frame.env,
            );
        }
        self.apply_closure(heap, frame, callee)
    }

    fn apply_closure(&mut self, heap: &mut Heap, frame: Frame, callee: ValueId) -> Result<(), Error> {
        // callee = (closure (lambda (params…) body…) captured-env)
        let parts = list::elements(heap, callee);
        if parts.len() != 3 {
            return Err(Error::TypeError {
                op: "closure",
                expected: "(closure lambda environment)",
            });
        }
        let lambda = parts[1];
        let captured = parts[2];
        let Some(params) = list::nth(heap, lambda, 1) else {
            return Err(Error::TypeError {
                op: "lambda",
                expected: "parameter list and body",
            });
        };
        let body = heap
            .value(lambda)
            .head()
            .and_then(|h| heap.link(h).next)
            .and_then(|h| heap.link(h).next);
        if body.is_none() {
            return Err(Error::TypeError {
                op: "lambda",
                expected: "parameter list and body",
            });
        }

        let argc = list::len(heap, frame.input) - 1;
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.take_data());
        }
        args.reverse();
        let bound = bind_parameters(heap, params, &args, captured);
        for arg in args {
            heap.release(arg);
        }
        let new_env = bound?;

        // Tail-call elimination: recursion through begin frames owned by
        // this same closure reuses their stack depth.
        heap.retain(callee);
        self.fold_tail_begins(heap, callee);
        self.replace_top(
            heap,
            FrameKind::Begin {
                owner: Some(callee),
                saved: self.context,
                forms: body,
                entered: false,
            },
            lambda,
            new_env,
        );
        heap.release(new_env);
        Ok(())
    }

    /// Pop a contiguous run of entered `begin` frames directly below the
    /// top frame when one of them runs the body of `owner`, restoring
    /// each saved context pointer innermost-first.
    fn fold_tail_begins(&mut self, heap: &mut Heap, owner: ValueId) {
        let top = self.frames.len() - 1;
        let mut start = top;
        while start > 0
            && matches!(
                self.frames[start - 1].kind,
                FrameKind::Begin { entered: true, .. }
            )
        {
            start -= 1;
        }
        let owned = (start..top).any(|i| {
            matches!(self.frames[i].kind, FrameKind::Begin { owner: Some(o), .. } if o == owner)
        });
        if !owned {
            return;
        }
        let folded: Vec<Frame> = self.frames.drain(start..top).collect();
        for frame in folded.into_iter().rev() {
            if let FrameKind::Begin { saved, .. } = frame.kind {
                self.context = saved;
            }
            Self::release_frame(heap, frame);
        }
    }

    fn apply_macro(&mut self, heap: &mut Heap, frame: Frame, callee: ValueId) -> Result<(), Error> {
        // callee = (macro (params…) body…); arguments substitute in
        // unevaluated.
        let Some(params_val) = list::nth(heap, callee, 1) else {
            return Err(Error::TypeError {
                op: "macro",
                expected: "parameter list and body",
            });
        };
        let body = heap
            .value(callee)
            .head()
            .and_then(|h| heap.link(h).next)
            .and_then(|h| heap.link(h).next);
        if body.is_none() {
            return Err(Error::TypeError {
                op: "macro",
                expected: "parameter list and body",
            });
        }
        let params = list::elements(heap, params_val);
        let args: Vec<ValueId> = list::elements(heap, frame.input)[1..].to_vec();
        let body_forms: Vec<ValueId> = {
            let mut forms = Vec::new();
            let mut current = body;
            while let Some(link) = current {
                let cell = heap.link(link);
                forms.push(cell.item);
                current = cell.next;
            }
            forms
        };

        let mut forms: Vec<ValueId> = body_forms
            .iter()
            .map(|&form| {
                heap.retain(form);
                form
            })
            .collect();
        let release_forms = |heap: &mut Heap, forms: &[ValueId]| {
            for &form in forms {
                heap.release(form);
            }
        };

        let mut pi = 0;
        let mut ai = 0;
        loop {
            match (params.get(pi), args.get(ai)) {
                (None, None) => break,
                (Some(&param), _) if is_dot(heap, param) => {
                    let Some(&rest_name) = params.get(pi + 1) else {
                        release_forms(heap, &forms);
                        return Err(Error::TypeError {
                            op: "macro",
                            expected: "rest parameter after .",
                        });
                    };
                    // The rest parameter binds the unevaluated argument
                    // list, quoted so substitution sites keep it inert.
                    let rest = list::from_slice(heap, &args[ai..]);
                    let quote_op = heap.alloc_value(Value::Operator(Op::Quote));
                    let quoted = list::make2(heap, quote_op, rest);
                    heap.release(quote_op);
                    heap.release(rest);
                    substitute_forms(heap, &mut forms, rest_name, quoted);
                    heap.release(quoted);
                    break;
                }
                (Some(&param), Some(&arg)) => {
                    if !heap.value(param).is_symbol() {
                        release_forms(heap, &forms);
                        return Err(Error::TypeError {
                            op: "macro",
                            expected: "symbol",
                        });
                    }
                    substitute_forms(heap, &mut forms, param, arg);
                    pi += 1;
                    ai += 1;
                }
                _ => {
                    release_forms(heap, &forms);
                    return Err(Error::ArityError {
                        op: "macro",
                        expected: "matching parameter count",
                        found: args.len(),
                    });
                }
            }
        }

        let body_val = list::from_slice(heap, &forms);
        release_forms(heap, &forms);
        let forms_head = heap.value(body_val).head();
        self.replace_top(
            heap,
            FrameKind::Begin {
                owner: None,
                saved: self.context,
                forms: forms_head,
                entered: false,
            },
            body_val,
            frame.env,
        );
        heap.release(body_val);
        Ok(())
    }

    fn step_eval_list(
        &mut self,
        heap: &mut Heap,
        frame: Frame,
        rest: Option<BoxId>,
        discard: bool,
        waiting: bool,
    ) -> Result<(), Error> {
        if waiting {
            // Begin semantics: drop the intermediate result.
            let value = self.take_data();
            heap.release(value);
            self.morph_top(FrameKind::EvalList {
                rest,
                discard,
                waiting: false,
            });
            return Ok(());
        }
        match rest {
            None => {
                self.pop_top(heap);
                Ok(())
            }
            Some(link) => {
                let cell = heap.link(link);
                let env = if discard { self.context_env() } else { frame.env };
                match cell.next {
                    None => {
                        // Last form: its frame replaces this one, which is
                        // what makes tail positions foldable.
                        self.replace_top(heap, FrameKind::Eval, cell.item, env);
                        Ok(())
                    }
                    Some(next) => {
                        self.morph_top(FrameKind::EvalList {
                            rest: Some(next),
                            discard,
                            waiting: discard,
                        });
                        self.push_frame(heap, FrameKind::Eval, cell.item, env)
                    }
                }
            }
        }
    }
}

fn is_dot(heap: &Heap, id: ValueId) -> bool {
    matches!(heap.value(id), Value::Symbol(name) if &**name == ".")
}

/// Rewrite each body form, replacing `old` with `new`, releasing the old
/// forms and keeping ownership of the rewritten ones.
fn substitute_forms(heap: &mut Heap, forms: &mut [ValueId], old: ValueId, new: ValueId) {
    for form in forms.iter_mut() {
        let rewritten = list::substitute(heap, old, new, *form);
        heap.release(*form);
        *form = rewritten;
    }
}

/// Validate a `(lambda (params…) body…)` or `(macro (params…) body…)`
/// form: a parameter list of symbols and at least one body form.
fn validate_procedure(heap: &Heap, input: ValueId, op: Op) -> Result<(), Error> {
    let members = list::len(heap, input);
    if members < 3 {
        return Err(Error::ArityError {
            op: op.name(),
            expected: "at least 2",
            found: members - 1,
        });
    }
    let params = list::nth(heap, input, 1).expect("length checked");
    if !heap.value(params).is_list() {
        return Err(Error::TypeError {
            op: op.name(),
            expected: "parameter list",
        });
    }
    for param in list::elements(heap, params) {
        if !heap.value(param).is_symbol() {
            return Err(Error::TypeError {
                op: op.name(),
                expected: "symbol",
            });
        }
    }
    Ok(())
}

/// Bind parameters to already-evaluated arguments on top of the captured
/// environment. A `.` marks the next parameter as the rest: remaining
/// arguments are packaged as a list and bound as one value. Mismatched
/// counts fail without binding a partial frame.
fn bind_parameters(
    heap: &mut Heap,
    params: ValueId,
    args: &[ValueId],
    captured: ValueId,
) -> Result<ValueId, Error> {
    let names = list::elements(heap, params);
    heap.retain(captured);
    let mut env = captured;
    let mut pi = 0;
    let mut ai = 0;
    loop {
        match (names.get(pi), args.get(ai)) {
            (None, None) => break,
            (Some(&param), _) if is_dot(heap, param) => {
                let Some(&rest_name) = names.get(pi + 1) else {
                    heap.release(env);
                    return Err(Error::TypeError {
                        op: "lambda",
                        expected: "rest parameter after .",
                    });
                };
                let rest = list::from_slice(heap, &args[ai..]);
                let binding = list::make2(heap, rest_name, rest);
                let extended = list::cons(heap, binding, env);
                heap.release(rest);
                heap.release(binding);
                heap.release(env);
                return Ok(extended);
            }
            (Some(&param), Some(&arg)) => {
                if !heap.value(param).is_symbol() {
                    heap.release(env);
                    return Err(Error::TypeError {
                        op: "lambda",
                        expected: "symbol",
                    });
                }
                let binding = list::make2(heap, param, arg);
                let extended = list::cons(heap, binding, env);
                heap.release(binding);
                heap.release(env);
                env = extended;
                pi += 1;
                ai += 1;
            }
            _ => {
                heap.release(env);
                return Err(Error::ArityError {
                    op: "lambda application",
                    expected: "matching parameter count",
                    found: args.len(),
                });
            }
        }
    }
    Ok(env)
}

/// Build the tail expression for `(apply f a… rest-list)`: the direct and
/// spliced arguments are re-quoted so re-evaluation returns them verbatim.
fn build_apply(heap: &mut Heap, args: &[ValueId], env: ValueId) -> Result<Invoke, Error> {
    let last = args[args.len() - 1];
    if !heap.value(last).is_list() {
        return Err(Error::TypeError {
            op: "apply",
            expected: "argument list",
        });
    }
    let mut items: Vec<ValueId> = Vec::new();
    heap.retain(args[0]);
    items.push(args[0]);
    for &arg in &args[1..args.len() - 1] {
        items.push(quote_wrap(heap, arg));
    }
    for element in list::elements(heap, last) {
        items.push(quote_wrap(heap, element));
    }
    let expr = list::from_slice(heap, &items);
    for item in items {
        heap.release(item);
    }
    heap.retain(env);
    Ok(Invoke::Tail { expr, env })
}

fn quote_wrap(heap: &mut Heap, value: ValueId) -> ValueId {
    let quote_op = heap.alloc_value(Value::Operator(Op::Quote));
    let wrapped = list::make2(heap, quote_op, value);
    heap.release(quote_op);
    wrapped
}
