use seedlisp::node::Printed;
use seedlisp::vm::Error;
use seedlisp::{Heap, Scanner, Vm, parse};

/// A heap and VM pair driving source text through the public API the way
/// the REPL does, returning the printed form of the last result.
struct Session {
    heap: Heap,
    vm: Vm,
}

impl Session {
    fn new() -> Self {
        let mut heap = Heap::new();
        let vm = Vm::new(&mut heap);
        Self { heap, vm }
    }

    fn run(&mut self, text: &str) -> Result<String, Error> {
        let mut scanner = Scanner::new(text);
        let mut last = String::new();
        while let Ok(expr) = parse(&mut self.heap, &mut scanner) {
            let result = self.vm.eval(&mut self.heap, expr);
            self.heap.release(expr);
            let value = result?;
            last = Printed::new(&self.heap, value).to_string();
            self.heap.release(value);
            self.heap.process_deletions();
        }
        Ok(last)
    }
}

#[test]
fn test_basic_arithmetic() {
    let mut s = Session::new();
    assert_eq!(s.run("(+ 1 2)").unwrap(), "3");
    assert_eq!(s.run("(- 10 4)").unwrap(), "6");
    assert_eq!(s.run("(* 6 7)").unwrap(), "42");
    assert_eq!(s.run("(/ 9 2)").unwrap(), "4");
}

#[test]
fn test_mixed_arithmetic_promotes() {
    let mut s = Session::new();
    assert_eq!(s.run("(+ 1 0.5)").unwrap(), "1.5");
    assert_eq!(s.run("(* 2 2.5)").unwrap(), "5.0");
    assert_eq!(s.run("(< 1 2.5)").unwrap(), "#t");
    assert_eq!(s.run("(= 2 2.0)").unwrap(), "#t");
    assert_eq!(s.run("(real->integer 2.9)").unwrap(), "2");
    assert_eq!(s.run("(real->integer -2.9)").unwrap(), "-2");
    assert_eq!(s.run("(integer->real 3)").unwrap(), "3.0");
    assert_eq!(s.run("(/ 1 0)"), Err(Error::DivisionByZero));
    assert_eq!(s.run("(/ 1.0 0.0)"), Err(Error::DivisionByZero));
}

#[test]
fn test_list_primitives() {
    let mut s = Session::new();
    assert_eq!(s.run("(car '(1 2 3))").unwrap(), "1");
    assert_eq!(s.run("(cdr '(1 2 3))").unwrap(), "(2 3)");
    assert_eq!(s.run("(cons 1 '(2 3))").unwrap(), "(1 2 3)");
    assert_eq!(s.run("(cons 1 2)").unwrap(), "(1 2)");
    assert_eq!(s.run("(atom? 'x)").unwrap(), "#t");
    assert_eq!(s.run("(atom? '(1))").unwrap(), "#f");
    assert_eq!(s.run("(null? '())").unwrap(), "#t");
    assert_eq!(s.run("(null? '(1))").unwrap(), "#f");
    assert_eq!(s.run("(pair? '(1))").unwrap(), "#t");
    assert_eq!(s.run("(pair? '())").unwrap(), "#f");
    assert_eq!(s.run("(eq? 'a 'a)").unwrap(), "#t");
    assert_eq!(s.run("(eq? 'a 'b)").unwrap(), "#f");
    assert_eq!(
        s.run("(car '())"),
        Err(Error::TypeError {
            op: "car/cdr",
            expected: "non-empty list"
        })
    );
}

#[test]
fn test_type_predicates_and_conversions() {
    let mut s = Session::new();
    assert_eq!(s.run("(boolean? #t)").unwrap(), "#t");
    assert_eq!(s.run("(char? #\\a)").unwrap(), "#t");
    assert_eq!(s.run("(string? \"x\")").unwrap(), "#t");
    assert_eq!(s.run("(number? 4)").unwrap(), "#t");
    assert_eq!(s.run("(integer? 4)").unwrap(), "#t");
    assert_eq!(s.run("(real? 4.0)").unwrap(), "#t");
    assert_eq!(s.run("(real? 4)").unwrap(), "#f");
    assert_eq!(s.run("(char->integer #\\a)").unwrap(), "97");
    assert_eq!(s.run("(integer->char 97)").unwrap(), "#\\a");
    assert_eq!(s.run("(number->string 42)").unwrap(), "\"42\"");
    assert_eq!(s.run("(string->number \"42\")").unwrap(), "42");
    assert_eq!(s.run("(string->number \"4.5\")").unwrap(), "4.5");
    assert_eq!(s.run("(not #f)").unwrap(), "#t");
    assert_eq!(
        s.run("(not 1)"),
        Err(Error::TypeError {
            op: "not",
            expected: "boolean"
        })
    );
}

#[test]
fn test_cond_clauses() {
    let mut s = Session::new();
    assert_eq!(s.run("(cond (#t 1) (#t 2))").unwrap(), "1");
    assert_eq!(s.run("(cond (#f 1) (#t 2))").unwrap(), "2");
    assert_eq!(s.run("(cond ((= 1 2) 'a) ((= 1 1) 'b))").unwrap(), "b");
    // Exhausted clauses yield the empty list.
    assert_eq!(s.run("(cond (#f 1))").unwrap(), "()");
    // Multiple consequent forms run in sequence.
    assert_eq!(s.run("(cond (#t (define x 5) (+ x 1)))").unwrap(), "6");
}

#[test]
fn test_logic_short_circuits() {
    let mut s = Session::new();
    assert_eq!(s.run("(and)").unwrap(), "#t");
    assert_eq!(s.run("(or)").unwrap(), "#f");
    assert_eq!(s.run("(and #t #t)").unwrap(), "#t");
    assert_eq!(s.run("(and #t #f)").unwrap(), "#f");
    assert_eq!(s.run("(or #f #t)").unwrap(), "#t");
    // The unused arm is never evaluated: the probe stays untouched.
    s.run("(define probe #f)").unwrap();
    assert_eq!(s.run("(or #t (set! probe #t)) probe").unwrap(), "#f");
    assert_eq!(s.run("(and #f (set! probe #t)) probe").unwrap(), "#f");
}

#[test]
fn test_define_and_set() {
    let mut s = Session::new();
    s.run("(define x 10)").unwrap();
    assert_eq!(s.run("x").unwrap(), "10");
    s.run("(set! x 11)").unwrap();
    assert_eq!(s.run("x").unwrap(), "11");
    assert_eq!(s.run("(set! nope 1)"), Err(Error::UnboundSymbol("nope".into())));
    assert_eq!(s.run("nope"), Err(Error::UnboundSymbol("nope".into())));
}

#[test]
fn test_closure_application() {
    let mut s = Session::new();
    // ((lambda (x y) (cons x y)) 1 '(2 3)) => (1 2 3)
    assert_eq!(
        s.run("((lambda (x y) (cons x y)) 1 '(2 3))").unwrap(),
        "(1 2 3)"
    );
    s.run("(define add (lambda (x y) (+ x y)))").unwrap();
    assert_eq!(s.run("(add 2 3)").unwrap(), "5");
    // Sugar form with a multi-form body.
    s.run("(define (twice x) (define two 2) (* two x))").unwrap();
    assert_eq!(s.run("(twice 21)").unwrap(), "42");
    // Missing and extra arguments fail without binding anything.
    assert_eq!(
        s.run("(add 1)"),
        Err(Error::ArityError {
            op: "lambda application",
            expected: "matching parameter count",
            found: 1
        })
    );
    assert_eq!(
        s.run("(add 1 2 3)"),
        Err(Error::ArityError {
            op: "lambda application",
            expected: "matching parameter count",
            found: 3
        })
    );
}

#[test]
fn test_recursive_factorial() {
    let mut s = Session::new();
    s.run("(define (fact n) (cond ((= n 0) 1) (#t (* n (fact (- n 1))))))")
        .unwrap();
    assert_eq!(s.run("(fact 5)").unwrap(), "120");
}

#[test]
fn test_macro_expansion() {
    let mut s = Session::new();
    s.run("(define if (macro (t c e) (cond (t c) (#t e))))").unwrap();
    assert_eq!(s.run("(if (> 3 2) 'yes 'no)").unwrap(), "yes");
    assert_eq!(s.run("(if (> 2 3) 'yes 'no)").unwrap(), "no");
    // The untaken branch is never evaluated.
    assert_eq!(s.run("(if #t 'ok (undefined-symbol))").unwrap(), "ok");
}

#[test]
fn test_tail_recursion_elides_stack() {
    let mut s = Session::new();
    s.run("(define (count n) (cond ((= n 0) 'done) (#t (count (- n 1)))))")
        .unwrap();
    assert_eq!(s.run("(count 5000)").unwrap(), "done");
}

#[test]
fn test_tail_recursion_through_begin() {
    let mut s = Session::new();
    s.run("(define (loop n) (begin (cond ((= n 0) 'done) (#t (loop (- n 1))))))")
        .unwrap();
    assert_eq!(s.run("(loop 10000)").unwrap(), "done");
}

#[test]
fn test_variadic_parameters() {
    let mut s = Session::new();
    s.run("(define list (lambda (. items) items))").unwrap();
    assert_eq!(s.run("(list 1 2 3)").unwrap(), "(1 2 3)");
    assert_eq!(s.run("(list)").unwrap(), "()");
    s.run("(define rest (lambda (x . more) more))").unwrap();
    assert_eq!(s.run("(rest 1 2 3)").unwrap(), "(2 3)");
}

#[test]
fn test_apply_equals_direct_call() {
    let mut s = Session::new();
    s.run("(define (add2 x y) (+ x y))").unwrap();
    assert_eq!(s.run("(apply add2 '(1 2))").unwrap(), s.run("(add2 1 2)").unwrap());
    assert_eq!(s.run("(apply + '(1 2))").unwrap(), "3");
    assert_eq!(s.run("(apply add2 1 '(2))").unwrap(), "3");
}

#[test]
fn test_assoc_and_subst() {
    let mut s = Session::new();
    assert_eq!(s.run("(assoc 'k (cons '(k 1) '()))").unwrap(), "1");
    assert_eq!(s.run("(assoc 'k '((a 0) (k 2)))").unwrap(), "2");
    assert_eq!(s.run("(assoc 'missing '((a 0)))").unwrap(), "#f");
    // Three-argument assoc replaces in place.
    s.run("(define e '((k 1)))").unwrap();
    assert_eq!(s.run("(assoc 'k e 9)").unwrap(), "9");
    assert_eq!(s.run("(assoc 'k e)").unwrap(), "9");
    // Substitution without occurrence returns a structurally equal value.
    assert_eq!(s.run("(subst 'a 'b '(a (a c)))").unwrap(), "(b (b c))");
    assert_eq!(s.run("(subst 'z 'b '(a (a c)))").unwrap(), "(a (a c))");
}

#[test]
fn test_begin_sequencing_and_scope() {
    let mut s = Session::new();
    assert_eq!(s.run("(begin 1 2 3)").unwrap(), "3");
    // A define inside begin extends the begin frame, not the global one.
    assert_eq!(s.run("(begin (define inner 1) inner)").unwrap(), "1");
    assert_eq!(s.run("inner"), Err(Error::UnboundSymbol("inner".into())));
}

#[test]
fn test_eval_in_environment() {
    let mut s = Session::new();
    assert_eq!(s.run("(eval '(+ 1 2) (current-environment))").unwrap(), "3");
    s.run("(define x 7)").unwrap();
    assert_eq!(s.run("(eval 'x (current-environment))").unwrap(), "7");
}

#[test]
fn test_library_load() {
    let mut s = Session::new();
    s.run("(load 'map)").unwrap();
    assert_eq!(
        s.run("(map (lambda (x) (* x x)) '(1 2 3))").unwrap(),
        "(1 4 9)"
    );
    s.run("(load 'length)").unwrap();
    assert_eq!(s.run("(length '(a b c d))").unwrap(), "4");
    s.run("(load 'filter)").unwrap();
    assert_eq!(s.run("(filter (lambda (x) (> x 1)) '(0 1 2 3))").unwrap(), "(2 3)");
    assert_eq!(
        s.run("(load 'no-such-entry)"),
        Err(Error::UnknownLibrary("no-such-entry".into()))
    );
    // unload rebinds the name to #f.
    s.run("(unload 'length)").unwrap();
    assert_eq!(s.run("length").unwrap(), "#f");
}

#[test]
fn test_let_macros_from_library() {
    let mut s = Session::new();
    s.run("(load 'foldl) (load 'pair) (load 'let)").unwrap();
    assert_eq!(s.run("(let ((x 1) (y 2)) (+ x y))").unwrap(), "3");
    s.run("(load 'let*)").unwrap();
    assert_eq!(s.run("(let* ((x 1) (y (+ x 1))) (+ x y))").unwrap(), "3");
}

#[test]
fn test_closure_captures_definition_environment() {
    let mut s = Session::new();
    s.run("(define base 10)").unwrap();
    s.run("(define (above x) (+ base x))").unwrap();
    assert_eq!(s.run("(above 5)").unwrap(), "15");
    // Rebinding base through set! is visible; shadowing by a later
    // define is too, because the captured alist shares the spine.
    s.run("(set! base 20)").unwrap();
    assert_eq!(s.run("(above 5)").unwrap(), "25");
}

#[test]
fn test_print_forms() {
    let mut s = Session::new();
    assert_eq!(s.run("(lambda (x) x)").unwrap(), "#closure");
    assert_eq!(s.run("'(lambda (x) x)").unwrap(), "#lambda");
    assert_eq!(s.run("(macro (x) x)").unwrap(), "#macro");
    assert_eq!(s.run("\"text\"").unwrap(), "\"text\"");
    assert_eq!(s.run("1.5").unwrap(), "1.5");
}

#[test]
fn test_string_data_round_trip() {
    let mut s = Session::new();
    s.run("(define d (string->data \"abc\"))").unwrap();
    assert_eq!(s.run("(data->string d)").unwrap(), "\"abc\"");
}

#[cfg(not(feature = "raw-memory"))]
#[test]
fn test_memory_operators_need_the_toggle() {
    let mut s = Session::new();
    assert_eq!(s.run("(mem-alloc 4)"), Err(Error::Unsupported("mem-alloc")));
    assert_eq!(
        s.run("(mem-addr (string->data \"x\"))"),
        Err(Error::Unsupported("mem-addr"))
    );
}

#[cfg(feature = "raw-memory")]
#[test]
fn test_memory_operators_on_data() {
    let mut s = Session::new();
    s.run("(define buf (mem-alloc 4))").unwrap();
    assert_eq!(s.run("(string? (data->string (mem-fill buf 97 4)))").unwrap(), "#t");
    s.run("(define src (string->data \"zz\"))").unwrap();
    s.run("(define dst (mem-alloc 2))").unwrap();
    assert_eq!(s.run("(data->string (mem-copy dst src 2))").unwrap(), "\"zz\"");
    assert_eq!(s.run("(integer? (mem-addr src))").unwrap(), "#t");
}

#[test]
fn test_errors_leave_global_environment_intact() {
    let mut s = Session::new();
    s.run("(define kept 1)").unwrap();
    assert!(s.run("(car 5)").is_err());
    assert!(s.run("(+ 'a 1)").is_err());
    assert_eq!(s.run("kept").unwrap(), "1");
    // Defines performed before an error inside a begin remain visible
    // inside that begin only; the global binding survives unchanged.
    assert!(s.run("(begin (define kept 2) (car 5))").is_err());
    assert_eq!(s.run("kept").unwrap(), "1");
}

#[test]
fn test_empty_list_does_not_evaluate() {
    let mut s = Session::new();
    assert_eq!(s.run("(())"), Err(Error::EmptyApplication));
    assert_eq!(s.run("()"), Err(Error::EmptyApplication));
}
