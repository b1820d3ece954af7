//! Compiled-in library of Scheme-defined procedures and macros.
//!
//! Each entry is the value form only; `(load 'name)` parses the source
//! and binds it with an ordinary `define`, so recursive references
//! resolve through the define pre-extension like any user definition.
//! The `let` family expects `foldl` and `pair` to be loaded first.

pub const LAMBDA_SOURCES: &[(&str, &str)] = &[
    (
        "map",
        "(lambda (func lst) \
           (cond ((null? lst) '()) \
                 (#t (cons (func (car lst)) (map func (cdr lst))))))",
    ),
    (
        "foldl",
        "(lambda (binfunc acc lst) \
           (cond ((null? lst) acc) \
                 (#t (foldl binfunc (binfunc (car lst) acc) (cdr lst)))))",
    ),
    (
        "foldr",
        "(lambda (binfunc acc lst) \
           (cond ((null? lst) acc) \
                 (#t (binfunc (car lst) (foldr binfunc acc (cdr lst))))))",
    ),
    (
        "filter",
        "(lambda (pred lst) \
           (cond ((null? lst) '()) \
                 ((pred (car lst)) (cons (car lst) (filter pred (cdr lst)))) \
                 (#t (filter pred (cdr lst)))))",
    ),
    (
        "length",
        "(lambda (lst) \
           (cond ((null? lst) 0) \
                 (#t (+ 1 (length (cdr lst))))))",
    ),
    ("pair", "(lambda (x y) (cons x (cons y '())))"),
];

pub const MACRO_SOURCES: &[(&str, &str)] = &[
    (
        "if",
        "(macro (test if-clause else-clause) \
           (cond (test if-clause) (#t else-clause)))",
    ),
    (
        "let",
        "(macro (bindings expression) \
           (begin \
             (define old-env (current-environment)) \
             (define appender (lambda (binding cur-env) \
               (cons (pair (car binding) (eval (car (cdr binding)) old-env)) cur-env))) \
             (define new-env (foldl appender old-env (quote bindings))) \
             (eval (quote expression) new-env)))",
    ),
    (
        "let*",
        "(macro (bindings expression) \
           (begin \
             (define old-env (current-environment)) \
             (define appender (lambda (binding cur-env) \
               (cons (pair (car binding) (eval (car (cdr binding)) cur-env)) cur-env))) \
             (define new-env (foldl appender old-env (quote bindings))) \
             (eval (quote expression) new-env)))",
    ),
    (
        "letrec",
        "(macro (bindings expression) \
           (begin \
             (define old-env (current-environment)) \
             (define appender (lambda (binding cur-env) \
               (cons (pair (car binding) '()) cur-env))) \
             (define setter (lambda (binding cur-env) \
               (begin \
                 (assoc (car binding) cur-env (eval (car (cdr binding)) cur-env)) \
                 cur-env))) \
             (define tmp-env (foldl appender old-env (quote bindings))) \
             (define new-env (foldl setter tmp-env (quote bindings))) \
             (eval (quote expression) new-env)))",
    ),
];

/// Look up a library source by name, lambdas first.
#[must_use]
pub fn find(name: &str) -> Option<&'static str> {
    LAMBDA_SOURCES
        .iter()
        .chain(MACRO_SOURCES.iter())
        .find(|(entry, _)| *entry == name)
        .map(|(_, source)| *source)
}

#[test]
fn test_library_sources_parse() {
    let mut heap = crate::Heap::new();
    for (name, source) in LAMBDA_SOURCES.iter().chain(MACRO_SOURCES.iter()) {
        let mut scanner = crate::Scanner::new(source);
        let parsed = crate::reader::parse(&mut heap, &mut scanner);
        assert!(parsed.is_ok(), "library source `{name}` must parse");
    }
    assert!(find("map").is_some());
    assert!(find("if").is_some());
    assert!(find("missing").is_none());
}
