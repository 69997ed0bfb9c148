// ABOUTME: End-to-end tests driving full sources through parse, compile and eval

use schemer::builtins::register_builtins;
use schemer::comp;
use schemer::error::{ErrorKind, Result};
use schemer::eval::Env;
use schemer::parser::{parse_one, Reader};
use schemer::value::{Value, ValueKind};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Set up an environment with builtins and a captured output sink.
fn setup() -> (Env, SharedBuf) {
    let buf = SharedBuf::default();
    let mut env = Env::with_output(Box::new(buf.clone()));
    register_builtins(&mut env).expect("builtin registration failed");
    (env, buf)
}

/// Compile a whole source as one module and evaluate it, returning the
/// captured display output and the final value.
fn eval_module(src: &str) -> (String, Result<Value>) {
    let (mut env, buf) = setup();
    let mut reader = Reader::new("test", src);
    let result =
        comp::compile_module(&mut reader, &env, true).and_then(|ins| env.eval_result(ins));
    let output = String::from_utf8(buf.0.borrow().clone()).expect("display output not utf-8");
    (output, result)
}

fn displayed(src: &str) -> String {
    let (output, result) = eval_module(src);
    result.expect("evaluation failed");
    output
}

/// Evaluate top-level forms one at a time, REPL style, in a shared env.
fn eval_forms(env: &mut Env, src: &str) -> Result<Value> {
    let mut reader = Reader::new("test", src);
    let mut last = Value::void();
    loop {
        match reader.next_value() {
            Ok(form) => {
                let ins = comp::compile_expr_global(&form, env, true)?;
                last = env.eval_result(ins)?;
            }
            Err(e) if e.is_no_value() => return Ok(last),
            Err(e) => return Err(e),
        }
    }
}

// ===== Core behaviours =====

#[test]
fn test_map_folds_across_lists() {
    assert_eq!(
        displayed("(display (map + '(1 2) '(1 2) '(1 2)))"),
        "(3 6)"
    );
}

#[test]
fn test_map_with_unary_function() {
    assert_eq!(displayed("(display (map car '((1) (2))))"), "(1 2)");
}

#[test]
fn test_closure_keeps_captured_argument() {
    assert_eq!(
        displayed(
            "(define (test x) (lambda () x))
             (define testa (test \"A\"))
             (display (testa))"
        ),
        "A"
    );
}

#[test]
fn test_nested_closures() {
    assert_eq!(
        displayed(
            "(define (test x)
               (lambda (y)
                 (lambda ()
                   (list x y))))
             (display (((test 1) 2)))"
        ),
        "(1 2)"
    );
}

#[test]
fn test_and_short_circuits_with_side_effects() {
    assert_eq!(
        displayed(
            "(define v false)
             (define (alternate) (set! v (not v)) v)
             (display (and (alternate) 1))
             (display (and (alternate) 1))
             (display (and (alternate) (alternate)))
             (display (and (alternate) (alternate)))"
        ),
        "1falsefalsefalse"
    );
}

#[test]
fn test_exclusive_begin_blocks_share_memory() {
    assert_eq!(
        displayed(
            "(define (test op later x)
               (if (> x 0)
                 (begin
                   (define xx (op x))
                   (later (lambda (x)
                     (display x)
                     (display xx))))
                 (begin
                   (define xxx (op (op x)))
                   (later (lambda (x)
                     (display x)
                     (display xxx))))))
             (define (double x) (* x 2))
             (define (later fn) (fn 42))
             (test double later -2)
             (test double later 2)"
        ),
        "42-8424"
    );
}

#[test]
fn test_temporary_locals_reuse_frame_slots() {
    let (mut env, buf) = setup();
    eval_forms(
        &mut env,
        "(define (probe x)
           (define v (+ x 3))
           (display v)
           (begin
             (define v2 (+ x 4))
             (display v2)))
         (probe 1)",
    )
    .expect("evaluation failed");
    assert_eq!(String::from_utf8(buf.0.borrow().clone()).unwrap(), "45");

    // two live slots: the argument plus one shared temporary
    let probe = env.glob_const.get("probe").expect("probe not published");
    match &probe.kind {
        ValueKind::Function(func) => assert_eq!(func.size.get(), 2),
        other => panic!("expected a function, got {:?}", other),
    }
}

#[test]
fn test_parse_error_kinds() {
    assert!(parse_one("test", "(list").unwrap_err().is_eof());
    assert!(parse_one("test", "").unwrap_err().is_no_value());
}

#[test]
fn test_unknown_variable_is_tagged_at_column_one() {
    let (output, result) = eval_module("foo");
    assert_eq!(output, "");
    let err = result.unwrap_err();
    assert!(matches!(err.kind, ErrorKind::UnknownVariable));
    let tag = err.tag.expect("unknown variable error should carry a tag");
    assert_eq!(tag.line.row, 1);
    assert_eq!(tag.column, 1);
}

// ===== Boolean forms =====

#[test]
fn test_and_basics() {
    assert_eq!(displayed("(display (and true))"), "true");
    assert_eq!(displayed("(display (and false true))"), "false");
    assert_eq!(displayed("(display (and))"), "false");
}

#[test]
fn test_or_basics() {
    assert_eq!(displayed("(display (or true))"), "true");
    assert_eq!(displayed("(display (or false true))"), "true");
    assert_eq!(displayed("(display (or))"), "true");
    assert_eq!(displayed("(display (or false \"x\"))"), "x");
}

#[test]
fn test_or_short_circuits_with_side_effects() {
    assert_eq!(
        displayed(
            "(define v false)
             (define (alternate) (set! v (not v)) v)
             (display (or (alternate) 1))
             (display (or (alternate) 1))"
        ),
        "true1"
    );
}

// ===== Begin blocks and locals =====

#[test]
fn test_begin_runs_in_order() {
    assert_eq!(displayed("(begin (display 1) (display 2))"), "12");
}

#[test]
fn test_recursion_through_begin() {
    assert_eq!(
        displayed(
            "(define (test pos-f neg-f lst)
               (if (pair? lst)
                 (begin
                   ((if (< (car lst) 0) neg-f pos-f) (car lst))
                   (test pos-f neg-f (cdr lst)))))
             (test
               (lambda (x) (display \"p\"))
               (lambda (x) (display \"n\"))
               (list -2 -1 0 1 2))"
        ),
        "nnppp"
    );
}

#[test]
fn test_sequential_begin_blocks_keep_captured_locals() {
    assert_eq!(
        displayed(
            "(define (test fn-collector)
               (define var 5)
               (begin
                 (define v2 (* var 2))
                 (fn-collector (lambda () v2)))
               (begin
                 (define v3 (* var 3))
                 (fn-collector (lambda () v3))))
             (define fn-lst ())
             (test (lambda (fn)
               ; reverse ordered
               (set! fn-lst (cons fn fn-lst))))
             (for-each (lambda (fn) (display (fn)) (display \" \")) fn-lst)"
        ),
        "15 10 "
    );
}

#[test]
fn test_mutual_recursion_through_globals() {
    assert_eq!(
        displayed(
            "(define (traverse c)
               (if (pair? c)
                   (traverse-pair c)
                   (if (not (null? c))
                       (display c))))
             (define (traverse-pair c)
               (traverse-car c)
               (traverse-cdr c))
             (define (traverse-car c)
               (traverse (car c)))
             (define (traverse-cdr c)
               (traverse (cdr c)))
             (traverse (list 1 (list 2 3)))"
        ),
        "123"
    );
}

// ===== Continuations =====

#[test]
fn test_call_cc_escapes_argument_evaluation() {
    assert_eq!(
        displayed("(display (+ 1 (call/cc (lambda (k) (+ 10 (k 100))))))"),
        "101"
    );
}

#[test]
fn test_continuations_are_multi_shot() {
    assert_eq!(
        displayed(
            "(define saved false)
             (define count 0)
             (display (call/cc (lambda (k) (set! saved k) \"first\")))
             (if (< count 2)
                 (begin
                   (set! count (+ count 1))
                   (saved \"again\")))"
        ),
        "firstagainagain"
    );
}

#[test]
fn test_continuation_requires_one_argument() {
    let (_, result) = eval_module("((call/cc (lambda (k) k)) 1 2)");
    assert!(matches!(
        result.unwrap_err().kind,
        ErrorKind::WrongArity { .. }
    ));
}

// ===== Errors =====

#[test]
fn test_undefined_variable_in_function() {
    let (_, result) = eval_module("((lambda (a) (+ a b)) 1)");
    assert!(matches!(result.unwrap_err().kind, ErrorKind::UnknownVariable));
}

#[test]
fn test_misplaced_define_rejected() {
    let (_, result) = eval_module("((lambda (a) (+ a 1)) (define a 3))");
    assert!(matches!(result.unwrap_err().kind, ErrorKind::Compile(_)));
}

#[test]
fn test_wrong_arity_aborts() {
    let (_, result) = eval_module("((lambda (a b) a) 1)");
    assert!(matches!(
        result.unwrap_err().kind,
        ErrorKind::WrongArity { .. }
    ));
}

#[test]
fn test_missing_dotted_arguments_abort() {
    let (_, result) = eval_module("((lambda (a . b)))");
    assert!(matches!(
        result.unwrap_err().kind,
        ErrorKind::WrongArity { .. }
    ));
}

#[test]
fn test_set_of_builtin_constant_fails() {
    let (_, result) = eval_module("(set! car 1)");
    assert!(result.is_err());
}

#[test]
fn test_redefining_published_function_fails() {
    let mut env = Env::new();
    eval_forms(&mut env, "(define (f x) x)").unwrap();
    let err = eval_forms(&mut env, "(define (f x) x)").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::ConstantRedefine));
}

#[test]
fn test_errors_leave_prior_side_effects() {
    let (output, result) = eval_module("(display 1) (display unknown-name)");
    assert_eq!(output, "1");
    assert!(result.is_err());
}

// ===== Arithmetic and builtins =====

#[test]
fn test_arithmetic_folds() {
    assert_eq!(displayed("(display (+ 1 2 3))"), "6");
    assert_eq!(displayed("(display (* 2 3 4))"), "24");
    assert_eq!(displayed("(display (- 10 3 2))"), "5");
    assert_eq!(displayed("(display (/ 5 2))"), "2.5");
    assert_eq!(displayed("(display (< 1 2))"), "true");
    assert_eq!(displayed("(display (>= 1 2))"), "false");
}

#[test]
fn test_equality_builtins() {
    assert_eq!(displayed("(display (equal? '(1 2) '(1 2)))"), "true");
    assert_eq!(displayed("(display (eq? '(1 2) '(1 2)))"), "false");
    assert_eq!(displayed("(display (eq? 'a 'a))"), "true");
}

#[test]
fn test_equality_on_callables() {
    // the same global operator looked up twice is eq? to itself
    assert_eq!(displayed("(display (eq? + +))"), "true");
    assert_eq!(displayed("(display (eq? car car))"), "true");
    assert_eq!(
        displayed("(define ops (list + -)) (display (equal? ops (list + -)))"),
        "true"
    );
    assert_eq!(
        displayed("(display (call/cc (lambda (k) (eq? k k))))"),
        "true"
    );
}

#[test]
fn test_newline_returns_a_string() {
    assert_eq!(displayed("(display (newline))"), "\n");
}

#[test]
fn test_dotted_literals_display() {
    assert_eq!(displayed("(display '(1 . 2))"), "(1 . 2)");
    assert_eq!(displayed("(display (cons 1 2))"), "(1 . 2)");
}

// ===== REPL-style sequences =====

#[test]
fn test_global_state_survives_across_forms() {
    let (mut env, buf) = setup();
    eval_forms(
        &mut env,
        "(define counter 0)
         (define (bump) (set! counter (+ counter 1)) counter)
         (bump)
         (bump)
         (display (bump))",
    )
    .unwrap();
    assert_eq!(String::from_utf8(buf.0.borrow().clone()).unwrap(), "3");
}

#[test]
fn test_empty_lambda_body_is_callable() {
    let (_, result) = eval_module("((lambda ()))");
    assert!(result.is_ok());
}

#[test]
fn test_module_function_defines_resolve_statically() {
    // module-level function defines are not published to the globals, but
    // calls inside the module resolve to them directly
    let (mut env, buf) = setup();
    let mut reader = Reader::new("test", "(define (id x) x) (display (id 9))");
    let ins = comp::compile_module(&mut reader, &env, true).unwrap();
    env.eval_result(ins).unwrap();
    assert_eq!(String::from_utf8(buf.0.borrow().clone()).unwrap(), "9");
    assert!(env.glob_const.get("id").is_none());
}
