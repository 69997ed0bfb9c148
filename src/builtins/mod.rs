//! # Built-in Functions Module
//!
//! The minimum library the core expects, registered into the constant
//! globals at startup:
//!
//! - **[arithmetic]**: +, -, *, /, <, <=, >, >= - left-fold host operators
//! - **[lists]**: car, cdr, cons, list, null?, pair? - pair manipulation
//! - **[predicates]**: number?, string?, symbol?, eq?, equal?, not
//! - **[console]**: display, newline
//!
//! `apply` is the dedicated callable kind dispatched by the interpreter.
//! `map` and `for-each` are derived in source and compiled here at startup.

use crate::comp;
use crate::error::{Error, Result};
use crate::eval::Env;
use crate::parser;
use crate::value::{Value, ValueKind};

pub mod arithmetic;
pub mod console;
pub mod lists;
pub mod predicates;

/// Register every builtin plus the source-derived loops.
pub fn register_builtins(env: &mut Env) -> Result<()> {
    arithmetic::register(env);
    lists::register(env);
    predicates::register(env);
    console::register(env);
    env.glob_const
        .insert("apply".to_string(), Value::new(ValueKind::Apply));
    register_loops(env)
}

/// `map` and `for-each` walk their list-of-lists arguments with plain
/// recursion, so they are written in the language itself and compiled once
/// at startup.
fn register_loops(env: &mut Env) -> Result<()> {
    const LOOPS: &str = r#"((lambda ()
  (define (all-car l)
    (if (null? l)
        ()
        (cons (car (car l)) (all-car (cdr l)))))
  (define (all-cdr l)
    (if (null? l)
        ()
        (cons (cdr (car l)) (all-cdr (cdr l)))))
  (define (all-null? l)
    (if (null? l)
        true
        (if (null? (car l))
            (all-null? (cdr l))
            false)))
  (define (map fn lsts)
    (if (all-null? lsts)
        ()
        (cons (apply fn (all-car lsts)) (map fn (all-cdr lsts)))))
  (define (for-each fn lsts)
    (if (not (all-null? lsts))
        (begin
          (apply fn (all-car lsts))
          (for-each fn (all-cdr lsts)))))
  (list
    (lambda (fn . lsts) (map fn lsts))
    (lambda (fn . lsts) (for-each fn lsts)))))"#;

    let form = parser::parse_one("loops.basics", LOOPS)?;
    let ins = comp::compile_expr_global(&form, env, true)?;
    let result = env.eval_result(ins)?;
    let items = result.list_elements()?;
    if items.len() != 2 {
        return Err(Error::internal("loop bootstrap returned a bad list"));
    }
    env.glob_const.insert("map".to_string(), items[0].clone());
    env.glob_const
        .insert("for-each".to_string(), items[1].clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_builtins_populates_constants() {
        let mut env = Env::new();
        register_builtins(&mut env).unwrap();
        for name in [
            "car", "cdr", "cons", "display", "newline", "not", "eq?", "equal?", "list", "null?",
            "pair?", "number?", "string?", "symbol?", "apply", "+", "-", "*", "/", "<", "<=",
            ">", ">=", "map", "for-each",
        ] {
            assert!(env.lookup_const(name).is_some(), "missing builtin {}", name);
        }
    }

    #[test]
    fn test_loop_bootstrap_yields_functions() {
        let mut env = Env::new();
        register_builtins(&mut env).unwrap();
        assert!(matches!(
            env.lookup_const("map").map(|v| &v.kind),
            Some(ValueKind::Function(_))
        ));
        assert!(matches!(
            env.lookup_const("for-each").map(|v| &v.kind),
            Some(ValueKind::Function(_))
        ));
    }
}
