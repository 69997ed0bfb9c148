//! Type and equality predicates: number?, string?, symbol?, eq?, equal?, not

use crate::error::{Error, Result};
use crate::eval::Env;
use crate::function::Builtin;
use crate::value::{Host, Value, ValueKind};
use std::rc::Rc;

fn bool_value(b: bool) -> Value {
    Value::from_host(Host::Bool(b))
}

fn one_arg<'a>(args: &'a [Value]) -> Result<&'a Value> {
    match args {
        [arg] => Ok(arg),
        _ => Err(Error::wrong_arity("1")),
    }
}

fn two_args<'a>(args: &'a [Value]) -> Result<(&'a Value, &'a Value)> {
    match args {
        [a, b] => Ok((a, b)),
        _ => Err(Error::wrong_arity("2")),
    }
}

pub fn builtin_is_number(_env: &mut Env, args: &[Value]) -> Result<Value> {
    Ok(bool_value(matches!(
        one_arg(args)?.kind,
        ValueKind::Number(_)
    )))
}

pub fn builtin_is_string(_env: &mut Env, args: &[Value]) -> Result<Value> {
    Ok(bool_value(matches!(one_arg(args)?.kind, ValueKind::Str(_))))
}

pub fn builtin_is_symbol(_env: &mut Env, args: &[Value]) -> Result<Value> {
    Ok(bool_value(matches!(
        one_arg(args)?.kind,
        ValueKind::Symbol(_)
    )))
}

/// Identity-flavoured equality: atoms compare by value, aggregates by
/// identity, host callables by their registered name (the same global
/// operator looked up twice is `eq?` to itself).
pub fn builtin_is_eq(_env: &mut Env, args: &[Value]) -> Result<Value> {
    let (a, b) = two_args(args)?;
    let eq = match (&a.kind, &b.kind) {
        (ValueKind::Null, ValueKind::Null) => true,
        (ValueKind::Void, ValueKind::Void) => true,
        (ValueKind::Symbol(x), ValueKind::Symbol(y)) => x == y,
        (ValueKind::Number(x), ValueKind::Number(y)) => x == y,
        (ValueKind::Function(x), ValueKind::Function(y)) => Rc::ptr_eq(x, y),
        (ValueKind::Closure(x), ValueKind::Closure(y)) => Rc::ptr_eq(x, y),
        (ValueKind::Continuation(x), ValueKind::Continuation(y)) => Rc::ptr_eq(x, y),
        (ValueKind::Builtin(x), ValueKind::Builtin(y)) => x.name == y.name,
        (ValueKind::BinaryOp(x), ValueKind::BinaryOp(y)) => x.name == y.name,
        (ValueKind::Apply, ValueKind::Apply) => true,
        _ => false,
    };
    Ok(bool_value(eq))
}

pub fn builtin_is_equal(_env: &mut Env, args: &[Value]) -> Result<Value> {
    let (a, b) = two_args(args)?;
    Ok(bool_value(a.equal(b)))
}

pub fn builtin_not(_env: &mut Env, args: &[Value]) -> Result<Value> {
    Ok(bool_value(one_arg(args)?.is_false()))
}

/// Register all predicates in the constant globals.
pub fn register(env: &mut Env) {
    let builtins: [Builtin; 6] = [
        Builtin {
            name: "number?",
            func: builtin_is_number,
            pure: true,
        },
        Builtin {
            name: "string?",
            func: builtin_is_string,
            pure: true,
        },
        Builtin {
            name: "symbol?",
            func: builtin_is_symbol,
            pure: true,
        },
        Builtin {
            name: "eq?",
            func: builtin_is_eq,
            pure: true,
        },
        Builtin {
            name: "equal?",
            func: builtin_is_equal,
            pure: true,
        },
        Builtin {
            name: "not",
            func: builtin_not,
            pure: true,
        },
    ];
    for builtin in builtins {
        env.glob_const
            .insert(builtin.name.to_string(), Value::new(ValueKind::Builtin(builtin)));
    }
}
