//! List builtins: car, cdr, cons, list, null?, pair?

use crate::error::{Error, ErrorKind, Result};
use crate::eval::Env;
use crate::function::Builtin;
use crate::value::{Value, ValueKind};

fn pair_error(name: &str, arg: &Value) -> Error {
    Error::with_data(
        ErrorKind::Type(format!("{}: not a pair:", name)),
        arg.clone(),
    )
}

pub fn builtin_car(_env: &mut Env, args: &[Value]) -> Result<Value> {
    let [arg] = args else {
        return Err(Error::wrong_arity("1"));
    };
    match &arg.kind {
        ValueKind::Pair(car, _) => Ok((**car).clone()),
        _ => Err(pair_error("car", arg)),
    }
}

pub fn builtin_cdr(_env: &mut Env, args: &[Value]) -> Result<Value> {
    let [arg] = args else {
        return Err(Error::wrong_arity("1"));
    };
    match &arg.kind {
        ValueKind::Pair(_, cdr) => Ok((**cdr).clone()),
        _ => Err(pair_error("cdr", arg)),
    }
}

pub fn builtin_cons(_env: &mut Env, args: &[Value]) -> Result<Value> {
    let [car, cdr] = args else {
        return Err(Error::wrong_arity("2"));
    };
    Ok(Value::pair(car.clone(), cdr.clone()))
}

pub fn builtin_list(_env: &mut Env, args: &[Value]) -> Result<Value> {
    Ok(Value::list(args.to_vec()))
}

pub fn builtin_is_null(_env: &mut Env, args: &[Value]) -> Result<Value> {
    let [arg] = args else {
        return Err(Error::wrong_arity("1"));
    };
    Ok(Value::from_host(crate::value::Host::Bool(arg.is_null())))
}

pub fn builtin_is_pair(_env: &mut Env, args: &[Value]) -> Result<Value> {
    let [arg] = args else {
        return Err(Error::wrong_arity("1"));
    };
    Ok(Value::from_host(crate::value::Host::Bool(matches!(
        arg.kind,
        ValueKind::Pair(_, _)
    ))))
}

/// Register all list builtins in the constant globals.
pub fn register(env: &mut Env) {
    let builtins: [Builtin; 6] = [
        Builtin {
            name: "car",
            func: builtin_car,
            pure: true,
        },
        Builtin {
            name: "cdr",
            func: builtin_cdr,
            pure: true,
        },
        Builtin {
            name: "cons",
            func: builtin_cons,
            pure: true,
        },
        Builtin {
            name: "list",
            func: builtin_list,
            pure: true,
        },
        Builtin {
            name: "null?",
            func: builtin_is_null,
            pure: true,
        },
        Builtin {
            name: "pair?",
            func: builtin_is_pair,
            pure: true,
        },
    ];
    for builtin in builtins {
        env.glob_const
            .insert(builtin.name.to_string(), Value::new(ValueKind::Builtin(builtin)));
    }
}
