//! Arithmetic and comparison operators: +, -, *, /, <, <=, >, >=
//!
//! All are left-folds over host numbers requiring at least one argument.
//! Integer arithmetic stays integral until a float appears; division always
//! produces a float. Comparisons yield the `true`/`false` symbols.

use crate::error::{Error, Result};
use crate::eval::Env;
use crate::function::BinaryOp;
use crate::value::{Host, Value, ValueKind};

fn as_float(h: &Host) -> Result<f64> {
    match h {
        Host::Int(n) => Ok(*n as f64),
        Host::Float(f) => Ok(*f),
        _ => Err(Error::type_error("not a number")),
    }
}

pub fn host_add(a: Host, b: Host) -> Result<Host> {
    match (&a, &b) {
        (Host::Int(x), Host::Int(y)) => Ok(Host::Int(x + y)),
        _ => Ok(Host::Float(as_float(&a)? + as_float(&b)?)),
    }
}

pub fn host_sub(a: Host, b: Host) -> Result<Host> {
    match (&a, &b) {
        (Host::Int(x), Host::Int(y)) => Ok(Host::Int(x - y)),
        _ => Ok(Host::Float(as_float(&a)? - as_float(&b)?)),
    }
}

pub fn host_mul(a: Host, b: Host) -> Result<Host> {
    match (&a, &b) {
        (Host::Int(x), Host::Int(y)) => Ok(Host::Int(x * y)),
        _ => Ok(Host::Float(as_float(&a)? * as_float(&b)?)),
    }
}

pub fn host_div(a: Host, b: Host) -> Result<Host> {
    let divisor = as_float(&b)?;
    if divisor == 0.0 {
        return Err(Error::type_error("division by zero"));
    }
    Ok(Host::Float(as_float(&a)? / divisor))
}

pub fn host_lt(a: Host, b: Host) -> Result<Host> {
    Ok(Host::Bool(as_float(&a)? < as_float(&b)?))
}

pub fn host_le(a: Host, b: Host) -> Result<Host> {
    Ok(Host::Bool(as_float(&a)? <= as_float(&b)?))
}

pub fn host_gt(a: Host, b: Host) -> Result<Host> {
    Ok(Host::Bool(as_float(&a)? > as_float(&b)?))
}

pub fn host_ge(a: Host, b: Host) -> Result<Host> {
    Ok(Host::Bool(as_float(&a)? >= as_float(&b)?))
}

/// Register all arithmetic operators in the constant globals.
pub fn register(env: &mut Env) {
    let ops: [(&'static str, fn(Host, Host) -> Result<Host>); 8] = [
        ("+", host_add),
        ("-", host_sub),
        ("*", host_mul),
        ("/", host_div),
        ("<", host_lt),
        ("<=", host_le),
        (">", host_gt),
        (">=", host_ge),
    ];
    for (name, func) in ops {
        env.glob_const.insert(
            name.to_string(),
            Value::new(ValueKind::BinaryOp(BinaryOp { name, func })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_arithmetic_stays_integral() {
        assert_eq!(host_add(Host::Int(1), Host::Int(2)).unwrap(), Host::Int(3));
        assert_eq!(host_mul(Host::Int(3), Host::Int(4)).unwrap(), Host::Int(12));
        assert_eq!(host_sub(Host::Int(1), Host::Int(5)).unwrap(), Host::Int(-4));
    }

    #[test]
    fn test_float_contaminates() {
        assert_eq!(
            host_add(Host::Int(1), Host::Float(0.5)).unwrap(),
            Host::Float(1.5)
        );
    }

    #[test]
    fn test_division_is_float() {
        assert_eq!(host_div(Host::Int(4), Host::Int(2)).unwrap(), Host::Float(2.0));
        assert_eq!(host_div(Host::Int(5), Host::Int(2)).unwrap(), Host::Float(2.5));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(host_div(Host::Int(1), Host::Int(0)).is_err());
    }

    #[test]
    fn test_comparisons_yield_bools() {
        assert_eq!(host_lt(Host::Int(1), Host::Int(2)).unwrap(), Host::Bool(true));
        assert_eq!(host_ge(Host::Int(1), Host::Int(2)).unwrap(), Host::Bool(false));
    }

    #[test]
    fn test_non_number_rejected() {
        assert!(host_add(Host::Str("x".into()), Host::Int(1)).is_err());
        assert!(host_lt(Host::Bool(true), Host::Int(1)).is_err());
    }
}
