// ABOUTME: Value types representing Scheme data, with printing, equality and host conversion

use crate::error::{Error, ErrorKind, Result};
use crate::eval::Continuation;
use crate::function::{BinaryOp, Builtin, Closure, Function};
use crate::source::SourceTag;
use std::fmt;
use std::rc::Rc;

/// A numeric value, preserving the integer/float distinction of the parsed
/// form. Arithmetic promotes to float as soon as either side is one.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Int(n) => *n as f64,
            Number::Float(f) => *f,
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a == b,
            _ => self.as_f64() == other.as_f64(),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(n) => write!(f, "{}", n),
            // {:?} keeps a trailing .0 on integral floats
            Number::Float(n) => write!(f, "{:?}", n),
        }
    }
}

/// A Scheme value plus the source position it was parsed at, if any.
#[derive(Debug, Clone)]
pub struct Value {
    pub kind: ValueKind,
    pub tag: Option<SourceTag>,
}

#[derive(Debug, Clone)]
pub enum ValueKind {
    /// The empty list.
    Null,
    /// A cons cell owning both children.
    Pair(Box<Value>, Box<Value>),
    Symbol(String),
    Number(Number),
    Str(String),
    /// The result of forms with no meaningful value.
    Void,
    /// An unevaluated form.
    Quote(Box<Value>),
    /// A first-class error value.
    Error(Box<Error>),
    Function(Rc<Function>),
    Closure(Rc<Closure>),
    Continuation(Rc<Continuation>),
    Builtin(Builtin),
    BinaryOp(BinaryOp),
    Apply,
}

/// Host-side primitive, the representation builtins compute with.
#[derive(Debug, Clone, PartialEq)]
pub enum Host {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Symbol(String),
}

impl Value {
    pub fn new(kind: ValueKind) -> Self {
        Value { kind, tag: None }
    }

    pub fn null() -> Self {
        Value::new(ValueKind::Null)
    }

    pub fn void() -> Self {
        Value::new(ValueKind::Void)
    }

    pub fn symbol(name: impl Into<String>) -> Self {
        Value::new(ValueKind::Symbol(name.into()))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::new(ValueKind::Str(s.into()))
    }

    pub fn int(n: i64) -> Self {
        Value::new(ValueKind::Number(Number::Int(n)))
    }

    pub fn float(n: f64) -> Self {
        Value::new(ValueKind::Number(Number::Float(n)))
    }

    pub fn pair(car: Value, cdr: Value) -> Self {
        Value::new(ValueKind::Pair(Box::new(car), Box::new(cdr)))
    }

    #[allow(dead_code)]
    pub fn quote(inner: Value) -> Self {
        Value::new(ValueKind::Quote(Box::new(inner)))
    }

    pub fn truth() -> Self {
        Value::symbol("true")
    }

    pub fn falsity() -> Self {
        Value::symbol("false")
    }

    /// Build a proper list from host-side items.
    pub fn list(items: Vec<Value>) -> Self {
        let mut tail = Value::null();
        for item in items.into_iter().rev() {
            tail = Value::pair(item, tail);
        }
        tail
    }

    pub fn from_host(h: Host) -> Self {
        match h {
            Host::Int(n) => Value::int(n),
            Host::Float(f) => Value::float(f),
            Host::Bool(true) => Value::truth(),
            Host::Bool(false) => Value::falsity(),
            Host::Str(s) => Value::string(s),
            Host::Symbol(s) => Value::symbol(s),
        }
    }

    pub fn to_host(&self) -> Result<Host> {
        match &self.kind {
            ValueKind::Str(s) => Ok(Host::Str(s.clone())),
            ValueKind::Number(Number::Int(n)) => Ok(Host::Int(*n)),
            ValueKind::Number(Number::Float(f)) => Ok(Host::Float(*f)),
            ValueKind::Symbol(s) => Ok(Host::Symbol(s.clone())),
            _ => Err(Error::with_data(
                ErrorKind::Type("unable to interpret value:".into()),
                self.clone(),
            )),
        }
    }

    /// Only the symbol `false` is false.
    pub fn is_false(&self) -> bool {
        matches!(&self.kind, ValueKind::Symbol(s) if s == "false")
    }

    pub fn is_true(&self) -> bool {
        !self.is_false()
    }

    /// Whether this is one of the two boolean-valued symbols.
    pub fn is_boolean_symbol(&self) -> bool {
        matches!(&self.kind, ValueKind::Symbol(s) if s == "true" || s == "false")
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pair(&self) -> Option<(&Value, &Value)> {
        match &self.kind {
            ValueKind::Pair(car, cdr) => Some((car, cdr)),
            _ => None,
        }
    }

    /// The elements of a proper list; improper tails are an error.
    pub fn list_elements(&self) -> Result<Vec<&Value>> {
        let mut items = Vec::new();
        let mut cursor = self;
        loop {
            match &cursor.kind {
                ValueKind::Null => return Ok(items),
                ValueKind::Pair(car, cdr) => {
                    items.push(car);
                    cursor = cdr;
                }
                _ => {
                    return Err(Error::with_data(
                        ErrorKind::Compile("malformed list".into()),
                        cursor.clone(),
                    ))
                }
            }
        }
    }

    /// Structural equality; source tags are ignored. Compiled callables
    /// compare by identity, host callables by their registered name, so
    /// `equal(x, x)` holds for every value.
    pub fn equal(&self, other: &Value) -> bool {
        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => true,
            (ValueKind::Void, ValueKind::Void) => true,
            (ValueKind::Pair(a1, d1), ValueKind::Pair(a2, d2)) => a1.equal(a2) && d1.equal(d2),
            (ValueKind::Symbol(a), ValueKind::Symbol(b)) => a == b,
            (ValueKind::Number(a), ValueKind::Number(b)) => a == b,
            (ValueKind::Str(a), ValueKind::Str(b)) => a == b,
            (ValueKind::Quote(a), ValueKind::Quote(b)) => a.equal(b),
            (ValueKind::Function(a), ValueKind::Function(b)) => Rc::ptr_eq(a, b),
            (ValueKind::Closure(a), ValueKind::Closure(b)) => Rc::ptr_eq(a, b),
            (ValueKind::Continuation(a), ValueKind::Continuation(b)) => Rc::ptr_eq(a, b),
            (ValueKind::Error(a), ValueKind::Error(b)) => std::ptr::eq(a.as_ref(), b.as_ref()),
            (ValueKind::Builtin(a), ValueKind::Builtin(b)) => a.name == b.name,
            (ValueKind::BinaryOp(a), ValueKind::BinaryOp(b)) => a.name == b.name,
            (ValueKind::Apply, ValueKind::Apply) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    /// The canonical printed form. Pairs walk their cdr chain and collapse
    /// dotted tails of proper lists.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ValueKind::Null => write!(f, "()"),
            ValueKind::Pair(car, cdr) => {
                write!(f, "({}", car)?;
                let mut cursor: &Value = cdr;
                loop {
                    match &cursor.kind {
                        ValueKind::Null => break,
                        ValueKind::Pair(car, cdr) => {
                            write!(f, " {}", car)?;
                            cursor = cdr;
                        }
                        _ => {
                            write!(f, " . {}", cursor)?;
                            break;
                        }
                    }
                }
                write!(f, ")")
            }
            ValueKind::Symbol(s) => write!(f, "{}", s),
            ValueKind::Number(n) => write!(f, "{}", n),
            ValueKind::Str(s) => write!(f, "\"{}\"", s),
            ValueKind::Void => write!(f, "#void"),
            ValueKind::Quote(inner) => write!(f, "'{}", inner),
            ValueKind::Error(_) => write!(f, "#error"),
            ValueKind::Function(func) => write!(f, "#{}", func.describe()),
            ValueKind::Closure(c) => write!(f, "#closure.{}", c.function.describe()),
            ValueKind::Continuation(_) => write!(f, "#continuation"),
            ValueKind::Builtin(b) => write!(f, "#{}", b.name),
            ValueKind::BinaryOp(op) => write!(f, "#{}", op.name),
            ValueKind::Apply => write!(f, "#apply"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_display() {
        assert_eq!(Value::int(42).to_string(), "42");
        assert_eq!(Value::int(-2).to_string(), "-2");
        assert_eq!(Value::float(2.5).to_string(), "2.5");
        assert_eq!(Value::float(4.0).to_string(), "4.0");
    }

    #[test]
    fn test_list_display() {
        let l = Value::list(vec![Value::int(1), Value::list(vec![Value::int(2)])]);
        assert_eq!(l.to_string(), "(1 (2))");
        assert_eq!(Value::null().to_string(), "()");
    }

    #[test]
    fn test_dotted_display() {
        let p = Value::pair(Value::int(1), Value::int(2));
        assert_eq!(p.to_string(), "(1 . 2)");
        let p = Value::pair(Value::int(1), Value::pair(Value::int(2), Value::int(3)));
        assert_eq!(p.to_string(), "(1 2 . 3)");
    }

    #[test]
    fn test_quote_and_void_display() {
        assert_eq!(Value::quote(Value::symbol("x")).to_string(), "'x");
        assert_eq!(Value::void().to_string(), "#void");
    }

    #[test]
    fn test_truthiness() {
        assert!(Value::falsity().is_false());
        assert!(!Value::falsity().is_true());
        assert!(Value::truth().is_true());
        assert!(Value::symbol("anything").is_true());
        assert!(Value::int(0).is_true());
        assert!(Value::null().is_true());
    }

    #[test]
    fn test_equal_is_structural() {
        let a = Value::list(vec![Value::int(1), Value::string("x")]);
        let b = Value::list(vec![Value::int(1), Value::string("x")]);
        assert!(a.equal(&b));
        assert!(a.equal(&a));
        assert!(!a.equal(&Value::list(vec![Value::int(1)])));
        assert!(Value::int(2).equal(&Value::float(2.0)));
    }

    #[test]
    fn test_equal_on_callables() {
        fn dummy(_: &mut crate::eval::Env, _: &[Value]) -> Result<Value> {
            Ok(Value::void())
        }
        let car_a = Value::new(ValueKind::Builtin(Builtin {
            name: "car",
            func: dummy,
            pure: true,
        }));
        let car_b = Value::new(ValueKind::Builtin(Builtin {
            name: "cdr",
            func: dummy,
            pure: true,
        }));
        assert!(car_a.equal(&car_a));
        assert!(!car_a.equal(&car_b));

        let apply = Value::new(ValueKind::Apply);
        assert!(apply.equal(&Value::new(ValueKind::Apply)));

        // a list of host operators is equal to an equally built one
        fn op(a: Host, _: Host) -> Result<Host> {
            Ok(a)
        }
        let plus = || Value::new(ValueKind::BinaryOp(BinaryOp { name: "+", func: op }));
        let ops = Value::list(vec![plus(), apply.clone()]);
        assert!(ops.equal(&Value::list(vec![plus(), apply])));
    }

    #[test]
    fn test_host_round_trip() {
        assert!(Value::from_host(Host::Bool(true)).equal(&Value::truth()));
        assert!(Value::from_host(Host::Bool(false)).equal(&Value::falsity()));
        assert_eq!(Value::int(3).to_host().unwrap(), Host::Int(3));
        assert!(Value::null().to_host().is_err());
    }

    #[test]
    fn test_list_elements_rejects_dotted() {
        let p = Value::pair(Value::int(1), Value::int(2));
        assert!(p.list_elements().is_err());
        let l = Value::list(vec![Value::int(1), Value::int(2)]);
        assert_eq!(l.list_elements().unwrap().len(), 2);
    }
}
