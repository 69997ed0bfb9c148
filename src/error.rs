// ABOUTME: Error types carrying source positions and offending data

use crate::source::SourceTag;
use crate::value::Value;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[allow(dead_code)]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ErrorKind {
    // ===== Parser =====
    /// Empty or comment-only input; the REPL silently asks for the next line.
    #[error("no value")]
    NoValue,

    /// Input ended inside an unterminated form.
    #[error("{0}")]
    Eof(String),

    /// Single-line comment in an input that does not track lines.
    #[error("single line comment not supported")]
    SingleLine,

    #[error("{0}")]
    Parse(String),

    // ===== Compiler =====
    #[error("{0}")]
    Compile(String),

    #[error("internal compiler error: {0}")]
    Internal(String),

    // ===== Evaluation =====
    #[error("unknown variable")]
    UnknownVariable,

    #[error("wrong number of arguments, should be {expected}")]
    WrongArity { expected: String },

    #[error("not a function")]
    NotCallable,

    #[error("{0}")]
    Type(String),

    #[error("cannot set constant")]
    ConstantAssign,

    #[error("cannot redefine constant")]
    ConstantRedefine,
}

/// An error: a kind plus the offending datum and source position when known.
/// When the datum carries a tag and the error does not, the datum's tag is
/// adopted.
#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub data: Option<Value>,
    pub tag: Option<SourceTag>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            data: None,
            tag: None,
        }
    }

    pub fn with_data(kind: ErrorKind, data: Value) -> Self {
        let tag = data.tag.clone();
        Error {
            kind,
            data: Some(data),
            tag,
        }
    }

    pub fn with_tag(mut self, tag: Option<SourceTag>) -> Self {
        if self.tag.is_none() {
            self.tag = tag;
        }
        self
    }

    pub fn compile(msg: impl Into<String>, data: Value) -> Self {
        Error::with_data(ErrorKind::Compile(msg.into()), data)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Internal(msg.into()))
    }

    pub fn wrong_arity(expected: impl Into<String>) -> Self {
        Error::new(ErrorKind::WrongArity {
            expected: expected.into(),
        })
    }

    pub fn type_error(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Type(msg.into()))
    }

    pub fn is_no_value(&self) -> bool {
        matches!(self.kind, ErrorKind::NoValue)
    }

    #[allow(dead_code)]
    pub fn is_eof(&self) -> bool {
        matches!(self.kind, ErrorKind::Eof(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut msg = self.kind.to_string();
        if let Some(data) = &self.data {
            msg.push(' ');
            msg.push_str(&data.to_string());
        }
        match &self.tag {
            Some(tag) => write!(f, "{}: error: {}\n{}", tag, msg, tag.point_to()),
            None => write!(f, "error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LineMap;

    #[test]
    fn test_untagged_display() {
        let e = Error::new(ErrorKind::NotCallable);
        assert_eq!(format!("{}", e), "error: not a function");
    }

    #[test]
    fn test_tagged_display_has_caret() {
        let map = LineMap::new("repl", "(foo)\n");
        let e = Error::new(ErrorKind::UnknownVariable).with_tag(Some(map.tag_at(1)));
        let printed = format!("{}", e);
        assert!(printed.starts_with("repl:1:2: error: unknown variable"));
        assert!(printed.ends_with("(foo)\n~^"));
    }

    #[test]
    fn test_data_tag_is_adopted() {
        let map = LineMap::new("t", "x\n");
        let mut sym = Value::symbol("x");
        sym.tag = Some(map.tag_at(0));
        let e = Error::with_data(ErrorKind::UnknownVariable, sym);
        assert!(e.tag.is_some());
        assert!(format!("{}", e).contains("unknown variable x"));
    }
}
