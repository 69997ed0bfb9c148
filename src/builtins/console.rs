//! Console output: display, newline
//!
//! `display` prints strings raw and everything else in canonical form,
//! through the environment's output sink. `newline` returns a newline
//! string rather than printing one.

use crate::error::{Error, ErrorKind, Result};
use crate::eval::Env;
use crate::function::Builtin;
use crate::value::{Value, ValueKind};
use std::io::Write;

pub fn builtin_display(env: &mut Env, args: &[Value]) -> Result<Value> {
    let [arg] = args else {
        return Err(Error::wrong_arity("1"));
    };
    let written = match &arg.kind {
        ValueKind::Str(s) => write!(env.out, "{}", s),
        _ => write!(env.out, "{}", arg),
    };
    written.map_err(|e| Error::new(ErrorKind::Type(format!("display: {}", e))))?;
    Ok(Value::void())
}

pub fn builtin_newline(_env: &mut Env, args: &[Value]) -> Result<Value> {
    if !args.is_empty() {
        return Err(Error::wrong_arity("0"));
    }
    Ok(Value::string("\n"))
}

/// Register the console builtins in the constant globals.
pub fn register(env: &mut Env) {
    let builtins: [Builtin; 2] = [
        Builtin {
            name: "display",
            func: builtin_display,
            pure: false,
        },
        Builtin {
            name: "newline",
            func: builtin_newline,
            pure: true,
        },
    ];
    for builtin in builtins {
        env.glob_const
            .insert(builtin.name.to_string(), Value::new(ValueKind::Builtin(builtin)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Capture(Rc<RefCell<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_display_strings_raw() {
        let capture = Capture::default();
        let mut env = Env::with_output(Box::new(capture.clone()));
        builtin_display(&mut env, &[Value::string("hi")]).unwrap();
        builtin_display(&mut env, &[Value::list(vec![Value::int(1), Value::int(2)])]).unwrap();
        assert_eq!(String::from_utf8(capture.0.borrow().clone()).unwrap(), "hi(1 2)");
    }

    #[test]
    fn test_newline_returns_string() {
        let mut env = Env::new();
        let v = builtin_newline(&mut env, &[]).unwrap();
        assert!(matches!(&v.kind, ValueKind::Str(s) if s == "\n"));
    }
}
