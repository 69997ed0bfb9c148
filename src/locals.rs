// ABOUTME: Runtime local frames: fixed-size slot arrays chained through parent links

use crate::error::{Error, Result};
use crate::value::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// The local environment of one function activation. Frames are shared:
/// closures and continuations keep ancestor frames alive, and writes through
/// any holder are observed by all of them.
pub struct Locals {
    mem: RefCell<Vec<Value>>,
    parent: Option<Rc<Locals>>,
}

impl Locals {
    pub fn new(size: usize, parent: Option<Rc<Locals>>) -> Rc<Locals> {
        Rc::new(Locals {
            mem: RefCell::new(vec![Value::void(); size]),
            parent,
        })
    }

    /// Write the call arguments into the first slots.
    pub fn apply_args(&self, args: Vec<Value>) {
        let mut mem = self.mem.borrow_mut();
        for (i, arg) in args.into_iter().enumerate() {
            mem[i] = arg;
        }
    }

    /// Walk `n` parent links.
    pub fn skip(self: &Rc<Self>, n: usize) -> Option<Rc<Locals>> {
        let mut frame = Rc::clone(self);
        for _ in 0..n {
            frame = Rc::clone(frame.parent.as_ref()?);
        }
        Some(frame)
    }

    pub fn lookup(&self, index: usize, level: usize) -> Result<Value> {
        if level == 0 {
            self.mem
                .borrow()
                .get(index)
                .cloned()
                .ok_or_else(|| Error::internal(format!("local slot {} out of range", index)))
        } else {
            self.parent
                .as_ref()
                .ok_or_else(|| Error::internal("environment skip past top frame"))?
                .lookup(index, level - 1)
        }
    }

    pub fn assign(&self, index: usize, level: usize, value: Value) -> Result<()> {
        if level == 0 {
            let mut mem = self.mem.borrow_mut();
            let slot = mem
                .get_mut(index)
                .ok_or_else(|| Error::internal(format!("local slot {} out of range", index)))?;
            *slot = value;
            Ok(())
        } else {
            self.parent
                .as_ref()
                .ok_or_else(|| Error::internal("environment skip past top frame"))?
                .assign(index, level - 1, value)
        }
    }

    /// Rotate the slots `[start, end)` by `positions` within this frame.
    pub fn move_range(&self, start: usize, end: usize, positions: isize) {
        let mut mem = self.mem.borrow_mut();
        let items: Vec<Value> = mem.drain(start..end).collect();
        let at = (start as isize + positions) as usize;
        mem.splice(at..at, items);
    }
}

impl fmt::Debug for Locals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mem = self.mem.borrow();
        write!(f, "local: [")?;
        for (i, v) in mem.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(frame: &Locals, n: usize) -> Vec<String> {
        (0..n)
            .map(|i| frame.lookup(i, 0).unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_apply_args_and_lookup() {
        let frame = Locals::new(3, None);
        frame.apply_args(vec![Value::int(1), Value::int(2)]);
        assert_eq!(ints(&frame, 3), vec!["1", "2", "#void"]);
    }

    #[test]
    fn test_parent_lookup_and_assign() {
        let parent = Locals::new(1, None);
        parent.apply_args(vec![Value::string("up")]);
        let child = Locals::new(1, Some(Rc::clone(&parent)));

        assert_eq!(child.lookup(0, 1).unwrap().to_string(), "\"up\"");
        child.assign(0, 1, Value::int(9)).unwrap();
        assert_eq!(parent.lookup(0, 0).unwrap().to_string(), "9");
    }

    #[test]
    fn test_skip() {
        let a = Locals::new(0, None);
        let b = Locals::new(0, Some(Rc::clone(&a)));
        let c = Locals::new(0, Some(Rc::clone(&b)));
        assert!(Rc::ptr_eq(&c.skip(0).unwrap(), &c));
        assert!(Rc::ptr_eq(&c.skip(2).unwrap(), &a));
        assert!(c.skip(3).is_none());
    }

    #[test]
    fn test_move_range_rotates_forward() {
        let frame = Locals::new(4, None);
        frame.apply_args(vec![
            Value::int(0),
            Value::int(1),
            Value::int(2),
            Value::int(3),
        ]);
        // arguments 0..3 shift one slot up, freeing slot 0
        frame.move_range(0, 3, 1);
        assert_eq!(ints(&frame, 4), vec!["3", "0", "1", "2"]);
    }

    #[test]
    fn test_move_range_rotates_backward() {
        let frame = Locals::new(4, None);
        frame.apply_args(vec![
            Value::int(0),
            Value::int(1),
            Value::int(2),
            Value::int(3),
        ]);
        frame.move_range(2, 3, -2);
        assert_eq!(ints(&frame, 4), vec!["2", "0", "1", "3"]);
    }
}
