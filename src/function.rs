// ABOUTME: Callable value kinds: compiled functions, closures and host builtins

use crate::error::Result;
use crate::instr::Instructions;
use crate::source::SourceTag;
use crate::value::{Host, Value};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// How much of the enclosing environment a function reaches into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purity {
    /// References a frame more than one level out; must be packaged into a
    /// closure at load time.
    DeepEnv,
    /// References only globals resolved at run time.
    ShallowEnv,
    /// References nothing outside its own frame.
    Pure,
}

/// A compiled first-class function. The body is installed after the whole
/// top-level form finishes compiling; nargs/size/purity are filled in as the
/// function's block is analysed.
pub struct Function {
    pub ins: RefCell<Option<Rc<Instructions>>>,
    pub nargs: Cell<usize>,
    pub size: Cell<usize>,
    pub dotted: Cell<bool>,
    pub purity: Cell<Purity>,
    pub tag: RefCell<Option<SourceTag>>,
}

impl Function {
    pub fn new() -> Rc<Function> {
        Rc::new(Function {
            ins: RefCell::new(None),
            nargs: Cell::new(0),
            size: Cell::new(0),
            dotted: Cell::new(false),
            purity: Cell::new(Purity::Pure),
            tag: RefCell::new(None),
        })
    }

    #[allow(dead_code)]
    pub fn is_pure(&self) -> bool {
        self.purity.get() == Purity::Pure
    }

    pub fn describe(&self) -> String {
        let purity = match self.purity.get() {
            Purity::DeepEnv => "d>1",
            Purity::ShallowEnv => "d=1",
            Purity::Pure => "PURE",
        };
        let dotted = if self.dotted.get() { "." } else { "" };
        format!(
            "Function({}{}|{} {})",
            self.nargs.get(),
            dotted,
            self.size.get(),
            purity
        )
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // body elided: function bodies may reference themselves
        write!(f, "{}", self.describe())
    }
}

/// A function paired with the frame chain it captured at load time.
pub struct Closure {
    pub function: Rc<Function>,
    pub saved: Option<Rc<crate::locals::Locals>>,
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // captured frames elided: they may reference this closure
        write!(f, "Closure({})", self.function.describe())
    }
}

/// A host-implemented builtin taking the evaluated argument list.
#[allow(dead_code)]
#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: fn(&mut crate::eval::Env, &[Value]) -> Result<Value>,
    pub pure: bool,
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Builtin({})", self.name)
    }
}

/// A host operator folded over the argument list left-to-right.
#[derive(Clone, Copy)]
pub struct BinaryOp {
    pub name: &'static str,
    pub func: fn(Host, Host) -> Result<Host>,
}

impl fmt::Debug for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinaryOp({})", self.name)
    }
}
