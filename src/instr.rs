// ABOUTME: The runtime instruction set, location operands and instruction streams

use crate::function::Function;
use crate::source::SourceTag;
use crate::value::Value;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

/// Operand of Load/Store: where a value lives.
#[derive(Debug, Clone)]
pub enum Location {
    /// Inline constant.
    Literal(Value),
    /// Slot in the current frame.
    Local(usize),
    /// Apply `skip` parent hops before resolving the inner location.
    EnvSkip(Box<Location>, usize),
    /// Global reference resolved at run time through the name maps.
    Unknown(String),
    /// Destination publishing a top-level function define.
    GlobalFunction {
        name: String,
        unknowns: Vec<String>,
    },
    /// A function used as a literal, for static call sites.
    Function(Rc<Function>),
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Instruction {
    /// Put the addressed value in the result register.
    Load(Location),
    /// Write the result register to the addressed location.
    Store(Location),
    /// Push the arg accumulator onto the arg stack and reset it.
    PushArgs,
    /// Append the result register to the arg accumulator.
    Arg,
    /// Prepend the result register to the arg accumulator.
    ArgPrepend,
    /// Invoke the callable in the result register with the accumulated args.
    Call(usize),
    /// Invoke the callable in the result register with a reified copy of the
    /// executor state as its only argument.
    CallCC,
    /// Splice one arm depending on the truthiness of the result register.
    If(Option<Rc<Instructions>>, Option<Rc<Instructions>>),
    /// Pop the locals stack; appended as a sentinel after a frame push.
    PopLocals,
    /// Rotate slots `[start, end)` of the current frame by `positions`.
    MoveLocalRange {
        start: usize,
        end: usize,
        positions: isize,
    },
}

/// A compiled instruction stream, with a parallel tag array when compiled
/// debuggable.
#[derive(Debug, Default)]
pub struct Instructions {
    pub items: Vec<Instruction>,
    pub tags: Option<Vec<Option<SourceTag>>>,
}

impl Instructions {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn tag_at(&self, index: usize) -> Option<&SourceTag> {
        self.tags.as_ref()?.get(index)?.as_ref()
    }

    /// Indented tree rendering of the stream, following `If` arms and
    /// function bodies, for compile tracing.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let mut seen = HashSet::new();
        self.dump_into(&mut out, 0, &mut seen);
        out
    }

    fn dump_into(&self, out: &mut String, level: usize, seen: &mut HashSet<*const Function>) {
        for (index, i) in self.items.iter().enumerate() {
            out.push_str(&"    ".repeat(level));
            out.push_str(&i.to_string());
            if let Some(tag) = self.tag_at(index) {
                out.push_str(&format!(" {{{}}}", tag));
            }
            out.push('\n');
            match i {
                Instruction::If(t, f) => {
                    for (label, arm) in [("then:", t), ("else:", f)] {
                        out.push_str(&"    ".repeat(level + 1));
                        out.push_str(label);
                        out.push('\n');
                        if let Some(arm) = arm {
                            arm.dump_into(out, level + 2, seen);
                        }
                    }
                }
                Instruction::Load(loc) | Instruction::Store(loc) => {
                    dump_location_body(loc, out, level + 1, seen);
                }
                _ => {}
            }
        }
    }
}

fn dump_location_body(
    loc: &Location,
    out: &mut String,
    level: usize,
    seen: &mut HashSet<*const Function>,
) {
    match loc {
        Location::Function(func) => {
            if seen.insert(Rc::as_ptr(func)) {
                if let Some(body) = func.ins.borrow().as_ref() {
                    body.dump_into(out, level, seen);
                }
            }
        }
        Location::EnvSkip(inner, _) => dump_location_body(inner, out, level, seen),
        _ => {}
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Literal(v) => write!(f, "Literal({})", v),
            Location::Local(index) => write!(f, "Local({})", index),
            Location::EnvSkip(inner, skip) => write!(f, "Skip({} {})", skip, inner),
            Location::Unknown(name) => write!(f, "Unknown({})", name),
            Location::GlobalFunction { name, .. } => write!(f, "GlobalFunction({})", name),
            Location::Function(func) => write!(f, "{}", func.describe()),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Load(loc) => write!(f, "Load({})", loc),
            Instruction::Store(loc) => write!(f, "Store({})", loc),
            Instruction::PushArgs => write!(f, "PushArgs"),
            Instruction::Arg => write!(f, "Arg"),
            Instruction::ArgPrepend => write!(f, "ArgPrepend"),
            Instruction::Call(n) => write!(f, "Call({})", n),
            Instruction::CallCC => write!(f, "CallCC"),
            Instruction::If(_, _) => write!(f, "If"),
            Instruction::PopLocals => write!(f, "PopLocals"),
            Instruction::MoveLocalRange {
                start,
                end,
                positions,
            } => {
                write!(
                    f,
                    "MoveLocalRange([{}:{}] {}{})",
                    start,
                    end,
                    if *positions > 0 { "+" } else { "" },
                    positions
                )
            }
        }
    }
}
