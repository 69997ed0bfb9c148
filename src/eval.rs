// ABOUTME: The fetch-decode-execute loop, executor state and global environment

use crate::error::{Error, ErrorKind, Result};
use crate::function::{Closure, Function};
use crate::instr::{Instruction, Instructions, Location};
use crate::locals::Locals;
use crate::value::{Value, ValueKind};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::mem;
use std::rc::Rc;

thread_local! {
    // sentinel spliced after every frame push; the normal fetch path pops
    // the frame when the callee's code ends
    static POP_LOCAL: Rc<Instructions> = Rc::new(Instructions {
        items: vec![Instruction::PopLocals],
        tags: None,
    });
}

/// The executor state: result register, instruction pointer, and the three
/// stacks kept in lock-step with function entry and exit.
///
/// Cloning deep-copies the stack containers but shares frame contents, which
/// is exactly what continuation capture needs: later pushes in the original
/// timeline do not affect the captured copy, while writes to a shared
/// ancestor frame stay visible to every holder.
#[derive(Clone)]
pub struct ExecEnv {
    pub value: Value,
    ins: Rc<Instructions>,
    pc: usize,
    ins_pc_stack: Vec<(Rc<Instructions>, usize)>,
    local: Option<Rc<Locals>>,
    local_stack: Vec<Option<Rc<Locals>>>,
    args: Vec<Value>,
    args_stack: Vec<Vec<Value>>,
}

impl ExecEnv {
    pub fn new(ins: Rc<Instructions>) -> Self {
        ExecEnv {
            value: Value::void(),
            ins,
            pc: 0,
            ins_pc_stack: Vec::new(),
            local: None,
            local_stack: Vec::new(),
            args: Vec::new(),
            args_stack: Vec::new(),
        }
    }

    /// Advance to the next instruction, popping exhausted streams; `None`
    /// halts the loop.
    fn fetch(&mut self) -> Option<(Rc<Instructions>, usize)> {
        while self.pc == self.ins.len() {
            let (ins, pc) = self.ins_pc_stack.pop()?;
            self.ins = ins;
            self.pc = pc;
        }
        let at = self.pc;
        self.pc += 1;
        Some((Rc::clone(&self.ins), at))
    }

    fn push_ins(&mut self, ins: Rc<Instructions>) {
        if ins.is_empty() {
            return;
        }
        if self.pc < self.ins.len() {
            self.ins_pc_stack.push((Rc::clone(&self.ins), self.pc));
        }
        self.ins = ins;
        self.pc = 0;
    }

    fn push_local_autopop(&mut self, frame: Rc<Locals>) {
        let prev = self.local.replace(frame);
        self.local_stack.push(prev);
        POP_LOCAL.with(|ins| self.push_ins(Rc::clone(ins)));
    }

    fn pop_args(&mut self) -> Result<Vec<Value>> {
        let prev = self
            .args_stack
            .pop()
            .ok_or_else(|| Error::internal("argument stack underflow"))?;
        Ok(mem::replace(&mut self.args, prev))
    }

    fn frame(&self) -> Result<&Rc<Locals>> {
        self.local
            .as_ref()
            .ok_or_else(|| Error::internal("no local frame"))
    }
}

/// A reified executor state, callable as a one-argument function. Invoking
/// it installs a fresh copy of the snapshot, so continuations are
/// multi-shot.
pub struct Continuation {
    saved: ExecEnv,
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Continuation")
    }
}

/// Process-wide globals: immutable constants (builtins and published
/// function defines), `set!`-able globals, and the forward-reference
/// registry of functions compiled against names that did not exist yet.
pub struct Env {
    pub glob_const: HashMap<String, Value>,
    pub glob: HashMap<String, Value>,
    func_unknowns: HashMap<String, Vec<Rc<Function>>>,
    pub out: Box<dyn Write>,
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    pub fn new() -> Self {
        Env::with_output(Box::new(std::io::stdout()))
    }

    pub fn with_output(out: Box<dyn Write>) -> Self {
        Env {
            glob_const: HashMap::new(),
            glob: HashMap::new(),
            func_unknowns: HashMap::new(),
            out,
        }
    }

    pub fn lookup_const(&self, name: &str) -> Option<&Value> {
        self.glob_const.get(name)
    }

    pub fn lookup_unknown(&self, name: &str) -> Result<Value> {
        self.glob_const
            .get(name)
            .or_else(|| self.glob.get(name))
            .cloned()
            .ok_or_else(|| Error::with_data(ErrorKind::UnknownVariable, Value::symbol(name)))
    }

    pub fn set_unknown(&mut self, name: &str, value: Value) -> Result<()> {
        if self.glob_const.contains_key(name) {
            return Err(Error::with_data(
                ErrorKind::ConstantAssign,
                Value::symbol(name),
            ));
        }
        self.glob.insert(name.to_string(), value);
        Ok(())
    }

    pub fn define_global_function(
        &mut self,
        name: &str,
        unknowns: &[String],
        value: Value,
    ) -> Result<()> {
        if self.glob_const.contains_key(name) {
            return Err(Error::with_data(
                ErrorKind::ConstantRedefine,
                Value::symbol(name),
            ));
        }
        self.glob_const.insert(name.to_string(), value.clone());
        self.resolve_unknowns(&value, name, unknowns);
        Ok(())
    }

    /// Forward-reference bookkeeping. Back-filling direct calls into the
    /// waiting functions is a planned optimisation; for now the registry is
    /// only recorded and traced.
    fn resolve_unknowns(&mut self, value: &Value, name: &str, unknowns: &[String]) {
        if let Some(waiting) = self.func_unknowns.get(name) {
            log::trace!(
                target: "schemer::eval",
                "new function {} referenced by {} earlier functions",
                name,
                waiting.len()
            );
        }
        if let ValueKind::Function(func) = &value.kind {
            for unk in unknowns {
                self.func_unknowns
                    .entry(unk.clone())
                    .or_default()
                    .push(Rc::clone(func));
            }
        }
    }

    /// Run an instruction stream to completion and return the result
    /// register. Errors abort evaluation; side effects already performed
    /// stay.
    pub fn eval_result(&mut self, ins: Rc<Instructions>) -> Result<Value> {
        let mut exe = ExecEnv::new(ins);
        run(self, &mut exe)?;
        Ok(exe.value)
    }

    /// Like `eval_result`, but an evaluation error is printed and handed
    /// back as a first-class error value. This is what the REPL shows as
    /// `#error`.
    pub fn eval(&mut self, ins: Rc<Instructions>) -> Value {
        match self.eval_result(ins) {
            Ok(value) => value,
            Err(e) => {
                eprintln!("{}", e);
                Value::new(ValueKind::Error(Box::new(e)))
            }
        }
    }
}

fn tag_err(e: Error, ins: &Instructions, at: usize) -> Error {
    e.with_tag(ins.tag_at(at).cloned())
}

fn run(env: &mut Env, exe: &mut ExecEnv) -> Result<()> {
    let trace = log::log_enabled!(target: "schemer::eval", log::Level::Trace);
    loop {
        let Some((ins, at)) = exe.fetch() else {
            return Ok(());
        };
        let instr = &ins.items[at];
        if trace {
            match ins.tag_at(at) {
                Some(tag) => log::trace!(target: "schemer::eval", "ins: {} {{{}}}", instr, tag),
                None => log::trace!(target: "schemer::eval", "ins: {}", instr),
            }
        }

        match instr {
            Instruction::Load(loc) => {
                exec_load(env, exe, loc).map_err(|e| tag_err(e, &ins, at))?
            }
            Instruction::Store(loc) => {
                exec_store(env, exe, loc).map_err(|e| tag_err(e, &ins, at))?
            }
            Instruction::PushArgs => {
                let args = mem::take(&mut exe.args);
                exe.args_stack.push(args);
            }
            Instruction::Arg => exe.args.push(exe.value.clone()),
            Instruction::ArgPrepend => exe.args.insert(0, exe.value.clone()),
            Instruction::Call(_) => {
                let args = exe.pop_args().map_err(|e| tag_err(e, &ins, at))?;
                let callee = exe.value.clone();
                apply_callable(env, exe, callee, args).map_err(|e| tag_err(e, &ins, at))?;
            }
            Instruction::CallCC => {
                let callee = exe.value.clone();
                let cont = Value::new(ValueKind::Continuation(Rc::new(Continuation {
                    saved: exe.clone(),
                })));
                apply_callable(env, exe, callee, vec![cont])
                    .map_err(|e| tag_err(e, &ins, at))?;
            }
            Instruction::If(true_ins, false_ins) => {
                let branch = if exe.value.is_true() {
                    true_ins
                } else {
                    false_ins
                };
                if let Some(arm) = branch {
                    exe.push_ins(Rc::clone(arm));
                }
            }
            Instruction::PopLocals => {
                exe.local = exe
                    .local_stack
                    .pop()
                    .ok_or_else(|| Error::internal("locals stack underflow"))
                    .map_err(|e| tag_err(e, &ins, at))?;
            }
            Instruction::MoveLocalRange {
                start,
                end,
                positions,
            } => {
                exe.frame()
                    .map_err(|e| tag_err(e, &ins, at))?
                    .move_range(*start, *end, *positions);
            }
        }

        if trace {
            log::trace!(target: "schemer::eval", "=> {}", exe.value);
        }
    }
}

fn exec_load(env: &mut Env, exe: &mut ExecEnv, loc: &Location) -> Result<()> {
    match loc {
        Location::Literal(v) => exe.value = v.clone(),
        Location::Local(index) => exe.value = exe.frame()?.lookup(*index, 0)?,
        Location::EnvSkip(inner, skip) => match &**inner {
            Location::Local(index) => exe.value = exe.frame()?.lookup(*index, *skip)?,
            Location::Function(func) => {
                // a function with inherited environment: package the current
                // frame chain into a closure
                let saved = exe.local.as_ref().and_then(|l| l.skip(*skip));
                exe.value = Value::new(ValueKind::Closure(Rc::new(Closure {
                    function: Rc::clone(func),
                    saved,
                })));
            }
            _ => return Err(Error::internal(format!("cannot skip location: {}", inner))),
        },
        Location::Unknown(name) => exe.value = env.lookup_unknown(name)?,
        Location::Function(func) => {
            exe.value = Value::new(ValueKind::Function(Rc::clone(func)))
        }
        Location::GlobalFunction { name, .. } => {
            return Err(Error::internal(format!(
                "cannot load global function location: {}",
                name
            )))
        }
    }
    Ok(())
}

fn exec_store(env: &mut Env, exe: &mut ExecEnv, loc: &Location) -> Result<()> {
    match loc {
        Location::Local(index) => exe.frame()?.assign(*index, 0, exe.value.clone()),
        Location::EnvSkip(inner, skip) => match &**inner {
            Location::Local(index) => exe.frame()?.assign(*index, *skip, exe.value.clone()),
            _ => Err(Error::internal(format!("cannot skip location: {}", inner))),
        },
        Location::Unknown(name) => env.set_unknown(name, exe.value.clone()),
        Location::GlobalFunction { name, unknowns } => {
            env.define_global_function(name, unknowns, exe.value.clone())
        }
        _ => Err(Error::type_error(format!(
            "cannot Store to location: {}",
            loc
        ))),
    }
}

/// Dispatch over the callable kinds.
pub fn apply_callable(
    env: &mut Env,
    exe: &mut ExecEnv,
    callee: Value,
    mut args: Vec<Value>,
) -> Result<()> {
    match &callee.kind {
        ValueKind::Function(func) => call_function(exe, func, None, args),
        ValueKind::Closure(closure) => {
            call_function(exe, &closure.function, closure.saved.clone(), args)
        }
        ValueKind::Continuation(cont) => {
            if args.len() != 1 {
                return Err(Error::wrong_arity("1"));
            }
            let value = args
                .pop()
                .ok_or_else(|| Error::internal("missing continuation argument"))?;
            *exe = cont.saved.clone();
            exe.value = value;
            Ok(())
        }
        ValueKind::Builtin(builtin) => {
            exe.value = (builtin.func)(env, &args)?;
            Ok(())
        }
        ValueKind::BinaryOp(op) => {
            let first = args
                .first()
                .ok_or_else(|| Error::wrong_arity("at least 1"))?;
            let mut acc = first.to_host()?;
            for arg in &args[1..] {
                acc = (op.func)(acc, arg.to_host()?)?;
            }
            exe.value = Value::from_host(acc);
            Ok(())
        }
        ValueKind::Apply => {
            if args.len() != 2 {
                return Err(Error::wrong_arity("2"));
            }
            let list = args
                .pop()
                .ok_or_else(|| Error::internal("missing apply argument"))?;
            let target = args
                .pop()
                .ok_or_else(|| Error::internal("missing apply target"))?;
            let call_args: Vec<Value> = list.list_elements()?.into_iter().cloned().collect();
            apply_callable(env, exe, target, call_args)
        }
        _ => Err(Error::with_data(ErrorKind::NotCallable, callee.clone())),
    }
}

fn call_function(
    exe: &mut ExecEnv,
    func: &Rc<Function>,
    parent: Option<Rc<Locals>>,
    mut args: Vec<Value>,
) -> Result<()> {
    let n = func.nargs.get();
    if func.dotted.get() {
        let fixed = n.saturating_sub(1);
        if args.len() < fixed {
            return Err(Error::wrong_arity(format!("at least {}", fixed)));
        }
        let rest = Value::list(args.split_off(fixed));
        args.push(rest);
    } else if args.len() != n {
        return Err(Error::wrong_arity(n.to_string()));
    }

    let frame = Locals::new(func.size.get(), parent);
    frame.apply_args(args);
    exe.push_local_autopop(frame);

    let body = func
        .ins
        .borrow()
        .clone()
        .ok_or_else(|| Error::internal("function has no compiled body"))?;
    exe.push_ins(body);
    Ok(())
}
