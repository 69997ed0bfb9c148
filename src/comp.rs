// ABOUTME: Expression compiler: scope analysis, local-slot resolution and instruction emission

use crate::error::{Error, ErrorKind, Result};
use crate::eval::Env;
use crate::function::{Function, Purity};
use crate::instr::{Instruction, Instructions, Location};
use crate::parser::Reader;
use crate::source::SourceTag;
use crate::value::{Value, ValueKind};
use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::rc::Rc;

// Compile-time structures live in arenas with stable indices, so patching a
// pending reference never depends on an instruction's position in a buffer.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InsId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BufId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StampId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlaceId(usize);

/// Compile-time location: the runtime set plus the two placeholder kinds
/// that must be resolved away before lowering.
#[derive(Debug, Clone)]
enum CLoc {
    Literal(Value),
    Local(usize),
    EnvSkip(Box<CLoc>, usize),
    Unknown(String),
    GlobalFunction { name: String, unknowns: Vec<String> },
    Function(Rc<Function>),
    /// A local that still awaits slot assignment.
    Stamped(StampId),
    /// A global name not yet resolved against the runtime environment.
    Placeholder(PlaceId),
}

#[derive(Debug, Clone)]
enum CIns {
    Load(CLoc),
    Store(CLoc),
    PushArgs,
    Arg,
    Call(usize),
    CallCC,
    If(Option<BufId>, Option<BufId>),
    MoveLocalRange {
        start: usize,
        end: usize,
        positions: isize,
    },
}

struct CBuf {
    ids: Vec<InsId>,
    tags: Option<Vec<Option<SourceTag>>>,
}

/// A local definition whose slot is not yet known: define order, last use,
/// and the flags driving constant elision and closured partitioning.
#[derive(Debug)]
struct StampedLocal {
    define_stamp: isize,
    target_stamp: isize,
    last_use_stamp: isize,
    is_arg: bool,
    closured: bool,
    overwritten: bool,
    func_block: BlockId,
    value: Option<Value>,
    name: String,
}

impl StampedLocal {
    fn is_constant(&self) -> bool {
        self.value.is_some() && !self.overwritten
    }
}

/// An unresolved global name, possibly carrying the folded initial value of
/// its define.
#[derive(Debug)]
struct Placeholder {
    name: String,
    value: Option<Value>,
}

/// A pending reference: an emitted Load/Store whose location still points at
/// a stamped local or placeholder.
#[derive(Debug, Clone)]
struct InsRef {
    ins: InsId,
    buf: BufId,
    name: String,
    block: BlockId,
    is_define: bool,
}

/// What a pending reference currently points at.
enum CoreRef {
    Stamped(StampId),
    Place(PlaceId),
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockType {
    Global,
    Module,
    Func,
    Scope,
}

#[derive(Clone)]
enum Def {
    Stamped(StampId),
    Placeholder(PlaceId),
    Function(Rc<Function>),
}

struct Block {
    block_type: BlockType,
    parent: Option<BlockId>,
    func: Option<Rc<Function>>,
    defines: HashMap<String, Def>,
    nesting_level: usize,
    local_stamp: isize,
    stamped_locals: Vec<StampId>,
    iminsref_list: Vec<InsRef>,
    uses_call_cc: bool,
}

/// Compiles one top-level unit. Buffers, blocks, stamped locals and pending
/// references live here; the result is lowered to runtime `Instructions`
/// once every reference has a concrete location.
pub struct ExpressionCompiler {
    ins_arena: Vec<CIns>,
    bufs: Vec<CBuf>,
    blocks: Vec<Block>,
    stamps: Vec<StampedLocal>,
    places: Vec<Placeholder>,
    cur_buf: BufId,
    buf_stack: Vec<BufId>,
    block: Option<BlockId>,
    pending_funcs: Vec<(Rc<Function>, BufId)>,
    debuggable: bool,
}

impl ExpressionCompiler {
    pub fn new(debuggable: bool) -> Self {
        let initial = CBuf {
            ids: Vec::new(),
            tags: debuggable.then(Vec::new),
        };
        ExpressionCompiler {
            ins_arena: Vec::new(),
            bufs: vec![initial],
            blocks: Vec::new(),
            stamps: Vec::new(),
            places: Vec::new(),
            cur_buf: BufId(0),
            buf_stack: Vec::new(),
            block: None,
            pending_funcs: Vec::new(),
            debuggable,
        }
    }

    // ===== Instruction buffers =====

    fn new_buf(&mut self) -> BufId {
        let id = BufId(self.bufs.len());
        self.bufs.push(CBuf {
            ids: Vec::new(),
            tags: self.debuggable.then(Vec::new),
        });
        id
    }

    fn add(&mut self, i: CIns, tag: Option<&SourceTag>) -> InsId {
        let id = InsId(self.ins_arena.len());
        self.ins_arena.push(i);
        let buf = &mut self.bufs[self.cur_buf.0];
        buf.ids.push(id);
        if let Some(tags) = &mut buf.tags {
            tags.push(tag.cloned());
        }
        id
    }

    fn cur_len(&self) -> usize {
        self.bufs[self.cur_buf.0].ids.len()
    }

    fn undo(&mut self, from: usize) {
        let buf = &mut self.bufs[self.cur_buf.0];
        buf.ids.truncate(from);
        if let Some(tags) = &mut buf.tags {
            tags.truncate(from);
        }
    }

    fn push_ins(&mut self) {
        self.buf_stack.push(self.cur_buf);
        self.cur_buf = self.new_buf();
    }

    fn pop_ins(&mut self) -> BufId {
        let buf = self.cur_buf;
        self.cur_buf = self.buf_stack.pop().expect("unbalanced instruction buffers");
        buf
    }

    fn compile_ins_of(&mut self, e: &Value) -> Result<BufId> {
        self.push_ins();
        let result = self.compile_expr(e);
        let buf = self.pop_ins();
        result.map(|_| buf)
    }

    // ===== Blocks =====

    fn cur(&self) -> BlockId {
        self.block.expect("no active block")
    }

    fn push_block(&mut self, block_type: BlockType, func: Option<Rc<Function>>) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(Block {
            block_type,
            parent: self.block,
            func,
            defines: HashMap::new(),
            nesting_level: 0,
            local_stamp: -1,
            stamped_locals: Vec::new(),
            iminsref_list: Vec::new(),
            uses_call_cc: false,
        });
        self.block = Some(id);
        id
    }

    fn block_type(&self, b: BlockId) -> BlockType {
        self.blocks[b.0].block_type
    }

    fn enclosing_func_block(&self, from: BlockId) -> Option<BlockId> {
        let mut cursor = Some(from);
        while let Some(b) = cursor {
            if self.block_type(b) == BlockType::Func {
                return Some(b);
            }
            cursor = self.blocks[b.0].parent;
        }
        None
    }

    /// Every function lexically containing the current position retains all
    /// its locals once a continuation may be captured inside it.
    fn mark_call_cc(&mut self) {
        let mut cursor = Some(self.cur());
        while let Some(b) = cursor {
            if self.block_type(b) == BlockType::Func {
                self.blocks[b.0].uses_call_cc = true;
            }
            cursor = self.blocks[b.0].parent;
        }
    }

    fn mark_func_nonpure(&mut self, from: BlockId) {
        let mut cursor = Some(from);
        while let Some(b) = cursor {
            if self.block_type(b) == BlockType::Func {
                if let Some(func) = &self.blocks[b.0].func {
                    if func.purity.get() == Purity::Pure {
                        func.purity.set(Purity::ShallowEnv);
                    }
                }
                return;
            }
            cursor = self.blocks[b.0].parent;
        }
    }

    // ===== Defines =====

    fn check_define_sym(&self, sym: &Value) -> Result<String> {
        let name = sym
            .as_symbol()
            .ok_or_else(|| Error::compile("argument is not a symbol", sym.clone()))?;
        let block = &self.blocks[self.cur().0];
        if block.defines.contains_key(name) {
            return Err(Error::compile("already defined:", sym.clone()));
        }
        if block.nesting_level > 1 {
            return Err(Error::compile("cannot define outside block:", sym.clone()));
        }
        Ok(name.to_string())
    }

    /// Context-sensitive define: a local in function/scope blocks, a global
    /// placeholder otherwise.
    fn define(&mut self, sym: &Value) -> Result<()> {
        match self.block_type(self.cur()) {
            BlockType::Func | BlockType::Scope => self.define_local(sym, false, None).map(|_| ()),
            _ => self.define_global(sym, None),
        }
    }

    /// Define a name bound to a folded value, enabling constant elision.
    fn define_value(&mut self, sym: &Value, value: Value) -> Result<()> {
        match self.block_type(self.cur()) {
            BlockType::Func | BlockType::Scope => {
                self.define_local(sym, false, Some(value)).map(|_| ())
            }
            _ => self.define_global(sym, Some(value)),
        }
    }

    fn define_global(&mut self, sym: &Value, value: Option<Value>) -> Result<()> {
        let name = self.check_define_sym(sym)?;
        let place = PlaceId(self.places.len());
        self.places.push(Placeholder {
            name: name.clone(),
            value,
        });
        let cur = self.cur();
        self.blocks[cur.0]
            .defines
            .insert(name, Def::Placeholder(place));
        Ok(())
    }

    fn define_local(&mut self, sym: &Value, is_arg: bool, value: Option<Value>) -> Result<StampId> {
        let name = self.check_define_sym(sym)?;
        let fb = self
            .enclosing_func_block(self.cur())
            .ok_or_else(|| Error::compile("cannot define outside function:", sym.clone()))?;
        self.blocks[fb.0].local_stamp += 1;
        let stamp = self.blocks[fb.0].local_stamp;
        let sid = StampId(self.stamps.len());
        self.stamps.push(StampedLocal {
            define_stamp: stamp,
            target_stamp: -1,
            last_use_stamp: stamp,
            is_arg,
            closured: false,
            overwritten: false,
            func_block: fb,
            value,
            name: name.clone(),
        });
        self.blocks[fb.0].stamped_locals.push(sid);
        let cur = self.cur();
        self.blocks[cur.0]
            .defines
            .insert(name, Def::Stamped(sid));
        Ok(sid)
    }

    /// Bind a name directly to a function value; references load it as a
    /// literal with no frame slot.
    fn define_constant(&mut self, sym: &Value, func: Rc<Function>) -> Result<()> {
        let name = self.check_define_sym(sym)?;
        let cur = self.cur();
        self.blocks[cur.0]
            .defines
            .insert(name, Def::Function(func));
        Ok(())
    }

    fn define_arg(&mut self, sym: &Value) -> Result<()> {
        let func = self.blocks[self.cur().0]
            .func
            .clone()
            .ok_or_else(|| Error::internal("argument define outside function block"))?;
        func.nargs.set(func.nargs.get() + 1);
        self.define_local(sym, true, None).map(|_| ())
    }

    fn define_dotted_arg(&mut self, sym: &Value) -> Result<()> {
        let func = self.blocks[self.cur().0]
            .func
            .clone()
            .ok_or_else(|| Error::internal("argument define outside function block"))?;
        func.dotted.set(true);
        self.define_arg(sym)
    }

    // ===== Lookup =====

    /// Reference bookkeeping for a stamped local found during lookup.
    fn ref_stamped_local(&mut self, found_in: BlockId, sid: StampId, closured: bool) {
        if closured {
            self.stamps[sid.0].closured = true;
        }
        let mut cursor = Some(found_in);
        while let Some(b) = cursor {
            if self.block_type(b) == BlockType::Func {
                self.stamps[sid.0].last_use_stamp = self.blocks[b.0].local_stamp;
                return;
            }
            cursor = self.blocks[b.0].parent;
        }
    }

    /// Find a stamped local for `name`, counting the function-block hops
    /// between reference and definition. Crossing a function boundary marks
    /// the local closured and drops the crossing function to `DeepEnv`;
    /// scope boundaries are free.
    fn find_local_w_skip(&mut self, name: &str) -> Option<(StampId, usize)> {
        self.find_local_from(self.cur(), name, false)
    }

    fn find_local_from(
        &mut self,
        b: BlockId,
        name: &str,
        closured: bool,
    ) -> Option<(StampId, usize)> {
        match self.blocks[b.0].defines.get(name).cloned() {
            Some(Def::Stamped(sid)) => {
                self.ref_stamped_local(b, sid, closured);
                Some((sid, 0))
            }
            Some(_) => None,
            None => {
                let parent = self.blocks[b.0].parent?;
                let is_func = self.block_type(b) == BlockType::Func;
                let (sid, level) = self.find_local_from(parent, name, closured || is_func)?;
                match self.block_type(b) {
                    BlockType::Func => {
                        if let Some(func) = self.blocks[b.0].func.clone() {
                            func.purity.set(Purity::DeepEnv);
                        }
                        Some((sid, level + 1))
                    }
                    BlockType::Scope => Some((sid, level)),
                    _ => Some((sid, level + 1)),
                }
            }
        }
    }

    fn find_global_def(&self, name: &str) -> Option<Def> {
        let mut cursor = Some(self.cur());
        while let Some(b) = cursor {
            if let Some(def) = self.blocks[b.0].defines.get(name) {
                return Some(def.clone());
            }
            cursor = self.blocks[b.0].parent;
        }
        None
    }

    fn global_ref_loc(&mut self, name: &str) -> CLoc {
        match self.find_global_def(name) {
            Some(Def::Function(func)) => CLoc::Function(func),
            Some(Def::Placeholder(place)) => CLoc::Placeholder(place),
            _ => {
                let place = PlaceId(self.places.len());
                self.places.push(Placeholder {
                    name: name.to_string(),
                    value: None,
                });
                CLoc::Placeholder(place)
            }
        }
    }

    fn record_ref(&mut self, ins: InsId, name: &str, is_define: bool) {
        let r = InsRef {
            ins,
            buf: self.cur_buf,
            name: name.to_string(),
            block: self.cur(),
            is_define,
        };
        let cur = self.cur();
        self.blocks[cur.0].iminsref_list.push(r);
    }

    // ===== Emission of loads and stores =====

    fn compile_load(&mut self, sym: &Value) -> Result<()> {
        let name = sym
            .as_symbol()
            .ok_or_else(|| Error::compile("argument is not a symbol", sym.clone()))?
            .to_string();
        let loc = match self.find_local_w_skip(&name) {
            Some((sid, level)) => wrap_skip(CLoc::Stamped(sid), level),
            None => self.global_ref_loc(&name),
        };
        let id = self.add(CIns::Load(loc), sym.tag.as_ref());
        self.record_ref(id, &name, false);
        Ok(())
    }

    fn emit_store(&mut self, sym: &Value, overwritten: bool, tag: Option<&SourceTag>) -> Result<()> {
        let name = sym
            .as_symbol()
            .ok_or_else(|| Error::compile("argument is not a symbol", sym.clone()))?
            .to_string();
        let loc = match self.find_local_w_skip(&name) {
            Some((sid, level)) => {
                if overwritten {
                    self.stamps[sid.0].overwritten = true;
                }
                wrap_skip(CLoc::Stamped(sid), level)
            }
            None => self.global_ref_loc(&name),
        };
        let id = self.add(CIns::Store(loc), tag);
        self.record_ref(id, &name, !overwritten);
        Ok(())
    }

    // ===== Form dispatch =====

    pub fn compile_expr(&mut self, e: &Value) -> Result<()> {
        let b = self.cur();
        self.blocks[b.0].nesting_level += 1;
        let result = self.compile_expr_kind(e);
        self.blocks[b.0].nesting_level -= 1;
        result
    }

    fn compile_expr_kind(&mut self, e: &Value) -> Result<()> {
        match &e.kind {
            ValueKind::Pair(head, args) => self.compile_list(head, args),
            ValueKind::Symbol(_) if e.is_boolean_symbol() => {
                self.compile_literal(e);
                Ok(())
            }
            ValueKind::Symbol(_) => self.compile_load(e),
            ValueKind::Quote(inner) => {
                self.compile_literal(inner);
                Ok(())
            }
            _ => {
                self.compile_literal(e);
                Ok(())
            }
        }
    }

    fn compile_list(&mut self, head: &Value, args: &Value) -> Result<()> {
        match head.as_symbol() {
            Some("and") => self.compile_and(args),
            Some("begin") => self.compile_begin(args),
            Some("call/cc") => self.compile_call_cc(head, args),
            Some("define") => self.compile_define(head, args),
            Some("if") => self.compile_if(head, args),
            Some("lambda") => self.compile_lambda(head, args),
            Some("or") => self.compile_or(args),
            Some("set!") => self.compile_set(head, args),
            _ => self.compile_call(head, args),
        }
    }

    fn compile_literal(&mut self, v: &Value) {
        self.add(CIns::Load(CLoc::Literal(v.clone())), v.tag.as_ref());
    }

    fn compile_call(&mut self, func: &Value, args: &Value) -> Result<()> {
        self.add(CIns::PushArgs, func.tag.as_ref());
        let mut nparams = 0;
        let mut cursor = args;
        loop {
            match &cursor.kind {
                ValueKind::Null => break,
                ValueKind::Pair(arg, rest) => {
                    self.compile_expr(arg)?;
                    self.add(CIns::Arg, arg.tag.as_ref());
                    nparams += 1;
                    cursor = rest;
                }
                _ => return Err(Error::compile("malformed list", cursor.clone())),
            }
        }
        self.compile_expr(func)?;
        self.add(CIns::Call(nparams), func.tag.as_ref());
        Ok(())
    }

    fn compile_call_cc(&mut self, head: &Value, args: &Value) -> Result<()> {
        let items = args.list_elements()?;
        if items.len() != 1 {
            return Err(Error::compile("call/cc takes one argument", head.clone()));
        }
        self.mark_call_cc();
        self.compile_expr(items[0])?;
        // the interpreter synthesises the single continuation argument, so
        // no PushArgs here
        self.add(CIns::CallCC, head.tag.as_ref());
        Ok(())
    }

    fn compile_lambda(&mut self, head: &Value, args: &Value) -> Result<()> {
        let (params, body) = args
            .as_pair()
            .ok_or_else(|| Error::compile("missing lambda arguments", head.clone()))?;
        let func = Function::new();
        self.function_block(&func, params, body, head.tag.clone())?;
        let loc = if func.purity.get() == Purity::DeepEnv {
            // force environment pickup: the load produces a closure
            log::trace!(target: "schemer::comp", "deep env for lambda {}", func.describe());
            CLoc::EnvSkip(Box::new(CLoc::Function(func)), 0)
        } else {
            CLoc::Function(func)
        };
        self.add(CIns::Load(loc), head.tag.as_ref());
        Ok(())
    }

    fn compile_define(&mut self, head: &Value, args: &Value) -> Result<()> {
        let (first, rest) = args
            .as_pair()
            .ok_or_else(|| Error::compile("no symbol", head.clone()))?;

        if let Some((name_sym, params)) = first.as_pair() {
            // function define: the name becomes a constant, referenced by
            // direct literal load
            let func = Function::new();
            self.define_constant(name_sym, func.clone())?;
            self.function_block(&func, params, rest, name_sym.tag.clone())?;

            if self.block_type(self.cur()) == BlockType::Global {
                // a global define outside a module needs instructions to
                // publish the function at run time
                let name = name_sym
                    .as_symbol()
                    .ok_or_else(|| Error::compile("argument is not a symbol", name_sym.clone()))?
                    .to_string();
                self.add(
                    CIns::Load(CLoc::Function(func)),
                    name_sym.tag.as_ref(),
                );
                self.add(
                    CIns::Store(CLoc::GlobalFunction {
                        name,
                        unknowns: Vec::new(),
                    }),
                    None,
                );
            }
        } else {
            let constant = match &rest.kind {
                ValueKind::Pair(init, _) => self.compile_nonconstant_expr(init)?,
                _ => Some(Value::void()),
            };
            match constant {
                Some(value) => self.define_value(first, value)?,
                None => self.define(first)?,
            }
            self.emit_store(first, false, None)?;
        }
        Ok(())
    }

    fn compile_set(&mut self, head: &Value, args: &Value) -> Result<()> {
        let items = args.list_elements()?;
        if items.len() != 2 {
            return Err(Error::compile(
                "wrong number of arguments to set!",
                head.clone(),
            ));
        }
        let sym = items[0].clone();
        self.compile_expr(items[1])?;
        self.emit_store(&sym, true, sym.tag.clone().as_ref())?;
        Ok(())
    }

    fn compile_begin(&mut self, args: &Value) -> Result<()> {
        // (begin ...) can contain definitions; they allocate stamps in the
        // enclosing function's space
        self.push_block(BlockType::Scope, None);
        let mut cursor = args;
        loop {
            match &cursor.kind {
                ValueKind::Null => break,
                ValueKind::Pair(expr, rest) => {
                    self.compile_expr(expr)?;
                    cursor = rest;
                }
                _ => return Err(Error::compile("malformed list", cursor.clone())),
            }
        }
        self.pop_scope_block()
    }

    fn compile_if(&mut self, head: &Value, args: &Value) -> Result<()> {
        let items = args.list_elements()?;
        match items.len() {
            0 => Err(Error::compile("empty if", head.clone())),
            1 => Err(Error::compile("if: missing true clause", items[0].clone())),
            2 | 3 => {
                match self.compile_nonconstant_expr(items[0])? {
                    None => {
                        // exclusive arms may share stamp slots
                        let b = self.cur();
                        let original_stamp = self.blocks[b.0].local_stamp;
                        let true_ins = self.compile_ins_of(items[1])?;
                        self.blocks[b.0].local_stamp = original_stamp;
                        let false_ins = if items.len() == 3 {
                            self.compile_ins_of(items[2])?
                        } else {
                            self.compile_ins_of(&Value::void())?
                        };
                        self.add(
                            CIns::If(Some(true_ins), Some(false_ins)),
                            head.tag.as_ref(),
                        );
                    }
                    Some(test) if test.is_false() => {
                        if items.len() == 3 {
                            self.compile_expr(items[2])?;
                        } else {
                            self.compile_literal(&Value::void());
                        }
                    }
                    Some(_) => self.compile_expr(items[1])?,
                }
                Ok(())
            }
            _ => Err(Error::compile("too many if clauses", items[3].clone())),
        }
    }

    fn compile_and(&mut self, args: &Value) -> Result<()> {
        if args.is_null() {
            self.compile_literal(&Value::falsity());
            return Ok(());
        }
        self.compile_and_chain(args)
    }

    fn compile_and_chain(&mut self, p: &Value) -> Result<()> {
        match &p.kind {
            ValueKind::Null => Ok(()),
            ValueKind::Pair(car, cdr) => {
                if let Some(constant) = self.compile_nonconstant_expr(car)? {
                    self.compile_literal(&constant);
                    if constant.is_false() {
                        return Ok(());
                    }
                }
                self.push_ins();
                let result = self.compile_and_chain(cdr);
                let rest = self.pop_ins();
                result?;
                self.add(CIns::If(Some(rest), None), None);
                Ok(())
            }
            _ => Err(Error::compile("malformed list", p.clone())),
        }
    }

    fn compile_or(&mut self, args: &Value) -> Result<()> {
        if args.is_null() {
            self.compile_literal(&Value::truth());
            return Ok(());
        }
        self.compile_or_chain(args)
    }

    fn compile_or_chain(&mut self, p: &Value) -> Result<()> {
        match &p.kind {
            ValueKind::Null => Ok(()),
            ValueKind::Pair(car, cdr) => {
                if let Some(constant) = self.compile_nonconstant_expr(car)? {
                    self.compile_literal(&constant);
                    if !constant.is_false() {
                        return Ok(());
                    }
                }
                self.push_ins();
                let result = self.compile_or_chain(cdr);
                let rest = self.pop_ins();
                result?;
                self.add(CIns::If(None, Some(rest)), None);
                Ok(())
            }
            _ => Err(Error::compile("malformed list", p.clone())),
        }
    }

    /// Compile `e` only if it is not a compile-time constant. A lone literal
    /// load is undone and handed back as the folded value.
    fn compile_nonconstant_expr(&mut self, e: &Value) -> Result<Option<Value>> {
        let undo_index = self.cur_len();
        self.compile_expr(e)?;
        if self.cur_len() == undo_index + 1 {
            if let Some(lit) = self.last_load_literal() {
                self.undo(undo_index);
                return Ok(Some(lit));
            }
        }
        Ok(None)
    }

    fn last_load_literal(&self) -> Option<Value> {
        let id = *self.bufs[self.cur_buf.0].ids.last()?;
        match &self.ins_arena[id.0] {
            CIns::Load(CLoc::Literal(v)) => Some(v.clone()),
            CIns::Load(CLoc::Function(f)) => {
                Some(Value::new(ValueKind::Function(Rc::clone(f))))
            }
            _ => None,
        }
    }

    // ===== Function blocks =====

    fn function_block(
        &mut self,
        func: &Rc<Function>,
        params: &Value,
        body: &Value,
        tag: Option<SourceTag>,
    ) -> Result<BlockId> {
        *func.tag.borrow_mut() = tag;
        let block = self.push_block(BlockType::Func, Some(Rc::clone(func)));

        let mut cursor = params;
        loop {
            match &cursor.kind {
                ValueKind::Pair(arg, rest) => {
                    self.define_arg(arg)?;
                    cursor = rest;
                }
                ValueKind::Symbol(_) => {
                    self.define_dotted_arg(cursor)?;
                    break;
                }
                ValueKind::Null => break,
                _ => return Err(Error::compile("must be a symbol", cursor.clone())),
            }
        }

        self.push_ins();
        let mut compiled = Ok(());
        let mut exprs = body;
        loop {
            match &exprs.kind {
                ValueKind::Null => break,
                ValueKind::Pair(expr, rest) => {
                    compiled = self.compile_expr(expr);
                    if compiled.is_err() {
                        break;
                    }
                    exprs = rest;
                }
                _ => {
                    compiled = Err(Error::compile("malformed list", exprs.clone()));
                    break;
                }
            }
        }
        let body_buf = self.pop_ins();
        compiled?;

        self.pop_func_block(block, body_buf)?;
        Ok(block)
    }

    // ===== Pending-reference resolution =====

    fn ref_core(&self, ins: InsId) -> CoreRef {
        let loc = match &self.ins_arena[ins.0] {
            CIns::Load(loc) | CIns::Store(loc) => loc,
            _ => return CoreRef::Other,
        };
        let core = match loc {
            CLoc::EnvSkip(inner, _) => inner,
            other => other,
        };
        match core {
            CLoc::Stamped(sid) => CoreRef::Stamped(*sid),
            CLoc::Placeholder(place) => CoreRef::Place(*place),
            _ => CoreRef::Other,
        }
    }

    fn set_whole_loc(&mut self, ins: InsId, loc: CLoc) {
        if let CIns::Load(slot) | CIns::Store(slot) = &mut self.ins_arena[ins.0] {
            *slot = loc;
        }
    }

    /// Fix defining stores against folded initial values: erase the store of
    /// a constant entirely, or make sure the value is loaded right before a
    /// non-constant store whose initialiser folded.
    fn complete_value_defines(&mut self, refs: &[InsRef]) {
        for r in refs {
            if !r.is_define || !matches!(self.ins_arena[r.ins.0], CIns::Store(_)) {
                continue;
            }
            let (is_constant, value) = match self.ref_core(r.ins) {
                CoreRef::Stamped(sid) => {
                    let stamped = &self.stamps[sid.0];
                    match &stamped.value {
                        None => continue,
                        Some(v) => (stamped.is_constant(), v.clone()),
                    }
                }
                CoreRef::Place(place) => match &self.places[place.0].value {
                    None => continue,
                    Some(v) => (false, v.clone()),
                },
                CoreRef::Other => continue,
            };
            let Some(pos) = self.bufs[r.buf.0].ids.iter().position(|id| *id == r.ins) else {
                continue;
            };
            if is_constant {
                // the Load(Literal) path supplies the value; drop the store
                self.bufs[r.buf.0].ids.remove(pos);
                if let Some(tags) = &mut self.bufs[r.buf.0].tags {
                    tags.remove(pos);
                }
            } else {
                let id = InsId(self.ins_arena.len());
                self.ins_arena.push(CIns::Load(CLoc::Literal(value)));
                self.bufs[r.buf.0].ids.insert(pos, id);
                if let Some(tags) = &mut self.bufs[r.buf.0].tags {
                    tags.insert(pos, None);
                }
            }
        }
    }

    fn resolve_constant_ref(&mut self, r: &InsRef) {
        if let CoreRef::Stamped(sid) = self.ref_core(r.ins) {
            let stamped = &self.stamps[sid.0];
            if stamped.is_constant() {
                if let Some(value) = stamped.value.clone() {
                    self.set_whole_loc(r.ins, CLoc::Literal(value));
                }
            }
        }
    }

    fn resolve_local_ref(&mut self, r: &InsRef) -> Result<()> {
        let CoreRef::Stamped(sid) = self.ref_core(r.ins) else {
            return Ok(());
        };
        let target = self.stamps[sid.0].target_stamp;
        if target < 0 {
            return Err(Error::internal(format!(
                "nonresolved local: {}",
                self.stamps[sid.0].name
            )));
        }
        if let CIns::Load(loc) | CIns::Store(loc) = &mut self.ins_arena[r.ins.0] {
            match loc {
                CLoc::EnvSkip(inner, _) => **inner = CLoc::Local(target as usize),
                other => *other = CLoc::Local(target as usize),
            }
        }
        Ok(())
    }

    /// Resolve references against the popping block's own defines; anything
    /// still pending bubbles to the parent.
    fn resolve_refs_in_block(&mut self, b: BlockId, refs: Vec<InsRef>) -> Vec<InsRef> {
        let mut rest = Vec::new();
        for r in refs {
            match self.blocks[b.0].defines.get(&r.name).cloned() {
                Some(Def::Function(func)) => {
                    self.set_whole_loc(r.ins, CLoc::Function(func));
                }
                _ => rest.push(r),
            }
        }
        rest
    }

    // ===== Block popping =====

    fn pop_scope_block(&mut self) -> Result<()> {
        let b = self.cur();
        let refs = mem::take(&mut self.blocks[b.0].iminsref_list);
        let rest = self.resolve_refs_in_block(b, refs);
        let parent = self.blocks[b.0]
            .parent
            .ok_or_else(|| Error::internal("scope block without parent"))?;
        self.blocks[parent.0].iminsref_list.extend(rest);
        self.block = Some(parent);
        Ok(())
    }

    fn pop_global_block(&mut self, env: &Env) -> Result<()> {
        let b = self.cur();
        let refs = mem::take(&mut self.blocks[b.0].iminsref_list);
        self.complete_value_defines(&refs);
        let refs = self.resolve_refs_in_block(b, refs);
        for r in refs {
            match env.lookup_const(&r.name) {
                Some(value) => {
                    let loc = match &value.kind {
                        ValueKind::Function(func) => CLoc::Function(Rc::clone(func)),
                        _ => CLoc::Literal(value.clone()),
                    };
                    self.set_whole_loc(r.ins, loc);
                }
                None => {
                    self.set_whole_loc(r.ins, CLoc::Unknown(r.name.clone()));
                    self.mark_func_nonpure(r.block);
                }
            }
        }
        self.block = self.blocks[b.0].parent;
        Ok(())
    }

    fn pop_func_block(&mut self, b: BlockId, body: BufId) -> Result<()> {
        let refs = mem::take(&mut self.blocks[b.0].iminsref_list);

        // a lexically reachable call/cc disables local optimisation: every
        // local is retained in its own slot
        if self.blocks[b.0].uses_call_cc {
            for sid in self.blocks[b.0].stamped_locals.clone() {
                let stamped = &mut self.stamps[sid.0];
                stamped.closured = true;
                stamped.overwritten = true;
            }
        }

        // eliminate constants, renumbering survivors to stay contiguous
        let mut removed = 0isize;
        for sid in self.blocks[b.0].stamped_locals.clone() {
            let stamped = &mut self.stamps[sid.0];
            if stamped.is_constant() {
                stamped.define_stamp = -1;
                removed += 1;
            } else {
                stamped.define_stamp -= removed;
                stamped.last_use_stamp -= removed;
            }
        }
        {
            let stamps = &self.stamps;
            self.blocks[b.0]
                .stamped_locals
                .retain(|sid| !stamps[sid.0].is_constant());
        }

        let mut own = Vec::new();
        let mut consts = Vec::new();
        let mut ignored = Vec::new();
        for r in refs {
            match self.ref_core(r.ins) {
                CoreRef::Stamped(sid) if self.stamps[sid.0].func_block == b => {
                    if self.stamps[sid.0].is_constant() {
                        consts.push(r);
                    } else {
                        own.push(r);
                    }
                }
                _ => ignored.push(r),
            }
        }
        self.complete_value_defines(&consts);
        for r in &consts {
            self.resolve_constant_ref(r);
        }

        let shuffles = self.reorder_locals(b);
        if !shuffles.is_empty() {
            let mut ids = Vec::with_capacity(shuffles.len());
            for shuffle in shuffles {
                let id = InsId(self.ins_arena.len());
                self.ins_arena.push(shuffle);
                ids.push(id);
            }
            let buf = &mut self.bufs[body.0];
            let count = ids.len();
            buf.ids.splice(0..0, ids);
            if let Some(tags) = &mut buf.tags {
                tags.splice(0..0, std::iter::repeat_with(|| None).take(count));
            }
        }

        self.complete_value_defines(&own);
        for r in &own {
            self.resolve_local_ref(r)?;
        }

        let func = self.blocks[b.0]
            .func
            .clone()
            .ok_or_else(|| Error::internal("function block without function"))?;
        // arguments land positionally before any shuffle runs, so the frame
        // can never be smaller than the argument count
        func.size.set(self.frame_size(b).max(func.nargs.get()));
        self.pending_funcs.push((func, body));

        self.complete_value_defines(&ignored);
        let rest = self.resolve_refs_in_block(b, ignored);
        let parent = self.blocks[b.0]
            .parent
            .ok_or_else(|| Error::internal("function block without parent"))?;
        self.blocks[parent.0].iminsref_list.extend(rest);
        self.block = Some(parent);
        Ok(())
    }

    // ===== Stamp resolution =====

    fn frame_size(&self, b: BlockId) -> usize {
        self.blocks[b.0]
            .stamped_locals
            .iter()
            .map(|sid| self.stamps[sid.0].target_stamp + 1)
            .max()
            .unwrap_or(0)
            .max(0) as usize
    }

    fn reorder_locals(&mut self, b: BlockId) -> Vec<CIns> {
        let sl = self.blocks[b.0].stamped_locals.clone();
        match sl.len() {
            0 => return Vec::new(),
            1 => {
                self.stamps[sl[0].0].target_stamp = 0;
                return Vec::new();
            }
            _ => {}
        }

        // lifetime intervals before the closured pass shifts last-use stamps
        let intervals: Vec<(StampId, isize, isize, bool)> = sl
            .iter()
            .map(|sid| {
                let stamped = &self.stamps[sid.0];
                (
                    *sid,
                    stamped.define_stamp,
                    stamped.last_use_stamp,
                    stamped.closured,
                )
            })
            .collect();

        let nclosured = self.move_closured(&sl);
        self.move_nonclosured(&intervals, nclosured);
        self.arg_shuffles(&sl)
    }

    /// Closured locals get the lowest slots, deduplicated by define stamp so
    /// exclusive `if`-arm locals share. Non-closured locals are offset past
    /// them, last-use clamped to the overall maximum.
    fn move_closured(&mut self, sl: &[StampId]) -> isize {
        let maxlu = sl
            .iter()
            .map(|sid| self.stamps[sid.0].last_use_stamp)
            .max()
            .unwrap_or(0);
        let mut n = 0isize;
        let mut by_define: HashMap<isize, isize> = HashMap::new();
        for sid in sl {
            let stamped = &self.stamps[sid.0];
            if stamped.closured && !stamped.is_constant() {
                let define = stamped.define_stamp;
                let target = *by_define.entry(define).or_insert_with(|| {
                    let t = n;
                    n += 1;
                    t
                });
                self.stamps[sid.0].target_stamp = target;
            }
        }
        for sid in sl {
            let stamped = &mut self.stamps[sid.0];
            if !stamped.closured {
                stamped.target_stamp = stamped.define_stamp + n;
                stamped.last_use_stamp = (stamped.last_use_stamp + n).min(maxlu);
            }
        }
        n
    }

    /// Pack non-closured locals by lifetime: a slot whose occupant died
    /// before the candidate was defined is reused. Locals sharing a define
    /// stamp (exclusive `if` arms) share a slot.
    fn move_nonclosured(&mut self, intervals: &[(StampId, isize, isize, bool)], n: isize) {
        let mut groups: BTreeMap<isize, (isize, Vec<StampId>)> = BTreeMap::new();
        for (sid, define, last_use, closured) in intervals {
            if *closured {
                continue;
            }
            let entry = groups.entry(*define).or_insert((*last_use, Vec::new()));
            entry.0 = entry.0.max(*last_use);
            entry.1.push(*sid);
        }
        let mut slots: Vec<isize> = Vec::new();
        for (define, (last_use, members)) in groups {
            let index = match slots.iter().position(|occupant| *occupant < define) {
                Some(free) => {
                    slots[free] = last_use;
                    free
                }
                None => {
                    slots.push(last_use);
                    slots.len() - 1
                }
            };
            for sid in members {
                self.stamps[sid.0].target_stamp = n + index as isize;
            }
        }
    }

    /// Arguments land positionally; synthesise MoveLocalRange instructions
    /// for those whose final slot differs, coalescing runs with the same
    /// delta.
    fn arg_shuffles(&mut self, sl: &[StampId]) -> Vec<CIns> {
        let mut shufs: Vec<(isize, isize)> = sl
            .iter()
            .filter_map(|sid| {
                let stamped = &self.stamps[sid.0];
                (stamped.is_arg && stamped.define_stamp != stamped.target_stamp)
                    .then_some((stamped.define_stamp, stamped.target_stamp))
            })
            .collect();
        if shufs.is_empty() {
            return Vec::new();
        }
        shufs.sort_by_key(|s| s.0);
        log::trace!(target: "schemer::comp", "arg shuffles: {:?}", shufs);

        let mut ranges: Vec<(usize, usize, isize)> = Vec::new();
        for (from, to) in shufs {
            let positions = to - from;
            if let Some(last) = ranges.last_mut() {
                if positions == last.2 && from as usize == last.1 {
                    last.1 += 1;
                    continue;
                }
            }
            ranges.push((from as usize, from as usize + 1, positions));
        }
        ranges
            .into_iter()
            .map(|(start, end, positions)| CIns::MoveLocalRange {
                start,
                end,
                positions,
            })
            .collect()
    }

    // ===== Lowering to runtime instructions =====

    fn lower(&mut self, top: BufId) -> Result<Rc<Instructions>> {
        let pending = mem::take(&mut self.pending_funcs);
        for (func, buf) in pending {
            let ins = self.lower_buf(buf)?;
            *func.ins.borrow_mut() = Some(Rc::new(ins));
        }
        Ok(Rc::new(self.lower_buf(top)?))
    }

    fn lower_buf(&self, b: BufId) -> Result<Instructions> {
        let buf = &self.bufs[b.0];
        let mut items = Vec::with_capacity(buf.ids.len());
        for id in &buf.ids {
            items.push(self.lower_ins(*id)?);
        }
        Ok(Instructions {
            items,
            tags: buf.tags.clone(),
        })
    }

    fn lower_ins(&self, id: InsId) -> Result<Instruction> {
        Ok(match &self.ins_arena[id.0] {
            CIns::Load(loc) => Instruction::Load(self.lower_loc(loc)?),
            CIns::Store(loc) => Instruction::Store(self.lower_loc(loc)?),
            CIns::PushArgs => Instruction::PushArgs,
            CIns::Arg => Instruction::Arg,
            CIns::Call(n) => Instruction::Call(*n),
            CIns::CallCC => Instruction::CallCC,
            CIns::If(true_ins, false_ins) => {
                let lower_arm = |arm: &Option<BufId>| -> Result<Option<Rc<Instructions>>> {
                    Ok(match arm {
                        Some(buf) => Some(Rc::new(self.lower_buf(*buf)?)),
                        None => None,
                    })
                };
                Instruction::If(lower_arm(true_ins)?, lower_arm(false_ins)?)
            }
            CIns::MoveLocalRange {
                start,
                end,
                positions,
            } => Instruction::MoveLocalRange {
                start: *start,
                end: *end,
                positions: *positions,
            },
        })
    }

    fn lower_loc(&self, loc: &CLoc) -> Result<Location> {
        Ok(match loc {
            CLoc::Literal(v) => Location::Literal(v.clone()),
            CLoc::Local(index) => Location::Local(*index),
            CLoc::EnvSkip(inner, skip) => {
                Location::EnvSkip(Box::new(self.lower_loc(inner)?), *skip)
            }
            CLoc::Unknown(name) => Location::Unknown(name.clone()),
            CLoc::GlobalFunction { name, unknowns } => Location::GlobalFunction {
                name: name.clone(),
                unknowns: unknowns.clone(),
            },
            CLoc::Function(func) => Location::Function(Rc::clone(func)),
            CLoc::Stamped(sid) => {
                return Err(Error::internal(format!(
                    "nonresolved local: {}",
                    self.stamps[sid.0].name
                )))
            }
            CLoc::Placeholder(place) => {
                return Err(Error::internal(format!(
                    "nonresolved global: {}",
                    self.places[place.0].name
                )))
            }
        })
    }

    // ===== Entry points =====

    /// Compile one top-level form under a fresh global block.
    pub fn compile_global(&mut self, e: &Value, env: &Env) -> Result<Rc<Instructions>> {
        self.push_block(BlockType::Global, None);
        let buf = self.compile_ins_of(e)?;
        self.pop_global_block(env)?;
        let ins = self.lower(buf)?;
        if log::log_enabled!(target: "schemer::comp", log::Level::Debug) {
            log::debug!(target: "schemer::comp", "compiled:\n{}", ins.dump());
        }
        Ok(ins)
    }
}

fn wrap_skip(loc: CLoc, level: usize) -> CLoc {
    if level > 0 {
        CLoc::EnvSkip(Box::new(loc), level)
    } else {
        loc
    }
}

/// Compile a single parsed form.
pub fn compile_expr_global(e: &Value, env: &Env, debuggable: bool) -> Result<Rc<Instructions>> {
    ExpressionCompiler::new(debuggable).compile_global(e, env)
}

/// Compile a whole source under one module block. Module-level function
/// defines resolve statically and are not published to the runtime globals.
#[allow(dead_code)]
pub fn compile_module(reader: &mut Reader, env: &Env, debuggable: bool) -> Result<Rc<Instructions>> {
    let mut compiler = ExpressionCompiler::new(debuggable);
    compiler.push_block(BlockType::Module, None);
    compiler.push_ins();
    loop {
        match reader.next_value() {
            Ok(form) => compiler.compile_expr(&form)?,
            Err(e) if matches!(e.kind, ErrorKind::NoValue) => break,
            Err(e) => return Err(e),
        }
    }
    compiler.pop_global_block(env)?;
    let buf = compiler.pop_ins();
    let ins = compiler.lower(buf)?;
    if log::log_enabled!(target: "schemer::comp", log::Level::Debug) {
        log::debug!(target: "schemer::comp", "compiled module:\n{}", ins.dump());
    }
    Ok(ins)
}
