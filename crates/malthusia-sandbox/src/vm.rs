//! The bytecode interpreter.
//!
//! One [`Frame`] per executing unit; calls recurse on the host stack and are
//! bounded by `max_call_depth`. Every error is an exception value: fatal
//! conditions are exceptions too, kept apart from user code by the
//! instrumentation guards and by [`Vm::checkpoint`] re-raising any fatal
//! condition a handler managed to observe.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use indexmap::IndexMap;
use malthusia_codegen::linetable::line_at;
use malthusia_codegen::opcode::{FORMAT_VALUE_HAS_SPEC, MAKE_FUNCTION_DEFAULTS};
use malthusia_codegen::{CodeUnit, Comparison, Opcode, UnitKind};
use tracing::{debug, trace};

use crate::builtins;
use crate::cost::{self, conversion_cost, method_cost, CostShape};
use crate::error::{ExcKind, Exception, FatalKind, RaiseError, TraceEntry, VmResult};
use crate::format::{format_value, to_str};
use crate::imports::ImportGraph;
use crate::meter::Meter;
use crate::methods::{self, MethodDef};
use crate::ops::{self, Arith};
use crate::policy;
use crate::value::{BoundMethod, BuiltinKind, Function, Key, Module, Namespace, SliceValue, Value};

/// Thread-safe switch that aborts a running session at its next checkpoint.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, AtomicOrdering::SeqCst);
    }
}

pub(crate) fn system_error(message: impl Into<String>) -> RaiseError {
    RaiseError::fatal(FatalKind::SystemError, message)
}

// ══════════════════════════════════════════════════════════════════════════════
// Frames
// ══════════════════════════════════════════════════════════════════════════════

enum Block {
    /// An active `try` body; exceptions jump to `handler`.
    Except { handler: usize, level: usize },
    /// A running `except` clause and the exception it caught.
    Handler(Rc<Exception>),
}

struct Frame {
    code: Rc<CodeUnit>,
    pc: usize,
    /// Start offset of the instruction being executed.
    last_offset: usize,
    stack: Vec<Value>,
    locals: Vec<Option<Value>>,
    globals: Namespace,
    module: Rc<str>,
    blocks: Vec<Block>,
}

impl Frame {
    fn new(code: Rc<CodeUnit>, globals: Namespace, module: Rc<str>, locals: Vec<Option<Value>>) -> Self {
        Self {
            stack: Vec::with_capacity(code.max_stack as usize),
            code,
            pc: 0,
            last_offset: 0,
            locals,
            globals,
            module,
            blocks: Vec::new(),
        }
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> VmResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| system_error(format!("stack underflow in {}", self.code.name)))
    }

    fn top(&self) -> VmResult<&Value> {
        self.stack
            .last()
            .ok_or_else(|| system_error(format!("stack underflow in {}", self.code.name)))
    }

    /// Pop `n` values, in push order.
    fn pop_n(&mut self, n: usize) -> VmResult<Vec<Value>> {
        if n > self.stack.len() {
            return Err(system_error(format!("stack underflow in {}", self.code.name)));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn name(&self, index: u32) -> VmResult<&str> {
        self.code
            .names
            .get(index as usize)
            .map(String::as_str)
            .ok_or_else(|| system_error(format!("name index {index} out of range")))
    }

    fn varname(&self, index: u32) -> VmResult<&str> {
        self.code
            .varnames
            .get(index as usize)
            .map(String::as_str)
            .ok_or_else(|| system_error(format!("local index {index} out of range")))
    }

    fn jump_to(&mut self, target: usize) -> VmResult<()> {
        if target >= self.code.code.len() || target % 2 != 0 {
            return Err(system_error(format!("jump target {target} out of range")));
        }
        self.pc = target;
        Ok(())
    }

    /// Route `err` to the innermost `try`; `false` when none is active.
    fn unwind(&mut self, err: &RaiseError) -> bool {
        while let Some(block) = self.blocks.pop() {
            if let Block::Except { handler, level } = block {
                self.stack.truncate(level);
                self.blocks.push(Block::Handler(Rc::clone(err.exception())));
                self.stack.push(Value::Exception(Rc::clone(err.exception())));
                self.pc = handler;
                return true;
            }
        }
        false
    }

    fn active_exception(&self) -> Option<Rc<Exception>> {
        self.blocks.iter().rev().find_map(|b| match b {
            Block::Handler(exc) => Some(Rc::clone(exc)),
            Block::Except { .. } => None,
        })
    }

    fn trace_entry(&self) -> TraceEntry {
        TraceEntry {
            module: self.module.to_string(),
            unit: self.code.name.clone(),
            line: line_at(self.code.first_line, &self.code.lnotab, self.last_offset),
        }
    }
}

enum Flow {
    Continue,
    Return(Value),
}

// ══════════════════════════════════════════════════════════════════════════════
// Machine
// ══════════════════════════════════════════════════════════════════════════════

/// Interpreter state shared by every frame of one session.
pub struct Vm {
    meter: Meter,
    capabilities: Rc<IndexMap<String, Value>>,
    units: IndexMap<String, Rc<CodeUnit>>,
    host_modules: IndexMap<String, Value>,
    imports: ImportGraph,
    depth: usize,
    max_call_depth: usize,
    interrupt: InterruptHandle,
    /// First fatal condition raised since the last turn started.
    fatal_pending: Option<RaiseError>,
    last_memory_usage: usize,
}

impl Vm {
    pub(crate) fn new(
        capabilities: IndexMap<String, Value>,
        units: IndexMap<String, Rc<CodeUnit>>,
        host_modules: IndexMap<String, Value>,
        max_call_depth: usize,
    ) -> Self {
        Self {
            meter: Meter::new(0),
            capabilities: Rc::new(capabilities),
            units,
            host_modules,
            imports: ImportGraph::new(),
            depth: 0,
            max_call_depth,
            interrupt: InterruptHandle::new(),
            fatal_pending: None,
            last_memory_usage: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new(builtins::capability_namespace(), IndexMap::new(), IndexMap::new(), 50)
    }

    /// Budget left in the current turn.
    pub fn budget(&self) -> i64 {
        self.meter.remaining()
    }

    /// Units charged over the session's lifetime.
    pub fn spent(&self) -> u64 {
        self.meter.spent()
    }

    /// Persistent-state size measured at the end of the previous turn.
    pub fn last_memory_usage(&self) -> usize {
        self.last_memory_usage
    }

    pub(crate) fn set_budget(&mut self, budget: i64) {
        self.meter.set_remaining(budget);
    }

    pub(crate) fn set_last_memory_usage(&mut self, bytes: usize) {
        self.last_memory_usage = bytes;
    }

    pub(crate) fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub(crate) fn take_fatal(&mut self) -> Option<RaiseError> {
        self.fatal_pending.take()
    }

    pub(crate) fn clear_fatal(&mut self) {
        self.fatal_pending = None;
    }

    // ── Instrumentation Hooks ─────────────────────────────────────────────────

    /// Charge one unit, or raise whatever must stop the program.
    pub(crate) fn checkpoint(&mut self) -> VmResult<()> {
        if self.interrupt.is_set() {
            return Err(RaiseError::fatal(FatalKind::Interrupt, "interrupted by host"));
        }
        if let Some(pending) = &self.fatal_pending {
            return Err(pending.clone());
        }
        self.meter.charge(1)
    }

    pub(crate) fn charge_multiply(&mut self, a: &Value, b: &Value) -> VmResult<()> {
        self.meter.charge_multiply(a, b)
    }

    /// Resolve `obj.name` for a method call, wrapped so it meters like
    /// the same call made through an unredirected lookup.
    pub(crate) fn redirect_method(&mut self, obj: &Value, name: &str) -> VmResult<Value> {
        policy::check_attribute(obj, name)?;
        if let Some(def) = methods::lookup(obj, name) {
            return Ok(Value::UnboundMethod(def));
        }
        Ok(Value::Detached(Rc::new(self.get_attr(obj, name)?)))
    }

    // ── Execution ─────────────────────────────────────────────────────────────

    /// Run a module body in `globals`.
    pub(crate) fn execute_module(
        &mut self,
        module: &str,
        code: Rc<CodeUnit>,
        globals: Namespace,
    ) -> VmResult<()> {
        if code.kind != UnitKind::Module {
            return Err(system_error(format!("{} is not a module body", code.name)));
        }
        let frame = Frame::new(code, globals, Rc::from(module), Vec::new());
        self.run_frame(frame).map(|_| ())
    }

    fn run_frame(&mut self, mut frame: Frame) -> VmResult<Value> {
        if self.depth >= self.max_call_depth {
            return Err(RaiseError::fatal(
                FatalKind::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }
        self.depth += 1;
        let result = self.run_loop(&mut frame);
        self.depth -= 1;
        result
    }

    fn run_loop(&mut self, frame: &mut Frame) -> VmResult<Value> {
        loop {
            match self.step(frame) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return(value)) => return Ok(value),
                Err(err) => {
                    if err.fatal_kind().is_some() && self.fatal_pending.is_none() {
                        debug!(kind = err.kind().name(), "fatal condition raised");
                        self.fatal_pending = Some(err.clone());
                    }
                    if !frame.unwind(&err) {
                        err.exception().traceback.borrow_mut().push(frame.trace_entry());
                        return Err(err);
                    }
                }
            }
        }
    }

    fn fetch(&self, frame: &mut Frame) -> VmResult<(Opcode, u32)> {
        let start = frame.pc;
        let mut extended: u32 = 0;
        loop {
            let pc = frame.pc;
            let (Some(&byte), Some(&arg)) = (frame.code.code.get(pc), frame.code.code.get(pc + 1)) else {
                return Err(system_error(format!(
                    "instruction pointer {pc} out of range in {}",
                    frame.code.name
                )));
            };
            let op = Opcode::from_u8(byte)
                .ok_or_else(|| system_error(format!("unknown opcode {byte} at offset {pc}")))?;
            frame.pc += 2;
            let arg = (extended << 8) | arg as u32;
            if op == Opcode::ExtendedArg {
                extended = arg;
                continue;
            }
            frame.last_offset = start;
            return Ok((op, arg));
        }
    }

    fn step(&mut self, frame: &mut Frame) -> VmResult<Flow> {
        let (op, arg) = self.fetch(frame)?;
        trace!(unit = %frame.code.name, offset = frame.last_offset, op = op.name(), arg);
        match op {
            Opcode::Nop | Opcode::ExtendedArg => {}

            // ── Stack ──────────────────────────────────────────────────────────
            Opcode::PopTop => {
                frame.pop()?;
            }
            Opcode::RotTwo => {
                let a = frame.pop()?;
                let b = frame.pop()?;
                frame.push(a);
                frame.push(b);
            }
            Opcode::RotThree => {
                let a = frame.pop()?;
                let b = frame.pop()?;
                let c = frame.pop()?;
                frame.push(a);
                frame.push(c);
                frame.push(b);
            }
            Opcode::DupTop => {
                let top = frame.top()?.clone();
                frame.push(top);
            }
            Opcode::DupTopTwo => {
                let pair = frame.pop_n(2)?;
                frame.stack.extend(pair.iter().cloned());
                frame.stack.extend(pair);
            }

            // ── Unary / Binary ─────────────────────────────────────────────────
            Opcode::UnaryPositive => {
                let v = frame.pop()?;
                frame.push(ops::positive(&v)?);
            }
            Opcode::UnaryNegative => {
                let v = frame.pop()?;
                frame.push(ops::negate(&v)?);
            }
            Opcode::UnaryNot => {
                let v = frame.pop()?;
                frame.push(Value::Bool(!ops::truthy(&v)));
            }
            Opcode::BinaryPower => self.binary(frame, Arith::Pow)?,
            Opcode::BinaryMultiply | Opcode::InplaceMultiply => self.binary(frame, Arith::Mul)?,
            Opcode::BinaryModulo | Opcode::InplaceModulo => self.binary(frame, Arith::Mod)?,
            Opcode::BinarySubtract | Opcode::InplaceSubtract => self.binary(frame, Arith::Sub)?,
            Opcode::BinaryFloorDivide | Opcode::InplaceFloorDivide => {
                self.binary(frame, Arith::FloorDiv)?
            }
            Opcode::BinaryTrueDivide | Opcode::InplaceTrueDivide => {
                self.binary(frame, Arith::TrueDiv)?
            }
            Opcode::BinaryAdd => self.binary(frame, Arith::Add)?,
            Opcode::InplaceAdd => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                if let Value::List(items) = &a {
                    let extra = ops::collect(&b)?;
                    ops::ensure_materializable(items.borrow().len().saturating_add(extra.len()))?;
                    self.charge_size(extra.len() as u64)?;
                    let mut items = items.borrow_mut();
                    items.extend(extra);
                    drop(items);
                    frame.push(a);
                } else {
                    self.charge_size(cost::concat_cost(&a, &b))?;
                    frame.push(ops::binary(Arith::Add, &a, &b)?);
                }
            }

            // ── Subscripts ─────────────────────────────────────────────────────
            Opcode::BinarySubscr => {
                let index = frame.pop()?;
                let container = frame.pop()?;
                policy::check_item_key(&index)?;
                if let (Value::Slice(slice), Some(len)) = (&index, ops::len_of(&container)) {
                    self.charge_size(slice.count(len)? as u64)?;
                }
                frame.push(ops::get_item(&container, &index)?);
            }
            Opcode::StoreSubscr => {
                let index = frame.pop()?;
                let container = frame.pop()?;
                let value = frame.pop()?;
                policy::check_item_key(&index)?;
                policy::check_writable(&container)?;
                ops::set_item(&container, &index, value)?;
            }
            Opcode::DeleteSubscr => {
                let index = frame.pop()?;
                let container = frame.pop()?;
                policy::check_item_key(&index)?;
                policy::check_writable(&container)?;
                ops::del_item(&container, &index)?;
            }

            // ── Names ──────────────────────────────────────────────────────────
            Opcode::LoadConst => {
                let constant = frame
                    .code
                    .consts
                    .get(arg as usize)
                    .ok_or_else(|| system_error(format!("constant index {arg} out of range")))?;
                let value = Value::from_constant(constant);
                frame.push(value);
            }
            Opcode::LoadName | Opcode::LoadGlobal => {
                let value = self.load_global(frame, arg)?;
                frame.push(value);
            }
            Opcode::StoreName | Opcode::StoreGlobal => {
                let name = frame.name(arg)?.to_string();
                let value = frame.pop()?;
                frame.globals.borrow_mut().insert(name, value);
            }
            Opcode::DeleteName | Opcode::DeleteGlobal => {
                let name = frame.name(arg)?.to_string();
                if frame.globals.borrow_mut().shift_remove(&name).is_none() {
                    return Err(RaiseError::name_error(format!("name '{name}' is not defined")));
                }
            }
            Opcode::LoadFast => {
                let value = frame.locals.get(arg as usize).cloned().flatten();
                match value {
                    Some(value) => frame.push(value),
                    None => {
                        return Err(RaiseError::name_error(format!(
                            "local variable '{}' referenced before assignment",
                            frame.varname(arg)?
                        )))
                    }
                }
            }
            Opcode::StoreFast => {
                let value = frame.pop()?;
                let slot = frame
                    .locals
                    .get_mut(arg as usize)
                    .ok_or_else(|| system_error(format!("local index {arg} out of range")))?;
                *slot = Some(value);
            }
            Opcode::DeleteFast => {
                let bound = frame.locals.get_mut(arg as usize).and_then(Option::take);
                if bound.is_none() {
                    return Err(RaiseError::name_error(format!(
                        "local variable '{}' referenced before assignment",
                        frame.varname(arg)?
                    )));
                }
            }

            // ── Attributes ─────────────────────────────────────────────────────
            Opcode::LoadAttr => {
                let obj = frame.pop()?;
                let name = frame.name(arg)?.to_string();
                frame.push(self.get_attr(&obj, &name)?);
            }
            Opcode::StoreAttr | Opcode::DeleteAttr => {
                let obj = frame.pop()?;
                if op == Opcode::StoreAttr {
                    frame.pop()?;
                }
                let name = frame.name(arg)?;
                policy::check_attribute(&obj, name)?;
                policy::check_writable(&obj)?;
                return Err(RaiseError::attribute_error(format!(
                    "'{}' object attribute '{name}' is read-only",
                    obj.type_name()
                )));
            }
            Opcode::LoadMethod => {
                let obj = frame.pop()?;
                let name = frame.name(arg)?.to_string();
                policy::check_attribute(&obj, &name)?;
                match methods::lookup(&obj, &name) {
                    Some(def) => {
                        frame.push(Value::UnboundMethod(def));
                        frame.push(obj);
                    }
                    None => {
                        let attr = self.get_attr(&obj, &name)?;
                        frame.push(Value::Null);
                        frame.push(attr);
                    }
                }
            }

            // ── Builders ───────────────────────────────────────────────────────
            Opcode::BuildTuple => {
                let items = frame.pop_n(arg as usize)?;
                frame.push(Value::tuple(items));
            }
            Opcode::BuildList => {
                let items = frame.pop_n(arg as usize)?;
                frame.push(Value::list(items));
            }
            Opcode::BuildSet => {
                let items = frame.pop_n(arg as usize)?;
                let set = items.into_iter().map(Key::new).collect::<VmResult<_>>()?;
                frame.push(Value::set(set));
            }
            Opcode::BuildMap => {
                let flat = frame.pop_n(2 * arg as usize)?;
                let mut map = IndexMap::with_capacity(arg as usize);
                let mut flat = flat.into_iter();
                while let (Some(k), Some(v)) = (flat.next(), flat.next()) {
                    map.insert(Key::new(k)?, v);
                }
                frame.push(Value::dict(map));
            }
            Opcode::BuildSlice => {
                let parts = frame.pop_n(arg as usize)?;
                let bound = |v: Option<&Value>| -> VmResult<Option<i64>> {
                    match v {
                        None | Some(Value::None) => Ok(None),
                        Some(v) => v.as_int().map(Some).ok_or_else(|| {
                            RaiseError::type_error(
                                "slice indices must be integers or None",
                            )
                        }),
                    }
                };
                let slice = SliceValue {
                    start: bound(parts.first())?,
                    stop: bound(parts.get(1))?,
                    step: bound(parts.get(2))?,
                };
                frame.push(Value::Slice(Rc::new(slice)));
            }
            Opcode::UnpackSequence => {
                let seq = frame.pop()?;
                let items = ops::collect(&seq)?;
                if items.len() != arg as usize {
                    let message = if items.len() > arg as usize {
                        format!("too many values to unpack (expected {arg})")
                    } else {
                        format!(
                            "not enough values to unpack (expected {arg}, got {})",
                            items.len()
                        )
                    };
                    return Err(RaiseError::value_error(message));
                }
                frame.stack.extend(items.into_iter().rev());
            }
            Opcode::FormatValue => {
                let spec = if arg & FORMAT_VALUE_HAS_SPEC != 0 {
                    Some(frame.pop()?)
                } else {
                    None
                };
                let value = frame.pop()?;
                let text = Value::from(match &spec {
                    Some(spec) => format_value(&value, &to_str(spec))?,
                    None => to_str(&value),
                });
                self.charge_size(cost::format_cost().after(&text))?;
                frame.push(text);
            }
            Opcode::BuildString => {
                let parts = frame.pop_n(arg as usize)?;
                let total = parts
                    .iter()
                    .fold(0usize, |n, part| n.saturating_add(ops::len_of(part).unwrap_or(0)));
                ops::ensure_materializable(total)?;
                self.charge_size(total as u64)?;
                let text: String = parts.iter().map(to_str).collect();
                frame.push(Value::from(text));
            }

            // ── Comparison ─────────────────────────────────────────────────────
            Opcode::CompareOp => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                let cmp = Comparison::from_arg(arg)
                    .ok_or_else(|| system_error(format!("unknown comparison {arg}")))?;
                if matches!(cmp, Comparison::In | Comparison::NotIn) {
                    self.charge_size(cost::contains_cost(&b))?;
                }
                frame.push(Value::Bool(compare(cmp, &a, &b)?));
            }

            // ── Jumps ──────────────────────────────────────────────────────────
            Opcode::JumpForward => frame.jump_to(frame.pc + arg as usize)?,
            Opcode::JumpAbsolute => frame.jump_to(arg as usize)?,
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let v = frame.pop()?;
                if ops::truthy(&v) == (op == Opcode::PopJumpIfTrue) {
                    frame.jump_to(arg as usize)?;
                }
            }
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                if ops::truthy(frame.top()?) == (op == Opcode::JumpIfTrueOrPop) {
                    frame.jump_to(arg as usize)?;
                } else {
                    frame.pop()?;
                }
            }

            // ── Iteration ──────────────────────────────────────────────────────
            Opcode::GetIter => {
                let v = frame.pop()?;
                frame.push(Value::iter(ops::iterate(&v)?));
            }
            Opcode::ForIter => {
                let Value::Iter(state) = frame.top()? else {
                    return Err(system_error("FOR_ITER without an iterator"));
                };
                let next = state.borrow_mut().next_value();
                match next {
                    Some(value) => frame.push(value),
                    None => {
                        frame.pop()?;
                        frame.jump_to(frame.pc + arg as usize)?;
                    }
                }
            }

            // ── Functions ──────────────────────────────────────────────────────
            Opcode::MakeFunction => {
                let code = match frame.pop()? {
                    Value::Code(code) => code,
                    other => {
                        return Err(system_error(format!(
                            "MAKE_FUNCTION expects code, got {}",
                            other.type_name()
                        )))
                    }
                };
                let defaults = if arg & MAKE_FUNCTION_DEFAULTS != 0 {
                    match frame.pop()? {
                        Value::Tuple(items) => items.to_vec(),
                        _ => return Err(system_error("MAKE_FUNCTION defaults must be a tuple")),
                    }
                } else {
                    Vec::new()
                };
                frame.push(Value::Function(Rc::new(Function {
                    code,
                    globals: Rc::clone(&frame.globals),
                    module: Rc::clone(&frame.module),
                    defaults,
                })));
            }
            Opcode::CallFunction => {
                let args = frame.pop_n(arg as usize)?;
                let func = frame.pop()?;
                let result = self.call(&func, args)?;
                frame.push(result);
            }
            Opcode::CallMethod => {
                let mut args = frame.pop_n(arg as usize)?;
                let receiver = frame.pop()?;
                let method = frame.pop()?;
                let result = if matches!(method, Value::Null) {
                    self.call(&receiver, args)?
                } else {
                    args.insert(0, receiver);
                    self.call(&method, args)?
                };
                frame.push(result);
            }
            Opcode::ReturnValue => return Ok(Flow::Return(frame.pop()?)),

            // ── Imports ────────────────────────────────────────────────────────
            Opcode::ImportName => {
                let name = frame.name(arg)?.to_string();
                let caller = Rc::clone(&frame.module);
                frame.push(self.import(&name, &caller)?);
            }
            Opcode::ImportFrom => {
                let module = frame.top()?.clone();
                let name = frame.name(arg)?.to_string();
                let value = self.get_attr(&module, &name).map_err(|_| {
                    let module_name = match &module {
                        Value::Module(m) => m.name.clone(),
                        other => other.type_name().to_string(),
                    };
                    RaiseError::import_error(format!(
                        "cannot import name '{name}' from '{module_name}'"
                    ))
                })?;
                frame.push(value);
            }

            // ── Exceptions ─────────────────────────────────────────────────────
            Opcode::SetupExcept => {
                let handler = frame.pc + arg as usize;
                frame.blocks.push(Block::Except {
                    handler,
                    level: frame.stack.len(),
                });
            }
            Opcode::PopBlock => match frame.blocks.pop() {
                Some(Block::Except { .. }) => {}
                _ => return Err(system_error("POP_BLOCK without a try block")),
            },
            Opcode::PopExcept => match frame.blocks.pop() {
                Some(Block::Handler(_)) => {}
                _ => return Err(system_error("POP_EXCEPT outside a handler")),
            },
            Opcode::Reraise => {
                let exc = frame.pop()?;
                match frame.blocks.pop() {
                    Some(Block::Handler(_)) => {}
                    _ => return Err(system_error("RERAISE outside a handler")),
                }
                return Err(match exc {
                    Value::Exception(exc) => RaiseError(exc),
                    _ => system_error("RERAISE of a non-exception"),
                });
            }
            Opcode::RaiseVarargs => {
                return Err(match arg {
                    0 => match frame.active_exception() {
                        Some(exc) => RaiseError(exc),
                        None => RaiseError::runtime_error("No active exception to reraise"),
                    },
                    1 => raise_value(frame.pop()?),
                    _ => system_error(format!("RAISE_VARARGS {arg}")),
                });
            }
            Opcode::LoadAssertionError => frame.push(Value::ExcType(ExcKind::AssertionError)),
        }
        Ok(Flow::Continue)
    }

    fn binary(&mut self, frame: &mut Frame, op: Arith) -> VmResult<()> {
        let b = frame.pop()?;
        let a = frame.pop()?;
        if op == Arith::Add {
            self.charge_size(cost::concat_cost(&a, &b))?;
        }
        frame.push(ops::binary(op, &a, &b)?);
        Ok(())
    }

    /// Charge a size-scaled operation before it materializes anything.
    fn charge_size(&mut self, cost: u64) -> VmResult<()> {
        if cost == 0 {
            return Ok(());
        }
        self.meter.charge_cost(cost)
    }

    fn load_global(&self, frame: &Frame, index: u32) -> VmResult<Value> {
        let name = frame.name(index)?;
        if let Some(value) = frame.globals.borrow().get(name) {
            return Ok(value.clone());
        }
        self.capabilities
            .get(name)
            .cloned()
            .ok_or_else(|| RaiseError::name_error(format!("name '{name}' is not defined")))
    }

    // ── Calls ─────────────────────────────────────────────────────────────────

    /// Call any callable value.
    pub fn call(&mut self, func: &Value, args: Vec<Value>) -> VmResult<Value> {
        match func {
            Value::Function(f) => self.call_function(f, args),
            Value::Builtin(b) => {
                if b.kind == BuiltinKind::Game {
                    policy::check_game_args(&args)?;
                }
                if let Some(cost) = &b.cost {
                    self.meter.charge_cost(cost.before(args.first(), args.get(1)))?;
                }
                let out = (b.func)(self, args)?;
                if let Some(cost) = b.cost.as_ref().filter(|c| c.charges_after()) {
                    self.meter.charge_cost(cost.after(&out))?;
                }
                Ok(out)
            }
            Value::Method(bound) => {
                let receiver = bound.receiver.clone();
                self.call_method(bound.def, &receiver, args)
            }
            Value::UnboundMethod(def) => {
                let mut args = args.into_iter();
                let receiver = args.next().ok_or_else(|| {
                    RaiseError::type_error(format!(
                        "descriptor '{}' of '{}' object needs an argument",
                        def.name, def.owner
                    ))
                })?;
                self.call_method(def, &receiver, args.collect())
            }
            Value::Detached(inner) => {
                let rest = args.into_iter().skip(1).collect();
                self.call(inner, rest)
            }
            Value::ExcType(kind) => Ok(builtins::instantiate(*kind, args)),
            Value::Type(kind) => {
                let cost = conversion_cost(*kind);
                self.meter.charge_cost(cost.before(args.first(), args.get(1)))?;
                let out = builtins::convert(*kind, args)?;
                self.meter.charge_cost(cost.after(&out))?;
                Ok(out)
            }
            other => Err(RaiseError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_method(
        &mut self,
        def: &'static MethodDef,
        receiver: &Value,
        args: Vec<Value>,
    ) -> VmResult<Value> {
        let cost: CostShape = method_cost(def.owner, def.name);
        self.meter.charge_cost(cost.before(Some(receiver), args.first()))?;
        let out = methods::invoke(def, receiver, args)?;
        self.meter.charge_cost(cost.after(&out))?;
        Ok(out)
    }

    fn call_function(&mut self, func: &Rc<Function>, args: Vec<Value>) -> VmResult<Value> {
        let code = &func.code;
        let argc = code.argcount as usize;
        let required = argc.saturating_sub(func.defaults.len());
        if args.len() > argc || args.len() < required {
            let expected = if required == argc {
                argc.to_string()
            } else {
                format!("from {required} to {argc}")
            };
            return Err(RaiseError::type_error(format!(
                "{}() takes {expected} positional arguments but {} were given",
                code.name,
                args.len()
            )));
        }
        let mut locals: Vec<Option<Value>> = vec![None; code.varnames.len().max(argc)];
        let given = args.len();
        for (slot, value) in locals.iter_mut().zip(args) {
            *slot = Some(value);
        }
        for (i, slot) in locals.iter_mut().enumerate().take(argc).skip(given) {
            *slot = func.defaults.get(i - required).cloned();
        }
        let frame = Frame::new(
            Rc::clone(code),
            Rc::clone(&func.globals),
            Rc::clone(&func.module),
            locals,
        );
        self.run_frame(frame)
    }

    // ── Attributes ────────────────────────────────────────────────────────────

    pub fn get_attr(&mut self, obj: &Value, name: &str) -> VmResult<Value> {
        policy::check_attribute(obj, name)?;
        if let Value::Module(module) = obj {
            return module.get(name).ok_or_else(|| {
                RaiseError::attribute_error(format!(
                    "module '{}' has no attribute '{name}'",
                    module.name
                ))
            });
        }
        if let (Value::Exception(exc), "args") = (obj, name) {
            return Ok(Value::tuple(exc.args.clone()));
        }
        if let Some(def) = methods::lookup(obj, name) {
            return Ok(Value::Method(Rc::new(BoundMethod {
                receiver: obj.clone(),
                def,
            })));
        }
        Err(RaiseError::attribute_error(format!(
            "'{}' object has no attribute '{name}'",
            obj.type_name()
        )))
    }

    // ── Imports ───────────────────────────────────────────────────────────────

    fn import(&mut self, name: &str, caller: &str) -> VmResult<Value> {
        if name.is_empty() {
            return Err(RaiseError::import_error("Empty module name"));
        }
        if let Some(code) = self.units.get(name).cloned() {
            self.imports.add_edge(caller, name);
            if let Some(cycle) = self.imports.find_cycle() {
                self.imports.remove_edge(caller, name);
                return Err(RaiseError::import_error(format!(
                    "infinite loop in imports: {}",
                    cycle.join(" -> ")
                )));
            }
            debug!(module = name, importer = caller, "importing bundle module");
            let globals: Namespace = Default::default();
            self.execute_module(name, code, Rc::clone(&globals))?;
            return Ok(Module::new(name, globals));
        }
        if let Some(module) = self.host_modules.get(name) {
            return Ok(module.clone());
        }
        Err(RaiseError::import_error(format!("module '{name}' does not exist")))
    }
}

/// Turn the operand of `raise x` into the exception it raises.
fn raise_value(value: Value) -> RaiseError {
    match value {
        Value::Exception(exc) => RaiseError(exc),
        Value::ExcType(kind) => match builtins::instantiate(kind, Vec::new()) {
            Value::Exception(exc) => RaiseError(exc),
            _ => system_error("exception type produced a non-exception"),
        },
        other => RaiseError::type_error(format!(
            "exceptions must derive from BaseException, not {}",
            other.type_name()
        )),
    }
}

fn exception_matches(exc: &Value, class: &Value) -> VmResult<bool> {
    let kind = match exc {
        Value::Exception(e) => e.kind,
        Value::ExcType(k) => *k,
        _ => return Ok(false),
    };
    match class {
        Value::ExcType(target) => Ok(kind.is_subclass_of(*target)),
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if exception_matches(exc, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(RaiseError::type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

fn compare(cmp: Comparison, a: &Value, b: &Value) -> VmResult<bool> {
    use std::cmp::Ordering;
    let ordered = |accept: fn(Ordering) -> bool| -> VmResult<bool> {
        match ops::partial_order(a, b) {
            Ok(order) => Ok(order.is_some_and(accept)),
            Err(err) if err.kind() == ExcKind::TypeError => Err(RaiseError::type_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                cmp.symbol(),
                a.type_name(),
                b.type_name()
            ))),
            Err(err) => Err(err),
        }
    };
    match cmp {
        Comparison::Lt => ordered(Ordering::is_lt),
        Comparison::LtE => ordered(Ordering::is_le),
        Comparison::Gt => ordered(Ordering::is_gt),
        Comparison::GtE => ordered(Ordering::is_ge),
        Comparison::Eq => ops::equals(a, b),
        Comparison::NotEq => Ok(!ops::equals(a, b)?),
        Comparison::In => ops::contains(b, a),
        Comparison::NotIn => Ok(!ops::contains(b, a)?),
        Comparison::Is => Ok(a.is(b)),
        Comparison::IsNot => Ok(!a.is(b)),
        Comparison::ExceptionMatch => exception_matches(a, b),
    }
}
