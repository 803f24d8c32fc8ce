//! Metering instrumentation pass.
//!
//! Rewrites a compiled unit so that every original instruction first calls
//! the budget checkpoint, and optionally:
//!
//! - guards every exception handler so the fatal conditions listed in
//!   [`GUARDED_EXCEPTIONS`] are re-raised before user code sees them;
//! - redirects `LOAD_METHOD` through the cost-aware method resolver;
//! - charges multiplications by operand size before they run.
//!
//! Each original instruction becomes a *group*:
//!
//! ```text
//! [checkpoint] [guard prologue] [redirect | multiply injection] original
//! ```
//!
//! The first instruction of the group is its *head*. Every original jump is
//! retargeted to the head of its target's group, so a jump never skips the
//! checkpoint and never lands in the middle of injected code. Injected
//! instructions are never metered themselves.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, enabled, trace, Level};

use malthusia_types::MAX_LITERAL_SIZE;

use crate::disasm;
use crate::editor::{Instr, InstrId, InstrList, Origin};
use crate::error::{InstrumentError, InstrumentResult};
use crate::opcode::{Comparison, Opcode};
use crate::unit::{CodeUnit, Constant};

/// Global called before every original instruction; charges one unit.
pub const CHECKPOINT_NAME: &str = "__instrument__";

/// Global resolving `(object, name)` to a cost-wrapped method.
pub const REDIRECT_NAME: &str = "__redirect_method__";

/// Global charging a multiplication from its two operands.
pub const MULTIPLY_NAME: &str = "__instrument_binary_multiply__";

/// Internal names of the fatal exception kinds a handler must never swallow.
///
/// Every name starts with `_`, so no user identifier can refer to them.
pub const GUARDED_EXCEPTIONS: &[&str] = &[
    "_OutOfBudget",
    "_RecursionError",
    "_MemoryError",
    "_Interrupt",
    "_SystemError",
];

// ══════════════════════════════════════════════════════════════════════════════
// Options
// ══════════════════════════════════════════════════════════════════════════════

/// Which rewrites the pass applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentOptions {
    /// Insert a checkpoint before each original instruction.
    pub inject_metering: bool,
    /// Re-raise fatal conditions at the top of every exception handler.
    pub guard_fatal_handlers: bool,
    /// Resolve `LOAD_METHOD` through the cost-aware resolver.
    pub redirect_method_lookups: bool,
    /// Charge multiplications by operand size.
    pub meter_multiply: bool,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self {
            inject_metering: true,
            guard_fatal_handlers: true,
            redirect_method_lookups: false,
            meter_multiply: true,
        }
    }
}

impl InstrumentOptions {
    /// Every rewrite enabled.
    pub fn full() -> Self {
        Self {
            redirect_method_lookups: true,
            ..Self::default()
        }
    }

    /// Nothing enabled; the unit is re-encoded unchanged.
    pub fn none() -> Self {
        Self {
            inject_metering: false,
            guard_fatal_handlers: false,
            redirect_method_lookups: false,
            meter_multiply: false,
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Pass
// ══════════════════════════════════════════════════════════════════════════════

/// Instrument `unit` and, recursively, every nested unit.
pub fn instrument(unit: &CodeUnit, options: &InstrumentOptions) -> InstrumentResult<CodeUnit> {
    validate_literals(unit)?;

    if enabled!(Level::TRACE) {
        trace!(unit = %unit.name, "before instrumentation:\n{}", disasm::disassemble(unit));
    }

    let mut out = unit.clone();
    for slot in out.consts.iter_mut() {
        if let Constant::Code(child) = slot {
            *slot = Constant::Code(Rc::new(instrument(child, options)?));
        }
    }

    let original = InstrList::decode(&unit.name, &unit.code, unit.first_line, &unit.lnotab)?;
    let rewritten = rewrite(&mut out, &original, options)?;
    let assembled = rewritten.assemble(&out.name, out.first_line)?;

    out.code = assembled.code;
    out.lnotab = assembled.lnotab;
    out.max_stack = rewritten.max_stack_depth();

    debug!(
        unit = %out.name,
        before = unit.word_count(),
        after = out.word_count(),
        max_stack = out.max_stack,
        "instrumented unit"
    );
    if enabled!(Level::TRACE) {
        trace!(unit = %out.name, "after instrumentation:\n{}", disasm::disassemble(&out));
    }
    Ok(out)
}

/// Reject constants and names above the literal ceiling.
fn validate_literals(unit: &CodeUnit) -> InstrumentResult<()> {
    for (index, constant) in unit.consts.iter().enumerate() {
        let size = largest_literal(constant);
        if size > MAX_LITERAL_SIZE {
            return Err(InstrumentError::ConstantTooLarge {
                unit: unit.name.clone(),
                index,
                size,
                limit: MAX_LITERAL_SIZE,
            });
        }
    }
    for (index, name) in unit.names.iter().chain(&unit.varnames).enumerate() {
        let size = name.chars().count();
        if size > MAX_LITERAL_SIZE {
            return Err(InstrumentError::NameTooLarge {
                unit: unit.name.clone(),
                index,
                size,
                limit: MAX_LITERAL_SIZE,
            });
        }
    }
    Ok(())
}

fn largest_literal(constant: &Constant) -> usize {
    match constant {
        Constant::Tuple(items) => items
            .iter()
            .map(largest_literal)
            .fold(constant.size(), usize::max),
        _ => constant.size(),
    }
}

/// Indices into the unit's tables for the injected globals and constants.
struct Symbols {
    checkpoint: u32,
    redirect: u32,
    multiply: u32,
    fatal: Vec<u32>,
}

impl Symbols {
    fn intern(unit: &mut CodeUnit, options: &InstrumentOptions) -> Self {
        let checkpoint = if options.inject_metering {
            unit.add_name(CHECKPOINT_NAME)
        } else {
            0
        };
        let redirect = if options.redirect_method_lookups {
            unit.add_name(REDIRECT_NAME)
        } else {
            0
        };
        let multiply = if options.meter_multiply {
            unit.add_name(MULTIPLY_NAME)
        } else {
            0
        };
        let fatal = if options.guard_fatal_handlers {
            GUARDED_EXCEPTIONS.iter().map(|n| unit.add_name(n)).collect()
        } else {
            Vec::new()
        };
        Self {
            checkpoint,
            redirect,
            multiply,
            fatal,
        }
    }
}

fn is_multiply(op: Opcode) -> bool {
    matches!(op, Opcode::BinaryMultiply | Opcode::InplaceMultiply)
}

/// Build the instrumented list. Tables in `unit` are extended in place.
fn rewrite(
    unit: &mut CodeUnit,
    original: &InstrList,
    options: &InstrumentOptions,
) -> InstrumentResult<InstrList> {
    let symbols = Symbols::intern(unit, options);

    let handler_heads: HashSet<InstrId> = if options.guard_fatal_handlers {
        original
            .instrs
            .iter()
            .filter(|i| i.op == Opcode::SetupExcept)
            .filter_map(|i| i.jump)
            .collect()
    } else {
        HashSet::new()
    };

    let mut out = original.empty_like();

    // Pre-allocate each group's head so forward references can be resolved.
    let mut heads: HashMap<InstrId, InstrId> = HashMap::with_capacity(original.len());
    for instr in &original.instrs {
        let injects_before = options.inject_metering
            || handler_heads.contains(&instr.id)
            || (options.redirect_method_lookups && instr.op == Opcode::LoadMethod)
            || (options.meter_multiply && is_multiply(instr.op));
        let head = if injects_before { out.fresh_id() } else { instr.id };
        heads.insert(instr.id, head);
    }

    for (pos, instr) in original.instrs.iter().enumerate() {
        let mut group = Group::new(&mut out, heads[&instr.id], instr.line);

        if options.inject_metering {
            group.push(Opcode::LoadGlobal, symbols.checkpoint);
            group.push(Opcode::CallFunction, 0);
            group.push(Opcode::PopTop, 0);
        }

        let guarded = handler_heads.contains(&instr.id);
        let prologue_id = guarded.then(|| group.next_id());

        // Everything after the prologue, staged so the prologue can jump
        // past itself onto it.
        let mut tail: Vec<Instr> = Vec::new();
        if options.redirect_method_lookups && instr.op == Opcode::LoadMethod {
            let next = original.instrs.get(pos + 1).ok_or_else(|| {
                InstrumentError::MalformedUnit {
                    unit: unit.name.clone(),
                    reason: "LOAD_METHOD is the last instruction".into(),
                }
            })?;
            let method_name = unit.names.get(instr.arg as usize).cloned().ok_or_else(|| {
                InstrumentError::MalformedUnit {
                    unit: unit.name.clone(),
                    reason: format!("LOAD_METHOD name index {} out of range", instr.arg),
                }
            })?;
            let name_const = unit.add_const(Constant::Str(method_name));
            let next_head = heads[&next.id];
            for (op, arg) in [
                (Opcode::DupTop, 0),
                (Opcode::LoadGlobal, symbols.redirect),
                (Opcode::RotTwo, 0),
                (Opcode::LoadConst, name_const),
                (Opcode::CallFunction, 2),
                (Opcode::RotTwo, 0),
            ] {
                tail.push(group.injected(op, arg, None));
            }
            tail.push(group.injected(Opcode::JumpAbsolute, 0, Some(next_head)));
        } else if options.meter_multiply && is_multiply(instr.op) {
            for (op, arg) in [
                (Opcode::DupTopTwo, 0),
                (Opcode::LoadGlobal, symbols.multiply),
                (Opcode::RotThree, 0),
                (Opcode::CallFunction, 2),
                (Opcode::PopTop, 0),
            ] {
                tail.push(group.injected(op, arg, None));
            }
        }

        let mut kept = instr.clone();
        if let Some(target) = kept.jump {
            kept.jump = Some(heads[&target]);
        }

        if let Some(prologue_id) = prologue_id {
            let resume = tail.first().map(|i| i.id).unwrap_or(kept.id);
            group.push_with_id(prologue_id, Opcode::DupTop, 0);
            for &name in &symbols.fatal {
                group.push(Opcode::LoadGlobal, name);
            }
            group.push(Opcode::BuildTuple, symbols.fatal.len() as u32);
            group.push(Opcode::CompareOp, Comparison::ExceptionMatch as u32);
            group.push_jump(Opcode::PopJumpIfFalse, resume);
            group.push(Opcode::Reraise, 0);
        }

        for staged in tail {
            group.push_staged(staged);
        }
        group.push_original(kept);
    }
    Ok(out)
}

/// Appends one original instruction's group, giving the first pushed
/// instruction the pre-allocated head id.
struct Group<'a> {
    list: &'a mut InstrList,
    head: Option<InstrId>,
    line: u32,
}

impl<'a> Group<'a> {
    fn new(list: &'a mut InstrList, head: InstrId, line: u32) -> Self {
        Self {
            list,
            head: Some(head),
            line,
        }
    }

    fn next_id(&mut self) -> InstrId {
        self.head.take().unwrap_or_else(|| self.list.fresh_id())
    }

    fn injected(&mut self, op: Opcode, arg: u32, jump: Option<InstrId>) -> Instr {
        Instr {
            id: self.next_id(),
            op,
            arg,
            jump,
            line: self.line,
            origin: Origin::Injected,
        }
    }

    fn push(&mut self, op: Opcode, arg: u32) {
        let instr = self.injected(op, arg, None);
        self.list.push_instr(instr);
    }

    fn push_with_id(&mut self, id: InstrId, op: Opcode, arg: u32) {
        self.list.push_instr(Instr {
            id,
            op,
            arg,
            jump: None,
            line: self.line,
            origin: Origin::Injected,
        });
    }

    fn push_jump(&mut self, op: Opcode, target: InstrId) {
        let instr = self.injected(op, 0, Some(target));
        self.list.push_instr(instr);
    }

    fn push_staged(&mut self, instr: Instr) {
        self.list.push_instr(instr);
    }

    /// The original comes last; if nothing was injected it is its own head.
    fn push_original(mut self, instr: Instr) {
        self.head = None;
        self.list.push_instr(instr);
    }
}
