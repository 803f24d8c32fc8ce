//! Human-readable rendering of compiled units.
//!
//! ```text
//! Disassembly of <module> (bot.py, line 1):
//!   1           0 LOAD_CONST               0 (1)
//!               2 STORE_NAME               0 (x)
//!   2     >>    4 LOAD_NAME                0 (x)
//! ```
//!
//! Jump targets are marked `>>`; jump operands are annotated with the
//! resolved target offset. Nested units follow their parent.

use std::collections::HashSet;
use std::fmt::Write;

use crate::editor::InstrList;
use crate::opcode::{Comparison, JumpKind, Opcode};
use crate::unit::CodeUnit;

/// Disassemble `unit` and every nested unit.
pub fn disassemble(unit: &CodeUnit) -> String {
    let mut out = String::new();
    render(unit, &mut out);
    out
}

fn render(unit: &CodeUnit, out: &mut String) {
    let _ = writeln!(
        out,
        "Disassembly of {} ({}, line {}):",
        unit.name, unit.filename, unit.first_line
    );
    let list = match InstrList::decode(&unit.name, &unit.code, unit.first_line, &unit.lnotab) {
        Ok(list) => list,
        Err(e) => {
            let _ = writeln!(out, "  <{e}>");
            return;
        }
    };
    let asm = match list.assemble(&unit.name, unit.first_line) {
        Ok(asm) => asm,
        Err(e) => {
            let _ = writeln!(out, "  <{e}>");
            return;
        }
    };
    let positions = list.positions();
    let targets: HashSet<usize> = list
        .instrs
        .iter()
        .filter_map(|i| i.jump)
        .filter_map(|id| positions.get(&id).copied())
        .collect();

    let mut last_line = None;
    for (pos, instr) in list.instrs.iter().enumerate() {
        let line = if last_line != Some(instr.line) {
            last_line = Some(instr.line);
            instr.line.to_string()
        } else {
            String::new()
        };
        let marker = if targets.contains(&pos) { ">>" } else { "" };
        let _ = write!(
            out,
            "{line:>4}   {marker:>4} {offset:>5} {name:<24}",
            offset = asm.offsets[pos],
            name = instr.op.name()
        );
        if instr.op.has_arg() {
            let arg = match (instr.op.jump_kind(), instr.jump) {
                (Some(_), Some(target)) => positions
                    .get(&target)
                    .map(|&p| asm.offsets[p] as u32)
                    .unwrap_or(instr.arg),
                _ => instr.arg,
            };
            let shown = encoded_arg(instr.op, arg, asm.offsets[pos], byte_len(&asm.offsets, pos, asm.code.len()));
            let _ = write!(out, " {shown:>4}");
            if let Some(note) = annotation(unit, instr.op, arg) {
                let _ = write!(out, " ({note})");
            }
        }
        out.push('\n');
    }

    for child in unit.children() {
        out.push('\n');
        render(child, out);
    }
}

/// Size in bytes of instruction `pos`, prefixes included.
fn byte_len(offsets: &[usize], pos: usize, code_len: usize) -> usize {
    offsets.get(pos + 1).copied().unwrap_or(code_len) - offsets[pos]
}

/// The operand as it appears in the encoded stream.
fn encoded_arg(op: Opcode, target: u32, offset: usize, size: usize) -> u32 {
    match op.jump_kind() {
        Some(JumpKind::Relative) => target.saturating_sub((offset + size) as u32),
        _ => target,
    }
}

fn annotation(unit: &CodeUnit, op: Opcode, arg: u32) -> Option<String> {
    let idx = arg as usize;
    match op {
        Opcode::LoadConst => unit.consts.get(idx).map(|c| c.repr()),
        Opcode::LoadName
        | Opcode::StoreName
        | Opcode::DeleteName
        | Opcode::LoadGlobal
        | Opcode::StoreGlobal
        | Opcode::DeleteGlobal
        | Opcode::LoadAttr
        | Opcode::StoreAttr
        | Opcode::DeleteAttr
        | Opcode::LoadMethod
        | Opcode::ImportName
        | Opcode::ImportFrom => unit.names.get(idx).cloned(),
        Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => unit.varnames.get(idx).cloned(),
        Opcode::CompareOp => Comparison::from_arg(arg).map(|c| c.symbol().to_string()),
        _ if op.is_jump() => Some(format!("to {arg}")),
        _ => None,
    }
}
