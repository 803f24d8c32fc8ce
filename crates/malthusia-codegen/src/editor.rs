//! Instruction-list editor.
//!
//! Decodes an encoded stream into a list of [`Instr`]s whose jumps refer to
//! their target by stable [`InstrId`] rather than by offset, lets callers
//! build a new list with injected instructions, and re-encodes the result.
//! Re-encoding runs offset assignment and operand widening to a fixpoint:
//! widening an operand shifts later offsets, which can widen further
//! operands, so a single pass is not enough.

use std::collections::HashMap;

use crate::error::{InstrumentError, InstrumentResult};
use crate::linetable;
use crate::opcode::{JumpKind, Opcode, MAX_EXTENDED_ARGS};

/// Stable identity of an instruction across edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub usize);

/// Whether an instruction came from the program or was added by a rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Original,
    Injected,
}

/// One decoded instruction. `EXTENDED_ARG` prefixes are folded into `arg`.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub id: InstrId,
    pub op: Opcode,
    /// Operand for non-jumps; recomputed from `jump` when encoding.
    pub arg: u32,
    pub jump: Option<InstrId>,
    pub line: u32,
    pub origin: Origin,
}

impl Instr {
    pub fn is_original(&self) -> bool {
        self.origin == Origin::Original
    }
}

/// An ordered, editable instruction list.
#[derive(Debug, Clone, Default)]
pub struct InstrList {
    pub instrs: Vec<Instr>,
    next_id: usize,
}

/// Output of [`InstrList::assemble`].
#[derive(Debug, Clone)]
pub struct Assembled {
    pub code: Vec<u8>,
    pub lnotab: Vec<u8>,
    /// Start offset of every instruction, in list order.
    pub offsets: Vec<usize>,
}

impl InstrList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// An empty list whose fresh ids cannot collide with any id in `self`.
    pub fn empty_like(&self) -> Self {
        Self {
            instrs: Vec::new(),
            next_id: self.next_id,
        }
    }

    /// Allocate a fresh id without inserting anything.
    pub fn fresh_id(&mut self) -> InstrId {
        let id = InstrId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Append a non-jump instruction.
    pub fn push(&mut self, op: Opcode, arg: u32, line: u32, origin: Origin) -> InstrId {
        let id = self.fresh_id();
        self.instrs.push(Instr {
            id,
            op,
            arg,
            jump: None,
            line,
            origin,
        });
        id
    }

    /// Append a jump to `target`.
    pub fn push_jump(&mut self, op: Opcode, target: InstrId, line: u32, origin: Origin) -> InstrId {
        let id = self.fresh_id();
        self.instrs.push(Instr {
            id,
            op,
            arg: 0,
            jump: Some(target),
            line,
            origin,
        });
        id
    }

    /// Append an existing instruction, keeping its id.
    pub fn push_instr(&mut self, instr: Instr) {
        self.next_id = self.next_id.max(instr.id.0 + 1);
        self.instrs.push(instr);
    }

    /// Position of every instruction id.
    pub fn positions(&self) -> HashMap<InstrId, usize> {
        self.instrs
            .iter()
            .enumerate()
            .map(|(i, instr)| (instr.id, i))
            .collect()
    }

    // ── Decoding ──────────────────────────────────────────────────────────────

    /// Decode an encoded stream. Every instruction is tagged `Original`.
    pub fn decode(
        unit: &str,
        code: &[u8],
        first_line: u32,
        lnotab: &[u8],
    ) -> InstrumentResult<Self> {
        let malformed = |reason: String| InstrumentError::MalformedUnit {
            unit: unit.to_string(),
            reason,
        };
        if code.len() % 2 != 0 {
            return Err(malformed("instruction stream has odd length".into()));
        }

        let mut list = InstrList::new();
        // (start offset, end offset) of each decoded instruction.
        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut start_of: HashMap<usize, usize> = HashMap::new();
        let mut ext: u32 = 0;
        let mut ext_count = 0usize;
        let mut start = 0usize;
        let rows = linetable::decode(first_line, lnotab);
        let mut row = 0usize;

        for (word, pair) in code.chunks_exact(2).enumerate() {
            let offset = word * 2;
            let op = Opcode::from_u8(pair[0])
                .ok_or_else(|| malformed(format!("unknown opcode {} at offset {offset}", pair[0])))?;
            let arg = (ext << 8) | pair[1] as u32;

            if op == Opcode::ExtendedArg {
                if ext_count == 0 {
                    start = offset;
                }
                ext_count += 1;
                if ext_count > MAX_EXTENDED_ARGS {
                    return Err(malformed(format!(
                        "more than {MAX_EXTENDED_ARGS} EXTENDED_ARG prefixes at offset {offset}"
                    )));
                }
                ext = arg;
                continue;
            }
            if ext_count == 0 {
                start = offset;
            }
            let arg = if op.has_arg() { arg } else { 0 };
            while row + 1 < rows.len() && rows[row + 1].0 <= start {
                row += 1;
            }
            let line = rows[row].1;
            start_of.insert(start, list.len());
            spans.push((start, offset + 2));
            list.push(op, arg, line, Origin::Original);
            ext = 0;
            ext_count = 0;
        }
        if ext_count != 0 {
            return Err(malformed("dangling EXTENDED_ARG at end of stream".into()));
        }

        // Resolve jump operands to instruction ids.
        for i in 0..list.instrs.len() {
            let instr = &list.instrs[i];
            let Some(kind) = instr.op.jump_kind() else {
                continue;
            };
            let (start, end) = spans[i];
            let target = match kind {
                JumpKind::Relative => end + instr.arg as usize,
                JumpKind::Absolute => instr.arg as usize,
            };
            let Some(&pos) = start_of.get(&target) else {
                return Err(InstrumentError::InvalidJumpTarget {
                    unit: unit.to_string(),
                    offset: start,
                    target,
                });
            };
            let target_id = list.instrs[pos].id;
            list.instrs[i].jump = Some(target_id);
        }
        Ok(list)
    }

    // ── Encoding ──────────────────────────────────────────────────────────────

    /// Assign offsets, resolve jumps and encode.
    ///
    /// Every instruction starts at one word; any whose operand no longer
    /// fits grows by an `EXTENDED_ARG` word and the layout is recomputed.
    /// Sizes only ever grow and are capped, so the loop terminates.
    pub fn assemble(&self, unit: &str, first_line: u32) -> InstrumentResult<Assembled> {
        let positions = self.positions();
        let mut words = vec![1usize; self.instrs.len()];

        let (offsets, args) = loop {
            let mut offsets = Vec::with_capacity(self.instrs.len());
            let mut offset = 0usize;
            for w in &words {
                offsets.push(offset);
                offset += 2 * w;
            }

            let mut args = Vec::with_capacity(self.instrs.len());
            let mut grew = false;
            for i in 0..self.instrs.len() {
                let arg = self.operand(unit, i, &offsets, &words, &positions)?;
                let needed = words_needed(arg);
                if needed > words[i] {
                    words[i] = needed;
                    grew = true;
                }
                args.push(arg);
            }
            if !grew {
                break (offsets, args);
            }
        };

        let mut code = Vec::with_capacity(words.iter().sum::<usize>() * 2);
        for (i, instr) in self.instrs.iter().enumerate() {
            let arg = args[i];
            for shift in (1..words[i]).rev() {
                code.push(Opcode::ExtendedArg as u8);
                code.push((arg >> (8 * shift)) as u8);
            }
            code.push(instr.op as u8);
            code.push(arg as u8);
        }

        let rows: Vec<(usize, u32)> = self
            .instrs
            .iter()
            .zip(&offsets)
            .map(|(instr, &off)| (off, instr.line))
            .collect();
        let lnotab = linetable::encode(first_line, &rows);

        Ok(Assembled {
            code,
            lnotab,
            offsets,
        })
    }

    /// Encoded operand of instruction `i` under the current layout.
    fn operand(
        &self,
        unit: &str,
        i: usize,
        offsets: &[usize],
        words: &[usize],
        positions: &HashMap<InstrId, usize>,
    ) -> InstrumentResult<u32> {
        let instr = &self.instrs[i];
        let (Some(kind), Some(target)) = (instr.op.jump_kind(), instr.jump) else {
            return Ok(instr.arg);
        };
        let &pos = positions.get(&target).ok_or_else(|| InstrumentError::MalformedUnit {
            unit: unit.to_string(),
            reason: format!("jump at position {i} refers to a removed instruction"),
        })?;
        let target_offset = offsets[pos];
        let value = match kind {
            JumpKind::Absolute => target_offset,
            JumpKind::Relative => {
                let next = offsets[i] + 2 * words[i];
                target_offset
                    .checked_sub(next)
                    .ok_or_else(|| InstrumentError::InvalidJumpTarget {
                        unit: unit.to_string(),
                        offset: offsets[i],
                        target: target_offset,
                    })?
            }
        };
        u32::try_from(value).map_err(|_| InstrumentError::OperandOverflow {
            unit: unit.to_string(),
            offset: offsets[i],
        })
    }

    // ── Analysis ──────────────────────────────────────────────────────────────

    /// Maximum operand-stack depth over every reachable path.
    pub fn max_stack_depth(&self) -> u32 {
        if self.instrs.is_empty() {
            return 0;
        }
        let positions = self.positions();
        let mut depth_at: Vec<Option<i32>> = vec![None; self.instrs.len()];
        let mut work = vec![(0usize, 0i32)];
        let mut max = 0i32;

        while let Some((pos, depth)) = work.pop() {
            if pos >= self.instrs.len() {
                continue;
            }
            match depth_at[pos] {
                Some(seen) if seen >= depth => continue,
                _ => depth_at[pos] = Some(depth),
            }
            let instr = &self.instrs[pos];
            let (fall, taken) = instr.op.stack_effect(instr.arg);
            max = max.max(depth).max(depth + fall).max(depth + taken);

            if let Some(&target) = instr.jump.as_ref().and_then(|t| positions.get(t)) {
                work.push((target, depth + taken));
            }
            if !instr.op.is_terminal() {
                work.push((pos + 1, depth + fall));
            }
        }
        max.max(0) as u32
    }
}

/// Words needed to encode `arg`: one plus the `EXTENDED_ARG` prefixes.
fn words_needed(arg: u32) -> usize {
    match arg {
        0..=0xff => 1,
        0x100..=0xffff => 2,
        0x1_0000..=0xff_ffff => 3,
        _ => 1 + MAX_EXTENDED_ARGS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_line() -> InstrList {
        let mut list = InstrList::new();
        list.push(Opcode::LoadConst, 0, 1, Origin::Original);
        list.push(Opcode::ReturnValue, 0, 1, Origin::Original);
        list
    }

    #[test]
    fn decode_assemble_identity() {
        let list = straight_line();
        let asm = list.assemble("m", 1).unwrap();
        assert_eq!(asm.code, vec![100, 0, 83, 0]);
        let back = InstrList::decode("m", &asm.code, 1, &asm.lnotab).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.assemble("m", 1).unwrap().code, asm.code);
    }

    #[test]
    fn extended_arg_is_emitted_and_folded() {
        let mut list = InstrList::new();
        list.push(Opcode::LoadConst, 0x1234, 1, Origin::Original);
        list.push(Opcode::ReturnValue, 0, 1, Origin::Original);
        let asm = list.assemble("m", 1).unwrap();
        assert_eq!(asm.code, vec![144, 0x12, 100, 0x34, 83, 0]);
        let back = InstrList::decode("m", &asm.code, 1, &asm.lnotab).unwrap();
        assert_eq!(back.instrs[0].arg, 0x1234);
        assert_eq!(back.len(), 2);
    }

    #[test]
    fn jumps_widen_to_fixpoint() {
        let mut list = InstrList::new();
        let end = list.fresh_id();
        list.push_jump(Opcode::JumpAbsolute, end, 1, Origin::Original);
        for _ in 0..200 {
            list.push(Opcode::Nop, 0, 1, Origin::Original);
        }
        list.push_instr(Instr {
            id: end,
            op: Opcode::ReturnValue,
            arg: 0,
            jump: None,
            line: 1,
            origin: Origin::Original,
        });
        let asm = list.assemble("m", 1).unwrap();
        // 2 words for the jump + 200 NOPs: target at offset 404.
        assert_eq!(asm.offsets[201], 404);
        assert_eq!(&asm.code[..4], &[144, 1, 113, 148]);
    }

    #[test]
    fn relative_jump_target_resolves() {
        let mut list = InstrList::new();
        let target = list.fresh_id();
        list.push_jump(Opcode::JumpForward, target, 1, Origin::Original);
        list.push(Opcode::Nop, 0, 1, Origin::Original);
        list.push_instr(Instr {
            id: target,
            op: Opcode::ReturnValue,
            arg: 0,
            jump: None,
            line: 1,
            origin: Origin::Original,
        });
        let asm = list.assemble("m", 1).unwrap();
        assert_eq!(asm.code[1], 2);
        let back = InstrList::decode("m", &asm.code, 1, &asm.lnotab).unwrap();
        assert_eq!(back.instrs[0].jump, Some(back.instrs[2].id));
    }

    #[test]
    fn backward_relative_jump_is_rejected() {
        let mut list = InstrList::new();
        let first = list.push(Opcode::Nop, 0, 1, Origin::Original);
        list.push_jump(Opcode::JumpForward, first, 1, Origin::Original);
        assert!(matches!(
            list.assemble("m", 1),
            Err(InstrumentError::InvalidJumpTarget { .. })
        ));
    }

    #[test]
    fn jump_into_extended_arg_is_rejected() {
        // JUMP_ABSOLUTE 4 lands on the LOAD_CONST word of an extended pair.
        let code = vec![113, 4, 144, 1, 100, 0, 83, 0];
        assert!(matches!(
            InstrList::decode("m", &code, 1, &[]),
            Err(InstrumentError::InvalidJumpTarget { .. })
        ));
    }

    #[test]
    fn malformed_streams() {
        assert!(InstrList::decode("m", &[100], 1, &[]).is_err());
        assert!(InstrList::decode("m", &[250, 0], 1, &[]).is_err());
        assert!(InstrList::decode("m", &[144, 1, 144, 1, 144, 1, 144, 1, 100, 0], 1, &[]).is_err());
        assert!(InstrList::decode("m", &[144, 1], 1, &[]).is_err());
    }

    #[test]
    fn stack_depth_follows_branches() {
        let mut list = InstrList::new();
        let handler = list.fresh_id();
        list.push_jump(Opcode::SetupExcept, handler, 1, Origin::Original);
        list.push(Opcode::LoadConst, 0, 1, Origin::Original);
        list.push(Opcode::LoadConst, 0, 1, Origin::Original);
        list.push(Opcode::BuildTuple, 2, 1, Origin::Original);
        list.push(Opcode::ReturnValue, 0, 1, Origin::Original);
        list.push_instr(Instr {
            id: handler,
            op: Opcode::DupTop,
            arg: 0,
            jump: None,
            line: 2,
            origin: Origin::Original,
        });
        list.push(Opcode::Reraise, 0, 2, Origin::Original);
        assert_eq!(list.max_stack_depth(), 2);
        assert_eq!(straight_line().max_stack_depth(), 1);
    }
}
