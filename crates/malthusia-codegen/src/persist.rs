//! Binary codec for compiled units.
//!
//! Little-endian, length-prefixed and tagged:
//!
//! ```text
//! unit     := str(name) str(filename) u8(kind) u32(argcount) u32(first_line)
//!             u32(max_stack) strs(varnames) strs(names) consts bytes(code)
//!             bytes(lnotab)
//! str      := u32(len) utf8
//! bytes    := u32(len) raw
//! strs     := u32(count) str*
//! consts   := u32(count) const*
//! const    := 0 | 1 | 2                 ; None, False, True
//!           | 3 i64 | 4 u64(float bits) | 5 str
//!           | 6 u32(count) const*       ; tuple
//!           | 7 unit                    ; nested unit
//! ```
//!
//! Decoding is strict enough that `encode(decode(b)) == b` for every
//! accepted input.

use std::rc::Rc;

use crate::error::{CodegenError, CodegenResult};
use crate::unit::{CodeUnit, Constant, UnitKind};

const TAG_NONE: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_TUPLE: u8 = 6;
const TAG_CODE: u8 = 7;

/// Deepest nesting of tuples and units accepted by the decoder.
const MAX_NESTING: usize = 64;

// ══════════════════════════════════════════════════════════════════════════════
// Encoding
// ══════════════════════════════════════════════════════════════════════════════

/// Serialize a unit and its nested units.
pub fn encode_unit(unit: &CodeUnit) -> Vec<u8> {
    let mut out = Vec::new();
    write_unit(&mut out, unit);
    out
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_bytes(out, s.as_bytes());
}

fn write_strs(out: &mut Vec<u8>, items: &[String]) {
    write_u32(out, items.len() as u32);
    for item in items {
        write_str(out, item);
    }
}

fn write_unit(out: &mut Vec<u8>, unit: &CodeUnit) {
    write_str(out, &unit.name);
    write_str(out, &unit.filename);
    out.push(match unit.kind {
        UnitKind::Module => 0,
        UnitKind::Function => 1,
    });
    write_u32(out, unit.argcount);
    write_u32(out, unit.first_line);
    write_u32(out, unit.max_stack);
    write_strs(out, &unit.varnames);
    write_strs(out, &unit.names);
    write_u32(out, unit.consts.len() as u32);
    for constant in &unit.consts {
        write_const(out, constant);
    }
    write_bytes(out, &unit.code);
    write_bytes(out, &unit.lnotab);
}

fn write_const(out: &mut Vec<u8>, constant: &Constant) {
    match constant {
        Constant::None => out.push(TAG_NONE),
        Constant::Bool(false) => out.push(TAG_FALSE),
        Constant::Bool(true) => out.push(TAG_TRUE),
        Constant::Int(v) => {
            out.push(TAG_INT);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Constant::Float(v) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Constant::Str(s) => {
            out.push(TAG_STR);
            write_str(out, s);
        }
        Constant::Tuple(items) => {
            out.push(TAG_TUPLE);
            write_u32(out, items.len() as u32);
            for item in items {
                write_const(out, item);
            }
        }
        Constant::Code(unit) => {
            out.push(TAG_CODE);
            write_unit(out, unit);
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Decoding
// ══════════════════════════════════════════════════════════════════════════════

/// Deserialize a unit. Trailing bytes are an error.
pub fn decode_unit(bytes: &[u8]) -> CodegenResult<CodeUnit> {
    let mut reader = Reader { bytes, pos: 0 };
    let unit = reader.unit(0)?;
    if reader.pos != bytes.len() {
        return Err(CodegenError::Decode(format!(
            "{} trailing bytes after unit",
            bytes.len() - reader.pos
        )));
    }
    Ok(unit)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> CodegenResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| CodegenError::Decode(format!("unexpected end of input at byte {}", self.pos)))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> CodegenResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> CodegenResult<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> CodegenResult<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn bytes(&mut self) -> CodegenResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> CodegenResult<String> {
        let at = self.pos;
        String::from_utf8(self.bytes()?)
            .map_err(|_| CodegenError::Decode(format!("invalid UTF-8 in string at byte {at}")))
    }

    fn strings(&mut self) -> CodegenResult<Vec<String>> {
        let count = self.u32()?;
        (0..count).map(|_| self.string()).collect()
    }

    fn unit(&mut self, depth: usize) -> CodegenResult<CodeUnit> {
        if depth > MAX_NESTING {
            return Err(CodegenError::Decode("units nested too deeply".into()));
        }
        let name = self.string()?;
        let filename = self.string()?;
        let kind = match self.u8()? {
            0 => UnitKind::Module,
            1 => UnitKind::Function,
            other => return Err(CodegenError::Decode(format!("unknown unit kind {other}"))),
        };
        let argcount = self.u32()?;
        let first_line = self.u32()?;
        let max_stack = self.u32()?;
        let varnames = self.strings()?;
        let names = self.strings()?;
        let count = self.u32()?;
        let consts = (0..count)
            .map(|_| self.constant(depth))
            .collect::<CodegenResult<Vec<_>>>()?;
        let code = self.bytes()?;
        let lnotab = self.bytes()?;
        Ok(CodeUnit {
            name,
            filename,
            kind,
            argcount,
            varnames,
            names,
            consts,
            code,
            first_line,
            lnotab,
            max_stack,
        })
    }

    fn constant(&mut self, depth: usize) -> CodegenResult<Constant> {
        if depth > MAX_NESTING {
            return Err(CodegenError::Decode("constants nested too deeply".into()));
        }
        let tag = self.u8()?;
        Ok(match tag {
            TAG_NONE => Constant::None,
            TAG_FALSE => Constant::Bool(false),
            TAG_TRUE => Constant::Bool(true),
            TAG_INT => Constant::Int(self.u64()? as i64),
            TAG_FLOAT => Constant::Float(f64::from_bits(self.u64()?)),
            TAG_STR => Constant::Str(self.string()?),
            TAG_TUPLE => {
                let count = self.u32()?;
                let items = (0..count)
                    .map(|_| self.constant(depth + 1))
                    .collect::<CodegenResult<Vec<_>>>()?;
                Constant::Tuple(items)
            }
            TAG_CODE => Constant::Code(Rc::new(self.unit(depth + 1)?)),
            other => return Err(CodegenError::Decode(format!("unknown constant tag {other}"))),
        })
    }
}
