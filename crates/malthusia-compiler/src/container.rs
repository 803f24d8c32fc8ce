//! Persisted program container.
//!
//! Holds every instrumented module of one robot, keyed by module name:
//!
//! ```text
//! "MLTH" u8(version) u32(count) { str(module) bytes(unit) }* [u8; 32](sha256)
//! ```
//!
//! Units use the codec in [`malthusia_codegen::persist`]; modules are
//! written in name order, so equal programs serialize to equal bytes.
//! The trailing digest covers everything before it and is checked on load.

use std::collections::BTreeMap;
use std::path::Path;

use malthusia_codegen::{decode_unit, encode_unit, CodeUnit};
use sha2::{Digest, Sha256};

use crate::error::{CompilerError, CompilerResult};

/// Leading magic bytes.
pub const MAGIC: &[u8; 4] = b"MLTH";

/// Container layout version.
pub const FORMAT_VERSION: u8 = 1;

/// Name of the module executed on spawn.
pub const ENTRY_MODULE: &str = "bot";

const DIGEST_LEN: usize = 32;

/// Every compiled module of one robot program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramContainer {
    modules: BTreeMap<String, CodeUnit>,
}

impl ProgramContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module, replacing any previous one with the same name.
    pub fn insert(&mut self, name: impl Into<String>, unit: CodeUnit) {
        self.modules.insert(name.into(), unit);
    }

    pub fn get(&self, name: &str) -> Option<&CodeUnit> {
        self.modules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Module names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// The `bot` module.
    pub fn entry(&self) -> Option<&CodeUnit> {
        self.get(ENTRY_MODULE)
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&(self.modules.len() as u32).to_le_bytes());
        for (name, unit) in &self.modules {
            write_blob(&mut out, name.as_bytes());
            write_blob(&mut out, &encode_unit(unit));
        }
        let digest = Sha256::digest(&out);
        out.extend_from_slice(&digest);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> CompilerResult<Self> {
        let invalid = |reason: &str| CompilerError::Container(reason.to_string());
        if bytes.len() < MAGIC.len() + 1 + 4 + DIGEST_LEN {
            return Err(invalid("too short"));
        }
        let (payload, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
        if Sha256::digest(payload).as_slice() != digest {
            return Err(invalid("digest mismatch"));
        }
        if &payload[..4] != MAGIC {
            return Err(invalid("bad magic"));
        }
        if payload[4] != FORMAT_VERSION {
            return Err(CompilerError::Container(format!(
                "unsupported version {}",
                payload[4]
            )));
        }

        let mut pos = 5;
        let count = read_u32(payload, &mut pos).ok_or_else(|| invalid("truncated header"))?;
        let mut modules = BTreeMap::new();
        let mut previous: Option<String> = None;
        for _ in 0..count {
            let name = read_blob(payload, &mut pos).ok_or_else(|| invalid("truncated module name"))?;
            let name = String::from_utf8(name.to_vec()).map_err(|_| invalid("module name is not UTF-8"))?;
            if previous.as_deref().is_some_and(|p| p >= name.as_str()) {
                return Err(invalid("modules out of order"));
            }
            let unit_bytes = read_blob(payload, &mut pos).ok_or_else(|| invalid("truncated unit"))?;
            let unit = decode_unit(unit_bytes).map_err(|e| CompilerError::Container(format!("module '{name}': {e}")))?;
            previous = Some(name.clone());
            modules.insert(name, unit);
        }
        if pos != payload.len() {
            return Err(invalid("trailing bytes"));
        }
        Ok(Self { modules })
    }

    /// Hex SHA-256 of the serialized container.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.to_bytes()))
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> CompilerResult<()> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> CompilerResult<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

fn write_blob(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Option<u32> {
    let raw = bytes.get(*pos..pos.checked_add(4)?)?;
    *pos += 4;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_blob<'a>(bytes: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let len = read_u32(bytes, pos)? as usize;
    let blob = bytes.get(*pos..pos.checked_add(len)?)?;
    *pos += len;
    Some(blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use malthusia_codegen::{Constant, UnitKind};

    fn unit(name: &str) -> CodeUnit {
        CodeUnit {
            name: "<module>".into(),
            filename: name.into(),
            kind: UnitKind::Module,
            argcount: 0,
            varnames: vec![],
            names: vec![],
            consts: vec![Constant::None],
            code: vec![100, 0, 83, 0],
            first_line: 1,
            lnotab: vec![],
            max_stack: 1,
        }
    }

    fn sample() -> ProgramContainer {
        let mut c = ProgramContainer::new();
        c.insert("helpers", unit("helpers"));
        c.insert("bot", unit("bot"));
        c
    }

    #[test]
    fn bytes_round_trip_exactly() {
        let bytes = sample().to_bytes();
        assert_eq!(&bytes[..4], MAGIC);
        let back = ProgramContainer::from_bytes(&bytes).unwrap();
        assert_eq!(back, sample());
        assert_eq!(back.to_bytes(), bytes);
        assert_eq!(back.names().collect::<Vec<_>>(), vec!["bot", "helpers"]);
        assert!(back.entry().is_some());
    }

    #[test]
    fn tampering_is_detected() {
        let mut bytes = sample().to_bytes();
        bytes[10] ^= 0xff;
        assert!(matches!(
            ProgramContainer::from_bytes(&bytes),
            Err(CompilerError::Container(_))
        ));
        assert!(ProgramContainer::from_bytes(&bytes[..8]).is_err());
    }

    #[test]
    fn digest_is_stable() {
        assert_eq!(sample().digest(), sample().digest());
        assert_eq!(sample().digest().len(), 64);
    }
}
