//! Program bundle format.
//!
//! A bundle is a flat text file holding every source file of one robot,
//! so it can be submitted without a directory structure:
//!
//! ```text
//! bot.py, 2 lines
//! ==============
//! import helpers
//! x = helpers.f()
//! ==============
//!
//! helpers.py, 2 lines
//! ==============
//! def f():
//!     return 1
//! ==============
//! ```
//!
//! File contents are stored without leading or trailing newlines; that is
//! the only normalization, so `Bundle::parse(b.to_text()) == b` for any
//! normalized bundle `b`.

use serde::{Deserialize, Serialize};

use crate::error::{CompilerError, CompilerResult};

/// Line fencing each file's contents.
pub const SEPARATOR: &str = "==============";

/// One named source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    /// File name as submitted, e.g. `bot.py`.
    pub name: String,
    pub source: String,
}

impl BundleFile {
    /// Module name: the file name without directories or `.py`.
    pub fn module_name(&self) -> &str {
        let base = self.name.rsplit('/').next().unwrap_or(&self.name);
        base.strip_suffix(".py").unwrap_or(base)
    }
}

/// An ordered set of source files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub files: Vec<BundleFile>,
}

impl Bundle {
    /// Build a bundle, normalizing every file's surrounding newlines.
    pub fn from_files<I, N, S>(files: I) -> Self
    where
        I: IntoIterator<Item = (N, S)>,
        N: Into<String>,
        S: AsRef<str>,
    {
        Self {
            files: files
                .into_iter()
                .map(|(name, source)| BundleFile {
                    name: name.into(),
                    source: source.as_ref().trim_matches('\n').to_string(),
                })
                .collect(),
        }
    }

    /// A single-file bundle holding `bot.py`.
    pub fn single(source: &str) -> Self {
        Self::from_files([("bot.py", source)])
    }

    pub fn get(&self, name: &str) -> Option<&BundleFile> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Serialize to the bundle text format.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (idx, file) in self.files.iter().enumerate() {
            if idx > 0 {
                out.push('\n');
            }
            let source = file.source.trim_matches('\n');
            let lines = source.split('\n').count();
            out.push_str(&format!("{}, {} lines\n{SEPARATOR}\n", file.name, lines));
            out.push_str(source);
            out.push('\n');
            out.push_str(SEPARATOR);
            out.push('\n');
        }
        out
    }

    /// Parse the bundle text format.
    pub fn parse(text: &str) -> CompilerResult<Self> {
        let lines: Vec<&str> = text.split('\n').collect();
        let mut files = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            if lines[i].is_empty() {
                i += 1;
                continue;
            }
            let (name, count) = parse_header(lines[i]).ok_or_else(|| CompilerError::Bundle {
                line: i + 1,
                reason: format!("expected '<name>, <n> lines', found '{}'", lines[i]),
            })?;
            expect_separator(&lines, i + 1)?;
            let body_start = i + 2;
            let body_end = body_start + count;
            if body_end > lines.len() {
                return Err(CompilerError::Bundle {
                    line: lines.len(),
                    reason: format!("file '{name}' is truncated"),
                });
            }
            expect_separator(&lines, body_end)?;
            files.push(BundleFile {
                name: name.to_string(),
                source: lines[body_start..body_end].join("\n"),
            });
            i = body_end + 1;
        }
        Ok(Self { files })
    }
}

fn parse_header(line: &str) -> Option<(&str, usize)> {
    let mut parts = line.split(' ');
    let name = parts.next()?.strip_suffix(',')?;
    let count = parts.next()?.parse().ok()?;
    match (parts.next(), parts.next()) {
        (Some("lines"), None) if !name.is_empty() => Some((name, count)),
        _ => None,
    }
}

fn expect_separator(lines: &[&str], idx: usize) -> CompilerResult<()> {
    match lines.get(idx) {
        Some(&line) if line == SEPARATOR => Ok(()),
        _ => Err(CompilerError::Bundle {
            line: idx + 1,
            reason: "missing separator".into(),
        }),
    }
}
