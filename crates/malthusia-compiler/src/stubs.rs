//! Stub-import preprocessing.
//!
//! Robot authors may write `from malthusia.stubs import *` (or a name
//! list) so their editor can resolve the game methods. The import has no
//! runtime meaning and would be rejected by the parser, so matching lines
//! are blanked before compilation; line numbers are unchanged.
//!
//! A line matches when, ignoring spaces and tabs around tokens, it reads
//! `from <STUB_MODULE> import *` or `from <STUB_MODULE> import a, b, c`
//! where every name is made of ASCII letters and underscores.

/// Module path of the editor stubs.
pub const STUB_MODULE: &str = "malthusia.stubs";

/// Blank every stub-import line in `source`.
pub fn strip_stub_imports(source: &str) -> String {
    source
        .split('\n')
        .map(|line| if is_stub_import(line) { "" } else { line })
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t'
}

/// Strip `keyword` followed by at least one blank.
fn keyword<'a>(rest: &'a str, keyword: &str) -> Option<&'a str> {
    let after = rest.strip_prefix(keyword)?;
    let trimmed = after.trim_start_matches(is_blank);
    (trimmed.len() < after.len()).then_some(trimmed)
}

fn is_stub_import(line: &str) -> bool {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let rest = line.trim_start_matches(is_blank);
    let Some(rest) = keyword(rest, "from") else {
        return false;
    };
    let Some(rest) = keyword(rest, STUB_MODULE) else {
        return false;
    };
    let Some(rest) = keyword(rest, "import") else {
        return false;
    };
    let names = rest.trim_end_matches(is_blank);
    if names == "*" {
        return true;
    }
    names.split(',').all(|name| {
        let name = name.trim_matches(is_blank);
        !name.is_empty() && name.chars().all(|c| c.is_ascii_alphabetic() || c == '_')
    })
}
