//! End-to-end pipeline tests: bundle text → instrumented program container.

use malthusia_codegen::{InstrumentOptions, CHECKPOINT_NAME};
use malthusia_compiler::{
    compile_bundle, compile_bundle_text, compile_source, compile_to_result, Bundle,
    CompileResult, CompilerError, ProgramContainer,
};

// ══════════════════════════════════════════════════════════════════════════════
// Sources
// ══════════════════════════════════════════════════════════════════════════════

const BOT: &str = r#"
from malthusia.stubs import *
import helpers

counter = 0

def turn():
    global counter
    counter += 1
    d = helpers.pick(counter)
    move(d)
"#;

const HELPERS: &str = r#"
import Direction

def pick(n):
    options = [Direction.NORTH, Direction.EAST]
    return options[n % 2]
"#;

fn two_file_bundle() -> Bundle {
    Bundle::from_files([("bot.py", BOT), ("helpers.py", HELPERS)])
}

// ══════════════════════════════════════════════════════════════════════════════
// 1. Bundle format
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn bundle_text_round_trips() {
    let bundle = two_file_bundle();
    let text = bundle.to_text();
    assert!(text.starts_with("bot.py, 10 lines\n==============\nfrom malthusia.stubs import *\n"));
    let parsed = Bundle::parse(&text).unwrap();
    assert_eq!(parsed, bundle);
    assert_eq!(parsed.to_text(), text);
}

#[test]
fn bundle_normalizes_surrounding_newlines() {
    let bundle = Bundle::from_files([("bot.py", "\n\nx = 1\n\n\n")]);
    assert_eq!(bundle.files[0].source, "x = 1");
    assert_eq!(bundle.to_text(), "bot.py, 1 lines\n==============\nx = 1\n==============\n");
}

#[test]
fn truncated_bundle_rejected() {
    let text = "bot.py, 5 lines\n==============\nx = 1\n";
    assert!(matches!(Bundle::parse(text), Err(CompilerError::Bundle { .. })));
}

#[test]
fn missing_separator_rejected() {
    let text = "bot.py, 1 lines\nx = 1\n==============\n";
    match Bundle::parse(text) {
        Err(CompilerError::Bundle { line, .. }) => assert_eq!(line, 2),
        other => panic!("expected bundle error, got {other:?}"),
    }
}

#[test]
fn bad_header_rejected() {
    assert!(Bundle::parse("bot.py\n==============\n").is_err());
}

// ══════════════════════════════════════════════════════════════════════════════
// 2. Compilation
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn stub_import_is_stripped_before_parsing() {
    let unit = compile_source("bot", "from malthusia.stubs import log, move\nx = 1\n").unwrap();
    assert!(!unit.names.iter().any(|n| n == "malthusia"));
}

#[test]
fn other_star_imports_still_fail() {
    let err = compile_source("bot", "from helpers import *\n").unwrap_err();
    assert!(matches!(err, CompilerError::Syntax { .. }));
}

#[test]
fn bundle_compiles_every_module() {
    let program = compile_bundle(&two_file_bundle(), &InstrumentOptions::default()).unwrap();
    assert_eq!(program.names().collect::<Vec<_>>(), vec!["bot", "helpers"]);
    for name in ["bot", "helpers"] {
        let unit = program.get(name).unwrap();
        assert!(unit.names.iter().any(|n| n == CHECKPOINT_NAME), "{name} not instrumented");
        for child in unit.children() {
            assert!(child.names.iter().any(|n| n == CHECKPOINT_NAME));
        }
    }
}

#[test]
fn missing_bot_module_rejected() {
    let bundle = Bundle::from_files([("helpers.py", HELPERS)]);
    let err = compile_bundle(&bundle, &InstrumentOptions::default()).unwrap_err();
    assert!(matches!(err, CompilerError::MissingEntry(ref m) if m == "bot"));
}

#[test]
fn duplicate_module_rejected() {
    let bundle = Bundle::from_files([("bot.py", "x = 1"), ("a/bot.py", "y = 2")]);
    let err = compile_bundle(&bundle, &InstrumentOptions::default()).unwrap_err();
    assert!(matches!(err, CompilerError::DuplicateModule(_)));
}

#[test]
fn oversized_literal_fails_compilation() {
    let source = format!("s = '{}'\n", "x".repeat(2000));
    let err = compile_bundle(&Bundle::single(&source), &InstrumentOptions::default()).unwrap_err();
    assert!(matches!(err, CompilerError::Codegen { .. }));
}

#[test]
fn deeply_chained_source_is_a_syntax_error() {
    for source in [
        format!("x = {}1\n", "-".repeat(100_000)),
        format!("x = {}2\n", "2 ** ".repeat(100_000)),
        format!("x = 0{}\n", " + 1".repeat(100_000)),
    ] {
        let err = compile_source("bot", &source).unwrap_err();
        assert!(matches!(err, CompilerError::Syntax { .. }), "{err}");
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// 3. Container persistence
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn container_survives_disk() {
    let program = compile_bundle(&two_file_bundle(), &InstrumentOptions::full()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bot.mlth");
    program.to_file(&path).unwrap();
    let loaded = ProgramContainer::from_file(&path).unwrap();
    assert_eq!(loaded, program);
    assert_eq!(loaded.to_bytes(), program.to_bytes());
}

#[test]
fn compilation_is_deterministic() {
    let text = two_file_bundle().to_text();
    let first = compile_bundle_text(&text, &InstrumentOptions::default()).unwrap().to_bytes();
    for i in 0..100 {
        let again = compile_bundle_text(&text, &InstrumentOptions::default()).unwrap().to_bytes();
        assert_eq!(first, again, "iteration {i} differs");
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// 4. Structured results
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn success_result_carries_program() {
    let result = compile_to_result(&two_file_bundle().to_text(), &InstrumentOptions::default());
    assert!(result.success);
    assert_eq!(result.modules, vec!["bot", "helpers"]);
    let bytes = hex::decode(result.program.as_ref().unwrap()).unwrap();
    let program = ProgramContainer::from_bytes(&bytes).unwrap();
    assert_eq!(result.digest.as_deref(), Some(program.digest().as_str()));
}

#[test]
fn syntax_error_produces_structured_json() {
    let text = Bundle::single("def f(:\n    pass\n").to_text();
    let result = compile_to_result(&text, &InstrumentOptions::default());
    assert!(!result.success);
    assert!(result.program.is_none());
    let json = serde_json::to_string(&result).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed["success"], false);
    assert!(parsed["errors"]["total_errors"].as_u64().unwrap() > 0);
    let code = parsed["errors"]["errors"][0]["code"].as_u64().unwrap();
    assert!((100..200).contains(&code));
}

#[test]
fn restricted_name_reported() {
    let text = Bundle::single("_secret = 1\n").to_text();
    let result = compile_to_result(&text, &InstrumentOptions::default());
    assert!(!result.success);
    assert!(result.errors.errors.iter().any(|e| e.code.0 == 200));
}

#[test]
fn literal_limit_reported_as_limit_error() {
    let text = Bundle::single(&format!("s = '{}'\n", "x".repeat(1001))).to_text();
    let result = compile_to_result(&text, &InstrumentOptions::default());
    assert_eq!(result.errors.errors[0].code.0, 300);
}

#[test]
fn missing_entry_reported() {
    let text = Bundle::from_files([("helpers.py", "x = 1")]).to_text();
    let result = compile_to_result(&text, &InstrumentOptions::default());
    assert_eq!(result.errors.errors[0].code.0, 402);
}

#[test]
fn result_json_round_trip() {
    let result = compile_to_result(&two_file_bundle().to_text(), &InstrumentOptions::default());
    let json = serde_json::to_string(&result).unwrap();
    let back: CompileResult = serde_json::from_str(&json).unwrap();
    assert_eq!(back.success, result.success);
    assert_eq!(back.program, result.program);
    assert_eq!(back.digest, result.digest);
}
