//! Pipeline orchestration.

use malthusia_codegen::{compile_module, instrument, CodeUnit, CodegenError, InstrumentError, InstrumentOptions};
use malthusia_parser::parse_source;
use malthusia_types::{CompileError, CompileErrors, ErrorCode, SourceFile, Span};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bundle::Bundle;
use crate::container::{ProgramContainer, ENTRY_MODULE};
use crate::error::{CompilerError, CompilerResult};
use crate::stubs::strip_stub_imports;

/// Compile one module to an uninstrumented unit.
pub fn compile_source(module: &str, source: &str) -> CompilerResult<CodeUnit> {
    let source = strip_stub_imports(source);
    let file = SourceFile::new(module, source);
    let ast = parse_source(&file).map_err(|errors| CompilerError::Syntax {
        module: module.to_string(),
        errors,
    })?;
    compile_module(&ast, module).map_err(|source| CompilerError::Codegen {
        module: module.to_string(),
        source,
    })
}

/// Compile and instrument every module of a bundle.
///
/// The bundle must contain `bot.py`; every other `.py` file becomes an
/// importable module named after the file.
pub fn compile_bundle(bundle: &Bundle, options: &InstrumentOptions) -> CompilerResult<ProgramContainer> {
    let mut program = ProgramContainer::new();
    for file in &bundle.files {
        let module = file.module_name();
        if program.contains(module) {
            return Err(CompilerError::DuplicateModule(module.to_string()));
        }
        let unit = compile_source(module, &file.source)?;
        let instrumented = instrument(&unit, options).map_err(|e| CompilerError::Codegen {
            module: module.to_string(),
            source: e.into(),
        })?;
        debug!(
            module,
            words = unit.word_count(),
            instrumented_words = instrumented.word_count(),
            "compiled module"
        );
        program.insert(module, instrumented);
    }
    if !program.contains(ENTRY_MODULE) {
        return Err(CompilerError::MissingEntry(ENTRY_MODULE.to_string()));
    }
    info!(modules = program.len(), "compiled program");
    Ok(program)
}

/// Parse bundle text and compile it.
pub fn compile_bundle_text(text: &str, options: &InstrumentOptions) -> CompilerResult<ProgramContainer> {
    compile_bundle(&Bundle::parse(text)?, options)
}

// ══════════════════════════════════════════════════════════════════════════════
// Structured Result
// ══════════════════════════════════════════════════════════════════════════════

/// Outcome of a compilation, serializable for delivery to robot authors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileResult {
    pub success: bool,
    /// Hex-encoded container bytes.
    pub program: Option<String>,
    /// Hex SHA-256 of the container.
    pub digest: Option<String>,
    /// Compiled module names.
    pub modules: Vec<String>,
    pub errors: CompileErrors,
}

/// Compile bundle text, reporting failures as structured errors.
pub fn compile_to_result(text: &str, options: &InstrumentOptions) -> CompileResult {
    match compile_bundle_text(text, options) {
        Ok(program) => CompileResult {
            success: true,
            program: Some(hex::encode(program.to_bytes())),
            digest: Some(program.digest()),
            modules: program.names().map(String::from).collect(),
            errors: CompileErrors::empty(),
        },
        Err(err) => CompileResult {
            success: false,
            program: None,
            digest: None,
            modules: Vec::new(),
            errors: to_compile_errors(err),
        },
    }
}

fn to_compile_errors(err: CompilerError) -> CompileErrors {
    let mut errors = CompileErrors::empty();
    let single = |file: &str, code: ErrorCode, message: String, line: usize| {
        CompileError::new(file, code, message, Span::point(line as u32, 1), "")
    };
    match err {
        CompilerError::Syntax { errors: found, .. } => return found,
        CompilerError::Bundle { line, reason } => {
            errors.push_error(single("<bundle>", ErrorCode::UNEXPECTED_TOKEN, reason, line));
        }
        CompilerError::Codegen { module, source } => {
            let code = match &source {
                CodegenError::Instrument(
                    InstrumentError::ConstantTooLarge { .. } | InstrumentError::NameTooLarge { .. },
                ) => ErrorCode::LITERAL_TOO_LARGE,
                _ => ErrorCode::UNSUPPORTED_SYNTAX,
            };
            errors.push_error(single(&module, code, source.to_string(), 1));
        }
        CompilerError::MissingEntry(module) => {
            errors.push_error(single(
                &module,
                ErrorCode::MISSING_ENTRY_MODULE,
                format!("program has no '{module}.py'"),
                1,
            ));
        }
        CompilerError::DuplicateModule(module) => {
            errors.push_error(single(
                &module,
                ErrorCode::DUPLICATE_MODULE,
                format!("module '{module}' appears more than once"),
                1,
            ));
        }
        other @ (CompilerError::Container(_) | CompilerError::Io(_)) => {
            errors.push_error(single("<bundle>", ErrorCode::UNSUPPORTED_SYNTAX, other.to_string(), 1));
        }
    }
    errors
}
