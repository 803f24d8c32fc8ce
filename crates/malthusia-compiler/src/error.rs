//! Compiler error types.

use malthusia_codegen::CodegenError;
use malthusia_types::CompileErrors;
use thiserror::Error;

/// Errors raised while turning a bundle into an instrumented program.
#[derive(Debug, Error)]
pub enum CompilerError {
    /// The bundle text does not follow the header/separator layout.
    #[error("malformed bundle at line {line}: {reason}")]
    Bundle { line: usize, reason: String },

    /// A module failed to lex or parse.
    #[error("module '{module}' has syntax errors:\n{errors}")]
    Syntax {
        module: String,
        errors: CompileErrors,
    },

    /// Code generation or instrumentation of a module failed.
    #[error("module '{module}': {source}")]
    Codegen {
        module: String,
        #[source]
        source: CodegenError,
    },

    /// The bundle has no `bot` module.
    #[error("program has no '{0}' module")]
    MissingEntry(String),

    /// Two bundle files map to the same module name.
    #[error("duplicate module '{0}'")]
    DuplicateModule(String),

    /// A persisted container is corrupt or was tampered with.
    #[error("invalid program container: {0}")]
    Container(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Compiler result type alias.
pub type CompilerResult<T> = Result<T, CompilerError>;
