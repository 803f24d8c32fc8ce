//! Codegen error types.

use thiserror::Error;

/// Errors raised while rewriting or re-encoding a compiled unit.
///
/// The instrumentation pass never degrades silently: any of these aborts
/// compilation of the whole program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstrumentError {
    /// A constant exceeds the literal size ceiling.
    #[error("constant #{index} in '{unit}' is too large ({size} > {limit})")]
    ConstantTooLarge {
        unit: String,
        index: usize,
        size: usize,
        limit: usize,
    },

    /// A name exceeds the literal size ceiling.
    #[error("name #{index} in '{unit}' is too long ({size} > {limit})")]
    NameTooLarge {
        unit: String,
        index: usize,
        size: usize,
        limit: usize,
    },

    /// An operand does not fit in one word plus the allowed extension words.
    #[error("operand of instruction at offset {offset} in '{unit}' cannot be encoded")]
    OperandOverflow { unit: String, offset: usize },

    /// A jump resolves outside the unit or onto the middle of an instruction.
    #[error("jump at offset {offset} in '{unit}' targets {target}, which is not an instruction boundary")]
    InvalidJumpTarget {
        unit: String,
        offset: usize,
        target: usize,
    },

    /// The instruction stream or a table could not be decoded.
    #[error("malformed unit '{unit}': {reason}")]
    MalformedUnit { unit: String, reason: String },
}

/// Errors that can occur while compiling an AST into a program unit.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// An AST feature the code generator cannot lower.
    #[error("unsupported feature: {0}")]
    Unsupported(String),

    /// Too many names, constants or locals for one unit.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Assembling or instrumenting the instruction stream failed.
    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    /// A persisted unit could not be read back.
    #[error("cannot decode persisted unit: {0}")]
    Decode(String),
}

/// Codegen result type alias.
pub type CodegenResult<T> = Result<T, CodegenError>;

/// Instrumentation result type alias.
pub type InstrumentResult<T> = Result<T, InstrumentError>;
