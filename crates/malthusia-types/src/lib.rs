//! Shared types for the Malthusia robot compiler.
//!
//! This crate defines the AST of the robot scripting language, source
//! spans, structured compile errors and the limits shared by every
//! compiler stage.

mod error;
mod span;
pub mod ast;

pub use error::{CompileError, CompileErrors, ErrorCategory, ErrorCode, MAX_ERRORS};
pub use span::{SourceFile, Span};

/// Longest string literal, name or collection constant a program may carry.
///
/// Applies to string constants, identifiers and attribute names alike.
pub const MAX_LITERAL_SIZE: usize = 1000;

/// Result type used throughout the compiler front end.
pub type Result<T> = std::result::Result<T, CompileError>;
