use crate::Span;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of errors reported before fail-fast.
pub const MAX_ERRORS: usize = 20;

/// Error category, determined by error code range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Syntax,
    Name,
    Limit,
    Import,
    Structure,
}

/// Numeric error code (E100–E599).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    // ── Syntax errors (E100–E199) ──
    pub const UNEXPECTED_TOKEN: Self = Self(100);
    pub const UNTERMINATED_STRING: Self = Self(101);
    pub const INCONSISTENT_INDENT: Self = Self(102);
    pub const INVALID_ESCAPE: Self = Self(103);
    pub const UNEXPECTED_CHARACTER: Self = Self(104);

    // ── Name errors (E200–E299) ──
    pub const RESTRICTED_NAME: Self = Self(200);
    pub const RESTRICTED_ATTRIBUTE: Self = Self(201);
    pub const INVALID_ASSIGN_TARGET: Self = Self(202);

    // ── Limit errors (E300–E399) ──
    pub const LITERAL_TOO_LARGE: Self = Self(300);
    pub const NESTING_TOO_DEEP: Self = Self(301);
    pub const TOO_MANY_ARGUMENTS: Self = Self(302);

    // ── Import errors (E400–E499) ──
    pub const RELATIVE_IMPORT: Self = Self(400);
    pub const STAR_IMPORT: Self = Self(401);
    pub const MISSING_ENTRY_MODULE: Self = Self(402);
    pub const DUPLICATE_MODULE: Self = Self(403);

    // ── Structure errors (E500–E599) ──
    pub const BREAK_OUTSIDE_LOOP: Self = Self(500);
    pub const CONTINUE_OUTSIDE_LOOP: Self = Self(501);
    pub const RETURN_OUTSIDE_FUNCTION: Self = Self(502);
    pub const UNSUPPORTED_SYNTAX: Self = Self(503);

    /// Get the category for this error code.
    pub fn category(self) -> ErrorCategory {
        match self.0 {
            200..=299 => ErrorCategory::Name,
            300..=399 => ErrorCategory::Limit,
            400..=499 => ErrorCategory::Import,
            500..=599 => ErrorCategory::Structure,
            _ => ErrorCategory::Syntax,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

/// A structured compile error for one robot source file.
///
/// Carried to the robot author verbatim through the error sink, so it
/// must not need parsing to be useful.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileError {
    /// Module the error was found in.
    pub file: String,
    pub code: ErrorCode,
    /// Derived from `code`.
    pub category: ErrorCategory,
    pub message: String,
    #[serde(flatten)]
    pub span: Span,
    /// The offending source line.
    pub source_line: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl CompileError {
    /// Create a new error.
    pub fn new(
        file: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
        span: Span,
        source_line: impl Into<String>,
    ) -> Self {
        Self {
            file: file.into(),
            code,
            category: code.category(),
            message: message.into(),
            span,
            source_line: source_line.into(),
            suggestion: None,
        }
    }

    /// Attach a fix suggestion.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: {} [{}] {}",
            self.file, self.span, self.code, self.category, self.message
        )
    }
}

impl std::error::Error for CompileError {}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::Name => write!(f, "name"),
            Self::Limit => write!(f, "limit"),
            Self::Import => write!(f, "import"),
            Self::Structure => write!(f, "structure"),
        }
    }
}

/// All errors found while compiling one source file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompileErrors {
    pub errors: Vec<CompileError>,
    pub total_errors: usize,
}

impl CompileErrors {
    /// Create an empty result (no errors).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Check if there are any errors.
    pub fn has_errors(&self) -> bool {
        self.total_errors > 0
    }

    /// Whether the error cap has been reached and scanning should stop.
    pub fn is_full(&self) -> bool {
        self.total_errors >= MAX_ERRORS
    }

    /// Add an error, respecting the MAX_ERRORS limit.
    pub fn push_error(&mut self, error: CompileError) {
        if self.errors.len() < MAX_ERRORS {
            self.errors.push(error);
        }
        self.total_errors += 1;
    }

    /// Move every error of `other` into `self`.
    pub fn extend(&mut self, other: CompileErrors) {
        let dropped = other.total_errors.saturating_sub(other.errors.len());
        for e in other.errors {
            self.push_error(e);
        }
        self.total_errors += dropped;
    }

    /// First error, if any.
    pub fn first(&self) -> Option<&CompileError> {
        self.errors.first()
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e}")?;
        }
        if self.total_errors > self.errors.len() {
            write!(f, "\n... and {} more", self.total_errors - self.errors.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(code: ErrorCode, line: u32) -> CompileError {
        CompileError::new(
            "bot",
            code,
            "Names starting with '_' are not allowed",
            Span::new(line, 1, line, 8),
            "_secret = 1",
        )
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::UNEXPECTED_TOKEN.category(), ErrorCategory::Syntax);
        assert_eq!(ErrorCode::RESTRICTED_NAME.category(), ErrorCategory::Name);
        assert_eq!(ErrorCode::LITERAL_TOO_LARGE.category(), ErrorCategory::Limit);
        assert_eq!(ErrorCode::RELATIVE_IMPORT.category(), ErrorCategory::Import);
        assert_eq!(
            ErrorCode::BREAK_OUTSIDE_LOOP.category(),
            ErrorCategory::Structure
        );
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(format!("{}", ErrorCode::RESTRICTED_NAME), "E200");
        assert_eq!(format!("{}", ErrorCode::UNEXPECTED_TOKEN), "E100");
    }

    #[test]
    fn test_compile_error_display() {
        let err = sample(ErrorCode::RESTRICTED_NAME, 3);
        assert_eq!(
            err.to_string(),
            "bot:3:1: E200 [name] Names starting with '_' are not allowed"
        );
        assert_eq!(err.category, ErrorCategory::Name);
    }

    #[test]
    fn test_compile_error_json_serialization() {
        let err = sample(ErrorCode::RESTRICTED_NAME, 1).with_suggestion("Rename to 'secret'");
        let json = serde_json::to_string_pretty(&err).unwrap();
        assert!(json.contains("\"code\": 200"));
        assert!(json.contains("\"category\": \"name\""));
        assert!(json.contains("\"line\": 1"));
        assert!(json.contains("\"end_column\": 8"));
        assert!(json.contains("\"suggestion\""));

        let back: CompileError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, err.code);
        assert_eq!(back.span, err.span);
    }

    #[test]
    fn test_compile_errors_max_limit() {
        let mut errs = CompileErrors::empty();
        for i in 0..25 {
            errs.push_error(sample(ErrorCode::UNEXPECTED_TOKEN, i + 1));
        }
        assert_eq!(errs.errors.len(), 20);
        assert_eq!(errs.total_errors, 25);
        assert!(errs.is_full());
        assert!(errs.to_string().ends_with("... and 5 more"));
    }

    #[test]
    fn test_compile_errors_extend_keeps_totals() {
        let mut a = CompileErrors::empty();
        a.push_error(sample(ErrorCode::UNEXPECTED_TOKEN, 1));
        let mut b = CompileErrors::empty();
        for i in 0..22 {
            b.push_error(sample(ErrorCode::RESTRICTED_NAME, i + 2));
        }
        a.extend(b);
        assert_eq!(a.total_errors, 23);
        assert_eq!(a.errors.len(), 20);
        assert_eq!(a.first().map(|e| e.code), Some(ErrorCode::UNEXPECTED_TOKEN));
    }

    #[test]
    fn test_compile_errors_empty() {
        let errs = CompileErrors::empty();
        assert!(!errs.has_errors());
        assert!(errs.first().is_none());
        assert_eq!(serde_json::to_string(&errs).unwrap(), r#"{"errors":[],"total_errors":0}"#);
    }
}
