//! Malthusia parser: converts a token stream into an AST.
//!
//! Besides building the tree, the parser enforces the compile-time half of
//! the sandbox policy: no identifier or attribute may start with `_`,
//! relative and star imports are rejected, and control-flow statements
//! must appear where they are meaningful.

mod parse_expr;
mod parse_stmt;
mod parser;

pub use parser::{ParseResult, Parser};

use malthusia_lexer::Lexer;
use malthusia_types::{ast::Module, CompileErrors, SourceFile};

/// Lex and parse one source file.
pub fn parse_source(source_file: &SourceFile) -> Result<Module, CompileErrors> {
    let lexed = Lexer::new(source_file).lex();
    let mut errors = lexed.errors;
    let parsed = Parser::new(lexed.tokens, source_file).parse();
    errors.extend(parsed.errors);
    match parsed.module {
        Some(module) if !errors.has_errors() => Ok(module),
        _ => Err(errors),
    }
}
