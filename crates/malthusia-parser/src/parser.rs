//! Core parser infrastructure: token cursor, error reporting, helpers.

use malthusia_lexer::token::{Token, TokenKind};
use malthusia_types::ast::{Ident, Module};
use malthusia_types::{CompileError, CompileErrors, ErrorCode, SourceFile, Span};

/// Deepest expression nesting the parser accepts.
pub(crate) const MAX_EXPR_DEPTH: u32 = 64;

/// Most operators in the left-deep chains (`a + b - c`, `f()[0].x`)
/// enclosing any one point of an expression.
pub(crate) const MAX_CHAIN_LINKS: u32 = 1_000;

/// Deepest block nesting the parser accepts.
pub(crate) const MAX_BLOCK_DEPTH: u32 = 32;

/// Most positional arguments or parameters in one call or definition.
pub(crate) const MAX_ARGUMENTS: usize = 255;

/// The Malthusia parser.
///
/// Consumes a token stream produced by the lexer and builds a [`Module`].
/// Collects errors and resynchronises at the next line.
pub struct Parser<'src> {
    tokens: Vec<Token>,
    /// Current index into `tokens`.
    pos: usize,
    source_file: &'src SourceFile,
    errors: CompileErrors,
    pub(crate) expr_depth: u32,
    /// Chain operators enclosing the current position.
    pub(crate) chain_depth: u32,
    pub(crate) block_depth: u32,
    /// Enclosing loops in the current function body.
    pub(crate) loop_depth: u32,
    /// Enclosing `def`s and lambdas.
    pub(crate) function_depth: u32,
}

/// Result of parsing.
pub struct ParseResult {
    pub module: Option<Module>,
    pub errors: CompileErrors,
}

impl<'src> Parser<'src> {
    /// Create a new parser from a token stream and source file.
    pub fn new(tokens: Vec<Token>, source_file: &'src SourceFile) -> Self {
        Self {
            tokens,
            pos: 0,
            source_file,
            errors: CompileErrors::empty(),
            expr_depth: 0,
            chain_depth: 0,
            block_depth: 0,
            loop_depth: 0,
            function_depth: 0,
        }
    }

    // ── Token Cursor ──────────────────────────────────────────────────────────

    /// Returns the current token without advancing.
    pub(crate) fn peek(&self) -> &Token {
        static EOF: Token = Token {
            kind: TokenKind::Eof,
            span: Span {
                start_line: 1,
                start_col: 1,
                end_line: 1,
                end_col: 1,
            },
        };
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .unwrap_or(&EOF)
    }

    pub(crate) fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    /// Advance the cursor by one and return the consumed token.
    pub(crate) fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    /// Look ahead by `n` tokens from the current position.
    pub(crate) fn look_ahead(&self, n: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + n)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    /// Span of the previously consumed token.
    pub(crate) fn previous_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|t| t.span)
            .unwrap_or(Span::point(1, 1))
    }

    pub(crate) fn current_span(&self) -> Span {
        self.peek().span
    }

    pub(crate) fn at_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    pub(crate) fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    /// If the current token matches, advance and return `true`.
    pub(crate) fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    // ── Expect Helpers ────────────────────────────────────────────────────────

    /// Expect a specific token kind. Returns the token if matched, or emits an error.
    pub(crate) fn expect(&mut self, expected: &TokenKind) -> Option<Token> {
        if self.check(expected) {
            Some(self.advance())
        } else {
            self.error_at_current(
                ErrorCode::UNEXPECTED_TOKEN,
                format!("expected '{}', got '{}'", expected, self.peek_kind()),
            );
            None
        }
    }

    /// Expect the end of a simple statement.
    pub(crate) fn expect_newline(&mut self) -> Option<()> {
        if self.eat(&TokenKind::Newline) || self.at_end() {
            return Some(());
        }
        self.error_at_current(
            ErrorCode::UNEXPECTED_TOKEN,
            format!("expected end of line, got '{}'", self.peek_kind()),
        );
        None
    }

    /// Expect an identifier that names a variable, function or parameter.
    pub(crate) fn expect_identifier(&mut self) -> Option<Ident> {
        match self.peek_kind().clone() {
            TokenKind::Identifier(name) => {
                let span = self.advance().span;
                self.check_name(&name, span);
                Some(Ident::new(name, span))
            }
            TokenKind::Reserved(word) => {
                self.error_at_current(
                    ErrorCode::UNSUPPORTED_SYNTAX,
                    format!("'{word}' is not supported in robot code"),
                );
                None
            }
            _ => {
                self.error_at_current(
                    ErrorCode::UNEXPECTED_TOKEN,
                    format!("expected identifier, got '{}'", self.peek_kind()),
                );
                None
            }
        }
    }

    /// Expect an attribute name after `.`.
    pub(crate) fn expect_attribute(&mut self) -> Option<Ident> {
        match self.peek_kind().clone() {
            TokenKind::Identifier(name) => {
                let span = self.advance().span;
                if name.starts_with('_') {
                    self.error_at(
                        ErrorCode::RESTRICTED_ATTRIBUTE,
                        format!("Attribute '{name}' is not accessible: names starting with '_' are restricted"),
                        span,
                    );
                }
                Some(Ident::new(name, span))
            }
            _ => {
                self.error_at_current(
                    ErrorCode::UNEXPECTED_TOKEN,
                    format!("expected attribute name, got '{}'", self.peek_kind()),
                );
                None
            }
        }
    }

    /// Reject identifiers starting with `_`.
    pub(crate) fn check_name(&mut self, name: &str, span: Span) {
        if name.starts_with('_') {
            let suggestion = format!("Rename to '{}'", name.trim_start_matches('_'));
            let source_line = self.source_line(span);
            let err = CompileError::new(
                &self.source_file.name,
                ErrorCode::RESTRICTED_NAME,
                format!("Name '{name}' is not allowed: names starting with '_' are restricted"),
                span,
                source_line,
            )
            .with_suggestion(suggestion);
            self.errors.push_error(err);
        }
    }

    // ── Error Reporting ───────────────────────────────────────────────────────

    pub(crate) fn error_at_current(&mut self, code: ErrorCode, message: impl Into<String>) {
        let span = self.current_span();
        self.error_at(code, message, span);
    }

    pub(crate) fn error_at(&mut self, code: ErrorCode, message: impl Into<String>, span: Span) {
        let source_line = self.source_line(span);
        let error = CompileError::new(&self.source_file.name, code, message, span, source_line);
        self.errors.push_error(error);
    }

    fn source_line(&self, span: Span) -> String {
        self.source_file
            .line(span.start_line)
            .unwrap_or("")
            .to_string()
    }

    pub(crate) fn too_many_errors(&self) -> bool {
        self.errors.is_full()
    }

    // ── Synchronization ───────────────────────────────────────────────────────

    /// Skip tokens until the start of the next statement. The body of a
    /// rejected compound header is skipped with it.
    pub(crate) fn synchronize(&mut self) {
        let mut depth = 0i32;
        while !self.at_end() {
            match self.peek_kind() {
                TokenKind::Newline if depth <= 0 => {
                    self.advance();
                    if self.check(&TokenKind::Indent) {
                        self.skip_block();
                    }
                    return;
                }
                TokenKind::Indent => depth += 1,
                TokenKind::Dedent if depth <= 0 => return,
                TokenKind::Dedent => depth -= 1,
                _ => {}
            }
            self.advance();
        }
    }

    fn skip_block(&mut self) {
        let mut depth = 0u32;
        while !self.at_end() {
            match self.advance().kind {
                TokenKind::Indent => depth += 1,
                TokenKind::Dedent => {
                    depth -= 1;
                    if depth == 0 {
                        return;
                    }
                }
                _ => {}
            }
        }
    }

    // ── Public API ────────────────────────────────────────────────────────────

    /// Parse the token stream into a [`Module`] AST.
    pub fn parse(mut self) -> ParseResult {
        let start = self.current_span();
        let mut body = Vec::new();
        while !self.at_end() && !self.too_many_errors() {
            if self.eat(&TokenKind::Newline) {
                continue;
            }
            if matches!(self.peek_kind(), TokenKind::Indent | TokenKind::Dedent) {
                self.error_at_current(ErrorCode::INCONSISTENT_INDENT, "unexpected indent");
                self.advance();
                continue;
            }
            match self.parse_statement() {
                Some(stmt) => body.push(stmt),
                None => self.synchronize(),
            }
        }
        let span = start.merge(self.previous_span());
        ParseResult {
            module: Some(Module {
                name: self.source_file.name.clone(),
                body,
                span,
            }),
            errors: self.errors,
        }
    }
}
