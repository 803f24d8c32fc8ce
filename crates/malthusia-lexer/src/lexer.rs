//! Core Malthusia lexer: converts robot source text to a token stream.
//!
//! Features:
//! - Indentation-structured blocks: `Indent` / `Dedent` tokens from an
//!   indentation stack, blank and comment-only lines ignored
//! - Implicit line joining inside `()`, `[]`, `{}` and explicit `\` joins
//! - f-string replacement fields via a mode stack, including format specs
//! - Single, double and triple quoted strings; `r` prefixed raw strings
//! - Error recovery: collects up to 20 errors instead of stopping at the first

use std::collections::VecDeque;

use malthusia_types::{CompileError, CompileErrors, ErrorCode, SourceFile, Span};

use crate::token::{Token, TokenKind};

/// Lexer mode: tracks whether we're scanning code or f-string text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Normal code scanning.
    Normal,
    /// Inside f-string text, scanning until the closing quote or `{`.
    FString { quote: u8 },
    /// Inside a `{...}` replacement field. `depth` counts brackets opened
    /// within the field so the closing `}` can be recognised.
    Interpolation { quote: u8, depth: u32 },
}

/// The Malthusia lexer.
pub struct Lexer<'src> {
    source: &'src [u8],
    source_file: &'src SourceFile,
    /// Current byte offset into `source`.
    pos: usize,
    /// Current line number (1-based).
    line: u32,
    /// Current column number (1-based).
    col: u32,
    errors: CompileErrors,
    mode_stack: Vec<Mode>,
    /// Tokens queued ahead of the next scan (dedent runs, field starts).
    pending: VecDeque<Token>,
    /// Indentation widths of the enclosing blocks; always starts with 0.
    indents: Vec<u32>,
    /// Open bracket depth in normal mode; newlines inside are ignored.
    paren_depth: u32,
    at_line_start: bool,
    /// Whether the last emitted token closed a logical line.
    line_ended: bool,
}

/// Result of lexing: tokens + any errors collected.
pub struct LexResult {
    /// The token stream (always ends with [`TokenKind::Eof`]).
    pub tokens: Vec<Token>,
    pub errors: CompileErrors,
}

impl<'src> Lexer<'src> {
    /// Create a new lexer for the given source file.
    pub fn new(source_file: &'src SourceFile) -> Self {
        Self {
            source: source_file.source.as_bytes(),
            source_file,
            pos: 0,
            line: 1,
            col: 1,
            errors: CompileErrors::empty(),
            mode_stack: vec![Mode::Normal],
            pending: VecDeque::new(),
            indents: vec![0],
            paren_depth: 0,
            at_line_start: true,
            line_ended: true,
        }
    }

    /// Lex the entire source file into a token stream.
    pub fn lex(mut self) -> LexResult {
        let mut tokens = Vec::new();

        loop {
            if self.errors.is_full() {
                break;
            }

            let token = self.next_token();
            self.line_ended = matches!(
                token.kind,
                TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent
            );
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);

            if is_eof {
                break;
            }
        }

        if tokens.last().is_none_or(|t| t.kind != TokenKind::Eof) {
            tokens.push(Token::new(TokenKind::Eof, self.current_span()));
        }

        LexResult {
            tokens,
            errors: self.errors,
        }
    }

    fn next_token(&mut self) -> Token {
        if let Some(pending) = self.pending.pop_front() {
            return pending;
        }
        match self.current_mode() {
            Mode::FString { quote } => {
                let (line, col) = (self.line, self.col);
                self.scan_fstring_text(quote, true, line, col)
            }
            Mode::Normal | Mode::Interpolation { .. } => self.scan_normal(),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Mode stack helpers
    // ─────────────────────────────────────────────────────────────

    fn current_mode(&self) -> Mode {
        *self.mode_stack.last().unwrap_or(&Mode::Normal)
    }

    fn push_mode(&mut self, mode: Mode) {
        self.mode_stack.push(mode);
    }

    fn pop_mode(&mut self) {
        if self.mode_stack.len() > 1 {
            self.mode_stack.pop();
        }
    }

    fn replace_mode(&mut self, mode: Mode) {
        self.pop_mode();
        self.push_mode(mode);
    }

    // ─────────────────────────────────────────────────────────────
    // Character-level helpers
    // ─────────────────────────────────────────────────────────────

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        if ch == b'\n' {
            self.line += 1;
            self.col = 1;
        } else if ch & 0xC0 != 0x80 {
            // UTF-8 continuation bytes do not start a new column.
            self.col += 1;
        }
        Some(ch)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.source.len()
    }

    fn current_span(&self) -> Span {
        Span::point(self.line, self.col)
    }

    fn span_from(&self, start_line: u32, start_col: u32) -> Span {
        Span::new(
            start_line,
            start_col,
            self.line,
            self.col.saturating_sub(1).max(1),
        )
    }

    fn emit_error(&mut self, code: ErrorCode, message: impl Into<String>, span: Span) {
        let source_line = self
            .source_file
            .line(span.start_line)
            .unwrap_or("")
            .to_string();
        let err = CompileError::new(&self.source_file.name, code, message, span, source_line);
        self.errors.push_error(err);
    }

    // ─────────────────────────────────────────────────────────────
    // Whitespace, comments & indentation
    // ─────────────────────────────────────────────────────────────

    /// Skip spaces and tabs (not newlines, which are tokens).
    fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\t' | b'\r' | b'\x0c') = self.peek() {
            self.advance();
        }
    }

    /// Skip a `#` comment up to, but not including, the newline.
    fn skip_comment(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == b'\n' {
                break;
            }
            self.advance();
        }
    }

    /// Measure the indentation of a new logical line and produce the
    /// `Indent` / `Dedent` tokens it implies. Blank and comment-only
    /// lines are consumed without producing anything.
    fn scan_indentation(&mut self) -> Option<Token> {
        loop {
            let mut width = 0u32;
            while let Some(ch) = self.peek() {
                match ch {
                    b' ' => width += 1,
                    b'\t' => width = (width / 8 + 1) * 8,
                    b'\x0c' => width = 0,
                    _ => break,
                }
                self.advance();
            }

            match self.peek() {
                Some(b'\n' | b'\r') => {
                    self.advance();
                    continue;
                }
                Some(b'#') => {
                    self.skip_comment();
                    continue;
                }
                None => {
                    self.at_line_start = false;
                    return None;
                }
                Some(_) => {}
            }

            self.at_line_start = false;
            let span = self.current_span();
            let current = self.indents.last().copied().unwrap_or(0);
            if width > current {
                self.indents.push(width);
                return Some(Token::new(TokenKind::Indent, span));
            }
            while width < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.pending.push_back(Token::new(TokenKind::Dedent, span));
            }
            if width != self.indents.last().copied().unwrap_or(0) {
                self.emit_error(
                    ErrorCode::INCONSISTENT_INDENT,
                    "Unindent does not match any outer indentation level",
                    span,
                );
            }
            return self.pending.pop_front();
        }
    }

    /// Emit the closing layout tokens at end of input.
    fn finish(&mut self) -> Token {
        let span = self.current_span();
        if self
            .mode_stack
            .iter()
            .any(|m| !matches!(m, Mode::Normal))
        {
            self.emit_error(
                ErrorCode::UNTERMINATED_STRING,
                "Unterminated f-string",
                span,
            );
            self.mode_stack.truncate(1);
        }
        if !self.line_ended {
            self.pending.push_back(Token::new(TokenKind::Newline, span));
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.pending.push_back(Token::new(TokenKind::Dedent, span));
        }
        self.pending.push_back(Token::new(TokenKind::Eof, span));
        self.pending
            .pop_front()
            .unwrap_or_else(|| Token::new(TokenKind::Eof, span))
    }

    // ─────────────────────────────────────────────────────────────
    // Normal-mode scanning
    // ─────────────────────────────────────────────────────────────

    /// Scan one token in normal (code) mode.
    fn scan_normal(&mut self) -> Token {
        loop {
            if self.at_line_start
                && self.paren_depth == 0
                && self.current_mode() == Mode::Normal
            {
                if let Some(token) = self.scan_indentation() {
                    return token;
                }
            }

            self.skip_whitespace();

            if self.errors.is_full() {
                return Token::new(TokenKind::Eof, self.current_span());
            }

            // Explicit line joining.
            if self.peek() == Some(b'\\') {
                let next = if self.peek_at(1) == Some(b'\r') { 2 } else { 1 };
                if self.peek_at(next) == Some(b'\n') {
                    for _ in 0..=next {
                        self.advance();
                    }
                    continue;
                }
            }

            if self.peek() == Some(b'#') {
                self.skip_comment();
                continue;
            }

            if self.at_end() {
                return self.finish();
            }

            let start_line = self.line;
            let start_col = self.col;
            let Some(ch) = self.advance() else {
                return self.finish();
            };

            if ch == b'\n' {
                if let Mode::Interpolation { .. } = self.current_mode() {
                    let span = self.span_from(start_line, start_col);
                    self.emit_error(
                        ErrorCode::UNTERMINATED_STRING,
                        "f-string replacement field is not closed before end of line",
                        span,
                    );
                    self.mode_stack.truncate(1);
                }
                if self.paren_depth > 0 {
                    continue;
                }
                self.at_line_start = true;
                if self.line_ended {
                    continue;
                }
                return Token::new(TokenKind::Newline, Span::point(start_line, start_col));
            }

            if let Some(token) = self.scan_token(ch, start_line, start_col) {
                return token;
            }
        }
    }

    /// Scan a token starting with `ch`. Returns `None` when the character
    /// was rejected and scanning should continue.
    fn scan_token(&mut self, ch: u8, start_line: u32, start_col: u32) -> Option<Token> {
        let simple = |lexer: &Self, kind| Some(Token::new(kind, lexer.span_from(start_line, start_col)));

        match ch {
            // ── String literals ──
            b'"' | b'\'' => Some(self.scan_string(ch, false, start_line, start_col)),

            // ── Number literals ──
            b'0'..=b'9' => Some(self.scan_number(start_line, start_col)),
            b'.' if matches!(self.peek(), Some(b'0'..=b'9')) => {
                Some(self.scan_number(start_line, start_col))
            }

            // ── Identifiers, keywords & string prefixes ──
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                Some(self.scan_identifier(start_line, start_col))
            }

            // ── Operators ──
            b'+' => self.with_eq(TokenKind::Plus, TokenKind::PlusEq, start_line, start_col),
            b'-' if self.peek() == Some(b'>') => {
                self.advance();
                simple(self, TokenKind::Arrow)
            }
            b'-' => self.with_eq(TokenKind::Minus, TokenKind::MinusEq, start_line, start_col),
            b'%' => self.with_eq(TokenKind::Percent, TokenKind::PercentEq, start_line, start_col),
            b'*' => {
                if self.peek() == Some(b'*') {
                    self.advance();
                    simple(self, TokenKind::StarStar)
                } else {
                    self.with_eq(TokenKind::Star, TokenKind::StarEq, start_line, start_col)
                }
            }
            b'/' => {
                if self.peek() == Some(b'/') {
                    self.advance();
                    self.with_eq(
                        TokenKind::SlashSlash,
                        TokenKind::SlashSlashEq,
                        start_line,
                        start_col,
                    )
                } else {
                    self.with_eq(TokenKind::Slash, TokenKind::SlashEq, start_line, start_col)
                }
            }
            b'=' => self.with_eq(TokenKind::Eq, TokenKind::EqEq, start_line, start_col),
            b'<' => self.with_eq(TokenKind::Less, TokenKind::LessEq, start_line, start_col),
            b'>' => self.with_eq(TokenKind::Greater, TokenKind::GreaterEq, start_line, start_col),
            b'!' if self.peek() == Some(b'=') => {
                self.advance();
                simple(self, TokenKind::NotEq)
            }

            // ── Punctuation ──
            b'.' => simple(self, TokenKind::Dot),
            b',' => simple(self, TokenKind::Comma),
            b':' => {
                if let Mode::Interpolation { depth: 0, .. } = self.current_mode() {
                    return Some(self.scan_format_spec(start_line, start_col));
                }
                simple(self, TokenKind::Colon)
            }
            b'(' | b'[' | b'{' => {
                self.open_bracket();
                let kind = match ch {
                    b'(' => TokenKind::LParen,
                    b'[' => TokenKind::LBracket,
                    _ => TokenKind::LBrace,
                };
                simple(self, kind)
            }
            b')' | b']' | b'}' => {
                if let Mode::Interpolation { quote, depth: 0 } = self.current_mode() {
                    if ch == b'}' {
                        self.replace_mode(Mode::FString { quote });
                        return simple(self, TokenKind::InterpolationEnd);
                    }
                }
                self.close_bracket();
                let kind = match ch {
                    b')' => TokenKind::RParen,
                    b']' => TokenKind::RBracket,
                    _ => TokenKind::RBrace,
                };
                simple(self, kind)
            }

            _ => {
                let span = self.span_from(start_line, start_col);
                let shown = self.char_at(self.pos - 1);
                self.skip_utf8_tail();
                let err = match ch {
                    b'!' => "Unexpected character '!'; use 'not' for negation".to_string(),
                    _ => format!("Unexpected character '{shown}'"),
                };
                self.emit_error(ErrorCode::UNEXPECTED_CHARACTER, err, span);
                None
            }
        }
    }

    /// Emit `with_eq` when the next byte is `=`, otherwise `plain`.
    fn with_eq(
        &mut self,
        plain: TokenKind,
        with_eq: TokenKind,
        start_line: u32,
        start_col: u32,
    ) -> Option<Token> {
        let kind = if self.peek() == Some(b'=') {
            self.advance();
            with_eq
        } else {
            plain
        };
        Some(Token::new(kind, self.span_from(start_line, start_col)))
    }

    fn open_bracket(&mut self) {
        match self.mode_stack.last_mut() {
            Some(Mode::Interpolation { depth, .. }) => *depth += 1,
            _ => self.paren_depth += 1,
        }
    }

    fn close_bracket(&mut self) {
        match self.mode_stack.last_mut() {
            Some(Mode::Interpolation { depth, .. }) => *depth = depth.saturating_sub(1),
            _ => self.paren_depth = self.paren_depth.saturating_sub(1),
        }
    }

    fn char_at(&self, offset: usize) -> char {
        let end = (offset + 4).min(self.source.len());
        String::from_utf8_lossy(&self.source[offset..end])
            .chars()
            .next()
            .unwrap_or('?')
    }

    fn skip_utf8_tail(&mut self) {
        while let Some(b) = self.peek() {
            if b & 0xC0 != 0x80 {
                break;
            }
            self.advance();
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Number literals
    // ─────────────────────────────────────────────────────────────

    fn scan_number(&mut self, start_line: u32, start_col: u32) -> Token {
        let begin = self.pos - 1;

        if self.source[begin] == b'0' && matches!(self.peek(), Some(b'x' | b'X')) {
            self.advance();
            while let Some(b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' | b'_') = self.peek() {
                self.advance();
            }
            let digits: String = self.lexeme(begin + 2).chars().filter(|c| *c != '_').collect();
            return self.int_token(i64::from_str_radix(&digits, 16).ok(), start_line, start_col);
        }

        let mut is_float = self.source[begin] == b'.';
        self.eat_digits();
        if !is_float && self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(b'0'..=b'9'))
        {
            is_float = true;
            self.advance();
            self.eat_digits();
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let sign = usize::from(matches!(self.peek_at(1), Some(b'+' | b'-')));
            if matches!(self.peek_at(1 + sign), Some(b'0'..=b'9')) {
                is_float = true;
                for _ in 0..=sign {
                    self.advance();
                }
                self.eat_digits();
            }
        }

        let text: String = self.lexeme(begin).chars().filter(|c| *c != '_').collect();
        if is_float {
            let span = self.span_from(start_line, start_col);
            match text.parse::<f64>() {
                Ok(v) if v.is_finite() => Token::new(TokenKind::Float(v), span),
                _ => {
                    self.emit_error(ErrorCode::LITERAL_TOO_LARGE, "Float literal out of range", span);
                    Token::new(TokenKind::Float(0.0), span)
                }
            }
        } else {
            self.int_token(text.parse::<i64>().ok(), start_line, start_col)
        }
    }

    fn eat_digits(&mut self) {
        while let Some(b'0'..=b'9' | b'_') = self.peek() {
            self.advance();
        }
    }

    fn int_token(&mut self, value: Option<i64>, start_line: u32, start_col: u32) -> Token {
        let span = self.span_from(start_line, start_col);
        match value {
            Some(v) => Token::new(TokenKind::Int(v), span),
            None => {
                self.emit_error(
                    ErrorCode::LITERAL_TOO_LARGE,
                    "Integer literal does not fit in 64 bits",
                    span,
                );
                Token::new(TokenKind::Int(0), span)
            }
        }
    }

    fn lexeme(&self, begin: usize) -> String {
        String::from_utf8_lossy(&self.source[begin..self.pos]).into_owned()
    }

    // ─────────────────────────────────────────────────────────────
    // Identifiers & keywords
    // ─────────────────────────────────────────────────────────────

    fn scan_identifier(&mut self, start_line: u32, start_col: u32) -> Token {
        let begin = self.pos - 1;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == b'_' {
                self.advance();
            } else {
                break;
            }
        }
        let text = self.lexeme(begin);

        // String prefixes: f"...", r'...'
        if let Some(quote @ (b'"' | b'\'')) = self.peek() {
            match text.as_str() {
                "f" | "F" => {
                    self.advance();
                    return self.scan_fstring_text(quote, false, start_line, start_col);
                }
                "r" | "R" => {
                    self.advance();
                    return self.scan_string(quote, true, start_line, start_col);
                }
                _ => {}
            }
        }

        let kind = TokenKind::from_keyword(&text).unwrap_or(TokenKind::Identifier(text));
        Token::new(kind, self.span_from(start_line, start_col))
    }

    // ─────────────────────────────────────────────────────────────
    // String literals & f-strings
    // ─────────────────────────────────────────────────────────────

    /// Scan a string literal after its opening quote.
    fn scan_string(&mut self, quote: u8, raw: bool, start_line: u32, start_col: u32) -> Token {
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.advance();
            self.advance();
        }
        let mut buf = Vec::new();

        loop {
            match self.peek() {
                None => break,
                Some(b'\n') if !triple => break,
                Some(q) if q == quote => {
                    if !triple {
                        self.advance();
                        return self.str_token(buf, start_line, start_col);
                    }
                    if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                        self.advance();
                        self.advance();
                        self.advance();
                        return self.str_token(buf, start_line, start_col);
                    }
                    self.advance();
                    buf.push(q);
                }
                Some(b'\\') if !raw => self.scan_escape_sequence(&mut buf),
                Some(ch) => {
                    self.advance();
                    buf.push(ch);
                }
            }
        }

        let span = self.span_from(start_line, start_col);
        self.emit_error(ErrorCode::UNTERMINATED_STRING, "Unterminated string literal", span);
        self.str_token(buf, start_line, start_col)
    }

    fn str_token(&self, buf: Vec<u8>, start_line: u32, start_col: u32) -> Token {
        Token::new(
            TokenKind::Str(String::from_utf8_lossy(&buf).into_owned()),
            self.span_from(start_line, start_col),
        )
    }

    /// Scan f-string text up to the closing quote or the next `{`.
    ///
    /// `continuing` is false right after the opening quote; the first
    /// text run then becomes either a plain `Str` (no replacement fields)
    /// or an `FStringStart`.
    fn scan_fstring_text(
        &mut self,
        quote: u8,
        continuing: bool,
        start_line: u32,
        start_col: u32,
    ) -> Token {
        let mut buf = Vec::new();

        loop {
            match self.peek() {
                None | Some(b'\n') => {
                    let span = self.span_from(start_line, start_col);
                    self.emit_error(ErrorCode::UNTERMINATED_STRING, "Unterminated f-string", span);
                    return self.close_fstring(buf, continuing, start_line, start_col);
                }
                Some(q) if q == quote => {
                    self.advance();
                    return self.close_fstring(buf, continuing, start_line, start_col);
                }
                Some(b'{') if self.peek_at(1) == Some(b'{') => {
                    self.advance();
                    self.advance();
                    buf.push(b'{');
                }
                Some(b'}') if self.peek_at(1) == Some(b'}') => {
                    self.advance();
                    self.advance();
                    buf.push(b'}');
                }
                Some(b'}') => {
                    let span = self.current_span();
                    self.advance();
                    self.emit_error(
                        ErrorCode::UNEXPECTED_TOKEN,
                        "Single '}' is not allowed in an f-string; write '}}'",
                        span,
                    );
                }
                Some(b'{') => {
                    let field_span = self.current_span();
                    self.advance();
                    let mode = Mode::Interpolation { quote, depth: 0 };
                    if continuing {
                        self.replace_mode(mode);
                    } else {
                        self.push_mode(mode);
                    }
                    self.pending
                        .push_back(Token::new(TokenKind::InterpolationStart, field_span));
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    let kind = if continuing {
                        TokenKind::FStringPart(text)
                    } else {
                        TokenKind::FStringStart(text)
                    };
                    return Token::new(kind, self.span_from(start_line, start_col));
                }
                Some(b'\\') => self.scan_escape_sequence(&mut buf),
                Some(ch) => {
                    self.advance();
                    buf.push(ch);
                }
            }
        }
    }

    fn close_fstring(
        &mut self,
        buf: Vec<u8>,
        continuing: bool,
        start_line: u32,
        start_col: u32,
    ) -> Token {
        let text = String::from_utf8_lossy(&buf).into_owned();
        let span = self.span_from(start_line, start_col);
        if continuing {
            self.pop_mode();
            Token::new(TokenKind::FStringEnd(text), span)
        } else {
            Token::new(TokenKind::Str(text), span)
        }
    }

    /// Scan the format spec after `:` in a replacement field.
    fn scan_format_spec(&mut self, start_line: u32, start_col: u32) -> Token {
        let begin = self.pos;
        while let Some(ch) = self.peek() {
            if ch == b'}' || ch == b'\n' {
                break;
            }
            self.advance();
        }
        let spec = self.lexeme(begin);
        Token::new(TokenKind::FormatSpec(spec), self.span_from(start_line, start_col))
    }

    /// Scan an escape sequence starting at the `\`, appending its bytes.
    fn scan_escape_sequence(&mut self, buf: &mut Vec<u8>) {
        let start_line = self.line;
        let start_col = self.col;
        self.advance();

        let ch = match self.advance() {
            Some(b'n') => '\n',
            Some(b't') => '\t',
            Some(b'r') => '\r',
            Some(b'0') => '\0',
            Some(b'\\') => '\\',
            Some(b'\'') => '\'',
            Some(b'"') => '"',
            Some(b'\n') => return,
            Some(b'x') => return self.scan_hex_escape(2, buf, start_line, start_col),
            Some(b'u') => return self.scan_hex_escape(4, buf, start_line, start_col),
            Some(other) => {
                buf.push(b'\\');
                buf.push(other);
                return;
            }
            None => {
                let span = self.span_from(start_line, start_col);
                self.emit_error(
                    ErrorCode::UNTERMINATED_STRING,
                    "Unexpected end of file in escape sequence",
                    span,
                );
                return;
            }
        };
        let mut utf8 = [0u8; 4];
        buf.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
    }

    fn scan_hex_escape(&mut self, digits: usize, buf: &mut Vec<u8>, start_line: u32, start_col: u32) {
        let begin = self.pos;
        for _ in 0..digits {
            if matches!(self.peek(), Some(b) if b.is_ascii_hexdigit()) {
                self.advance();
            }
        }
        let text = self.lexeme(begin);
        let decoded = (text.len() == digits)
            .then(|| u32::from_str_radix(&text, 16).ok())
            .flatten()
            .and_then(char::from_u32);
        match decoded {
            Some(ch) => {
                let mut utf8 = [0u8; 4];
                buf.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
            }
            None => {
                let span = self.span_from(start_line, start_col);
                self.emit_error(
                    ErrorCode::INVALID_ESCAPE,
                    format!("Invalid escape sequence: expected {digits} hex digits"),
                    span,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let file = SourceFile::new("bot", src);
        let result = Lexer::new(&file).lex();
        assert!(!result.errors.has_errors(), "{}", result.errors);
        result.tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_blank_and_comment_lines_produce_nothing() {
        assert_eq!(
            kinds("\n\n# only a comment\n   \nx\n"),
            vec![
                TokenKind::Identifier("x".into()),
                TokenKind::Newline,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_dedent_run_at_eof() {
        let toks = kinds("if a:\n    if b:\n        c");
        let dedents = toks.iter().filter(|k| **k == TokenKind::Dedent).count();
        assert_eq!(dedents, 2);
        assert_eq!(toks[toks.len() - 4], TokenKind::Newline);
    }

    #[test]
    fn test_brackets_join_lines() {
        assert_eq!(
            kinds("x = (1,\n     2)\n"),
            vec![
                TokenKind::Identifier("x".into()),
                TokenKind::Eq,
                TokenKind::LParen,
                TokenKind::Int(1),
                TokenKind::Comma,
                TokenKind::Int(2),
                TokenKind::RParen,
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_backslash_continuation() {
        let toks = kinds("x = 1 + \\\n    2\n");
        assert!(!toks.contains(&TokenKind::Indent));
        assert_eq!(toks.iter().filter(|k| **k == TokenKind::Newline).count(), 1);
    }

    #[test]
    fn test_escape_sequences() {
        assert_eq!(
            kinds(r#"'a\n\x41\u00e9\q'"#)[0],
            TokenKind::Str("a\nA\u{e9}\\q".into())
        );
    }
}
