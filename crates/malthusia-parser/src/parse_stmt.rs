//! Statement parsing: simple statements, compound statements and blocks.

use malthusia_lexer::token::TokenKind;
use malthusia_types::ast::*;
use malthusia_types::ErrorCode;

use crate::parser::{Parser, MAX_ARGUMENTS, MAX_BLOCK_DEPTH};

impl<'src> Parser<'src> {
    // ══════════════════════════════════════════════════════════════════════════
    // Dispatch
    // ══════════════════════════════════════════════════════════════════════════

    /// Parse one statement, simple or compound.
    pub(crate) fn parse_statement(&mut self) -> Option<Stmt> {
        match self.peek_kind() {
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Def => self.parse_def(),
            TokenKind::Try => self.parse_try(),
            TokenKind::Reserved(word) => {
                let word = *word;
                self.error_at_current(
                    ErrorCode::UNSUPPORTED_SYNTAX,
                    format!("'{word}' is not supported in robot code"),
                );
                None
            }
            _ => {
                let stmt = self.parse_simple_statement()?;
                self.expect_newline()?;
                Some(stmt)
            }
        }
    }

    /// Parse `: NEWLINE INDENT stmts DEDENT`, or `: simple_stmt` on one line.
    fn parse_block(&mut self) -> Option<Vec<Stmt>> {
        self.expect(&TokenKind::Colon)?;

        if !self.eat(&TokenKind::Newline) {
            let stmt = self.parse_simple_statement()?;
            self.expect_newline()?;
            return Some(vec![stmt]);
        }
        if !self.eat(&TokenKind::Indent) {
            self.error_at_current(ErrorCode::INCONSISTENT_INDENT, "expected an indented block");
            return None;
        }

        self.block_depth += 1;
        if self.block_depth > MAX_BLOCK_DEPTH {
            self.error_at_current(
                ErrorCode::NESTING_TOO_DEEP,
                format!("maximum block nesting depth is {MAX_BLOCK_DEPTH}"),
            );
        }

        let mut body = Vec::new();
        while !self.check(&TokenKind::Dedent) && !self.at_end() && !self.too_many_errors() {
            if self.eat(&TokenKind::Newline) {
                continue;
            }
            match self.parse_statement() {
                Some(stmt) => body.push(stmt),
                None => self.synchronize(),
            }
        }
        self.eat(&TokenKind::Dedent);
        self.block_depth -= 1;
        Some(body)
    }

    // ══════════════════════════════════════════════════════════════════════════
    // Compound Statements
    // ══════════════════════════════════════════════════════════════════════════

    /// `if test: block (elif test: block)* [else: block]`
    fn parse_if(&mut self) -> Option<Stmt> {
        let start = self.advance().span;
        let test = self.parse_test()?;
        let body = self.parse_block()?;
        let orelse = if self.check(&TokenKind::Elif) {
            vec![self.parse_if()?]
        } else if self.eat(&TokenKind::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        let span = start.merge(self.previous_span());
        Some(Stmt::new(StmtKind::If { test, body, orelse }, span))
    }

    /// `while test: block [else: block]`
    fn parse_while(&mut self) -> Option<Stmt> {
        let start = self.advance().span;
        let test = self.parse_test()?;
        self.loop_depth += 1;
        let body = self.parse_block();
        self.loop_depth -= 1;
        let body = body?;
        let orelse = self.parse_else_block()?;
        let span = start.merge(self.previous_span());
        Some(Stmt::new(StmtKind::While { test, body, orelse }, span))
    }

    /// `for targets in testlist: block [else: block]`
    fn parse_for(&mut self) -> Option<Stmt> {
        let start = self.advance().span;
        let target = self.parse_target_list()?;
        self.validate_target(&target);
        self.expect(&TokenKind::In)?;
        let iter = self.parse_testlist()?;
        self.loop_depth += 1;
        let body = self.parse_block();
        self.loop_depth -= 1;
        let body = body?;
        let orelse = self.parse_else_block()?;
        let span = start.merge(self.previous_span());
        Some(Stmt::new(
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            },
            span,
        ))
    }

    fn parse_else_block(&mut self) -> Option<Vec<Stmt>> {
        if self.eat(&TokenKind::Else) {
            self.parse_block()
        } else {
            Some(Vec::new())
        }
    }

    /// `def name(params) [-> annotation]: block`
    fn parse_def(&mut self) -> Option<Stmt> {
        let start = self.advance().span;
        let name = self.expect_identifier()?;
        self.expect(&TokenKind::LParen)?;
        let params = self.parse_params(&TokenKind::RParen)?;
        self.expect(&TokenKind::RParen)?;
        if self.eat(&TokenKind::Arrow) {
            self.parse_test()?;
        }

        let saved_loops = std::mem::replace(&mut self.loop_depth, 0);
        self.function_depth += 1;
        let body = self.parse_block();
        self.function_depth -= 1;
        self.loop_depth = saved_loops;

        let span = start.merge(self.previous_span());
        Some(Stmt::new(
            StmtKind::FunctionDef(FunctionDef {
                name,
                params,
                body: body?,
                span,
            }),
            span,
        ))
    }

    /// Parameter list up to (not including) `close`. Shared with lambdas.
    pub(crate) fn parse_params(&mut self, close: &TokenKind) -> Option<Vec<Param>> {
        let mut params: Vec<Param> = Vec::new();
        while !self.check(close) {
            if self.check(&TokenKind::Star) || self.check(&TokenKind::StarStar) {
                self.error_at_current(
                    ErrorCode::UNSUPPORTED_SYNTAX,
                    "variadic parameters are not supported",
                );
                return None;
            }
            let name = self.expect_identifier()?;
            if params.iter().any(|p| p.name.name == name.name) {
                self.error_at(
                    ErrorCode::INVALID_ASSIGN_TARGET,
                    format!("duplicate parameter '{}'", name.name),
                    name.span,
                );
            }
            // Annotations are accepted and ignored; lambdas have none.
            if *close == TokenKind::RParen && self.eat(&TokenKind::Colon) {
                self.parse_test()?;
            }
            let default = if self.eat(&TokenKind::Eq) {
                Some(self.parse_test()?)
            } else {
                if params.iter().any(|p| p.default.is_some()) {
                    self.error_at(
                        ErrorCode::UNEXPECTED_TOKEN,
                        "non-default parameter follows default parameter",
                        name.span,
                    );
                }
                None
            };
            params.push(Param { name, default });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        if params.len() > MAX_ARGUMENTS {
            self.error_at_current(
                ErrorCode::TOO_MANY_ARGUMENTS,
                format!("at most {MAX_ARGUMENTS} parameters are allowed"),
            );
        }
        Some(params)
    }

    /// `try: block (except [test [as name]]: block)+ [else: block]`
    fn parse_try(&mut self) -> Option<Stmt> {
        let start = self.advance().span;
        let body = self.parse_block()?;

        let mut handlers: Vec<ExceptHandler> = Vec::new();
        while self.check(&TokenKind::Except) {
            let handler_start = self.advance().span;
            if handlers.last().is_some_and(|h| h.kind.is_none()) {
                self.error_at(
                    ErrorCode::UNEXPECTED_TOKEN,
                    "a bare 'except:' must be the last handler",
                    handler_start,
                );
            }
            let (kind, name) = if self.check(&TokenKind::Colon) {
                (None, None)
            } else {
                let kind = self.parse_test()?;
                let name = if self.eat(&TokenKind::As) {
                    Some(self.expect_identifier()?)
                } else {
                    None
                };
                (Some(kind), name)
            };
            let body = self.parse_block()?;
            handlers.push(ExceptHandler {
                kind,
                name,
                body,
                span: handler_start.merge(self.previous_span()),
            });
        }

        if handlers.is_empty() {
            self.error_at_current(
                ErrorCode::UNSUPPORTED_SYNTAX,
                "'try' needs at least one 'except' handler; 'finally' is not supported",
            );
            return None;
        }
        let orelse = self.parse_else_block()?;
        if matches!(self.peek_kind(), TokenKind::Reserved("finally")) {
            self.error_at_current(ErrorCode::UNSUPPORTED_SYNTAX, "'finally' is not supported");
            return None;
        }

        let span = start.merge(self.previous_span());
        Some(Stmt::new(
            StmtKind::Try {
                body,
                handlers,
                orelse,
            },
            span,
        ))
    }

    // ══════════════════════════════════════════════════════════════════════════
    // Simple Statements
    // ══════════════════════════════════════════════════════════════════════════

    fn parse_simple_statement(&mut self) -> Option<Stmt> {
        let start = self.current_span();
        let kind = match self.peek_kind() {
            TokenKind::Pass => {
                self.advance();
                StmtKind::Pass
            }
            TokenKind::Break => {
                self.advance();
                if self.loop_depth == 0 {
                    self.error_at(ErrorCode::BREAK_OUTSIDE_LOOP, "'break' outside loop", start);
                }
                StmtKind::Break
            }
            TokenKind::Continue => {
                self.advance();
                if self.loop_depth == 0 {
                    self.error_at(
                        ErrorCode::CONTINUE_OUTSIDE_LOOP,
                        "'continue' not properly in loop",
                        start,
                    );
                }
                StmtKind::Continue
            }
            TokenKind::Return => {
                self.advance();
                if self.function_depth == 0 {
                    self.error_at(
                        ErrorCode::RETURN_OUTSIDE_FUNCTION,
                        "'return' outside function",
                        start,
                    );
                }
                let value = if self.at_statement_end() {
                    None
                } else {
                    Some(self.parse_testlist()?)
                };
                StmtKind::Return(value)
            }
            TokenKind::Global => {
                self.advance();
                let mut names = vec![self.expect_identifier()?];
                while self.eat(&TokenKind::Comma) {
                    names.push(self.expect_identifier()?);
                }
                StmtKind::Global(names)
            }
            TokenKind::Import => return self.parse_import(),
            TokenKind::From => return self.parse_from_import(),
            TokenKind::Raise => {
                self.advance();
                let exc = if self.at_statement_end() {
                    None
                } else {
                    Some(self.parse_test()?)
                };
                if self.check(&TokenKind::From) {
                    self.error_at_current(
                        ErrorCode::UNSUPPORTED_SYNTAX,
                        "'raise ... from ...' is not supported",
                    );
                    return None;
                }
                StmtKind::Raise(exc)
            }
            TokenKind::Assert => {
                self.advance();
                let test = self.parse_test()?;
                let msg = if self.eat(&TokenKind::Comma) {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                StmtKind::Assert { test, msg }
            }
            TokenKind::Del => {
                self.advance();
                let mut targets = vec![self.parse_postfix()?];
                while self.eat(&TokenKind::Comma) {
                    targets.push(self.parse_postfix()?);
                }
                for target in &targets {
                    if !matches!(
                        target.kind,
                        ExprKind::Name(_) | ExprKind::Subscript { .. } | ExprKind::Attribute { .. }
                    ) {
                        self.error_at(
                            ErrorCode::INVALID_ASSIGN_TARGET,
                            "cannot delete this expression",
                            target.span,
                        );
                    }
                }
                StmtKind::Del(targets)
            }
            _ => return self.parse_expression_statement(),
        };
        let span = start.merge(self.previous_span());
        Some(Stmt::new(kind, span))
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Newline | TokenKind::Eof | TokenKind::Dedent
        )
    }

    /// Expression statement, assignment chain or augmented assignment.
    fn parse_expression_statement(&mut self) -> Option<Stmt> {
        let start = self.current_span();
        let first = self.parse_testlist()?;

        if let Some(op) = aug_assign_op(self.peek_kind()) {
            self.advance();
            if !matches!(
                first.kind,
                ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. }
            ) {
                self.error_at(
                    ErrorCode::INVALID_ASSIGN_TARGET,
                    "illegal expression for augmented assignment",
                    first.span,
                );
            }
            let value = self.parse_testlist()?;
            let span = start.merge(self.previous_span());
            return Some(Stmt::new(
                StmtKind::AugAssign {
                    target: first,
                    op,
                    value,
                },
                span,
            ));
        }

        if !self.check(&TokenKind::Eq) {
            let span = first.span;
            return Some(Stmt::new(StmtKind::Expr(first), span));
        }

        let mut targets = vec![first];
        let value = loop {
            self.advance();
            let next = self.parse_testlist()?;
            if self.check(&TokenKind::Eq) {
                targets.push(next);
            } else {
                break next;
            }
        };
        for target in &targets {
            self.validate_target(target);
        }
        let span = start.merge(self.previous_span());
        Some(Stmt::new(StmtKind::Assign { targets, value }, span))
    }

    /// Report an error unless `target` can be assigned to.
    pub(crate) fn validate_target(&mut self, target: &Expr) {
        match &target.kind {
            ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. } => {}
            ExprKind::Tuple(items) | ExprKind::List(items) if !items.is_empty() => {
                for item in items {
                    self.validate_target(item);
                }
            }
            _ => self.error_at(
                ErrorCode::INVALID_ASSIGN_TARGET,
                "cannot assign to this expression",
                target.span,
            ),
        }
    }

    // ══════════════════════════════════════════════════════════════════════════
    // Imports
    // ══════════════════════════════════════════════════════════════════════════

    /// `import a [as b], c`
    fn parse_import(&mut self) -> Option<Stmt> {
        let start = self.advance().span;
        let mut names = vec![self.parse_alias()?];
        while self.eat(&TokenKind::Comma) {
            names.push(self.parse_alias()?);
        }
        let span = start.merge(self.previous_span());
        Some(Stmt::new(StmtKind::Import(names), span))
    }

    /// `from module import a [as b], c` or with parenthesised names.
    fn parse_from_import(&mut self) -> Option<Stmt> {
        let start = self.advance().span;
        if self.check(&TokenKind::Dot) {
            self.error_at_current(ErrorCode::RELATIVE_IMPORT, "No relative imports (yet).");
            return None;
        }
        let module = self.expect_identifier()?;
        if self.check(&TokenKind::Dot) {
            self.error_at_current(
                ErrorCode::UNSUPPORTED_SYNTAX,
                "dotted module paths are not supported; bundle modules are flat",
            );
            return None;
        }
        self.expect(&TokenKind::Import)?;
        if self.check(&TokenKind::Star) {
            self.error_at_current(ErrorCode::STAR_IMPORT, "'from ... import *' is not allowed");
            return None;
        }
        let parenthesised = self.eat(&TokenKind::LParen);
        let mut names = vec![self.parse_alias()?];
        while self.eat(&TokenKind::Comma) {
            if parenthesised && self.check(&TokenKind::RParen) {
                break;
            }
            names.push(self.parse_alias()?);
        }
        if parenthesised {
            self.expect(&TokenKind::RParen)?;
        }
        let span = start.merge(self.previous_span());
        Some(Stmt::new(StmtKind::ImportFrom { module, names }, span))
    }

    fn parse_alias(&mut self) -> Option<Alias> {
        let name = self.expect_identifier()?;
        let asname = if self.eat(&TokenKind::As) {
            Some(self.expect_identifier()?)
        } else {
            None
        };
        Some(Alias { name, asname })
    }
}

fn aug_assign_op(kind: &TokenKind) -> Option<BinOp> {
    Some(match kind {
        TokenKind::PlusEq => BinOp::Add,
        TokenKind::MinusEq => BinOp::Sub,
        TokenKind::StarEq => BinOp::Mul,
        TokenKind::SlashEq => BinOp::Div,
        TokenKind::SlashSlashEq => BinOp::FloorDiv,
        TokenKind::PercentEq => BinOp::Mod,
        _ => return None,
    })
}
