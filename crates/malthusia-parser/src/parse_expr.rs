//! Expression parsing with full operator precedence.
//!
//! Precedence (lowest → highest):
//! 1. `lambda`, `x if c else y`
//! 2. `or`
//! 3. `and`
//! 4. `not`
//! 5. comparisons, chained: `<`, `<=`, `==`, `!=`, `>`, `>=`, `in`, `not in`, `is`, `is not`
//! 6. `+`, `-`
//! 7. `*`, `/`, `//`, `%`
//! 8. unary `-`, `+`
//! 9. `**` (right associative, binds tighter than a unary operator on its left)
//! 10. `.attr`, `[index]`, `(args)`

use malthusia_lexer::token::TokenKind;
use malthusia_types::ast::*;
use malthusia_types::{ErrorCode, Span};

use crate::parser::{Parser, MAX_ARGUMENTS, MAX_CHAIN_LINKS, MAX_EXPR_DEPTH};

impl<'src> Parser<'src> {
    // ══════════════════════════════════════════════════════════════════════════
    // Entry Points
    // ══════════════════════════════════════════════════════════════════════════

    /// `test (',' test)* [',']`, building a tuple when commas are present.
    pub(crate) fn parse_testlist(&mut self) -> Option<Expr> {
        let first = self.parse_test()?;
        if !self.check(&TokenKind::Comma) {
            return Some(first);
        }
        let start = first.span;
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if !starts_expression(self.peek_kind()) {
                break;
            }
            items.push(self.parse_test()?);
        }
        let span = start.merge(self.previous_span());
        Some(Expr::new(ExprKind::Tuple(items), span))
    }

    /// Comma-separated assignment targets of a `for` loop, stopping at `in`.
    pub(crate) fn parse_target_list(&mut self) -> Option<Expr> {
        let first = self.parse_postfix()?;
        if !self.check(&TokenKind::Comma) {
            return Some(first);
        }
        let start = first.span;
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.check(&TokenKind::In) {
                break;
            }
            items.push(self.parse_postfix()?);
        }
        let span = start.merge(self.previous_span());
        Some(Expr::new(ExprKind::Tuple(items), span))
    }

    /// A single expression, including conditional expressions and lambdas.
    pub(crate) fn parse_test(&mut self) -> Option<Expr> {
        self.nested(Self::parse_test_inner)
    }

    /// Run a recursive production one nesting level deeper.
    fn nested(&mut self, production: fn(&mut Self) -> Option<Expr>) -> Option<Expr> {
        self.expr_depth += 1;
        if self.expr_depth > MAX_EXPR_DEPTH {
            self.error_at_current(
                ErrorCode::NESTING_TOO_DEEP,
                format!("maximum expression nesting depth is {MAX_EXPR_DEPTH}"),
            );
            self.expr_depth -= 1;
            return None;
        }
        let result = production(self);
        self.expr_depth -= 1;
        result
    }

    /// Run a left-deep chain production; its links are released when it ends.
    fn chained(&mut self, production: fn(&mut Self) -> Option<Expr>) -> Option<Expr> {
        let depth = self.chain_depth;
        let result = production(self);
        self.chain_depth = depth;
        result
    }

    /// Account for one more operator in the enclosing chains.
    fn chain_link(&mut self) -> Option<()> {
        self.chain_depth += 1;
        if self.chain_depth > MAX_CHAIN_LINKS {
            self.error_at_current(
                ErrorCode::NESTING_TOO_DEEP,
                format!("expression chains are limited to {MAX_CHAIN_LINKS} operators"),
            );
            return None;
        }
        Some(())
    }

    fn parse_test_inner(&mut self) -> Option<Expr> {
        if self.check(&TokenKind::Lambda) {
            return self.parse_lambda();
        }
        let body = self.parse_or()?;
        if !self.eat(&TokenKind::If) {
            return Some(body);
        }
        let test = self.parse_or()?;
        self.expect(&TokenKind::Else)?;
        let orelse = self.parse_test()?;
        let span = body.span.merge(orelse.span);
        Some(Expr::new(
            ExprKind::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            },
            span,
        ))
    }

    /// `lambda params: test`
    fn parse_lambda(&mut self) -> Option<Expr> {
        let start = self.advance().span;
        let params = self.parse_params(&TokenKind::Colon)?;
        self.expect(&TokenKind::Colon)?;
        let saved_loops = std::mem::replace(&mut self.loop_depth, 0);
        self.function_depth += 1;
        let body = self.parse_test();
        self.function_depth -= 1;
        self.loop_depth = saved_loops;
        let body = body?;
        let span = start.merge(body.span);
        Some(Expr::new(
            ExprKind::Lambda {
                params,
                body: Box::new(body),
            },
            span,
        ))
    }

    // ══════════════════════════════════════════════════════════════════════════
    // Boolean Operators
    // ══════════════════════════════════════════════════════════════════════════

    fn parse_or(&mut self) -> Option<Expr> {
        self.parse_bool_chain(TokenKind::Or, BoolOp::Or, Self::parse_and)
    }

    fn parse_and(&mut self) -> Option<Expr> {
        self.parse_bool_chain(TokenKind::And, BoolOp::And, Self::parse_not)
    }

    fn parse_bool_chain(
        &mut self,
        token: TokenKind,
        op: BoolOp,
        operand: fn(&mut Self) -> Option<Expr>,
    ) -> Option<Expr> {
        let first = operand(self)?;
        if !self.check(&token) {
            return Some(first);
        }
        let mut values = vec![first];
        while self.eat(&token) {
            values.push(operand(self)?);
        }
        let span = values[0].span.merge(self.previous_span());
        Some(Expr::new(ExprKind::BoolOp { op, values }, span))
    }

    fn parse_not(&mut self) -> Option<Expr> {
        if self.check(&TokenKind::Not) {
            let start = self.advance().span;
            let operand = self.nested(Self::parse_not)?;
            let span = start.merge(operand.span);
            return Some(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.parse_comparison()
    }

    // ══════════════════════════════════════════════════════════════════════════
    // Comparisons & Arithmetic
    // ══════════════════════════════════════════════════════════════════════════

    fn parse_comparison(&mut self) -> Option<Expr> {
        let left = self.parse_arith()?;
        let mut ops = Vec::new();
        while let Some(op) = self.comparison_op() {
            let right = self.parse_arith()?;
            ops.push((op, right));
        }
        if ops.is_empty() {
            return Some(left);
        }
        let span = left.span.merge(self.previous_span());
        Some(Expr::new(
            ExprKind::Compare {
                left: Box::new(left),
                ops,
            },
            span,
        ))
    }

    /// Consume a comparison operator, including the two-word ones.
    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek_kind() {
            TokenKind::Less => CmpOp::Lt,
            TokenKind::LessEq => CmpOp::LtE,
            TokenKind::EqEq => CmpOp::Eq,
            TokenKind::NotEq => CmpOp::NotEq,
            TokenKind::Greater => CmpOp::Gt,
            TokenKind::GreaterEq => CmpOp::GtE,
            TokenKind::In => CmpOp::In,
            TokenKind::Not if *self.look_ahead(1) == TokenKind::In => {
                self.advance();
                CmpOp::NotIn
            }
            TokenKind::Is if *self.look_ahead(1) == TokenKind::Not => {
                self.advance();
                CmpOp::IsNot
            }
            TokenKind::Is => CmpOp::Is,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn parse_arith(&mut self) -> Option<Expr> {
        self.chained(Self::parse_arith_chain)
    }

    fn parse_arith_chain(&mut self) -> Option<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Some(left),
            };
            self.chain_link()?;
            self.advance();
            let right = self.parse_term()?;
            left = binary(left, op, right);
        }
    }

    fn parse_term(&mut self) -> Option<Expr> {
        self.chained(Self::parse_term_chain)
    }

    fn parse_term_chain(&mut self) -> Option<Expr> {
        let mut left = self.parse_factor()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::SlashSlash => BinOp::FloorDiv,
                TokenKind::Percent => BinOp::Mod,
                _ => return Some(left),
            };
            self.chain_link()?;
            self.advance();
            let right = self.parse_factor()?;
            left = binary(left, op, right);
        }
    }

    fn parse_factor(&mut self) -> Option<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Pos,
            _ => return self.parse_power(),
        };
        let start = self.advance().span;
        let operand = self.nested(Self::parse_factor)?;

        // `-1` is a single constant.
        if op == UnaryOp::Neg {
            match operand.kind {
                ExprKind::Int(v) if v != i64::MIN => {
                    return Some(Expr::new(ExprKind::Int(-v), start.merge(operand.span)))
                }
                ExprKind::Float(v) => {
                    return Some(Expr::new(ExprKind::Float(-v), start.merge(operand.span)))
                }
                _ => {}
            }
        }
        let span = start.merge(operand.span);
        Some(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        ))
    }

    fn parse_power(&mut self) -> Option<Expr> {
        let base = self.parse_postfix()?;
        if !self.eat(&TokenKind::StarStar) {
            return Some(base);
        }
        let exponent = self.nested(Self::parse_factor)?;
        Some(binary(base, BinOp::Pow, exponent))
    }

    // ══════════════════════════════════════════════════════════════════════════
    // Postfix & Atoms
    // ══════════════════════════════════════════════════════════════════════════

    /// Atom followed by any number of calls, attribute accesses and subscripts.
    pub(crate) fn parse_postfix(&mut self) -> Option<Expr> {
        self.chained(Self::parse_postfix_chain)
    }

    fn parse_postfix_chain(&mut self) -> Option<Expr> {
        let mut expr = self.parse_atom()?;
        loop {
            if matches!(
                self.peek_kind(),
                TokenKind::LParen | TokenKind::Dot | TokenKind::LBracket
            ) {
                self.chain_link()?;
            }
            match self.peek_kind() {
                TokenKind::LParen => {
                    self.advance();
                    let args = self.parse_call_args()?;
                    self.expect(&TokenKind::RParen)?;
                    let span = expr.span.merge(self.previous_span());
                    expr = Expr::new(
                        ExprKind::Call {
                            func: Box::new(expr),
                            args,
                        },
                        span,
                    );
                }
                TokenKind::Dot => {
                    self.advance();
                    let attr = self.expect_attribute()?;
                    let span = expr.span.merge(attr.span);
                    expr = Expr::new(
                        ExprKind::Attribute {
                            value: Box::new(expr),
                            attr,
                        },
                        span,
                    );
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_subscript()?;
                    self.expect(&TokenKind::RBracket)?;
                    let span = expr.span.merge(self.previous_span());
                    expr = Expr::new(
                        ExprKind::Subscript {
                            value: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    );
                }
                _ => return Some(expr),
            }
        }
    }

    fn parse_call_args(&mut self) -> Option<Vec<Expr>> {
        let mut args = Vec::new();
        while !self.check(&TokenKind::RParen) {
            if matches!(self.peek_kind(), TokenKind::Star | TokenKind::StarStar) {
                self.error_at_current(
                    ErrorCode::UNSUPPORTED_SYNTAX,
                    "argument unpacking is not supported",
                );
                return None;
            }
            if matches!(self.peek_kind(), TokenKind::Identifier(_))
                && *self.look_ahead(1) == TokenKind::Eq
            {
                self.error_at_current(
                    ErrorCode::UNSUPPORTED_SYNTAX,
                    "keyword arguments are not supported; pass arguments by position",
                );
                return None;
            }
            args.push(self.parse_test()?);
            self.reject_comprehension()?;
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        if args.len() > MAX_ARGUMENTS {
            self.error_at_current(
                ErrorCode::TOO_MANY_ARGUMENTS,
                format!("at most {MAX_ARGUMENTS} arguments are allowed"),
            );
        }
        Some(args)
    }

    /// Index expression inside `[...]`: a test, a slice, or a tuple of tests.
    fn parse_subscript(&mut self) -> Option<Expr> {
        let start = self.current_span();
        let lower = if self.check(&TokenKind::Colon) {
            None
        } else {
            let first = self.parse_test()?;
            if !self.check(&TokenKind::Colon) {
                if self.check(&TokenKind::Comma) {
                    let mut items = vec![first];
                    while self.eat(&TokenKind::Comma) {
                        if self.check(&TokenKind::RBracket) {
                            break;
                        }
                        items.push(self.parse_test()?);
                    }
                    let span = start.merge(self.previous_span());
                    return Some(Expr::new(ExprKind::Tuple(items), span));
                }
                return Some(first);
            }
            Some(Box::new(first))
        };

        self.expect(&TokenKind::Colon)?;
        let upper = self.parse_slice_part()?;
        let step = if self.eat(&TokenKind::Colon) {
            self.parse_slice_part()?
        } else {
            None
        };
        let span = start.merge(self.previous_span());
        Some(Expr::new(ExprKind::Slice { lower, upper, step }, span))
    }

    fn parse_slice_part(&mut self) -> Option<Option<Box<Expr>>> {
        if matches!(self.peek_kind(), TokenKind::Colon | TokenKind::RBracket) {
            Some(None)
        } else {
            Some(Some(Box::new(self.parse_test()?)))
        }
    }

    fn parse_atom(&mut self) -> Option<Expr> {
        let span = self.current_span();
        let kind = match self.peek_kind().clone() {
            TokenKind::Int(v) => {
                self.advance();
                ExprKind::Int(v)
            }
            TokenKind::Float(v) => {
                self.advance();
                ExprKind::Float(v)
            }
            TokenKind::Str(s) => {
                self.advance();
                let mut text = s;
                // Adjacent literals concatenate.
                while let TokenKind::Str(next) = self.peek_kind() {
                    text.push_str(next);
                    self.advance();
                }
                ExprKind::Str(text)
            }
            TokenKind::FStringStart(text) => {
                self.advance();
                return self.parse_fstring(text, span);
            }
            TokenKind::True => {
                self.advance();
                ExprKind::Bool(true)
            }
            TokenKind::False => {
                self.advance();
                ExprKind::Bool(false)
            }
            TokenKind::None => {
                self.advance();
                ExprKind::None
            }
            TokenKind::Identifier(name) => {
                self.advance();
                self.check_name(&name, span);
                ExprKind::Name(name)
            }
            TokenKind::LParen => return self.parse_paren(),
            TokenKind::LBracket => return self.parse_list_display(),
            TokenKind::LBrace => return self.parse_brace_display(),
            TokenKind::Reserved(word) => {
                self.error_at_current(
                    ErrorCode::UNSUPPORTED_SYNTAX,
                    format!("'{word}' is not supported in robot code"),
                );
                return None;
            }
            other => {
                self.error_at_current(
                    ErrorCode::UNEXPECTED_TOKEN,
                    format!("expected expression, got '{other}'"),
                );
                return None;
            }
        };
        Some(Expr::new(kind, span.merge(self.previous_span())))
    }

    /// `(` `)` is the empty tuple, `(x)` grouping, `(x,)` a tuple.
    fn parse_paren(&mut self) -> Option<Expr> {
        let start = self.advance().span;
        if self.eat(&TokenKind::RParen) {
            return Some(Expr::new(ExprKind::Tuple(Vec::new()), start.merge(self.previous_span())));
        }
        let first = self.parse_test()?;
        self.reject_comprehension()?;
        if self.eat(&TokenKind::RParen) {
            return Some(first);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.check(&TokenKind::RParen) {
                break;
            }
            items.push(self.parse_test()?);
        }
        self.expect(&TokenKind::RParen)?;
        Some(Expr::new(ExprKind::Tuple(items), start.merge(self.previous_span())))
    }

    fn parse_list_display(&mut self) -> Option<Expr> {
        let start = self.advance().span;
        let mut items = Vec::new();
        while !self.check(&TokenKind::RBracket) {
            items.push(self.parse_test()?);
            self.reject_comprehension()?;
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RBracket)?;
        Some(Expr::new(ExprKind::List(items), start.merge(self.previous_span())))
    }

    /// `{}` is an empty dict; `{k: v}` a dict; `{a, b}` a set.
    fn parse_brace_display(&mut self) -> Option<Expr> {
        let start = self.advance().span;
        if self.eat(&TokenKind::RBrace) {
            return Some(Expr::new(ExprKind::Dict(Vec::new()), start.merge(self.previous_span())));
        }
        let first = self.parse_test()?;
        let kind = if self.eat(&TokenKind::Colon) {
            let value = self.parse_test()?;
            self.reject_comprehension()?;
            let mut pairs = vec![(first, value)];
            while self.eat(&TokenKind::Comma) {
                if self.check(&TokenKind::RBrace) {
                    break;
                }
                let key = self.parse_test()?;
                self.expect(&TokenKind::Colon)?;
                let value = self.parse_test()?;
                pairs.push((key, value));
            }
            ExprKind::Dict(pairs)
        } else {
            self.reject_comprehension()?;
            let mut items = vec![first];
            while self.eat(&TokenKind::Comma) {
                if self.check(&TokenKind::RBrace) {
                    break;
                }
                items.push(self.parse_test()?);
            }
            ExprKind::Set(items)
        };
        self.expect(&TokenKind::RBrace)?;
        Some(Expr::new(kind, start.merge(self.previous_span())))
    }

    fn reject_comprehension(&mut self) -> Option<()> {
        if self.check(&TokenKind::For) {
            self.error_at_current(
                ErrorCode::UNSUPPORTED_SYNTAX,
                "comprehensions are not supported; use a for loop",
            );
            return None;
        }
        Some(())
    }

    /// Parse the remainder of an f-string after its `FStringStart`.
    fn parse_fstring(&mut self, first: String, start: Span) -> Option<Expr> {
        let mut parts = Vec::new();
        if !first.is_empty() {
            parts.push(FStringPart::Text(first));
        }
        loop {
            self.expect(&TokenKind::InterpolationStart)?;
            let value = self.parse_testlist()?;
            let spec = match self.peek_kind().clone() {
                TokenKind::FormatSpec(spec) => {
                    self.advance();
                    Some(spec)
                }
                _ => None,
            };
            self.expect(&TokenKind::InterpolationEnd)?;
            parts.push(FStringPart::Field { value, spec });

            match self.peek_kind().clone() {
                TokenKind::FStringPart(text) => {
                    self.advance();
                    if !text.is_empty() {
                        parts.push(FStringPart::Text(text));
                    }
                }
                TokenKind::FStringEnd(text) => {
                    self.advance();
                    if !text.is_empty() {
                        parts.push(FStringPart::Text(text));
                    }
                    break;
                }
                other => {
                    self.error_at_current(
                        ErrorCode::UNTERMINATED_STRING,
                        format!("expected end of f-string, got '{other}'"),
                    );
                    return None;
                }
            }
        }
        Some(Expr::new(ExprKind::FString(parts), start.merge(self.previous_span())))
    }
}

fn binary(left: Expr, op: BinOp, right: Expr) -> Expr {
    let span = left.span.merge(right.span);
    Expr::new(
        ExprKind::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        },
        span,
    )
}

/// Whether `kind` can begin an expression; used to tell `x, = ...` style
/// trailing commas apart from another element.
fn starts_expression(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Int(_)
            | TokenKind::Float(_)
            | TokenKind::Str(_)
            | TokenKind::FStringStart(_)
            | TokenKind::Identifier(_)
            | TokenKind::True
            | TokenKind::False
            | TokenKind::None
            | TokenKind::Not
            | TokenKind::Minus
            | TokenKind::Plus
            | TokenKind::LParen
            | TokenKind::LBracket
            | TokenKind::LBrace
            | TokenKind::Lambda
    )
}
