use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use super::ast::*;
use super::diagnostic::Diagnostic;
use super::lexer::{SpannedToken, Token, INT_MIN_MAGNITUDE};

/// Which language surface the parser accepts. Preview unlocks constructs
/// that are not yet part of the stable surface (currently `**`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum LanguageVersion {
    Stable,
    #[default]
    Preview,
}

impl LanguageVersion {
    pub fn label(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Preview => "preview",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    pub language_version: LanguageVersion,
}

/// Deepest nesting of expressions and statements the later passes accept.
/// Long operator chains count one level per operator.
pub const MAX_NESTING: usize = 256;

const TOO_COMPLEX: &str = "An expression is too long or complex to compile";

pub fn parse(tokens: Vec<SpannedToken>, options: ParseOptions) -> Result<Script, Vec<Diagnostic>> {
    let mut parser = Parser::new(tokens, options);
    parser.parse_script()
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    options: ParseOptions,
    errors: Vec<Diagnostic>,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<SpannedToken>, options: ParseOptions) -> Self {
        Self {
            tokens,
            pos: 0,
            options,
            errors: Vec::new(),
            depth: 0,
        }
    }

    fn parse_script(&mut self) -> Result<Script, Vec<Diagnostic>> {
        let mut items = Vec::new();

        while !self.at_eof() {
            let start = self.pos;
            self.depth = 0;
            let item = if self.at_fn_def() {
                self.parse_fn_def().map(Item::Function)
            } else {
                self.parse_top_level_stmt().map(Item::Stmt)
            };
            match item {
                Ok(item) => items.push(item),
                Err(e) => {
                    self.errors.push(e);
                    self.recover_from(start);
                }
            }
        }

        if self.errors.is_empty() {
            Ok(Script { items })
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).map_or(&Token::Eof, |t| &t.token)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).map_or(&Token::Eof, |t| &t.token)
    }

    fn span(&self) -> Span {
        self.tokens.get(self.pos).map_or(Span::new(0, 0), |t| t.span)
    }

    /// Span of the most recently consumed token.
    fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(Span::new(0, 0), |t| t.span)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len().saturating_sub(1) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span, Diagnostic> {
        if self.peek() == expected {
            let sp = self.span();
            self.advance();
            Ok(sp)
        } else {
            Err(Diagnostic::parser(
                format!("Expected {}, got {}", expected.describe(), self.peek().describe()),
                self.span(),
            ))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Span), Diagnostic> {
        if let Token::Ident(name) = self.peek().clone() {
            let sp = self.span();
            self.advance();
            Ok((name, sp))
        } else {
            Err(Diagnostic::parser(
                format!("Expected identifier, got {}", self.peek().describe()),
                self.span(),
            ))
        }
    }

    /// Enter one level of nesting.
    fn descend(&mut self) -> Result<(), Diagnostic> {
        self.depth += 1;
        self.check_depth(0)
    }

    fn ascend(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// `links` is the length of the operator chain being built at this level.
    fn check_depth(&self, links: usize) -> Result<(), Diagnostic> {
        if self.depth + links > MAX_NESTING {
            Err(Diagnostic::parser(TOO_COMPLEX, self.span()))
        } else {
            Ok(())
        }
    }

    /// Rewind to the start of the failed item and skip past it: up to the
    /// next `;` at brace depth zero, or past the brace block it opened.
    fn recover_from(&mut self, start: usize) {
        self.pos = start;
        let mut depth = 0usize;
        loop {
            match self.peek() {
                Token::Eof => break,
                Token::Semicolon if depth == 0 => {
                    self.advance();
                    break;
                }
                Token::LBrace => depth += 1,
                Token::RBrace => {
                    if depth <= 1 {
                        self.advance();
                        break;
                    }
                    depth -= 1;
                }
                _ => {}
            }
            self.advance();
        }
    }

    fn is_type_keyword(token: &Token) -> bool {
        matches!(
            token,
            Token::IntTy | Token::DoubleTy | Token::BoolTy | Token::StringTy | Token::VoidTy
        )
    }

    /// `T Name(` starts a function declaration.
    fn at_fn_def(&self) -> bool {
        Self::is_type_keyword(self.peek())
            && matches!(self.peek_at(1), Token::Ident(_))
            && matches!(self.peek_at(2), Token::LParen)
    }

    fn parse_type_name(&mut self) -> Result<TypeName, Diagnostic> {
        let ty = match self.peek() {
            Token::IntTy => TypeName::Int,
            Token::DoubleTy => TypeName::Double,
            Token::BoolTy => TypeName::Bool,
            Token::StringTy => TypeName::String,
            Token::VoidTy => TypeName::Void,
            _ => {
                return Err(Diagnostic::parser(
                    format!("Expected type name, got {}", self.peek().describe()),
                    self.span(),
                ))
            }
        };
        self.advance();
        Ok(ty)
    }

    // ── Function definitions ──────────────────────────────────────

    fn parse_fn_def(&mut self) -> Result<FnDef, Diagnostic> {
        let start = self.span();
        let return_type = self.parse_type_name()?;
        let (name, _) = self.expect_ident()?;
        self.expect(&Token::LParen)?;

        let mut params = Vec::new();
        while !matches!(self.peek(), Token::RParen | Token::Eof) {
            let pstart = self.span();
            let ty = self.parse_type_name()?;
            if ty == TypeName::Void {
                return Err(Diagnostic::parser("Parameters cannot have type 'void'", pstart));
            }
            let (pname, pspan) = self.expect_ident()?;
            params.push(FnParam {
                name: pname,
                ty,
                span: pstart.merge(pspan),
            });
            if matches!(self.peek(), Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(&Token::RParen)?;

        let body = if matches!(self.peek(), Token::FatArrow) {
            // Expression-bodied: `=> expr;`
            self.advance();
            let expr = self.parse_expr()?;
            let span = expr.span;
            self.expect(&Token::Semicolon)?;
            if return_type == TypeName::Void {
                vec![Stmt::Expr { expr, terminated: true }]
            } else {
                vec![Stmt::Return { value: Some(expr), span }]
            }
        } else {
            self.expect(&Token::LBrace)?;
            let stmts = self.parse_block_body()?;
            self.expect(&Token::RBrace)?;
            stmts
        };

        Ok(FnDef {
            name,
            params,
            return_type,
            body,
            span: start.merge(self.prev_span()),
        })
    }

    // ── Statements ────────────────────────────────────────────────

    /// A top-level statement. The final expression of the script may omit
    /// its `;`, which makes it the submission's result.
    fn parse_top_level_stmt(&mut self) -> Result<Stmt, Diagnostic> {
        if self.starts_declaration() || !self.starts_expression() {
            return self.parse_stmt();
        }
        let expr = self.parse_expr()?;
        match self.peek() {
            Token::Semicolon => {
                self.advance();
                Ok(Stmt::Expr { expr, terminated: true })
            }
            Token::Eof => Ok(Stmt::Expr { expr, terminated: false }),
            _ => Err(Diagnostic::parser(
                format!("Expected ';', got {}", self.peek().describe()),
                self.span(),
            )),
        }
    }

    fn starts_declaration(&self) -> bool {
        matches!(self.peek(), Token::Var)
            || (Self::is_type_keyword(self.peek()) && matches!(self.peek_at(1), Token::Ident(_)))
    }

    fn starts_expression(&self) -> bool {
        !matches!(
            self.peek(),
            Token::If
                | Token::While
                | Token::For
                | Token::Return
                | Token::Break
                | Token::Continue
                | Token::Throw
                | Token::LBrace
                | Token::Semicolon
        )
    }

    /// Statements up to (not including) the closing `}`.
    fn parse_block_body(&mut self) -> Result<Vec<Stmt>, Diagnostic> {
        let mut stmts = Vec::new();
        while !matches!(self.peek(), Token::RBrace | Token::Eof) {
            stmts.push(self.parse_stmt()?);
        }
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, Diagnostic> {
        self.descend()?;
        let stmt = self.parse_stmt_body();
        self.ascend();
        stmt
    }

    fn parse_stmt_body(&mut self) -> Result<Stmt, Diagnostic> {
        let start = self.span();
        match self.peek() {
            Token::LBrace => {
                self.advance();
                let stmts = self.parse_block_body()?;
                self.expect(&Token::RBrace)?;
                Ok(Stmt::Block {
                    stmts,
                    span: start.merge(self.prev_span()),
                })
            }
            Token::Semicolon => {
                self.advance();
                Ok(Stmt::Empty(start))
            }
            Token::If => {
                self.advance();
                self.expect(&Token::LParen)?;
                let condition = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                let then_branch = Box::new(self.parse_embedded_stmt()?);
                let else_branch = if matches!(self.peek(), Token::Else) {
                    self.advance();
                    Some(Box::new(self.parse_embedded_stmt()?))
                } else {
                    None
                };
                Ok(Stmt::If {
                    condition,
                    then_branch,
                    else_branch,
                    span: start.merge(self.prev_span()),
                })
            }
            Token::While => {
                self.advance();
                self.expect(&Token::LParen)?;
                let condition = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                let body = Box::new(self.parse_embedded_stmt()?);
                Ok(Stmt::While {
                    condition,
                    body,
                    span: start.merge(self.prev_span()),
                })
            }
            Token::For => self.parse_for(start),
            Token::Return => {
                self.advance();
                let value = if matches!(self.peek(), Token::Semicolon) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(&Token::Semicolon)?;
                Ok(Stmt::Return {
                    value,
                    span: start.merge(self.prev_span()),
                })
            }
            Token::Break => {
                self.advance();
                self.expect(&Token::Semicolon)?;
                Ok(Stmt::Break(start))
            }
            Token::Continue => {
                self.advance();
                self.expect(&Token::Semicolon)?;
                Ok(Stmt::Continue(start))
            }
            Token::Throw => {
                self.advance();
                let value = self.parse_expr()?;
                self.expect(&Token::Semicolon)?;
                Ok(Stmt::Throw {
                    value,
                    span: start.merge(self.prev_span()),
                })
            }
            _ if self.at_fn_def() => Err(Diagnostic::parser(
                "Functions can only be declared at the top level of a submission",
                start,
            )),
            _ if self.starts_declaration() => {
                let stmt = self.parse_let()?;
                self.expect(&Token::Semicolon)?;
                Ok(stmt)
            }
            _ => {
                let expr = self.parse_expr()?;
                self.expect(&Token::Semicolon)?;
                Ok(Stmt::Expr { expr, terminated: true })
            }
        }
    }

    /// Body of `if`/`while`/`for`. A bare declaration is not allowed there.
    fn parse_embedded_stmt(&mut self) -> Result<Stmt, Diagnostic> {
        if self.starts_declaration() {
            return Err(Diagnostic::parser(
                "Embedded statement cannot be a declaration",
                self.span(),
            ));
        }
        self.parse_stmt()
    }

    /// `var x = e`, `T x`, `T x = e` without the trailing `;`.
    fn parse_let(&mut self) -> Result<Stmt, Diagnostic> {
        let start = self.span();
        let ty = if matches!(self.peek(), Token::Var) {
            self.advance();
            None
        } else {
            let ty = self.parse_type_name()?;
            if ty == TypeName::Void {
                return Err(Diagnostic::parser("Variables cannot have type 'void'", start));
            }
            Some(ty)
        };
        let (name, name_span) = self.expect_ident()?;
        let value = if matches!(self.peek(), Token::Eq) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };
        let end = value.as_ref().map_or(name_span, |v| v.span);
        Ok(Stmt::Let {
            name,
            ty,
            value,
            span: start.merge(end),
        })
    }

    fn parse_for(&mut self, start: Span) -> Result<Stmt, Diagnostic> {
        self.expect(&Token::For)?;
        self.expect(&Token::LParen)?;

        let init = if matches!(self.peek(), Token::Semicolon) {
            None
        } else if self.starts_declaration() {
            Some(Box::new(self.parse_let()?))
        } else {
            let expr = self.parse_expr()?;
            Some(Box::new(Stmt::Expr { expr, terminated: true }))
        };
        self.expect(&Token::Semicolon)?;

        let condition = if matches!(self.peek(), Token::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(&Token::Semicolon)?;

        let mut step = Vec::new();
        if !matches!(self.peek(), Token::RParen) {
            step.push(self.parse_expr()?);
            while matches!(self.peek(), Token::Comma) {
                self.advance();
                step.push(self.parse_expr()?);
            }
        }
        self.expect(&Token::RParen)?;
        let body = Box::new(self.parse_embedded_stmt()?);

        Ok(Stmt::For {
            init,
            condition,
            step,
            body,
            span: start.merge(self.prev_span()),
        })
    }

    // ── Expression parsing (precedence climbing) ──────────────────

    fn parse_expr(&mut self) -> Result<Expr, Diagnostic> {
        self.descend()?;
        let expr = self.parse_assignment();
        self.ascend();
        expr
    }

    fn parse_assignment(&mut self) -> Result<Expr, Diagnostic> {
        let target = self.parse_conditional()?;

        let op = match self.peek() {
            Token::Eq => None,
            Token::PlusEq => Some(BinOp::Add),
            Token::MinusEq => Some(BinOp::Sub),
            Token::StarEq => Some(BinOp::Mul),
            Token::SlashEq => Some(BinOp::Div),
            Token::PercentEq => Some(BinOp::Mod),
            _ => return Ok(target),
        };
        if !matches!(target.kind, ExprKind::Ident(_)) {
            return Err(Diagnostic::parser(
                "The left-hand side of an assignment must be a variable",
                target.span,
            ));
        }
        self.advance();
        // Right-associative: a = b = c
        let value = self.parse_expr()?;
        let span = target.span.merge(value.span);
        Ok(Expr {
            kind: ExprKind::Assign {
                op,
                target: Box::new(target),
                value: Box::new(value),
            },
            span,
        })
    }

    fn parse_conditional(&mut self) -> Result<Expr, Diagnostic> {
        let condition = self.parse_or()?;
        if !matches!(self.peek(), Token::Question) {
            return Ok(condition);
        }
        self.advance();
        let then_expr = self.parse_expr()?;
        self.expect(&Token::Colon)?;
        let else_expr = self.parse_expr()?;
        let span = condition.span.merge(else_expr.span);
        Ok(Expr {
            kind: ExprKind::Conditional {
                condition: Box::new(condition),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
            span,
        })
    }

    fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
        let span = left.span.merge(right.span);
        Expr {
            kind: ExprKind::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        }
    }

    /// Left-deep chains nest one level per operator.
    fn link(&self, links: &mut usize) -> Result<(), Diagnostic> {
        *links += 1;
        self.check_depth(*links)
    }

    fn parse_or(&mut self) -> Result<Expr, Diagnostic> {
        let mut left = self.parse_and()?;
        let mut links = 0;
        while matches!(self.peek(), Token::Or) {
            self.link(&mut links)?;
            self.advance();
            let right = self.parse_and()?;
            left = Self::binary(BinOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, Diagnostic> {
        let mut left = self.parse_equality()?;
        let mut links = 0;
        while matches!(self.peek(), Token::And) {
            self.link(&mut links)?;
            self.advance();
            let right = self.parse_equality()?;
            left = Self::binary(BinOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, Diagnostic> {
        let mut left = self.parse_comparison()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinOp::Eq,
                Token::Ne => BinOp::Ne,
                _ => break,
            };
            self.link(&mut links)?;
            self.advance();
            let right = self.parse_comparison()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, Diagnostic> {
        let mut left = self.parse_add()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Token::Lt => BinOp::Lt,
                Token::Gt => BinOp::Gt,
                Token::Le => BinOp::Le,
                Token::Ge => BinOp::Ge,
                _ => break,
            };
            self.link(&mut links)?;
            self.advance();
            let right = self.parse_add()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_add(&mut self) -> Result<Expr, Diagnostic> {
        let mut left = self.parse_mul()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.link(&mut links)?;
            self.advance();
            let right = self.parse_mul()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Expr, Diagnostic> {
        let mut left = self.parse_power()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.link(&mut links)?;
            self.advance();
            let right = self.parse_power()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_power(&mut self) -> Result<Expr, Diagnostic> {
        let left = self.parse_unary()?;
        if !matches!(self.peek(), Token::StarStar) {
            return Ok(left);
        }
        let op_span = self.span();
        if self.options.language_version == LanguageVersion::Stable {
            // Keep parsing so later errors in the same fragment still surface.
            self.errors.push(Diagnostic::parser(
                "Feature 'exponent operator' is not available in the stable language version. Use language version 'preview'.",
                op_span,
            ));
        }
        self.advance();
        // Right-associative: recurse into parse_power (not parse_unary)
        self.descend()?;
        let right = self.parse_power();
        self.ascend();
        Ok(Self::binary(BinOp::Pow, left, right?))
    }

    fn parse_unary(&mut self) -> Result<Expr, Diagnostic> {
        self.descend()?;
        let expr = self.parse_prefixed();
        self.ascend();
        expr
    }

    fn parse_prefixed(&mut self) -> Result<Expr, Diagnostic> {
        let start = self.span();
        match self.peek() {
            // `-2147483648` is the one literal that only fits once negated.
            Token::Minus if matches!(self.peek_at(1), Token::Int(INT_MIN_MAGNITUDE)) => {
                self.advance();
                let span = start.merge(self.span());
                self.advance();
                Ok(Expr { kind: ExprKind::IntLit(i32::MIN), span })
            }
            Token::Minus | Token::Bang => {
                let op = if matches!(self.peek(), Token::Minus) { UnaryOp::Neg } else { UnaryOp::Not };
                self.advance();
                let operand = self.parse_unary()?;
                let span = start.merge(operand.span);
                Ok(Expr {
                    kind: ExprKind::UnaryOp {
                        op,
                        operand: Box::new(operand),
                    },
                    span,
                })
            }
            Token::Plus => {
                self.advance();
                self.parse_unary()
            }
            Token::PlusPlus | Token::MinusMinus => {
                let increment = matches!(self.peek(), Token::PlusPlus);
                self.advance();
                let target = self.parse_unary()?;
                Self::inc_dec(target, increment, true, start)
            }
            // Cast: `(int)x`, `(double)x`, `(string)x`, `(bool)x`
            Token::LParen
                if Self::is_type_keyword(self.peek_at(1))
                    && !matches!(self.peek_at(1), Token::VoidTy)
                    && matches!(self.peek_at(2), Token::RParen) =>
            {
                self.advance();
                let ty = self.parse_type_name()?;
                self.expect(&Token::RParen)?;
                let operand = self.parse_unary()?;
                let span = start.merge(operand.span);
                Ok(Expr {
                    kind: ExprKind::Cast {
                        ty,
                        operand: Box::new(operand),
                    },
                    span,
                })
            }
            _ => self.parse_postfix(),
        }
    }

    fn inc_dec(target: Expr, increment: bool, prefix: bool, start: Span) -> Result<Expr, Diagnostic> {
        if !matches!(target.kind, ExprKind::Ident(_)) {
            return Err(Diagnostic::parser(
                "The operand of an increment or decrement operator must be a variable",
                target.span,
            ));
        }
        let span = start.merge(target.span);
        Ok(Expr {
            kind: ExprKind::IncDec {
                target: Box::new(target),
                increment,
                prefix,
            },
            span,
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr, Diagnostic> {
        let mut expr = self.parse_primary()?;
        let mut links = 0;

        loop {
            match self.peek() {
                Token::Dot => {
                    self.link(&mut links)?;
                    self.advance();
                    let (field, field_span) = self.expect_ident()?;
                    // Check if it's a method call: obj.method(args)
                    if matches!(self.peek(), Token::LParen) {
                        self.advance();
                        let args = self.parse_args()?;
                        let span = expr.span.merge(self.prev_span());
                        expr = Expr {
                            kind: ExprKind::MethodCall {
                                object: Box::new(expr),
                                method: field,
                                args,
                            },
                            span,
                        };
                    } else {
                        let span = expr.span.merge(field_span);
                        expr = Expr {
                            kind: ExprKind::Field {
                                object: Box::new(expr),
                                field,
                            },
                            span,
                        };
                    }
                }
                Token::LParen if matches!(expr.kind, ExprKind::Ident(_)) => {
                    if let ExprKind::Ident(name) = &expr.kind {
                        let name = name.clone();
                        self.advance();
                        let args = self.parse_args()?;
                        let span = expr.span.merge(self.prev_span());
                        expr = Expr {
                            kind: ExprKind::Call { name, args },
                            span,
                        };
                    }
                }
                Token::PlusPlus | Token::MinusMinus => {
                    let increment = matches!(self.peek(), Token::PlusPlus);
                    let end = self.span();
                    self.advance();
                    let start = expr.span;
                    expr = Self::inc_dec(expr, increment, false, start.merge(end))?;
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, Diagnostic> {
        let mut args = Vec::new();
        if !matches!(self.peek(), Token::RParen) {
            args.push(self.parse_expr()?);
            while matches!(self.peek(), Token::Comma) {
                self.advance();
                args.push(self.parse_expr()?);
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, Diagnostic> {
        let span = self.span();
        match self.peek().clone() {
            Token::Float(v) => {
                self.advance();
                Ok(Expr { kind: ExprKind::FloatLit(v), span })
            }
            Token::Int(v) => {
                let v = i32::try_from(v).map_err(|_| {
                    Diagnostic::parser(format!("Integral constant is too large: {v}"), span)
                })?;
                self.advance();
                Ok(Expr { kind: ExprKind::IntLit(v), span })
            }
            Token::String(s) => {
                self.advance();
                Ok(Expr { kind: ExprKind::StringLit(s), span })
            }
            Token::True => {
                self.advance();
                Ok(Expr { kind: ExprKind::BoolLit(true), span })
            }
            Token::False => {
                self.advance();
                Ok(Expr { kind: ExprKind::BoolLit(false), span })
            }
            Token::Null => {
                self.advance();
                Ok(Expr { kind: ExprKind::Null, span })
            }
            Token::Ident(name) => {
                self.advance();
                Ok(Expr { kind: ExprKind::Ident(name), span })
            }
            Token::LParen => {
                self.advance();
                let mut expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                expr.span = span.merge(self.prev_span());
                Ok(expr)
            }
            Token::New => {
                self.advance();
                // Qualified type names are allowed: `new System.Exception("x")`
                let (mut type_name, _) = self.expect_ident()?;
                while matches!(self.peek(), Token::Dot) {
                    self.advance();
                    let (segment, _) = self.expect_ident()?;
                    type_name.push('.');
                    type_name.push_str(&segment);
                }
                self.expect(&Token::LParen)?;
                let args = self.parse_args()?;
                Ok(Expr {
                    kind: ExprKind::New { type_name, args },
                    span: span.merge(self.prev_span()),
                })
            }
            _ => Err(Diagnostic::parser(
                format!("Expected expression, got {}", self.peek().describe()),
                self.span(),
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::script::lexer::lex;

    fn parse_str(s: &str) -> Script {
        let tokens = lex(s).unwrap();
        parse(tokens, ParseOptions::default()).unwrap()
    }

    fn parse_err(s: &str, options: ParseOptions) -> Vec<Diagnostic> {
        let tokens = lex(s).unwrap();
        parse(tokens, options).unwrap_err()
    }

    fn only_stmt(script: &Script) -> &Stmt {
        assert_eq!(script.items.len(), 1);
        match &script.items[0] {
            Item::Stmt(s) => s,
            Item::Function(_) => panic!("expected statement"),
        }
    }

    #[test]
    fn trailing_expression_is_unterminated() {
        let script = parse_str("1+1");
        let Stmt::Expr { expr, terminated } = only_stmt(&script) else {
            panic!("expected expression statement");
        };
        assert!(!terminated);
        assert!(matches!(expr.kind, ExprKind::BinOp { op: BinOp::Add, .. }));
    }

    #[test]
    fn unterminated_expression_must_be_last() {
        let errors = parse_err("1 + 1 var x = 2;", ParseOptions::default());
        assert!(errors[0].message.contains("Expected ';'"));
    }

    #[test]
    fn var_and_typed_declarations() {
        let script = parse_str("var x = 10; int y; string s = \"a\";");
        assert_eq!(script.items.len(), 3);
        let Item::Stmt(Stmt::Let { name, ty, value, .. }) = &script.items[0] else {
            panic!("expected let");
        };
        assert_eq!(name, "x");
        assert!(ty.is_none());
        assert!(value.is_some());
        let Item::Stmt(Stmt::Let { ty, value, .. }) = &script.items[1] else {
            panic!("expected let");
        };
        assert_eq!(*ty, Some(TypeName::Int));
        assert!(value.is_none());
    }

    #[test]
    fn incomplete_declaration_is_error() {
        let errors = parse_err("int y = ", ParseOptions::default());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("Expected expression"));
        assert_eq!(errors[0].span.start, 8);
    }

    #[test]
    fn block_and_expression_bodied_functions() {
        let script = parse_str("int sq(int x) => x * x; void hi() { WriteLine(\"hi\"); }");
        let Item::Function(sq) = &script.items[0] else { panic!("expected fn") };
        assert_eq!(sq.name, "sq");
        assert_eq!(sq.params.len(), 1);
        assert!(matches!(sq.body[0], Stmt::Return { .. }));
        let Item::Function(hi) = &script.items[1] else { panic!("expected fn") };
        assert_eq!(hi.return_type, TypeName::Void);
        assert!(hi.params.is_empty());
    }

    #[test]
    fn nested_function_rejected() {
        let errors = parse_err("{ int f() => 1; }", ParseOptions::default());
        assert!(errors[0].message.contains("top level"));
    }

    #[test]
    fn precedence_mul_over_add() {
        let script = parse_str("1 + 2 * 3");
        let Stmt::Expr { expr, .. } = only_stmt(&script) else { panic!() };
        let ExprKind::BinOp { op, right, .. } = &expr.kind else { panic!() };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(right.kind, ExprKind::BinOp { op: BinOp::Mul, .. }));
    }

    #[test]
    fn power_is_right_associative() {
        let script = parse_str("2 ** 3 ** 2");
        let Stmt::Expr { expr, .. } = only_stmt(&script) else { panic!() };
        let ExprKind::BinOp { op, left, right } = &expr.kind else { panic!() };
        assert_eq!(*op, BinOp::Pow);
        assert!(matches!(left.kind, ExprKind::IntLit(2)));
        assert!(matches!(right.kind, ExprKind::BinOp { op: BinOp::Pow, .. }));
    }

    #[test]
    fn power_gated_under_stable() {
        let options = ParseOptions {
            language_version: LanguageVersion::Stable,
        };
        let errors = parse_err("2 ** 3", options);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("preview"));
    }

    #[test]
    fn assignment_is_right_associative() {
        let script = parse_str("a = b += 2;");
        let Stmt::Expr { expr, .. } = only_stmt(&script) else { panic!() };
        let ExprKind::Assign { op, value, .. } = &expr.kind else { panic!() };
        assert!(op.is_none());
        assert!(matches!(value.kind, ExprKind::Assign { op: Some(BinOp::Add), .. }));
    }

    #[test]
    fn assignment_target_must_be_variable() {
        let errors = parse_err("1 = 2;", ParseOptions::default());
        assert!(errors[0].message.contains("left-hand side"));
    }

    #[test]
    fn casts_and_parenthesised_expressions() {
        let script = parse_str("(int)2.5 + (x)");
        let Stmt::Expr { expr, .. } = only_stmt(&script) else { panic!() };
        let ExprKind::BinOp { left, right, .. } = &expr.kind else { panic!() };
        assert!(matches!(left.kind, ExprKind::Cast { ty: TypeName::Int, .. }));
        assert!(matches!(right.kind, ExprKind::Ident(_)));
    }

    #[test]
    fn qualified_method_call() {
        let script = parse_str("System.Console.WriteLine(1);");
        let Stmt::Expr { expr, .. } = only_stmt(&script) else { panic!() };
        let ExprKind::MethodCall { object, method, args } = &expr.kind else { panic!() };
        assert_eq!(method, "WriteLine");
        assert_eq!(args.len(), 1);
        assert!(matches!(object.kind, ExprKind::Field { .. }));
    }

    #[test]
    fn increment_forms() {
        let script = parse_str("i++; --j;");
        let Item::Stmt(Stmt::Expr { expr, .. }) = &script.items[0] else { panic!() };
        assert!(matches!(expr.kind, ExprKind::IncDec { increment: true, prefix: false, .. }));
        let Item::Stmt(Stmt::Expr { expr, .. }) = &script.items[1] else { panic!() };
        assert!(matches!(expr.kind, ExprKind::IncDec { increment: false, prefix: true, .. }));
    }

    #[test]
    fn control_flow_statements() {
        let script = parse_str(
            "for (int i = 0; i < 3; i++) { if (i == 1) continue; else break; } while (true) ;",
        );
        assert!(matches!(script.items[0], Item::Stmt(Stmt::For { .. })));
        assert!(matches!(script.items[1], Item::Stmt(Stmt::While { .. })));
    }

    #[test]
    fn throw_new_exception() {
        let script = parse_str("throw new Exception(\"boom\");");
        let Stmt::Throw { value, .. } = only_stmt(&script) else { panic!() };
        let ExprKind::New { type_name, args } = &value.kind else { panic!() };
        assert_eq!(type_name, "Exception");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn conditional_expression() {
        let script = parse_str("x > 0 ? \"pos\" : \"neg\"");
        let Stmt::Expr { expr, .. } = only_stmt(&script) else { panic!() };
        assert!(matches!(expr.kind, ExprKind::Conditional { .. }));
    }

    #[test]
    fn recovery_reports_each_bad_statement() {
        let errors = parse_err("var = 1; int ok = 2; if (;", ParseOptions::default());
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn int_min_literal_folds_under_minus() {
        let script = parse_str("-2147483648");
        let Stmt::Expr { expr, .. } = only_stmt(&script) else { panic!() };
        assert!(matches!(expr.kind, ExprKind::IntLit(i32::MIN)));
        assert_eq!(expr.span.end, 11);

        let errors = parse_err("2147483648;", ParseOptions::default());
        assert_eq!(errors[0].message, "Integral constant is too large: 2147483648");
        let errors = parse_err("-(2147483648);", ParseOptions::default());
        assert!(errors[0].message.contains("too large"));
    }

    #[test]
    fn nesting_past_the_limit_is_one_error() {
        let source = format!("0{};", " + 1".repeat(MAX_NESTING + 10));
        let errors = parse_err(&source, ParseOptions::default());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "An expression is too long or complex to compile");

        let source = format!("0{};", " + 1".repeat(MAX_NESTING / 2));
        parse_str(&source);
    }

    #[test]
    fn empty_script() {
        assert!(parse_str("").items.is_empty());
        assert!(parse_str("  // nothing\n").items.is_empty());
    }
}
