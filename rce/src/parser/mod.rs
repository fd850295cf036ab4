//! Recursive-descent parser for method descriptions
//!
//! ```text
//! method fill {
//!     param off: i32 in [-10, 10];
//!     array a: 199;
//!     for i: i32 = 0; i < 100; i += 1 {
//!         check c0 @4: a[2 * i + off];
//!         store s0 @6: a[2 * i + off] after c0;
//!         if i < -100000 || i > 100000 throw IllegalArgument @8;
//!         break if i == 50;
//!     }
//! }
//! ```
//!
//! Expression precedence, loosest first: `<<`, then `+ -`, then `*`, then
//! unary `-` and `(long)`.

mod expr;

#[cfg(test)]
mod tests;

pub use expr::{BinOp, Expr};

use std::collections::HashMap;

use crate::error::{RceError, Result};
use crate::ir::{
    ArrayId, BranchAction, CheckId, CheckMode, CmpOp, Compare, ExceptionKind, Method, MethodBuilder, NodeId,
    TestShape,
};
use crate::lexer::{tokenize, Span, Token};
use crate::range::{IntRange, Width};

use expr::{lower, lower_expr, Names, Spanned};

/// Parse every method in `source`
pub fn parse(source: &str) -> Result<Vec<Method>> {
    let tokens = tokenize(source)?;
    Parser::new(tokens, source.len()).program()
}

/// Parse a source holding exactly one method
pub fn parse_method(source: &str) -> Result<Method> {
    let mut methods = parse(source)?;
    match methods.len() {
        1 => methods.pop().ok_or_else(|| RceError::parser("expected a method", Span::new(0, 0))),
        0 => Err(RceError::parser("expected a method", Span::new(0, source.len()))),
        n => Err(RceError::parser(format!("expected one method, found {n}"), Span::new(0, source.len()))),
    }
}

/// Declarations visible inside one method
#[derive(Default)]
struct Scope {
    names: Names,
    arrays: HashMap<String, (ArrayId, NodeId)>,
    checks: HashMap<String, CheckId>,
    stores: HashMap<String, Span>,
}

struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    eof: Span,
}

impl Parser {
    fn new(tokens: Vec<(Token, Span)>, len: usize) -> Self {
        Parser { tokens, pos: 0, eof: Span::new(len, len) }
    }

    // ========================================================================
    // Token helpers
    // ========================================================================

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn span(&self) -> Span {
        self.tokens.get(self.pos).map(|(_, s)| *s).unwrap_or(self.eof)
    }

    fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|p| self.tokens.get(p))
            .map(|(_, s)| *s)
            .unwrap_or(self.eof)
    }

    fn at(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.at(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<Span> {
        if self.eat(&token) {
            Ok(self.prev_span())
        } else {
            Err(self.unexpected(&format!("`{token}`")))
        }
    }

    fn unexpected(&self, expected: &str) -> RceError {
        match self.peek() {
            Some(found) => RceError::parser(format!("expected {expected}, found `{found}`"), self.span()),
            None => RceError::parser(format!("expected {expected}, found end of input"), self.eof),
        }
    }

    fn ident(&mut self) -> Result<Spanned<String>> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(Spanned::new(name, self.prev_span()))
            }
            _ => Err(self.unexpected("an identifier")),
        }
    }

    /// Unsigned integer literal, without suffix
    fn magnitude(&mut self) -> Result<(i128, Span)> {
        match self.peek() {
            Some(Token::IntLit(n)) | Some(Token::LongLit(n)) => {
                let n = *n;
                self.pos += 1;
                Ok((n, self.prev_span()))
            }
            _ => Err(self.unexpected("an integer")),
        }
    }

    fn signed_literal(&mut self) -> Result<(i128, Span)> {
        let start = self.span();
        let negative = self.eat(&Token::Minus);
        let (n, end) = self.magnitude()?;
        Ok((if negative { -n } else { n }, start.to(end)))
    }

    fn width(&mut self) -> Result<Width> {
        if self.eat(&Token::TyI32) {
            Ok(Width::I32)
        } else if self.eat(&Token::TyI64) {
            Ok(Width::I64)
        } else {
            Err(self.unexpected("`i32` or `i64`"))
        }
    }

    fn bci(&mut self) -> Result<u32> {
        self.expect(Token::At)?;
        let (n, span) = self.magnitude()?;
        u32::try_from(n).map_err(|_| RceError::parser("bytecode index out of range", span))
    }

    fn cmp_op(&mut self) -> Result<CmpOp> {
        let op = match self.peek() {
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::LtEq) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::GtEq) => CmpOp::Ge,
            Some(Token::EqEq) => CmpOp::Eq,
            Some(Token::NotEq) => CmpOp::Ne,
            _ => return Err(self.unexpected("a comparison operator")),
        };
        self.pos += 1;
        Ok(op)
    }

    // ========================================================================
    // Declarations and statements
    // ========================================================================

    fn program(&mut self) -> Result<Vec<Method>> {
        let mut methods = Vec::new();
        while self.peek().is_some() {
            methods.push(self.method()?);
        }
        Ok(methods)
    }

    fn method(&mut self) -> Result<Method> {
        self.expect(Token::Method)?;
        let name = self.ident()?;
        self.expect(Token::LBrace)?;
        let mut b = MethodBuilder::new(&name.node);
        let mut scope = Scope::default();
        while !self.eat(&Token::RBrace) {
            if self.peek().is_none() {
                return Err(self.unexpected("`}`"));
            }
            self.statement(&mut b, &mut scope)?;
        }
        b.finish()
    }

    fn statement(&mut self, b: &mut MethodBuilder, scope: &mut Scope) -> Result<()> {
        match self.peek() {
            Some(Token::Param) => self.param(b, scope),
            Some(Token::Array) => self.array(b, scope),
            Some(Token::For) => self.for_loop(b, scope),
            Some(Token::Check) => self.check(b, scope),
            Some(Token::Store) => self.store(b, scope),
            Some(Token::If) => self.branch(b, scope),
            Some(Token::Break) => self.break_if(b, scope),
            _ => Err(self.unexpected("a statement")),
        }
    }

    /// `param off: i32 in [-10, 10];`
    fn param(&mut self, b: &mut MethodBuilder, scope: &mut Scope) -> Result<()> {
        self.expect(Token::Param)?;
        let name = self.ident()?;
        self.expect(Token::Colon)?;
        let width = self.width()?;
        let range = if self.eat(&Token::In) {
            self.expect(Token::LBracket)?;
            let (lo, lo_span) = self.signed_literal()?;
            self.expect(Token::Comma)?;
            let (hi, hi_span) = self.signed_literal()?;
            self.expect(Token::RBracket)?;
            let span = lo_span.to(hi_span);
            if !width.fits(lo) || !width.fits(hi) || lo > hi {
                return Err(RceError::parser(format!("[{lo}, {hi}] is not a valid {width} range"), span));
            }
            IntRange::new(lo as i64, hi as i64, width)
        } else {
            IntRange::bottom(width)
        };
        self.expect(Token::Semi)?;
        let id = b.param(&name.node, range);
        scope.names.push(name.node, id);
        Ok(())
    }

    /// `array a: n + 1;`
    fn array(&mut self, b: &mut MethodBuilder, scope: &mut Scope) -> Result<()> {
        self.expect(Token::Array)?;
        let name = self.ident()?;
        self.expect(Token::Colon)?;
        let length = self.expr()?;
        self.expect(Token::Semi)?;
        if scope.arrays.contains_key(&name.node) {
            return Err(RceError::parser(format!("array `{}` declared twice", name.node), name.span));
        }
        let length = lower_expr(b, &scope.names, &length, None)?;
        let id = b.array(&name.node, length);
        scope.arrays.insert(name.node, (id, length));
        Ok(())
    }

    /// `for i: i32 = 0; i < n; i += 1 { ... }`
    fn for_loop(&mut self, b: &mut MethodBuilder, scope: &mut Scope) -> Result<()> {
        self.expect(Token::For)?;
        let name = self.ident()?;
        self.expect(Token::Colon)?;
        let width = self.width()?;
        self.expect(Token::Eq)?;
        let init = self.expr()?;
        self.expect(Token::Semi)?;

        let tested = self.ident()?;
        if tested.node != name.node {
            return Err(RceError::parser(
                format!("loop test must compare `{}`", name.node),
                tested.span,
            ));
        }
        let test = self.cmp_op()?;
        let limit = self.expr()?;
        self.expect(Token::Semi)?;

        let stepped = self.ident()?;
        if stepped.node != name.node {
            return Err(RceError::parser(format!("loop must step `{}`", name.node), stepped.span));
        }
        let negate = if self.eat(&Token::MinusEq) {
            true
        } else {
            self.expect(Token::PlusEq)?;
            false
        };
        let (magnitude, stride_span) = self.signed_literal()?;
        let stride = if negate { -magnitude } else { magnitude };
        if stride == 0 || !width.fits(stride) {
            return Err(RceError::parser(format!("invalid {width} stride {stride}"), stride_span));
        }

        let init = lower(b, &scope.names, &init, width)?;
        let limit = lower(b, &scope.names, &limit, width)?;
        let (_, iv) = b.begin_loop(&name.node, width, init, limit, stride as i64, test);

        let depth = scope.names.depth();
        scope.names.push(name.node, iv);
        self.expect(Token::LBrace)?;
        while !self.eat(&Token::RBrace) {
            if self.peek().is_none() {
                return Err(self.unexpected("`}`"));
            }
            self.statement(b, scope)?;
        }
        scope.names.truncate(depth);
        b.end_loop()?;
        Ok(())
    }

    /// `a[expr]`, returning the array and its index
    fn access(&mut self, b: &mut MethodBuilder, scope: &Scope) -> Result<(ArrayId, NodeId)> {
        let array = self.ident()?;
        let (id, length) = *scope
            .arrays
            .get(&array.node)
            .ok_or_else(|| RceError::parser(format!("unknown array `{}`", array.node), array.span))?;
        self.expect(Token::LBracket)?;
        let index = self.expr()?;
        self.expect(Token::RBracket)?;
        let width = b.graph().width(length);
        let node = lower(b, &scope.names, &index, width)?;
        Ok((id, node))
    }

    /// `check c0 @4: a[i] unsigned;`
    fn check(&mut self, b: &mut MethodBuilder, scope: &mut Scope) -> Result<()> {
        self.expect(Token::Check)?;
        let name = self.ident()?;
        if scope.checks.contains_key(&name.node) {
            return Err(RceError::parser(format!("check `{}` declared twice", name.node), name.span));
        }
        let bci = self.bci()?;
        self.expect(Token::Colon)?;
        let (array, index) = self.access(b, scope)?;
        let mode = if self.eat(&Token::Unsigned) {
            CheckMode::UnsignedSubFoldable
        } else {
            CheckMode::Signed
        };
        self.expect(Token::Semi)?;
        let id = b.check(&name.node, array, index, mode, bci);
        scope.checks.insert(name.node, id);
        Ok(())
    }

    /// `store s0 @6: a[i] after c0, c1;`
    fn store(&mut self, b: &mut MethodBuilder, scope: &mut Scope) -> Result<()> {
        self.expect(Token::Store)?;
        let name = self.ident()?;
        if scope.stores.contains_key(&name.node) {
            return Err(RceError::parser(format!("store `{}` declared twice", name.node), name.span));
        }
        let bci = self.bci()?;
        self.expect(Token::Colon)?;
        let (array, index) = self.access(b, scope)?;
        let mut guarded_by = Vec::new();
        if self.eat(&Token::After) {
            loop {
                let check = self.ident()?;
                let id = scope
                    .checks
                    .get(&check.node)
                    .copied()
                    .ok_or_else(|| RceError::parser(format!("unknown check `{}`", check.node), check.span))?;
                guarded_by.push(id);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::Semi)?;
        b.store(&name.node, array, index, bci, &guarded_by);
        scope.stores.insert(name.node, name.span);
        Ok(())
    }

    /// `lhs op rhs`, both sides lowered at a common width
    fn compare(&mut self, b: &mut MethodBuilder, scope: &Scope) -> Result<Compare> {
        let lhs = self.expr()?;
        let op = self.cmp_op()?;
        let rhs = self.expr()?;
        let width = expr::infer(b, &scope.names, &lhs)
            .or_else(|| expr::infer(b, &scope.names, &rhs))
            .unwrap_or(Width::I32);
        let value = lower(b, &scope.names, &lhs, width)?;
        let bound = lower(b, &scope.names, &rhs, width)?;
        Ok(Compare { value, op, bound })
    }

    /// `if x < lo || x > hi throw IllegalArgument @8;`
    fn branch(&mut self, b: &mut MethodBuilder, scope: &mut Scope) -> Result<()> {
        self.expect(Token::If)?;
        let first = self.compare(b, scope)?;
        let shape = if self.eat(&Token::OrOr) {
            TestShape::Outside
        } else if self.eat(&Token::AndAnd) {
            TestShape::Inside
        } else {
            return Err(self.unexpected("`||` or `&&`"));
        };
        let second = self.compare(b, scope)?;
        let action = if self.eat(&Token::Continue) {
            BranchAction::Continue
        } else {
            self.expect(Token::Throw)?;
            let kind = match self.peek() {
                Some(Token::Ident(kind)) => {
                    let kind = match kind.as_str() {
                        "IndexOutOfBounds" => ExceptionKind::IndexOutOfBounds,
                        "IllegalArgument" => ExceptionKind::IllegalArgument,
                        other => {
                            return Err(RceError::parser(format!("unknown exception `{other}`"), self.span()));
                        }
                    };
                    self.pos += 1;
                    kind
                }
                _ => ExceptionKind::IllegalArgument,
            };
            BranchAction::Throw(kind)
        };
        let bci = self.bci()?;
        self.expect(Token::Semi)?;
        b.branch(first, second, shape, action, bci);
        Ok(())
    }

    /// `break if i == n;`
    fn break_if(&mut self, b: &mut MethodBuilder, scope: &mut Scope) -> Result<()> {
        let start = self.expect(Token::Break)?;
        self.expect(Token::If)?;
        let cond = self.compare(b, scope)?;
        self.expect(Token::Semi)?;
        b.break_if(cond)
            .map_err(|e| RceError::parser(e.message().to_string(), start.to(self.prev_span())))
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn expr(&mut self) -> Result<Spanned<Expr>> {
        let mut lhs = self.additive()?;
        while self.eat(&Token::Shl) {
            let amount = self.additive()?;
            let span = lhs.span.to(amount.span);
            lhs = Spanned::new(Expr::Shl { value: Box::new(lhs), amount: Box::new(amount) }, span);
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Spanned<Expr>> {
        let mut lhs = self.term()?;
        loop {
            let op = if self.eat(&Token::Plus) {
                BinOp::Add
            } else if self.eat(&Token::Minus) {
                BinOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.term()?;
            let span = lhs.span.to(rhs.span);
            lhs = Spanned::new(Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }, span);
        }
    }

    fn term(&mut self) -> Result<Spanned<Expr>> {
        let mut lhs = self.unary()?;
        while self.eat(&Token::Star) {
            let rhs = self.unary()?;
            let span = lhs.span.to(rhs.span);
            lhs = Spanned::new(Expr::Binary { op: BinOp::Mul, lhs: Box::new(lhs), rhs: Box::new(rhs) }, span);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Spanned<Expr>> {
        let start = self.span();
        if self.eat(&Token::Minus) {
            let inner = self.unary()?;
            let span = start.to(inner.span);
            return Ok(Spanned::new(Expr::Neg(Box::new(inner)), span));
        }
        if self.at(&Token::LParen) && self.tokens.get(self.pos + 1).map(|(t, _)| t) == Some(&Token::Long) {
            self.pos += 2;
            self.expect(Token::RParen)?;
            let inner = self.unary()?;
            let span = start.to(inner.span);
            return Ok(Spanned::new(Expr::ToLong(Box::new(inner)), span));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Spanned<Expr>> {
        let start = self.span();
        match self.peek() {
            Some(Token::IntLit(n)) => {
                let n = *n;
                self.pos += 1;
                Ok(Spanned::new(Expr::Int(n), start))
            }
            Some(Token::LongLit(n)) => {
                let n = *n;
                self.pos += 1;
                Ok(Spanned::new(Expr::Long(n), start))
            }
            Some(Token::Ident(_)) => {
                let name = self.ident()?;
                Ok(Spanned::new(Expr::Name(name.node), name.span))
            }
            Some(Token::Opaque) => {
                self.pos += 1;
                self.expect(Token::LParen)?;
                let label = self.ident()?;
                let end = self.expect(Token::RParen)?;
                Ok(Spanned::new(Expr::Opaque(label.node), start.to(end)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.expr()?;
                let end = self.expect(Token::RParen)?;
                Ok(Spanned::new(inner.node, start.to(end)))
            }
            _ => Err(self.unexpected("an expression")),
        }
    }
}
