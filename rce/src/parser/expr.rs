//! Index expressions: syntax tree and lowering into the node graph
//!
//! Integer literals have no width of their own. They take the width of the
//! expression they appear in, found by looking at the names, `L` literals
//! and `(long)` casts around them; an expression with none defaults to `i32`.

use crate::error::{RceError, Result};
use crate::ir::{MethodBuilder, NodeId};
use crate::range::Width;
use crate::lexer::Span;

/// A parsed construct and where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Spanned { node, span }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i128),
    /// Literal with an `L` suffix
    Long(i128),
    Name(String),
    Neg(Box<Spanned<Expr>>),
    Binary { op: BinOp, lhs: Box<Spanned<Expr>>, rhs: Box<Spanned<Expr>> },
    Shl { value: Box<Spanned<Expr>>, amount: Box<Spanned<Expr>> },
    /// `(long) e`: sign extension of an `i32` expression
    ToLong(Box<Spanned<Expr>>),
    /// `opaque(label)`: a value the optimizer cannot see through
    Opaque(String),
}

/// Names visible at a program point, innermost last
#[derive(Debug, Default)]
pub struct Names {
    values: Vec<(String, NodeId)>,
}

impl Names {
    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.values.iter().rev().find(|(n, _)| n == name).map(|(_, id)| *id)
    }

    pub fn push(&mut self, name: String, id: NodeId) {
        self.values.push((name, id));
    }

    pub fn depth(&self) -> usize {
        self.values.len()
    }

    pub fn truncate(&mut self, depth: usize) {
        self.values.truncate(depth);
    }
}

/// Width implied by the expression itself, if any
pub fn infer(b: &MethodBuilder, names: &Names, e: &Spanned<Expr>) -> Option<Width> {
    match &e.node {
        Expr::Int(_) | Expr::Opaque(_) => None,
        Expr::Long(_) | Expr::ToLong(_) => Some(Width::I64),
        Expr::Name(n) => names.lookup(n).map(|id| b.graph().width(id)),
        Expr::Neg(inner) => infer(b, names, inner),
        Expr::Binary { lhs, rhs, .. } => infer(b, names, lhs).or_else(|| infer(b, names, rhs)),
        Expr::Shl { value, .. } => infer(b, names, value),
    }
}

/// Lower with the width inferred from `e`, else `default`, else `i32`
pub fn lower_expr(b: &mut MethodBuilder, names: &Names, e: &Spanned<Expr>, default: Option<Width>) -> Result<NodeId> {
    let width = infer(b, names, e).or(default).unwrap_or(Width::I32);
    lower(b, names, e, width)
}

/// Lower `e` as a value of width `want`
pub fn lower(b: &mut MethodBuilder, names: &Names, e: &Spanned<Expr>, want: Width) -> Result<NodeId> {
    match &e.node {
        Expr::Int(v) => literal(b, *v, want, e.span),
        Expr::Long(v) => {
            expect_width(Width::I64, want, e.span)?;
            literal(b, *v, want, e.span)
        }
        Expr::Name(n) => {
            let id = names
                .lookup(n)
                .ok_or_else(|| RceError::parser(format!("unknown name `{n}`"), e.span))?;
            expect_width(b.graph().width(id), want, e.span)?;
            Ok(id)
        }
        Expr::Neg(inner) => match &inner.node {
            Expr::Int(v) => literal(b, -*v, want, e.span),
            Expr::Long(v) => {
                expect_width(Width::I64, want, e.span)?;
                literal(b, -*v, want, e.span)
            }
            _ => {
                let zero = b.konst(0, want);
                let value = lower(b, names, inner, want)?;
                Ok(b.sub(zero, value))
            }
        },
        Expr::Binary { op, lhs, rhs } => {
            let l = lower(b, names, lhs, want)?;
            let r = lower(b, names, rhs, want)?;
            Ok(match op {
                BinOp::Add => b.add(l, r),
                BinOp::Sub => b.sub(l, r),
                BinOp::Mul => b.mul(l, r),
            })
        }
        Expr::Shl { value, amount } => {
            let v = lower(b, names, value, want)?;
            let a = lower_expr(b, names, amount, None)?;
            Ok(b.shl(v, a))
        }
        Expr::ToLong(inner) => {
            expect_width(Width::I64, want, e.span)?;
            let v = lower(b, names, inner, Width::I32)?;
            Ok(b.conv_i2l(v))
        }
        Expr::Opaque(label) => Ok(b.opaque(label, want)),
    }
}

fn literal(b: &mut MethodBuilder, value: i128, want: Width, span: Span) -> Result<NodeId> {
    if !want.fits(value) {
        return Err(RceError::parser(format!("literal {value} does not fit in {want}"), span));
    }
    Ok(b.konst(value as i64, want))
}

fn expect_width(found: Width, want: Width, span: Span) -> Result<()> {
    if found != want {
        return Err(RceError::parser(format!("expected a {want} value, found {found}"), span));
    }
    Ok(())
}
