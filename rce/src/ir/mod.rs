//! IR snapshot consumed by the range-check optimizer
//!
//! A method is an immutable arena of arithmetic nodes plus the loop
//! descriptors, array-access sites and statement lists that reference them by
//! index. Optimizations never mutate a `Method`; they emit rewrite commands
//! (see `crate::opt`) that an editing layer applies afterwards.
//!
//! The node vocabulary is deliberately small and closed: constants, loop
//! invariant parameters, induction-variable references, add/sub/mul/shl and
//! the int-to-long conversion. Everything else is `Node::Opaque`, which the
//! optimizer treats as unknown.

mod builder;

pub use builder::MethodBuilder;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RceError, Result};
use crate::range::{IntRange, Width};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Index of a node in the arena
    NodeId, "n"
);
id_type!(LoopId, "L");
id_type!(CheckId, "c");
id_type!(StoreId, "s");
id_type!(ArrayId, "a");
id_type!(BranchId, "b");

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    /// Evaluate on concrete signed values
    pub fn eval(self, lhs: i64, rhs: i64) -> bool {
        match self {
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
        }
    }

    /// `!(a op b)` as `a op' b`
    pub fn negate(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
        }
    }

    pub fn is_less(self) -> bool {
        matches!(self, CmpOp::Lt | CmpOp::Le)
    }

    pub fn is_greater(self) -> bool {
        matches!(self, CmpOp::Gt | CmpOp::Ge)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Arithmetic node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Const { value: i64, width: Width },
    /// Loop-invariant input whose value lies in `range`
    Param { name: String, range: IntRange },
    /// Current value of a loop's induction variable
    Iv { loop_id: LoopId },
    Add { lhs: NodeId, rhs: NodeId, width: Width },
    Sub { lhs: NodeId, rhs: NodeId, width: Width },
    Mul { lhs: NodeId, rhs: NodeId, width: Width },
    Shl { value: NodeId, amount: NodeId, width: Width },
    /// Sign extension of an `i32` value
    ConvI2L { value: NodeId },
    /// Anything the optimizer does not model (loads, calls, phis)
    Opaque { label: String, width: Width },
}

impl Node {
    /// Operands of this node, in order
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            Node::Add { lhs, rhs, .. } | Node::Sub { lhs, rhs, .. } | Node::Mul { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            Node::Shl { value, amount, .. } => vec![*value, *amount],
            Node::ConvI2L { value } => vec![*value],
            Node::Const { .. } | Node::Param { .. } | Node::Iv { .. } | Node::Opaque { .. } => vec![],
        }
    }
}

/// Values bound while evaluating nodes concretely
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    pub params: BTreeMap<String, i64>,
    pub ivs: BTreeMap<LoopId, i64>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, name: &str, value: i64) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }
}

/// Append-only node arena
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<Node>,
    widths: Vec<Width>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node whose result width is `width`
    pub fn push(&mut self, node: Node, width: Width) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.widths.push(width);
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.get(id)
            .ok_or_else(|| RceError::malformed(format!("dangling node reference {id}")))
    }

    pub fn width(&self, id: NodeId) -> Width {
        self.widths.get(id.index()).copied().unwrap_or(Width::I32)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    pub fn konst(&mut self, value: i64, width: Width) -> NodeId {
        self.push(Node::Const { value: width.wrap(value as i128), width }, width)
    }

    pub fn param(&mut self, name: &str, range: IntRange) -> NodeId {
        let width = range.width();
        self.push(Node::Param { name: name.to_string(), range }, width)
    }

    pub fn add(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        let width = self.width(lhs);
        self.push(Node::Add { lhs, rhs, width }, width)
    }

    pub fn sub(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        let width = self.width(lhs);
        self.push(Node::Sub { lhs, rhs, width }, width)
    }

    pub fn mul(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        let width = self.width(lhs);
        self.push(Node::Mul { lhs, rhs, width }, width)
    }

    pub fn shl(&mut self, value: NodeId, amount: NodeId) -> NodeId {
        let width = self.width(value);
        self.push(Node::Shl { value, amount, width }, width)
    }

    pub fn conv_i2l(&mut self, value: NodeId) -> NodeId {
        self.push(Node::ConvI2L { value }, Width::I64)
    }

    pub fn opaque(&mut self, label: &str, width: Width) -> NodeId {
        self.push(Node::Opaque { label: label.to_string(), width }, width)
    }

    /// Evaluate with the wrapping semantics of the executing program
    pub fn eval(&self, id: NodeId, env: &Bindings) -> Result<i64> {
        let width = self.width(id);
        Ok(match self.node(id)? {
            Node::Const { value, .. } => *value,
            Node::Param { name, .. } | Node::Opaque { label: name, .. } => {
                let value = env
                    .params
                    .get(name)
                    .copied()
                    .ok_or_else(|| RceError::malformed(format!("no value bound for `{name}`")))?;
                width.wrap(value as i128)
            }
            Node::Iv { loop_id } => env
                .ivs
                .get(loop_id)
                .copied()
                .ok_or_else(|| RceError::malformed(format!("induction variable of {loop_id} is not live")))?,
            Node::Add { lhs, rhs, .. } => {
                width.wrap(self.eval(*lhs, env)? as i128 + self.eval(*rhs, env)? as i128)
            }
            Node::Sub { lhs, rhs, .. } => {
                width.wrap(self.eval(*lhs, env)? as i128 - self.eval(*rhs, env)? as i128)
            }
            Node::Mul { lhs, rhs, .. } => {
                width.wrap(self.eval(*lhs, env)? as i128 * self.eval(*rhs, env)? as i128)
            }
            Node::Shl { value, amount, .. } => {
                let shift = (self.eval(*amount, env)? as u32) & (width.bits() - 1);
                width.wrap((self.eval(*value, env)? as i128) << shift)
            }
            Node::ConvI2L { value } => self.eval(*value, env)?,
        })
    }

    /// Evaluate in exact (unbounded) arithmetic.
    ///
    /// Used for hoisted guards: a boundary index that only lands in bounds
    /// because of wrap-around must not pass. Returns `None` if the exact value
    /// does not fit in 128 bits.
    pub fn eval_exact(&self, id: NodeId, env: &Bindings) -> Result<Option<i128>> {
        Ok(match self.node(id)? {
            Node::Const { .. } | Node::Param { .. } | Node::Opaque { .. } | Node::Iv { .. } => {
                Some(self.eval(id, env)? as i128)
            }
            Node::Add { lhs, rhs, .. } => match (self.eval_exact(*lhs, env)?, self.eval_exact(*rhs, env)?) {
                (Some(a), Some(b)) => a.checked_add(b),
                _ => None,
            },
            Node::Sub { lhs, rhs, .. } => match (self.eval_exact(*lhs, env)?, self.eval_exact(*rhs, env)?) {
                (Some(a), Some(b)) => a.checked_sub(b),
                _ => None,
            },
            Node::Mul { lhs, rhs, .. } => match (self.eval_exact(*lhs, env)?, self.eval_exact(*rhs, env)?) {
                (Some(a), Some(b)) => a.checked_mul(b),
                _ => None,
            },
            Node::Shl { value, amount, width } => {
                let shift = (self.eval(*amount, env)? as u32) & (width.bits() - 1);
                match self.eval_exact(*value, env)? {
                    Some(v) => v.checked_mul(1i128 << shift),
                    None => None,
                }
            }
            Node::ConvI2L { value } => self.eval_exact(*value, env)?,
        })
    }
}

/// How a bounds check compares its index against the length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CheckMode {
    /// `0 <= index && index < length`
    #[default]
    Signed,
    /// `(unsigned) index < (unsigned) length`
    UnsignedSubFoldable,
}

impl CheckMode {
    /// Evaluate the check on concrete values of the given width
    pub fn passes(self, index: i64, length: i64, width: Width) -> bool {
        match self {
            CheckMode::Signed => index >= 0 && index < length,
            CheckMode::UnsignedSubFoldable => width.to_unsigned(index) < width.to_unsigned(length),
        }
    }
}

/// An array with a loop-invariant length
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayDecl {
    pub id: ArrayId,
    pub name: String,
    pub length: NodeId,
}

/// Counted-loop descriptor as produced by loop recognition.
///
/// The loop runs `for (iv = init; iv test limit; iv += stride)`; `limit` is
/// evaluated once at loop entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDecl {
    pub id: LoopId,
    pub name: String,
    pub width: Width,
    pub iv: NodeId,
    pub init: NodeId,
    pub limit: NodeId,
    pub stride: i64,
    pub test: CmpOp,
    pub parent: Option<LoopId>,
    pub body: Vec<Stmt>,
}

impl LoopDecl {
    /// A loop is exact when it can only be left through its counting test
    pub fn is_exact(&self) -> bool {
        !self.body.iter().any(|s| matches!(s, Stmt::BreakIf(_)))
    }
}

/// One array-index bounds check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSite {
    pub id: CheckId,
    pub name: String,
    pub array: ArrayId,
    pub index: NodeId,
    pub mode: CheckMode,
    pub bci: u32,
    /// Innermost enclosing loop
    pub loop_id: Option<LoopId>,
}

/// A store whose safety was established by one or more checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSite {
    pub id: StoreId,
    pub name: String,
    pub array: ArrayId,
    pub index: NodeId,
    pub bci: u32,
    pub guarded_by: Vec<CheckId>,
    pub loop_id: Option<LoopId>,
}

/// `value op bound`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compare {
    pub value: NodeId,
    pub op: CmpOp,
    pub bound: NodeId,
}

/// How two compares are combined in a two-sided range test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestShape {
    /// `first || second`: true when the value is outside the range
    Outside,
    /// `first && second`: true when the value is inside the range
    Inside,
}

/// What happens when a branch test evaluates to true
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchAction {
    Throw(ExceptionKind),
    /// Skip the rest of the current iteration
    Continue,
}

/// Exceptions observable by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExceptionKind {
    IndexOutOfBounds,
    IllegalArgument,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionKind::IndexOutOfBounds => f.write_str("IndexOutOfBounds"),
            ExceptionKind::IllegalArgument => f.write_str("IllegalArgument"),
        }
    }
}

/// A two-sided range test guarding a branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchSite {
    pub id: BranchId,
    pub first: Compare,
    pub second: Compare,
    pub shape: TestShape,
    pub action: BranchAction,
    pub bci: u32,
    pub loop_id: Option<LoopId>,
}

/// Statement in a method or loop body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stmt {
    Check(CheckId),
    Store(StoreId),
    Branch(BranchId),
    Loop(LoopId),
    /// Side exit: leave the innermost loop when the compare holds
    BreakIf(Compare),
}

/// A method ready for optimization
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    pub graph: Graph,
    pub params: Vec<NodeId>,
    pub arrays: Vec<ArrayDecl>,
    pub loops: Vec<LoopDecl>,
    pub checks: Vec<CheckSite>,
    pub stores: Vec<StoreSite>,
    pub branches: Vec<BranchSite>,
    pub body: Vec<Stmt>,
}

impl Method {
    pub fn loop_decl(&self, id: LoopId) -> Option<&LoopDecl> {
        self.loops.get(id.index())
    }

    pub fn check(&self, id: CheckId) -> Option<&CheckSite> {
        self.checks.get(id.index())
    }

    pub fn store(&self, id: StoreId) -> Option<&StoreSite> {
        self.stores.get(id.index())
    }

    pub fn array(&self, id: ArrayId) -> Option<&ArrayDecl> {
        self.arrays.get(id.index())
    }

    pub fn branch(&self, id: BranchId) -> Option<&BranchSite> {
        self.branches.get(id.index())
    }

    pub fn find_check(&self, name: &str) -> Option<&CheckSite> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn find_store(&self, name: &str) -> Option<&StoreSite> {
        self.stores.iter().find(|s| s.name == name)
    }

    /// Length node of the array a check guards
    pub fn check_length(&self, check: &CheckSite) -> Result<NodeId> {
        self.array(check.array)
            .map(|a| a.length)
            .ok_or_else(|| RceError::malformed(format!("check {} refers to unknown array", check.name)))
    }

    /// Is `outer` an enclosing loop of (or equal to) `inner`?
    pub fn loop_encloses(&self, outer: LoopId, inner: LoopId) -> bool {
        let mut cur = Some(inner);
        while let Some(id) = cur {
            if id == outer {
                return true;
            }
            cur = self.loop_decl(id).and_then(|l| l.parent);
        }
        false
    }

    /// Structural validation: references resolve, operands precede their
    /// users, widths agree, loop bounds are defined before the induction
    /// variable they control.
    pub fn validate(&self) -> Result<()> {
        for (id, node) in self.graph.iter() {
            for input in node.inputs() {
                if input >= id {
                    return Err(RceError::malformed(format!(
                        "node {id} uses {input}, which is not defined before it"
                    )));
                }
            }
            match node {
                Node::Add { lhs, rhs, width } | Node::Sub { lhs, rhs, width } | Node::Mul { lhs, rhs, width } => {
                    if self.graph.width(*lhs) != *width || self.graph.width(*rhs) != *width {
                        return Err(RceError::malformed(format!("width mismatch in node {id}")));
                    }
                }
                Node::Shl { value, width, .. } => {
                    if self.graph.width(*value) != *width {
                        return Err(RceError::malformed(format!("width mismatch in node {id}")));
                    }
                }
                Node::ConvI2L { value } => {
                    if self.graph.width(*value) != Width::I32 {
                        return Err(RceError::malformed(format!("node {id} converts a value that is not i32")));
                    }
                }
                Node::Iv { loop_id } => {
                    let lp = self
                        .loop_decl(*loop_id)
                        .ok_or_else(|| RceError::malformed(format!("node {id} refers to unknown loop {loop_id}")))?;
                    if lp.init >= id || lp.limit >= id {
                        return Err(RceError::malformed(format!(
                            "bounds of loop {} must be defined before its induction variable",
                            lp.name
                        )));
                    }
                }
                Node::Const { .. } | Node::Param { .. } | Node::Opaque { .. } => {}
            }
        }
        for lp in &self.loops {
            if lp.stride == 0 {
                return Err(RceError::malformed(format!("loop {} has a zero stride", lp.name)));
            }
            if self.graph.width(lp.init) != lp.width || self.graph.width(lp.limit) != lp.width {
                return Err(RceError::malformed(format!("bounds of loop {} do not match its width", lp.name)));
            }
            if !lp.width.fits(lp.stride as i128) {
                return Err(RceError::malformed(format!("stride of loop {} does not fit its width", lp.name)));
            }
            if let Some(parent) = lp.parent
                && parent >= lp.id
            {
                return Err(RceError::malformed(format!("loop {} is nested in a later loop", lp.name)));
            }
        }
        for check in &self.checks {
            self.graph.node(check.index)?;
            let length = self.check_length(check)?;
            if self.graph.width(check.index) != self.graph.width(length) {
                return Err(RceError::malformed(format!(
                    "index and length of check {} have different widths",
                    check.name
                )));
            }
        }
        for store in &self.stores {
            for c in &store.guarded_by {
                if self.check(*c).is_none() {
                    return Err(RceError::malformed(format!("store {} depends on unknown check {c}", store.name)));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_wraps() {
        let mut g = Graph::new();
        let a = g.konst(i32::MAX as i64, Width::I32);
        let b = g.konst(1, Width::I32);
        let sum = g.add(a, b);
        assert_eq!(g.eval(sum, &Bindings::new()).unwrap(), i32::MIN as i64);
        assert_eq!(g.eval_exact(sum, &Bindings::new()).unwrap(), Some(i32::MAX as i128 + 1));
    }

    #[test]
    fn test_eval_shift_masks_amount() {
        let mut g = Graph::new();
        let one = g.konst(1, Width::I32);
        let amt = g.konst(33, Width::I32);
        let sh = g.shl(one, amt);
        assert_eq!(g.eval(sh, &Bindings::new()).unwrap(), 2);
    }

    #[test]
    fn test_eval_unbound_param_is_error() {
        let mut g = Graph::new();
        let p = g.param("n", IntRange::bottom(Width::I32));
        assert!(g.eval(p, &Bindings::new()).is_err());
        assert_eq!(g.eval(p, &Bindings::new().with_param("n", 7)).unwrap(), 7);
    }

    #[test]
    fn test_check_mode_passes() {
        assert!(CheckMode::Signed.passes(0, 1, Width::I32));
        assert!(!CheckMode::Signed.passes(-1, 10, Width::I32));
        assert!(!CheckMode::UnsignedSubFoldable.passes(-1, 10, Width::I32));
        assert!(CheckMode::UnsignedSubFoldable.passes(3, -1, Width::I32));
    }

    #[test]
    fn test_cmp_op_negate() {
        for op in [CmpOp::Lt, CmpOp::Le, CmpOp::Gt, CmpOp::Ge, CmpOp::Eq, CmpOp::Ne] {
            for (a, b) in [(1, 2), (2, 2), (3, 2)] {
                assert_eq!(op.eval(a, b), !op.negate().eval(a, b));
            }
        }
    }

    #[test]
    fn test_validate_rejects_forward_reference() {
        let mut m = Method::default();
        let a = m.graph.konst(1, Width::I32);
        m.graph.push(
            Node::Add { lhs: a, rhs: NodeId(5), width: Width::I32 },
            Width::I32,
        );
        assert!(m.validate().is_err());
    }
}
