//! Incremental construction of a `Method`

use crate::error::{RceError, Result};
use crate::range::{IntRange, Width};

use super::{
    ArrayDecl, ArrayId, BranchAction, BranchId, BranchSite, CheckId, CheckMode, CheckSite, CmpOp,
    Compare, Graph, LoopDecl, LoopId, Method, Node, NodeId, Stmt, StoreId, StoreSite, TestShape,
};

/// Builds a method body top to bottom, tracking the open loop nest.
///
/// Statements are appended to the innermost open loop, or to the method body
/// when no loop is open.
#[derive(Debug)]
pub struct MethodBuilder {
    method: Method,
    open: Vec<LoopId>,
}

impl MethodBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            method: Method { name: name.to_string(), ..Method::default() },
            open: Vec::new(),
        }
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.method.graph
    }

    pub fn graph(&self) -> &Graph {
        &self.method.graph
    }

    /// Innermost open loop
    pub fn current_loop(&self) -> Option<LoopId> {
        self.open.last().copied()
    }

    pub fn konst(&mut self, value: i64, width: Width) -> NodeId {
        self.method.graph.konst(value, width)
    }

    pub fn param(&mut self, name: &str, range: IntRange) -> NodeId {
        let id = self.method.graph.param(name, range);
        self.method.params.push(id);
        id
    }

    pub fn add(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.method.graph.add(lhs, rhs)
    }

    pub fn sub(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.method.graph.sub(lhs, rhs)
    }

    pub fn mul(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.method.graph.mul(lhs, rhs)
    }

    pub fn shl(&mut self, value: NodeId, amount: NodeId) -> NodeId {
        self.method.graph.shl(value, amount)
    }

    pub fn conv_i2l(&mut self, value: NodeId) -> NodeId {
        self.method.graph.conv_i2l(value)
    }

    pub fn opaque(&mut self, label: &str, width: Width) -> NodeId {
        self.method.graph.opaque(label, width)
    }

    pub fn array(&mut self, name: &str, length: NodeId) -> ArrayId {
        let id = ArrayId(self.method.arrays.len() as u32);
        self.method.arrays.push(ArrayDecl { id, name: name.to_string(), length });
        id
    }

    /// Open a counted loop `for (iv = init; iv test limit; iv += stride)`.
    ///
    /// Returns the loop id and the node of its induction variable.
    pub fn begin_loop(
        &mut self,
        name: &str,
        width: Width,
        init: NodeId,
        limit: NodeId,
        stride: i64,
        test: CmpOp,
    ) -> (LoopId, NodeId) {
        let id = LoopId(self.method.loops.len() as u32);
        let iv = self.method.graph.push(Node::Iv { loop_id: id }, width);
        self.push_stmt(Stmt::Loop(id));
        self.method.loops.push(LoopDecl {
            id,
            name: name.to_string(),
            width,
            iv,
            init,
            limit,
            stride,
            test,
            parent: self.current_loop(),
            body: Vec::new(),
        });
        self.open.push(id);
        (id, iv)
    }

    pub fn end_loop(&mut self) -> Result<LoopId> {
        self.open
            .pop()
            .ok_or_else(|| RceError::malformed("end of loop without a matching loop"))
    }

    pub fn check(&mut self, name: &str, array: ArrayId, index: NodeId, mode: CheckMode, bci: u32) -> CheckId {
        let id = CheckId(self.method.checks.len() as u32);
        self.method.checks.push(CheckSite {
            id,
            name: name.to_string(),
            array,
            index,
            mode,
            bci,
            loop_id: self.current_loop(),
        });
        self.push_stmt(Stmt::Check(id));
        id
    }

    pub fn store(&mut self, name: &str, array: ArrayId, index: NodeId, bci: u32, guarded_by: &[CheckId]) -> StoreId {
        let id = StoreId(self.method.stores.len() as u32);
        self.method.stores.push(StoreSite {
            id,
            name: name.to_string(),
            array,
            index,
            bci,
            guarded_by: guarded_by.to_vec(),
            loop_id: self.current_loop(),
        });
        self.push_stmt(Stmt::Store(id));
        id
    }

    pub fn branch(
        &mut self,
        first: Compare,
        second: Compare,
        shape: TestShape,
        action: BranchAction,
        bci: u32,
    ) -> BranchId {
        let id = BranchId(self.method.branches.len() as u32);
        self.method.branches.push(BranchSite {
            id,
            first,
            second,
            shape,
            action,
            bci,
            loop_id: self.current_loop(),
        });
        self.push_stmt(Stmt::Branch(id));
        id
    }

    /// Side exit from the innermost loop
    pub fn break_if(&mut self, cond: Compare) -> Result<()> {
        if self.open.is_empty() {
            return Err(RceError::malformed("`break if` outside of a loop"));
        }
        self.push_stmt(Stmt::BreakIf(cond));
        Ok(())
    }

    /// Close the method and validate it
    pub fn finish(self) -> Result<Method> {
        if let Some(open) = self.open.last() {
            let name = self
                .method
                .loop_decl(*open)
                .map(|l| l.name.clone())
                .unwrap_or_default();
            return Err(RceError::malformed(format!("loop `{name}` is never closed")));
        }
        self.method.validate()?;
        Ok(self.method)
    }

    fn push_stmt(&mut self, stmt: Stmt) {
        match self.open.last() {
            Some(id) => {
                if let Some(lp) = self.method.loops.get_mut(id.index()) {
                    lp.body.push(stmt);
                }
            }
            None => self.method.body.push(stmt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_nests_loops() {
        let mut b = MethodBuilder::new("nest");
        let zero = b.konst(0, Width::I32);
        let ten = b.konst(10, Width::I32);
        let len = b.konst(10, Width::I32);
        let arr = b.array("a", len);
        let (outer, i) = b.begin_loop("i", Width::I32, zero, ten, 1, CmpOp::Lt);
        let (inner, _j) = b.begin_loop("j", Width::I32, zero, ten, 1, CmpOp::Lt);
        b.check("c0", arr, i, CheckMode::Signed, 3);
        b.end_loop().unwrap();
        b.end_loop().unwrap();
        let m = b.finish().unwrap();

        assert_eq!(m.body, vec![Stmt::Loop(outer)]);
        assert_eq!(m.loops[0].body, vec![Stmt::Loop(inner)]);
        assert_eq!(m.loops[1].parent, Some(outer));
        assert_eq!(m.checks[0].loop_id, Some(inner));
        assert!(m.loop_encloses(outer, inner));
        assert!(!m.loop_encloses(inner, outer));
    }

    #[test]
    fn test_builder_rejects_unclosed_loop() {
        let mut b = MethodBuilder::new("open");
        let zero = b.konst(0, Width::I32);
        let ten = b.konst(10, Width::I32);
        b.begin_loop("i", Width::I32, zero, ten, 1, CmpOp::Lt);
        assert!(b.finish().is_err());
    }

    #[test]
    fn test_break_if_outside_loop() {
        let mut b = MethodBuilder::new("m");
        let zero = b.konst(0, Width::I32);
        let cond = Compare { value: zero, op: CmpOp::Eq, bound: zero };
        assert!(b.break_if(cond).is_err());
    }
}
