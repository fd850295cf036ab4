//! Compare-Fusion Engine
//!
//! Folds a two-sided signed range test on one value into a single unsigned
//! comparison:
//!
//! ```text
//! x <  LOW || x >  HIGH      =>   (x - LOW)     >=u (HIGH - LOW + 1)
//! x <= LOW || x >= HIGH      =>   (x - LOW - 1) >=u (HIGH - LOW - 1)
//! x >= LOW && x <= HIGH      =>   (x - LOW)     <u  (HIGH - LOW + 1)
//! ```
//!
//! Both forms first normalize to the accepted interval `[L, H]`. Fusion is
//! refused when `H - L + 1` can overflow or be negative: the unsigned compare
//! would then accept a different set of values. An interval that is empty for
//! every input folds the whole test to a constant, as does a value whose
//! range lies entirely on one side.

use std::fmt;

use serde::Serialize;

use crate::error::Result;
use crate::ir::{Bindings, CmpOp, Compare, Graph, NodeId, TestShape};
use crate::loops::LoopModel;
use crate::range::Width;

/// `(value - (low + low_adjust)) <u ((high + high_adjust) - (low + low_adjust) + 1)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FusedCompare {
    pub value: NodeId,
    pub low: NodeId,
    pub low_adjust: i64,
    pub high: NodeId,
    pub high_adjust: i64,
    pub width: Width,
    pub shape: TestShape,
}

impl FusedCompare {
    /// Evaluate the original test's outcome with one unsigned compare
    pub fn eval(&self, graph: &Graph, env: &Bindings) -> Result<bool> {
        let w = self.width;
        let x = graph.eval(self.value, env)? as i128;
        let l = w.wrap(graph.eval(self.low, env)? as i128 + self.low_adjust as i128) as i128;
        let h = w.wrap(graph.eval(self.high, env)? as i128 + self.high_adjust as i128) as i128;
        let delta = w.to_unsigned(w.wrap(x - l));
        let limit = w.to_unsigned(w.wrap(h - l + 1));
        let inside = delta < limit;
        Ok(match self.shape {
            TestShape::Outside => !inside,
            TestShape::Inside => inside,
        })
    }
}

impl fmt::Display for FusedCompare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.shape {
            TestShape::Outside => ">=u",
            TestShape::Inside => "<u",
        };
        write!(
            f,
            "({} - ({}{:+})) {op} (({}{:+}) - ({}{:+}) + 1)",
            self.value, self.low, self.low_adjust, self.high, self.high_adjust, self.low, self.low_adjust
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoFusionReason {
    /// The two compares test different values
    DifferentValues,
    /// Not one lower and one upper bound test
    Shape,
    /// `H - L + 1` or a bound adjustment can overflow
    LimitOverflow,
    /// The accepted interval may be empty for some inputs
    NegativeLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FusionOutcome {
    Fused(FusedCompare),
    AlwaysTrue,
    AlwaysFalse,
    NoFusion(NoFusionReason),
}

impl FusionOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            FusionOutcome::Fused(_) => "fused",
            FusionOutcome::AlwaysTrue => "always-true",
            FusionOutcome::AlwaysFalse => "always-false",
            FusionOutcome::NoFusion(_) => "no-fusion",
        }
    }
}

/// One side of the accepted interval
struct Side {
    node: NodeId,
    adjust: i64,
}

/// Split into the lower and upper side of the accepted interval
fn normalize(first: &Compare, second: &Compare, shape: TestShape) -> Option<(Side, Side)> {
    // Outside: the test rejects [L, H]; Inside: it accepts [L, H]
    let side = |c: &Compare| -> Option<(bool, Side)> {
        let (is_low, adjust) = match (shape, c.op) {
            (TestShape::Outside, CmpOp::Lt) => (true, 0),
            (TestShape::Outside, CmpOp::Le) => (true, 1),
            (TestShape::Outside, CmpOp::Gt) => (false, 0),
            (TestShape::Outside, CmpOp::Ge) => (false, -1),
            (TestShape::Inside, CmpOp::Ge) => (true, 0),
            (TestShape::Inside, CmpOp::Gt) => (true, 1),
            (TestShape::Inside, CmpOp::Le) => (false, 0),
            (TestShape::Inside, CmpOp::Lt) => (false, -1),
            _ => return None,
        };
        Some((is_low, Side { node: c.bound, adjust }))
    };
    let (a_low, a) = side(first)?;
    let (b_low, b) = side(second)?;
    match (a_low, b_low) {
        (true, false) => Some((a, b)),
        (false, true) => Some((b, a)),
        _ => None,
    }
}

/// Try to fuse `first <shape> second` over the value ranges of `model`
pub fn fuse(graph: &Graph, model: &LoopModel, first: &Compare, second: &Compare, shape: TestShape) -> FusionOutcome {
    if first.value != second.value {
        return FusionOutcome::NoFusion(NoFusionReason::DifferentValues);
    }
    let Some((low, high)) = normalize(first, second, shape) else {
        return FusionOutcome::NoFusion(NoFusionReason::Shape);
    };
    let width = graph.width(first.value);
    if graph.width(low.node) != width || graph.width(high.node) != width {
        return FusionOutcome::NoFusion(NoFusionReason::Shape);
    }
    let (when_inside, when_outside) = match shape {
        TestShape::Outside => (FusionOutcome::AlwaysFalse, FusionOutcome::AlwaysTrue),
        TestShape::Inside => (FusionOutcome::AlwaysTrue, FusionOutcome::AlwaysFalse),
    };

    let x = model.range(first.value);
    let l = model.range(low.node).add_overflow_safe(low.adjust);
    let h = model.range(high.node).add_overflow_safe(high.adjust);
    if l.is_bottom() || h.is_bottom() {
        return FusionOutcome::NoFusion(NoFusionReason::LimitOverflow);
    }

    // Accepted interval empty for every input
    if l.lo() > h.hi() {
        return when_outside;
    }
    if !x.is_top() {
        if x.lo() >= l.hi() && x.hi() <= h.lo() {
            return when_inside;
        }
        if x.hi() < l.lo() || x.lo() > h.hi() {
            return when_outside;
        }
    }

    let limit = h.sub(&l).add_overflow_safe(1);
    if limit.is_bottom() {
        return FusionOutcome::NoFusion(NoFusionReason::LimitOverflow);
    }
    if limit.lo() < 0 {
        return FusionOutcome::NoFusion(NoFusionReason::NegativeLimit);
    }
    FusionOutcome::Fused(FusedCompare {
        value: first.value,
        low: low.node,
        low_adjust: low.adjust,
        high: high.node,
        high_adjust: high.adjust,
        width,
        shape,
    })
}

/// Evaluate a two-sided test directly, without fusion
pub fn eval_unfused(graph: &Graph, env: &Bindings, first: &Compare, second: &Compare, shape: TestShape) -> Result<bool> {
    let a = first.op.eval(graph.eval(first.value, env)?, graph.eval(first.bound, env)?);
    let b = second.op.eval(graph.eval(second.value, env)?, graph.eval(second.bound, env)?);
    Ok(match shape {
        TestShape::Outside => a || b,
        TestShape::Inside => a && b,
    })
}
