//! Loop Induction Model
//!
//! Derives, for every counted loop of a method, its induction variable, the
//! range of values the induction variable takes inside the body, and the
//! affine classification of index expressions.
//!
//! # Classification
//!
//! An index expression is linearized against the loop owning the check:
//!
//! ```text
//! index = scale * iv + offset      (scale != 0)  -> Affine
//! index = offset                   (scale == 0)  -> Invariant(range)
//! anything else                                  -> Opaque(reason)
//! ```
//!
//! Recognized shapes: constants, parameters, the loop's own induction
//! variable, induction variables of enclosing loops (as invariant terms),
//! `+`, `-`, multiplication by a constant, left shift by a constant and the
//! sign extension of a 32-bit scaled induction variable. Everything else is
//! opaque; the prover leaves opaque checks alone.
//!
//! # Staleness
//!
//! Every loop carries a shape epoch. `LoopModel::invalidate` bumps it; an
//! `InductionVar` derived under an older epoch is rejected with
//! `RceError::StaleInduction` until the loop is derived again. Passes report
//! reshaped loops through `Session::loop_shape_changed`, and range-check
//! elimination calls `LoopModel::refresh` before reading any loop.

use std::fmt;

use serde::Serialize;

use crate::error::{RceError, Result};
use crate::ir::{CmpOp, LoopDecl, LoopId, Method, Node, NodeId};
use crate::range::{IntRange, Width};

/// Default recursion limit for `classify_index`
pub const DEFAULT_CLASSIFY_DEPTH: usize = 32;

// ============================================================================
// Induction variables
// ============================================================================

/// Direction of a counted loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopKind {
    CountedUp,
    CountedDown,
}

/// Counter of a recognized counted loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InductionVar {
    pub loop_id: LoopId,
    pub init: IntRange,
    pub stride: i64,
    pub kind: LoopKind,
    pub is_long: bool,
    /// Exit test, `iv test limit` keeps the loop running
    pub test: CmpOp,
    epoch: u32,
}

impl InductionVar {
    pub fn width(&self) -> Width {
        if self.is_long { Width::I64 } else { Width::I32 }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }
}

/// How a loop leaves its body for good
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripEnd {
    /// The body never runs
    ZeroTrip,
    /// Last induction value that reaches the body
    Last(i128),
    /// The counter wraps or skips past the limit
    Unbounded,
}

/// Range of induction values reaching the body of a loop.
///
/// Applies the loop-limit check: if advancing past the limit could overflow
/// the width, or the test does not match the stride direction, the result is
/// BOTTOM. A loop that is never entered for any input yields TOP.
pub fn iteration_range(iv: &InductionVar, limit: &IntRange) -> IntRange {
    let w = iv.width();
    let init = iv.init;
    if init.is_top() || limit.is_top() {
        return IntRange::top(w);
    }
    if init.compare(iv.test, limit) == Some(false) {
        return IntRange::top(w);
    }
    if iv.test == CmpOp::Eq {
        return init.meet(limit);
    }
    let s = iv.stride as i128;
    let (min, max) = (w.min() as i128, w.max() as i128);
    match (iv.kind, iv.test) {
        (LoopKind::CountedUp, CmpOp::Lt) => {
            let hi = limit.hi() as i128 - 1;
            if hi + s > max {
                return IntRange::bottom(w);
            }
            IntRange::exact(init.lo() as i128, hi, w)
        }
        (LoopKind::CountedUp, CmpOp::Le) => {
            let hi = limit.hi() as i128;
            if hi + s > max {
                return IntRange::bottom(w);
            }
            IntRange::exact(init.lo() as i128, hi, w)
        }
        (LoopKind::CountedUp, CmpOp::Ne) if iv.stride == 1 && init.hi() <= limit.lo() => {
            IntRange::exact(init.lo() as i128, limit.hi() as i128 - 1, w)
        }
        (LoopKind::CountedDown, CmpOp::Gt) => {
            let lo = limit.lo() as i128 + 1;
            if lo + s < min {
                return IntRange::bottom(w);
            }
            IntRange::exact(lo, init.hi() as i128, w)
        }
        (LoopKind::CountedDown, CmpOp::Ge) => {
            let lo = limit.lo() as i128;
            if lo + s < min {
                return IntRange::bottom(w);
            }
            IntRange::exact(lo, init.hi() as i128, w)
        }
        (LoopKind::CountedDown, CmpOp::Ne) if iv.stride == -1 && init.lo() >= limit.hi() => {
            IntRange::exact(limit.lo() as i128 + 1, init.hi() as i128, w)
        }
        _ => IntRange::bottom(w),
    }
}

/// Exact last induction value for concrete loop bounds
pub fn last_value(test: CmpOp, stride: i64, init: i64, limit: i64, width: Width) -> TripEnd {
    if !test.eval(init, limit) {
        return TripEnd::ZeroTrip;
    }
    if stride == 0 {
        return TripEnd::Unbounded;
    }
    let (s, i, l) = (stride as i128, init as i128, limit as i128);
    let last = match test {
        CmpOp::Eq => return TripEnd::Last(i),
        CmpOp::Lt if s > 0 => i + ((l - 1 - i) / s) * s,
        CmpOp::Le if s > 0 => i + ((l - i) / s) * s,
        CmpOp::Gt if s < 0 => i - ((i - l - 1) / -s) * -s,
        CmpOp::Ge if s < 0 => i - ((i - l) / -s) * -s,
        CmpOp::Ne if (l - i) % s == 0 && (l - i) / s > 0 => l - s,
        _ => return TripEnd::Unbounded,
    };
    if !width.fits(last + s) {
        return TripEnd::Unbounded;
    }
    TripEnd::Last(last)
}

// ============================================================================
// Counted loops
// ============================================================================

/// Everything the prover needs to know about one loop
#[derive(Debug, Clone, Serialize)]
pub struct CountedLoop {
    pub iv: InductionVar,
    pub limit: IntRange,
    /// Only leaves through the counting test
    pub exact: bool,
    /// Init or limit depends on an induction variable
    pub trip_depends_on_iv: bool,
    pub iteration: IntRange,
}

impl CountedLoop {
    pub fn limit(&self) -> IntRange {
        self.limit
    }

    pub fn is_counted_loop_exact(&self) -> bool {
        self.exact
    }

    /// True when no input makes the body run
    pub fn is_zero_trip(&self) -> bool {
        self.iteration.is_top()
    }
}

// ============================================================================
// Index classification
// ============================================================================

/// `(long)(scale * iv + offset)` part of a 64-bit index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShortForm {
    pub scale: i64,
    pub offset: IntRange,
    /// The 32-bit expression being extended
    pub node: NodeId,
}

/// `scale * iv + offset`, borrowing its induction variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AffineIndexExpr<'m> {
    pub scale: i64,
    pub iv: &'m InductionVar,
    pub offset: IntRange,
    pub short: Option<ShortForm>,
}

impl fmt::Display for AffineIndexExpr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*iv({}) + {}", self.scale, self.iv.loop_id, self.offset)
    }
}

/// Why an index could not be classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpaqueReason {
    UnknownNode,
    NonLinear,
    ForeignInduction,
    ScaleOverflow,
    ShiftOutOfRange,
    DepthExceeded,
    TripCountDependsOnIv,
    NotInLoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndexClass<'m> {
    Affine(AffineIndexExpr<'m>),
    Invariant(IntRange),
    Opaque(OpaqueReason),
}

/// Linear form of a subexpression against one loop
#[derive(Debug, Clone, Copy)]
struct Linear {
    scale: i128,
    offset: IntRange,
    short: Option<ShortForm>,
}

// ============================================================================
// Model
// ============================================================================

/// Ranges and counted loops of one method
#[derive(Debug, Clone)]
pub struct LoopModel {
    loops: Vec<CountedLoop>,
    epochs: Vec<u32>,
    ranges: Vec<IntRange>,
    depends_on_iv: Vec<bool>,
    /// Reaches an opaque node, whose value may change between iterations
    opaque: Vec<bool>,
    max_depth: usize,
}

impl LoopModel {
    /// Derive ranges and loops in one forward pass over the node arena.
    ///
    /// Operands always precede their users and loop bounds precede the loop's
    /// induction variable, so each range is final when first computed.
    pub fn build(method: &Method, max_depth: usize) -> Result<Self> {
        let mut model = LoopModel {
            loops: Vec::with_capacity(method.loops.len()),
            epochs: vec![0; method.loops.len()],
            ranges: Vec::with_capacity(method.graph.len()),
            depends_on_iv: Vec::with_capacity(method.graph.len()),
            opaque: Vec::with_capacity(method.graph.len()),
            max_depth,
        };
        let mut derived: Vec<Option<CountedLoop>> = vec![None; method.loops.len()];

        for (id, node) in method.graph.iter() {
            let width = method.graph.width(id);
            let range = match node {
                Node::Const { value, .. } => IntRange::constant(*value, width),
                Node::Param { range, .. } => *range,
                Node::Iv { loop_id } => {
                    let decl = method
                        .loop_decl(*loop_id)
                        .ok_or_else(|| RceError::malformed(format!("unknown loop {loop_id}")))?;
                    let counted = model.derive(decl, 0);
                    let iteration = counted.iteration;
                    if let Some(slot) = derived.get_mut(loop_id.index()) {
                        *slot = Some(counted);
                    }
                    iteration
                }
                Node::Add { lhs, rhs, .. } => model.range(*lhs).add(&model.range(*rhs)),
                Node::Sub { lhs, rhs, .. } => model.range(*lhs).sub(&model.range(*rhs)),
                Node::Mul { lhs, rhs, .. } => model.range(*lhs).mul(&model.range(*rhs)),
                Node::Shl { value, amount, .. } => match model.range(*amount).as_constant() {
                    Some(k) => model.range(*value).shl_safe(k),
                    None => IntRange::bottom(width),
                },
                Node::ConvI2L { value } => model.range(*value).to_long(),
                Node::Opaque { .. } => IntRange::bottom(width),
            };
            let depends = matches!(node, Node::Iv { .. })
                || node.inputs().iter().any(|i| model.depends_on_iv(*i));
            let opaque = matches!(node, Node::Opaque { .. })
                || node.inputs().iter().any(|i| model.opaque.get(i.index()).copied().unwrap_or(true));
            model.ranges.push(range);
            model.depends_on_iv.push(depends);
            model.opaque.push(opaque);
        }

        for (decl, slot) in method.loops.iter().zip(derived) {
            let counted = match slot {
                Some(c) => c,
                None => model.derive(decl, 0),
            };
            tracing::trace!(
                loop_name = %decl.name,
                iteration = %counted.iteration,
                exact = counted.exact,
                "counted loop"
            );
            model.loops.push(counted);
        }
        Ok(model)
    }

    fn derive(&self, decl: &LoopDecl, epoch: u32) -> CountedLoop {
        let init = self.range(decl.init);
        let limit = self.range(decl.limit);
        let iv = InductionVar {
            loop_id: decl.id,
            init,
            stride: decl.stride,
            kind: if decl.stride > 0 { LoopKind::CountedUp } else { LoopKind::CountedDown },
            is_long: decl.width == Width::I64,
            test: decl.test,
            epoch,
        };
        let iteration = iteration_range(&iv, &limit);
        CountedLoop {
            iv,
            limit,
            exact: decl.is_exact(),
            trip_depends_on_iv: self.depends_on_iv(decl.init) || self.depends_on_iv(decl.limit),
            iteration,
        }
    }

    /// Range of a node across every execution
    pub fn range(&self, id: NodeId) -> IntRange {
        self.ranges
            .get(id.index())
            .copied()
            .unwrap_or(IntRange::bottom(Width::I64))
    }

    pub fn depends_on_iv(&self, id: NodeId) -> bool {
        self.depends_on_iv.get(id.index()).copied().unwrap_or(true)
    }

    /// Current counted loop, rejecting a stale derivation
    pub fn counted(&self, id: LoopId) -> Result<&CountedLoop> {
        let counted = self
            .loops
            .get(id.index())
            .ok_or_else(|| RceError::malformed(format!("unknown loop {id}")))?;
        self.ensure_fresh(&counted.iv)?;
        Ok(counted)
    }

    pub fn ensure_fresh(&self, iv: &InductionVar) -> Result<()> {
        let current = self.epochs.get(iv.loop_id.index()).copied().unwrap_or(0);
        if iv.epoch != current {
            return Err(RceError::stale(format!(
                "induction variable of {} was derived at epoch {}, loop is now at epoch {current}",
                iv.loop_id, iv.epoch
            )));
        }
        Ok(())
    }

    /// Record that the loop's shape changed
    pub fn invalidate(&mut self, id: LoopId) {
        if let Some(epoch) = self.epochs.get_mut(id.index()) {
            *epoch += 1;
            tracing::debug!(loop_id = %id, epoch = *epoch, "loop shape invalidated");
        }
    }

    pub fn is_stale(&self, id: LoopId) -> bool {
        match (self.loops.get(id.index()), self.epochs.get(id.index())) {
            (Some(counted), Some(epoch)) => counted.iv.epoch != *epoch,
            _ => false,
        }
    }

    /// Re-derive every invalidated loop. Returns how many were stale.
    pub fn refresh(&mut self, method: &Method) -> Result<usize> {
        let stale: Vec<LoopId> = method.loops.iter().map(|lp| lp.id).filter(|id| self.is_stale(*id)).collect();
        for id in &stale {
            self.rederive(method, *id)?;
        }
        Ok(stale.len())
    }

    /// Derive the loop again after `invalidate`
    pub fn rederive(&mut self, method: &Method, id: LoopId) -> Result<&CountedLoop> {
        let decl = method
            .loop_decl(id)
            .ok_or_else(|| RceError::malformed(format!("unknown loop {id}")))?;
        let epoch = self.epochs.get(id.index()).copied().unwrap_or(0);
        let counted = self.derive(decl, epoch);
        let slot = self
            .loops
            .get_mut(id.index())
            .ok_or_else(|| RceError::malformed(format!("unknown loop {id}")))?;
        *slot = counted;
        Ok(slot)
    }

    /// Classify an index expression against the loop that contains the check
    pub fn classify_index(&self, method: &Method, loop_id: LoopId, index: NodeId) -> Result<IndexClass<'_>> {
        let counted = self.counted(loop_id)?;
        if counted.trip_depends_on_iv {
            return Ok(IndexClass::Opaque(OpaqueReason::TripCountDependsOnIv));
        }
        let linear = match self.linearize(method, loop_id, index, 0) {
            Ok(l) => l,
            Err(reason) => return Ok(IndexClass::Opaque(reason)),
        };
        if linear.scale == 0 {
            return Ok(IndexClass::Invariant(linear.offset.meet(&self.range(index))));
        }
        let width = method.graph.width(index);
        // Scale must be representable with a representable negation
        if linear.scale <= width.min() as i128 || linear.scale > width.max() as i128 {
            return Ok(IndexClass::Opaque(OpaqueReason::ScaleOverflow));
        }
        Ok(IndexClass::Affine(AffineIndexExpr {
            scale: linear.scale as i64,
            iv: &counted.iv,
            offset: linear.offset,
            short: linear.short,
        }))
    }

    fn linearize(
        &self,
        method: &Method,
        target: LoopId,
        id: NodeId,
        depth: usize,
    ) -> std::result::Result<Linear, OpaqueReason> {
        if depth > self.max_depth {
            return Err(OpaqueReason::DepthExceeded);
        }
        let opaque = self.opaque.get(id.index()).copied().unwrap_or(true);
        if !self.depends_on_iv(id) && !opaque {
            return Ok(Linear { scale: 0, offset: self.range(id), short: None });
        }
        let width = method.graph.width(id);
        let node = method.graph.get(id).ok_or(OpaqueReason::UnknownNode)?;
        let result = match node {
            Node::Const { .. } | Node::Param { .. } => Linear { scale: 0, offset: self.range(id), short: None },
            Node::Opaque { .. } => return Err(OpaqueReason::UnknownNode),
            Node::Iv { loop_id } if *loop_id == target => Linear {
                scale: 1,
                offset: IntRange::constant(0, width),
                short: None,
            },
            Node::Iv { loop_id } if method.loop_encloses(*loop_id, target) => {
                Linear { scale: 0, offset: self.range(id), short: None }
            }
            Node::Iv { .. } => return Err(OpaqueReason::ForeignInduction),
            Node::Add { lhs, rhs, .. } | Node::Sub { lhs, rhs, .. } => {
                let a = self.linearize(method, target, *lhs, depth + 1)?;
                let b = self.linearize(method, target, *rhs, depth + 1)?;
                let short = merge_short(a.short, b.short)?;
                if matches!(node, Node::Add { .. }) {
                    Linear { scale: a.scale + b.scale, offset: a.offset.add(&b.offset), short }
                } else {
                    Linear { scale: a.scale - b.scale, offset: a.offset.sub(&b.offset), short }
                }
            }
            Node::Mul { lhs, rhs, .. } => {
                let a = self.linearize(method, target, *lhs, depth + 1)?;
                let b = self.linearize(method, target, *rhs, depth + 1)?;
                let (term, factor) = match (a.scale, b.scale) {
                    (0, 0) => {
                        let short = merge_short(a.short, b.short)?;
                        return Ok(Linear { scale: 0, offset: a.offset.mul(&b.offset), short });
                    }
                    (_, 0) => (a, b.offset.as_constant()),
                    (0, _) => (b, a.offset.as_constant()),
                    _ => return Err(OpaqueReason::NonLinear),
                };
                let k = factor.ok_or(OpaqueReason::NonLinear)?;
                scale_linear(term, k, width)?
            }
            Node::Shl { value, amount, .. } => {
                let a = self.linearize(method, target, *value, depth + 1)?;
                if self.depends_on_iv(*amount) {
                    return Err(OpaqueReason::NonLinear);
                }
                let amt = self.range(*amount).as_constant().ok_or(OpaqueReason::NonLinear)?;
                if amt < 0 || amt >= width.bits() as i64 {
                    return Err(OpaqueReason::ShiftOutOfRange);
                }
                let factor = width.wrap(1i128 << amt);
                if factor == width.min() {
                    return Err(OpaqueReason::ScaleOverflow);
                }
                scale_linear(a, factor, width)?
            }
            Node::ConvI2L { value } => {
                let a = self.linearize(method, target, *value, depth + 1)?;
                if a.short.is_some() {
                    return Err(OpaqueReason::NonLinear);
                }
                if a.scale <= Width::I32.min() as i128 || a.scale > Width::I32.max() as i128 {
                    return Err(OpaqueReason::ScaleOverflow);
                }
                let short = ShortForm { scale: a.scale as i64, offset: a.offset, node: *value };
                Linear { scale: a.scale, offset: a.offset.to_long(), short: Some(short) }
            }
        };
        if result.scale <= i64::MIN as i128 || result.scale > i64::MAX as i128 {
            return Err(OpaqueReason::ScaleOverflow);
        }
        Ok(result)
    }
}

/// At most one sign-extended scaled term per index
fn merge_short(a: Option<ShortForm>, b: Option<ShortForm>) -> std::result::Result<Option<ShortForm>, OpaqueReason> {
    match (a, b) {
        (Some(_), Some(_)) => Err(OpaqueReason::NonLinear),
        (x, None) | (None, x) => Ok(x),
    }
}

fn scale_linear(term: Linear, k: i64, width: Width) -> std::result::Result<Linear, OpaqueReason> {
    if k == width.min() {
        return Err(OpaqueReason::ScaleOverflow);
    }
    let scale = term.scale.checked_mul(k as i128).ok_or(OpaqueReason::ScaleOverflow)?;
    Ok(Linear {
        scale,
        offset: term.offset.scale_safe(k),
        // Scaling after the extension keeps the 32-bit part intact
        short: term.short,
    })
}
