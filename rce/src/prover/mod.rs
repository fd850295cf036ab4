//! Range-Check Prover
//!
//! Decides, for one bounds-check fact inside one counted loop, whether the
//! check can be removed, replaced by an unconditional throw, or reduced to
//! boundary pre-checks evaluated once before the loop.
//!
//! # Algorithm
//!
//! 1. Range of the index across the loop: the iteration range scaled and
//!    offset with overflow-safe arithmetic. BOTTOM gives `Irreducible`, TOP
//!    (the loop never runs) gives `Unreachable`.
//! 2. `hi < 0 || lo >= length.hi` gives `AlwaysFails`.
//! 3. `0 <= lo && hi < length.lo` gives `AlwaysPasses`.
//! 4. An exact counted loop with a strictly monotonic index gives
//!    `Hoistable`, with the index checked at the first and the last
//!    iteration.
//!
//! The prover never fails: incomplete analysis is `Irreducible`.

use std::fmt;

use serde::Serialize;

use crate::check::{BoundsCheckFact, IndexTerm};
use crate::error::{RceError, Result};
use crate::ir::{Bindings, CheckId, CheckMode, LoopId, Method, NodeId};
use crate::loops::{iteration_range, last_value, CountedLoop, LoopKind, ShortForm, TripEnd};
use crate::range::{IntRange, Width};

// ============================================================================
// Budget
// ============================================================================

/// Compile-time budget shared by all proofs of one compilation.
///
/// Each `prove` call costs one unit; an exhausted budget answers
/// `Irreducible`, never a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    remaining: u64,
}

impl Budget {
    pub fn new(units: u64) -> Self {
        Self { remaining: units }
    }

    pub fn unlimited() -> Self {
        Self { remaining: u64::MAX }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Consume one unit; false when nothing was left
    pub fn charge(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

// ============================================================================
// Pre-checks
// ============================================================================

/// Loop boundary a pre-check is evaluated at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Boundary {
    /// Induction variable equal to its initial value
    Init,
    /// Induction variable equal to its exact last value
    Last,
    /// Loop-invariant index
    Invariant,
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Boundary::Init => f.write_str("init"),
            Boundary::Last => f.write_str("last"),
            Boundary::Invariant => f.write_str("invariant"),
        }
    }
}

/// One check evaluated before the loop instead of inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PreCheck {
    pub check: CheckId,
    pub boundary: Boundary,
    pub loop_id: LoopId,
    /// Coefficient of the induction variable (0 for invariant checks)
    pub scale: i64,
    pub index: NodeId,
    pub length: NodeId,
    pub mode: CheckMode,
    pub short: Option<ShortForm>,
}

/// Index a pre-check sees at its boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    /// The loop runs zero times
    Skipped,
    At(i128),
    /// No exact value: unbounded trip, or an overflowing affine part
    Unrepresentable,
}

impl PreCheck {
    /// Evaluate at loop entry.
    ///
    /// `env` must bind every parameter and the induction variables of all
    /// enclosing loops. A loop that will not run passes trivially. Boundary
    /// indices are computed in exact arithmetic, so an index that only lands
    /// in bounds by wrapping around fails.
    pub fn holds(&self, method: &Method, env: &Bindings) -> Result<bool> {
        let length = method.graph.eval(self.length, env)?;
        Ok(match self.probe(method, env)? {
            Probe::Skipped => true,
            Probe::Unrepresentable => false,
            Probe::At(index) if self.boundary == Boundary::Invariant => {
                self.mode.passes(index as i64, length, method.graph.width(self.index))
            }
            Probe::At(index) => index >= 0 && index < length as i128,
        })
    }

    /// Exact index at the boundary, if the loop runs and the index has one
    pub fn boundary_index(&self, method: &Method, env: &Bindings) -> Result<Option<i128>> {
        Ok(match self.probe(method, env)? {
            Probe::At(index) => Some(index),
            Probe::Skipped | Probe::Unrepresentable => None,
        })
    }

    fn probe(&self, method: &Method, env: &Bindings) -> Result<Probe> {
        let decl = method
            .loop_decl(self.loop_id)
            .ok_or_else(|| RceError::malformed(format!("pre-check refers to unknown loop {}", self.loop_id)))?;
        let init = method.graph.eval(decl.init, env)?;
        let limit = method.graph.eval(decl.limit, env)?;
        let trip = last_value(decl.test, decl.stride, init, limit, decl.width);
        if trip == TripEnd::ZeroTrip {
            return Ok(Probe::Skipped);
        }
        if self.boundary == Boundary::Invariant {
            return Ok(Probe::At(method.graph.eval(self.index, env)? as i128));
        }

        let at = match (self.boundary, trip) {
            (Boundary::Init, _) => init as i128,
            (Boundary::Last, TripEnd::Last(v)) => v,
            _ => return Ok(Probe::Unrepresentable),
        };
        let mut origin = env.clone();
        origin.ivs.insert(self.loop_id, 0);

        if let Some(short) = &self.short {
            let base = method.graph.eval(short.node, &origin)? as i128;
            if !Width::I32.fits(short.scale as i128 * at + base) {
                return Ok(Probe::Unrepresentable);
            }
        }
        let base = method.graph.eval(self.index, &origin)? as i128;
        Ok(match (self.scale as i128).checked_mul(at).and_then(|v| v.checked_add(base)) {
            Some(index) => Probe::At(index),
            None => Probe::Unrepresentable,
        })
    }
}

impl fmt::Display for PreCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.check, self.loop_id, self.boundary)
    }
}

// ============================================================================
// Verdict
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Verdict {
    AlwaysPasses,
    AlwaysFails,
    /// Both boundary checks pass implies every in-loop check passes
    Hoistable { low: PreCheck, high: PreCheck },
    /// Loop-invariant check evaluated once at loop entry
    InvariantHoistable { check: PreCheck },
    /// The check never executes
    Unreachable,
    Irreducible,
}

impl Verdict {
    pub fn name(&self) -> &'static str {
        match self {
            Verdict::AlwaysPasses => "always-passes",
            Verdict::AlwaysFails => "always-fails",
            Verdict::Hoistable { .. } => "hoistable",
            Verdict::InvariantHoistable { .. } => "invariant-hoistable",
            Verdict::Unreachable => "unreachable",
            Verdict::Irreducible => "irreducible",
        }
    }

    /// Pre-checks in emission order: the init boundary first
    pub fn pre_checks(&self) -> Vec<PreCheck> {
        match self {
            Verdict::Hoistable { low, high } => {
                if high.boundary == Boundary::Init {
                    vec![*high, *low]
                } else {
                    vec![*low, *high]
                }
            }
            Verdict::InvariantHoistable { check } => vec![*check],
            _ => vec![],
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Hoistable { low, high } => write!(f, "hoistable(low={low}, high={high})"),
            Verdict::InvariantHoistable { check } => write!(f, "invariant-hoistable({check})"),
            other => f.write_str(other.name()),
        }
    }
}

// ============================================================================
// Prover
// ============================================================================

#[derive(Debug, Clone)]
pub struct Prover {
    budget: Budget,
    loop_predication: bool,
}

impl Prover {
    pub fn new(budget: Budget, loop_predication: bool) -> Self {
        Self { budget, loop_predication }
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    /// Prove one fact. `counted` is the loop containing the check, if any.
    pub fn prove(&mut self, fact: &BoundsCheckFact<'_>, counted: Option<&CountedLoop>) -> Verdict {
        if !self.budget.charge() {
            tracing::debug!(check = %fact.check, "compile budget exhausted");
            return Verdict::Irreducible;
        }
        let verdict = self.decide(fact, counted);
        tracing::debug!(check = %fact.check, %fact, %verdict, "range check verdict");
        verdict
    }

    fn decide(&self, fact: &BoundsCheckFact<'_>, counted: Option<&CountedLoop>) -> Verdict {
        let length = fact.length;
        if length.is_top() {
            return Verdict::Unreachable;
        }

        let (index, iteration) = match &fact.index {
            IndexTerm::Range(r) => (*r, None),
            IndexTerm::Affine(affine) => {
                let Some(counted) = counted else {
                    return Verdict::Irreducible;
                };
                if counted.iv.loop_id != affine.iv.loop_id {
                    return Verdict::Irreducible;
                }
                let iteration = iteration_range(affine.iv, &counted.limit);
                if iteration.is_top() {
                    return Verdict::Unreachable;
                }
                if iteration.is_bottom() {
                    return Verdict::Irreducible;
                }
                if let Some(short) = &affine.short {
                    let part = iteration.scale_safe(short.scale).add(&short.offset);
                    if part.is_bottom() {
                        return Verdict::Irreducible;
                    }
                }
                let iv_range = if length.width() == Width::I64 { iteration.to_long() } else { iteration };
                let index = iv_range.scale_safe(affine.scale).add(&affine.offset);
                if index.is_bottom() {
                    return Verdict::Irreducible;
                }
                (index, Some((iteration, affine.scale, affine.short)))
            }
        };
        if index.is_top() {
            return Verdict::Unreachable;
        }

        match static_outcome(index, length, fact.mode) {
            Some(true) => return Verdict::AlwaysPasses,
            Some(false) => return Verdict::AlwaysFails,
            None => {}
        }

        let Some(loop_id) = fact.loop_id else {
            return Verdict::Irreducible;
        };
        let Some(counted) = counted else {
            return Verdict::Irreducible;
        };
        if fact.mode == CheckMode::UnsignedSubFoldable && length.lo() < 0 {
            return Verdict::Irreducible;
        }

        let pre = |boundary, scale, short| PreCheck {
            check: fact.check,
            boundary,
            loop_id,
            scale,
            index: fact.index_node,
            length: fact.length_node,
            mode: fact.mode,
            short,
        };

        match iteration {
            None if self.loop_predication => Verdict::InvariantHoistable {
                check: pre(Boundary::Invariant, 0, None),
            },
            None => Verdict::Irreducible,
            Some(_) if !counted.exact => Verdict::Irreducible,
            Some((iteration, scale, short)) => {
                // Endpoints from the affine function at both ends of the loop
                let (first, far) = match counted.iv.kind {
                    LoopKind::CountedUp => (iteration.lo(), iteration.hi()),
                    LoopKind::CountedDown => (iteration.hi(), iteration.lo()),
                };
                let at_first = scale as i128 * first as i128;
                let at_far = scale as i128 * far as i128;
                let init = pre(Boundary::Init, scale, short);
                let last = pre(Boundary::Last, scale, short);
                if at_first <= at_far {
                    Verdict::Hoistable { low: init, high: last }
                } else {
                    Verdict::Hoistable { low: last, high: init }
                }
            }
        }
    }
}

/// Decide the check for every index in `index`, if possible
fn static_outcome(index: IntRange, length: IntRange, mode: CheckMode) -> Option<bool> {
    if index.is_bottom() {
        return None;
    }
    match mode {
        CheckMode::Signed => {
            if index.hi() < 0 || index.lo() >= length.hi() {
                Some(false)
            } else if index.lo() >= 0 && index.hi() < length.lo() {
                Some(true)
            } else {
                None
            }
        }
        CheckMode::UnsignedSubFoldable => {
            let (ui, ul) = (index.as_unsigned(), length.as_unsigned());
            if ui.lo() >= ul.hi() {
                Some(false)
            } else if ui.hi() < ul.lo() {
                Some(true)
            } else {
                None
            }
        }
    }
}
