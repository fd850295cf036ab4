//! Bounds-check facts and the per-site optimization state machine
//!
//! A `BoundsCheckFact` is the assertion `0 <= index < length` of one check
//! site, with the index already classified by the loop model. Facts live for
//! one analysis pass and borrow the model's induction variables.
//!
//! ```text
//! Unanalyzed --> RangeComputed --> Verdicted --> Hoisted
//!                                            \-> Fused
//!                                            \-> Eliminated
//!                                            \-> Unchanged
//! ```
//!
//! Terminal states are final for the compilation; `CheckTracker` refuses any
//! transition out of them.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::{RceError, Result};
use crate::ir::{BranchId, CheckId, CheckMode, CheckSite, LoopId, Method, NodeId};
use crate::loops::{AffineIndexExpr, IndexClass, LoopModel, OpaqueReason};
use crate::range::IntRange;

/// Index side of a fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndexTerm<'m> {
    Affine(AffineIndexExpr<'m>),
    /// Loop-invariant (or outside any loop)
    Range(IntRange),
}

/// `0 <= index < length` for one check site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundsCheckFact<'m> {
    pub check: CheckId,
    pub index: IndexTerm<'m>,
    pub length: IntRange,
    pub mode: CheckMode,
    pub index_node: NodeId,
    pub length_node: NodeId,
    pub loop_id: Option<LoopId>,
}

/// Outcome of building a fact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Derived<'m> {
    Fact(BoundsCheckFact<'m>),
    Opaque(OpaqueReason),
}

impl<'m> BoundsCheckFact<'m> {
    /// Classify the check's index against its innermost loop
    pub fn derive(method: &Method, model: &'m LoopModel, site: &CheckSite) -> Result<Derived<'m>> {
        let length_node = method.check_length(site)?;
        let length = model.range(length_node);
        let index = match site.loop_id {
            None => IndexTerm::Range(model.range(site.index)),
            Some(lp) => match model.classify_index(method, lp, site.index)? {
                IndexClass::Affine(affine) => IndexTerm::Affine(affine),
                IndexClass::Invariant(range) => IndexTerm::Range(range),
                IndexClass::Opaque(reason) => return Ok(Derived::Opaque(reason)),
            },
        };
        Ok(Derived::Fact(BoundsCheckFact {
            check: site.id,
            index,
            length,
            mode: site.mode,
            index_node: site.index,
            length_node,
            loop_id: site.loop_id,
        }))
    }
}

impl fmt::Display for BoundsCheckFact<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            CheckMode::Signed => "signed",
            CheckMode::UnsignedSubFoldable => "unsigned",
        };
        match &self.index {
            IndexTerm::Affine(a) => write!(f, "0 <= {a} < {} ({mode})", self.length),
            IndexTerm::Range(r) => write!(f, "0 <= {r} < {} ({mode})", self.length),
        }
    }
}

// ============================================================================
// State machine
// ============================================================================

/// Optimization state of a check or branch site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CheckState {
    #[default]
    Unanalyzed,
    RangeComputed,
    Verdicted,
    Hoisted,
    Fused,
    Eliminated,
    Unchanged,
}

impl CheckState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CheckState::Hoisted | CheckState::Fused | CheckState::Eliminated | CheckState::Unchanged
        )
    }

    fn can_advance_to(self, next: CheckState) -> bool {
        use CheckState::*;
        match (self, next) {
            (Unanalyzed, RangeComputed) => true,
            // Opaque indices never reach a verdict
            (Unanalyzed, Unchanged) => true,
            (RangeComputed, Verdicted) => true,
            (Verdicted, Hoisted | Fused | Eliminated | Unchanged) => true,
            _ => false,
        }
    }
}

/// A site tracked by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Site {
    Check(CheckId),
    Branch(BranchId),
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Site::Check(c) => write!(f, "{c}"),
            Site::Branch(b) => write!(f, "{b}"),
        }
    }
}

/// States of all sites in one compilation
#[derive(Debug, Clone, Default)]
pub struct CheckTracker {
    states: BTreeMap<Site, CheckState>,
}

impl CheckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, site: Site) -> CheckState {
        self.states.get(&site).copied().unwrap_or_default()
    }

    pub fn advance(&mut self, site: Site, next: CheckState) -> Result<()> {
        let current = self.state(site);
        if !current.can_advance_to(next) {
            return Err(RceError::illegal_transition(format!(
                "{site}: {current:?} -> {next:?}"
            )));
        }
        tracing::trace!(%site, from = ?current, to = ?next, "state transition");
        self.states.insert(site, next);
        Ok(())
    }

    /// Sites that reached a terminal state
    pub fn terminal(&self) -> impl Iterator<Item = (Site, CheckState)> + '_ {
        self.states
            .iter()
            .filter(|(_, s)| s.is_terminal())
            .map(|(site, s)| (*site, *s))
    }
}
