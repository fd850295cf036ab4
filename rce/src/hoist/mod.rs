//! Predicate Hoister
//!
//! Turns `Hoistable` and `InvariantHoistable` verdicts into pre-loop guards.
//! A guard that fails at runtime does not throw: it deoptimizes, and the
//! interpreter re-executes the loop from its entry with the original in-loop
//! check in place.
//!
//! Stores that were control dependent on a removed check are pinned to the
//! guard that now justifies them, so the editing layer cannot schedule them
//! above it.

use std::fmt;

use serde::Serialize;

use crate::ir::{CheckId, LoopId, Method, StoreId};
use crate::prover::{PreCheck, Verdict};

/// Index of a guard within one compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GuardId(pub u32);

impl fmt::Display for GuardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeoptReason {
    RangeCheck,
    /// Loop-invariant check evaluated at loop entry
    Predicate,
}

impl DeoptReason {
    pub fn name(self) -> &'static str {
        match self {
            DeoptReason::RangeCheck => "range_check",
            DeoptReason::Predicate => "predicate",
        }
    }
}

impl fmt::Display for DeoptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the runtime does when a guard fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeoptDescriptor {
    pub reason: DeoptReason,
    /// Bytecode indices of every check the guard replaces, first one first
    pub bcis: Vec<u32>,
    pub recompile_on_failure: bool,
}

impl DeoptDescriptor {
    pub fn new(reason: DeoptReason, bci: u32) -> Self {
        DeoptDescriptor { reason, bcis: vec![bci], recompile_on_failure: true }
    }
}

/// A pre-loop guard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Guard {
    pub id: GuardId,
    pub loop_id: LoopId,
    pub pre: PreCheck,
    pub deopt: DeoptDescriptor,
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} before {}: {} deopt({}", self.id, self.loop_id, self.pre, self.deopt.reason)?;
        for bci in &self.deopt.bcis {
            write!(f, " @{bci}")?;
        }
        f.write_str(")")
    }
}

/// A program point a store may be pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControlPoint {
    Guard(GuardId),
    /// Position the removed check occupied
    CheckSite(CheckId),
}

impl fmt::Display for ControlPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlPoint::Guard(g) => write!(f, "{g}"),
            ControlPoint::CheckSite(c) => write!(f, "site of {c}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pin {
    pub store: StoreId,
    pub control: ControlPoint,
}

/// Result of hoisting one check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HoistPlan {
    /// Guards that are new to this compilation, in emission order
    pub pre_loop_guards: Vec<Guard>,
    /// All guards justifying the removal, including reused ones
    pub justified_by: Vec<GuardId>,
    /// Reused guards that took on this check's bytecode index
    pub extended: Vec<GuardId>,
    pub removed: Option<CheckId>,
    pub pins: Vec<Pin>,
}

/// Allocates guards for one compilation, sharing identical ones
#[derive(Debug, Default)]
pub struct Hoister {
    guards: Vec<Guard>,
}

impl Hoister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    pub fn guard(&self, id: GuardId) -> Option<&Guard> {
        self.guards.iter().find(|g| g.id == id)
    }

    /// Plan the removal of `check` under `verdict`.
    ///
    /// Returns `None` for verdicts that do not hoist anything.
    pub fn hoist(&mut self, method: &Method, check: CheckId, verdict: &Verdict) -> Option<HoistPlan> {
        let reason = match verdict {
            Verdict::Hoistable { .. } => DeoptReason::RangeCheck,
            Verdict::InvariantHoistable { .. } => DeoptReason::Predicate,
            _ => return None,
        };
        let site = method.check(check)?;
        let mut plan = HoistPlan { removed: Some(check), ..HoistPlan::default() };

        for pre in verdict.pre_checks() {
            let id = match self.find(&pre) {
                // A failure of a shared guard disables every site it covers
                Some(existing) => {
                    let bcis = &mut existing.deopt.bcis;
                    if !bcis.contains(&site.bci) {
                        bcis.push(site.bci);
                        plan.extended.push(existing.id);
                    }
                    existing.id
                }
                None => {
                    let guard = Guard {
                        id: GuardId(self.guards.len() as u32),
                        loop_id: pre.loop_id,
                        pre,
                        deopt: DeoptDescriptor::new(reason, site.bci),
                    };
                    tracing::debug!(%guard, "hoisted guard");
                    plan.pre_loop_guards.push(guard.clone());
                    let id = guard.id;
                    self.guards.push(guard);
                    id
                }
            };
            plan.justified_by.push(id);
        }

        // The last guard dominates every store the check used to protect
        let anchor = plan.justified_by.last().copied()?;
        plan.pins = dependent_stores(method, check)
            .map(|store| Pin { store, control: ControlPoint::Guard(anchor) })
            .collect();
        Some(plan)
    }

    /// An identical guard at the same loop entry
    fn find(&mut self, pre: &PreCheck) -> Option<&mut Guard> {
        self.guards.iter_mut().find(|g| {
            g.pre.loop_id == pre.loop_id
                && g.pre.boundary == pre.boundary
                && g.pre.index == pre.index
                && g.pre.length == pre.length
                && g.pre.mode == pre.mode
        })
    }
}

/// Pins for a check that is removed without a guard
pub fn pin_at_site(method: &Method, check: CheckId) -> Vec<Pin> {
    dependent_stores(method, check)
        .map(|store| Pin { store, control: ControlPoint::CheckSite(check) })
        .collect()
}

fn dependent_stores(method: &Method, check: CheckId) -> impl Iterator<Item = StoreId> + '_ {
    method
        .stores
        .iter()
        .filter(move |s| s.guarded_by.contains(&check))
        .map(|s| s.id)
}
