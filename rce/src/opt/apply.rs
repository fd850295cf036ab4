//! Transactional application of rewrite commands
//!
//! `apply` checks the whole command list against the method before producing
//! anything. One inconsistent command rejects the list and leaves no partial
//! result behind.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{RceError, Result};
use crate::fusion::FusedCompare;
use crate::hoist::{ControlPoint, Guard, GuardId, Pin};
use crate::ir::{BranchId, CheckId, ExceptionKind, LoopId, Method, StoreId};

use super::{RemovalReason, RewriteCommand};

/// A method with its rewrites applied
#[derive(Debug, Clone, Serialize)]
pub struct CompiledMethod {
    pub method: Method,
    /// In insertion order; evaluated in this order at loop entry
    pub guards: Vec<Guard>,
    pub removed: BTreeMap<CheckId, RemovalReason>,
    pub throws: BTreeMap<CheckId, ExceptionKind>,
    /// Every control point a store must stay below
    pub pins: BTreeMap<StoreId, Vec<ControlPoint>>,
    pub fused: BTreeMap<BranchId, FusedCompare>,
    pub folded: BTreeMap<BranchId, bool>,
}

impl CompiledMethod {
    /// Unoptimized code: every check stays in place
    pub fn baseline(method: &Method) -> Self {
        CompiledMethod {
            method: method.clone(),
            guards: Vec::new(),
            removed: BTreeMap::new(),
            throws: BTreeMap::new(),
            pins: BTreeMap::new(),
            fused: BTreeMap::new(),
            folded: BTreeMap::new(),
        }
    }

    pub fn guards_for(&self, loop_id: LoopId) -> impl Iterator<Item = &Guard> {
        self.guards.iter().filter(move |g| g.loop_id == loop_id)
    }

    pub fn guard(&self, id: GuardId) -> Option<&Guard> {
        self.guards.iter().find(|g| g.id == id)
    }

    pub fn is_removed(&self, check: CheckId) -> bool {
        self.removed.contains_key(&check)
    }
}

/// Validate `commands` against `method` and apply them all, or none
pub fn apply(method: &Method, commands: &[RewriteCommand]) -> Result<CompiledMethod> {
    let mut out = CompiledMethod::baseline(method);
    let mut pins: Vec<Pin> = Vec::new();

    for cmd in commands {
        match cmd {
            RewriteCommand::InsertGuard(guard) => {
                if out.guard(guard.id).is_some() {
                    return Err(plan_error(format!("guard {} inserted twice", guard.id)));
                }
                if method.loop_decl(guard.loop_id).is_none() {
                    return Err(plan_error(format!("guard {} targets unknown loop {}", guard.id, guard.loop_id)));
                }
                let check = known_check(method, guard.pre.check)?;
                if guard.pre.loop_id != guard.loop_id
                    || check.loop_id.is_none_or(|lp| !method.loop_encloses(guard.loop_id, lp))
                {
                    return Err(plan_error(format!(
                        "guard {} is not at the entry of a loop around {}",
                        guard.id, check.name
                    )));
                }
                out.guards.push(guard.clone());
            }
            RewriteCommand::RemoveCheck { check, reason } => {
                let site = known_check(method, *check)?;
                ensure_untouched(&out, *check)?;
                if *reason == RemovalReason::Hoisted {
                    let covered = site.loop_id.is_some_and(|lp| {
                        out.guards.iter().any(|g| method.loop_encloses(g.loop_id, lp))
                    });
                    if !covered {
                        return Err(plan_error(format!("{} hoisted without a guard", site.name)));
                    }
                }
                out.removed.insert(*check, *reason);
            }
            RewriteCommand::ReplaceWithThrow { check, kind } => {
                known_check(method, *check)?;
                ensure_untouched(&out, *check)?;
                out.throws.insert(*check, *kind);
            }
            RewriteCommand::PinStore(pin) => pins.push(*pin),
            RewriteCommand::FuseCompares { branch, fused } => {
                let site = known_branch(method, *branch)?;
                ensure_branch_untouched(&out, *branch)?;
                if fused.value != site.first.value || fused.shape != site.shape {
                    return Err(plan_error(format!("fused compare does not match branch {branch}")));
                }
                out.fused.insert(*branch, *fused);
            }
            RewriteCommand::FoldBranch { branch, taken } => {
                known_branch(method, *branch)?;
                ensure_branch_untouched(&out, *branch)?;
                out.folded.insert(*branch, *taken);
            }
        }
    }

    // Pins are checked once every guard and removal is known
    for pin in pins {
        let store = method
            .store(pin.store)
            .ok_or_else(|| plan_error(format!("pin refers to unknown store {}", pin.store)))?;
        match pin.control {
            ControlPoint::Guard(g) => {
                let guard = out
                    .guard(g)
                    .ok_or_else(|| plan_error(format!("{} pinned to missing guard {g}", store.name)))?;
                if store.loop_id.is_none_or(|lp| !method.loop_encloses(guard.loop_id, lp)) {
                    return Err(plan_error(format!("{} pinned to {g}, which does not dominate it", store.name)));
                }
            }
            ControlPoint::CheckSite(c) => {
                if !out.is_removed(c) {
                    return Err(plan_error(format!("{} pinned to the site of {c}, which is still present", store.name)));
                }
            }
        }
        let controls = out.pins.entry(pin.store).or_default();
        if controls.contains(&pin.control) {
            return Err(plan_error(format!("{} pinned to {} twice", store.name, pin.control)));
        }
        controls.push(pin.control);
    }

    for store in &method.stores {
        let depends_on_removed = store.guarded_by.iter().any(|c| out.is_removed(*c));
        if depends_on_removed && !out.pins.contains_key(&store.id) {
            return Err(plan_error(format!("{} lost its check without being pinned", store.name)));
        }
    }

    tracing::debug!(
        method = %method.name,
        guards = out.guards.len(),
        removed = out.removed.len(),
        "rewrite applied"
    );
    Ok(out)
}

fn plan_error(message: String) -> RceError {
    RceError::invalid_plan(message)
}

fn known_check(method: &Method, id: CheckId) -> Result<&crate::ir::CheckSite> {
    method.check(id).ok_or_else(|| plan_error(format!("unknown check {id}")))
}

fn known_branch(method: &Method, id: BranchId) -> Result<&crate::ir::BranchSite> {
    method.branch(id).ok_or_else(|| plan_error(format!("unknown branch {id}")))
}

fn ensure_untouched(out: &CompiledMethod, check: CheckId) -> Result<()> {
    if out.removed.contains_key(&check) || out.throws.contains_key(&check) {
        return Err(plan_error(format!("{check} rewritten twice")));
    }
    Ok(())
}

fn ensure_branch_untouched(out: &CompiledMethod, branch: BranchId) -> Result<()> {
    if out.fused.contains_key(&branch) || out.folded.contains_key(&branch) {
        return Err(plan_error(format!("{branch} rewritten twice")));
    }
    Ok(())
}
