//! The two optimization passes

use crate::check::{BoundsCheckFact, CheckState, Derived, Site};
use crate::error::Result;
use crate::fusion::{fuse, FusionOutcome};
use crate::hoist::pin_at_site;
use crate::ir::ExceptionKind;
use crate::prover::Verdict;

use super::{BranchReport, CheckOutcome, CheckReport, RcePass, RemovalReason, RewriteCommand, Session};

// ============================================================================
// Range Check Elimination
// ============================================================================

/// Remove, throw-replace or hoist every bounds check the prover can decide
pub struct RangeCheckElimination;

impl RcePass for RangeCheckElimination {
    fn name(&self) -> &'static str {
        "range-check-elimination"
    }

    fn run(&self, session: &mut Session<'_>) -> Result<bool> {
        let before = session.commands.len();
        let refreshed = session.model.refresh(session.method)?;
        if refreshed > 0 {
            tracing::debug!(loops = refreshed, "re-derived reshaped loops");
        }
        let order = session.visit_order(session.method.checks.len());
        let Session { method, model, tracker, prover, hoister, commands, stats, checks, no_hoist_sites, .. } =
            session;
        let method = *method;

        for idx in order {
            let site = &method.checks[idx];
            let key = Site::Check(site.id);

            let fact = match BoundsCheckFact::derive(method, model, site)? {
                Derived::Fact(fact) => fact,
                Derived::Opaque(reason) => {
                    tracing::debug!(check = %site.name, ?reason, "index not analyzable");
                    tracker.advance(key, CheckState::Unchanged)?;
                    checks.push(CheckReport {
                        check: site.id,
                        name: site.name.clone(),
                        outcome: CheckOutcome::Opaque(reason),
                        hoisting_disabled: false,
                    });
                    continue;
                }
            };
            tracker.advance(key, CheckState::RangeComputed)?;

            let counted = match site.loop_id {
                Some(lp) => Some(model.counted(lp)?),
                None => None,
            };
            let verdict = prover.prove(&fact, counted);
            tracker.advance(key, CheckState::Verdicted)?;

            let hoisting_disabled = no_hoist_sites.contains(&site.bci)
                && matches!(verdict, Verdict::Hoistable { .. } | Verdict::InvariantHoistable { .. });

            let next = match &verdict {
                Verdict::AlwaysPasses | Verdict::Unreachable => {
                    let reason = if verdict == Verdict::Unreachable {
                        RemovalReason::Unreachable
                    } else {
                        RemovalReason::AlwaysPasses
                    };
                    commands.push(RewriteCommand::RemoveCheck { check: site.id, reason });
                    commands.extend(pin_at_site(method, site.id).into_iter().map(RewriteCommand::PinStore));
                    stats.checks_removed += 1;
                    CheckState::Eliminated
                }
                Verdict::AlwaysFails => {
                    commands.push(RewriteCommand::ReplaceWithThrow {
                        check: site.id,
                        kind: ExceptionKind::IndexOutOfBounds,
                    });
                    stats.checks_replaced_with_throw += 1;
                    CheckState::Eliminated
                }
                Verdict::Hoistable { .. } | Verdict::InvariantHoistable { .. } if hoisting_disabled => {
                    tracing::info!(check = %site.name, bci = site.bci, "guard failed before, keeping check");
                    CheckState::Unchanged
                }
                Verdict::Hoistable { .. } | Verdict::InvariantHoistable { .. } => {
                    match hoister.hoist(method, site.id, &verdict) {
                        Some(plan) => {
                            // Reused guards were emitted earlier; refresh their sites
                            for id in &plan.extended {
                                if let Some(current) = hoister.guard(*id) {
                                    for cmd in commands.iter_mut() {
                                        if let RewriteCommand::InsertGuard(guard) = cmd {
                                            if guard.id == *id {
                                                guard.deopt = current.deopt.clone();
                                            }
                                        }
                                    }
                                }
                            }
                            stats.guards_inserted += plan.pre_loop_guards.len();
                            commands.extend(plan.pre_loop_guards.into_iter().map(RewriteCommand::InsertGuard));
                            commands.push(RewriteCommand::RemoveCheck {
                                check: site.id,
                                reason: RemovalReason::Hoisted,
                            });
                            commands.extend(plan.pins.into_iter().map(RewriteCommand::PinStore));
                            stats.checks_hoisted += 1;
                            CheckState::Hoisted
                        }
                        None => CheckState::Unchanged,
                    }
                }
                Verdict::Irreducible => CheckState::Unchanged,
            };
            tracker.advance(key, next)?;
            checks.push(CheckReport {
                check: site.id,
                name: site.name.clone(),
                outcome: CheckOutcome::Verdict(verdict),
                hoisting_disabled,
            });
        }

        checks.sort_by_key(|r| r.check);
        Ok(commands.len() > before)
    }
}

// ============================================================================
// Compare Fusion
// ============================================================================

/// Fold `x < lo || x > hi` style tests into one unsigned compare
pub struct CompareFusion;

impl RcePass for CompareFusion {
    fn name(&self) -> &'static str {
        "compare-fusion"
    }

    fn run(&self, session: &mut Session<'_>) -> Result<bool> {
        let before = session.commands.len();
        let order = session.visit_order(session.method.branches.len());
        let Session { method, model, tracker, commands, stats, branches, .. } = session;
        let method = *method;

        for idx in order {
            let site = &method.branches[idx];
            let key = Site::Branch(site.id);
            tracker.advance(key, CheckState::RangeComputed)?;
            let outcome = fuse(&method.graph, model, &site.first, &site.second, site.shape);
            tracker.advance(key, CheckState::Verdicted)?;
            tracing::debug!(branch = %site.id, outcome = outcome.name(), "compare fusion");

            let next = match &outcome {
                FusionOutcome::Fused(fused) => {
                    commands.push(RewriteCommand::FuseCompares { branch: site.id, fused: *fused });
                    stats.branches_fused += 1;
                    CheckState::Fused
                }
                FusionOutcome::AlwaysTrue | FusionOutcome::AlwaysFalse => {
                    let taken = matches!(outcome, FusionOutcome::AlwaysTrue);
                    commands.push(RewriteCommand::FoldBranch { branch: site.id, taken });
                    stats.branches_folded += 1;
                    CheckState::Eliminated
                }
                FusionOutcome::NoFusion(_) => CheckState::Unchanged,
            };
            tracker.advance(key, next)?;
            branches.push(BranchReport { branch: site.id, outcome });
        }

        branches.sort_by_key(|r| r.branch);
        Ok(commands.len() > before)
    }
}
