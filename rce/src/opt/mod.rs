//! Range-check optimization pipeline
//!
//! Passes never edit the method. They read an immutable `Method` snapshot
//! and append `RewriteCommand`s to a `Session`; `apply` validates the whole
//! command list and produces a `CompiledMethod` only if every command is
//! consistent.
//!
//! # Available Passes
//!
//! - **RangeCheckElimination**: proves bounds checks redundant, replaces
//!   always-failing checks with throws, hoists the rest when possible
//! - **CompareFusion**: folds two-sided range tests into one unsigned compare

mod apply;
mod passes;

pub use apply::{apply, CompiledMethod};
pub use passes::{CompareFusion, RangeCheckElimination};

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::check::{CheckState, CheckTracker, Site};
use crate::config::RceConfig;
use crate::deopt::TrapHistory;
use crate::error::Result;
use crate::fusion::{FusedCompare, FusionOutcome};
use crate::hoist::{Guard, Hoister, Pin};
use crate::ir::{BranchId, CheckId, ExceptionKind, LoopId, Method};
use crate::loops::{LoopModel, OpaqueReason};
use crate::prover::{Budget, Prover, Verdict};

// ============================================================================
// Rewrite commands
// ============================================================================

/// Why a check disappears from the compiled code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemovalReason {
    AlwaysPasses,
    Unreachable,
    /// Replaced by pre-loop guards
    Hoisted,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::AlwaysPasses => f.write_str("always passes"),
            RemovalReason::Unreachable => f.write_str("unreachable"),
            RemovalReason::Hoisted => f.write_str("hoisted"),
        }
    }
}

/// One edit for the graph-editing layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RewriteCommand {
    InsertGuard(Guard),
    RemoveCheck { check: CheckId, reason: RemovalReason },
    ReplaceWithThrow { check: CheckId, kind: ExceptionKind },
    PinStore(Pin),
    FuseCompares { branch: BranchId, fused: FusedCompare },
    FoldBranch { branch: BranchId, taken: bool },
}

impl fmt::Display for RewriteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteCommand::InsertGuard(g) => write!(f, "insert-guard {g}"),
            RewriteCommand::RemoveCheck { check, reason } => write!(f, "remove {check} ({reason})"),
            RewriteCommand::ReplaceWithThrow { check, kind } => write!(f, "throw {kind} at {check}"),
            RewriteCommand::PinStore(p) => write!(f, "pin {} to {}", p.store, p.control),
            RewriteCommand::FuseCompares { branch, fused } => write!(f, "fuse {branch}: {fused}"),
            RewriteCommand::FoldBranch { branch, taken } => write!(f, "fold {branch} -> {taken}"),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RceStats {
    pub checks_removed: usize,
    pub checks_hoisted: usize,
    pub checks_replaced_with_throw: usize,
    pub guards_inserted: usize,
    pub branches_fused: usize,
    pub branches_folded: usize,
}

impl RceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total optimizations applied
    pub fn total(&self) -> usize {
        self.checks_removed
            + self.checks_hoisted
            + self.checks_replaced_with_throw
            + self.branches_fused
            + self.branches_folded
    }

    pub fn merge(&mut self, other: &RceStats) {
        self.checks_removed += other.checks_removed;
        self.checks_hoisted += other.checks_hoisted;
        self.checks_replaced_with_throw += other.checks_replaced_with_throw;
        self.guards_inserted += other.guards_inserted;
        self.branches_fused += other.branches_fused;
        self.branches_folded += other.branches_folded;
    }
}

// ============================================================================
// Session
// ============================================================================

/// Analysis result for one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CheckOutcome {
    Opaque(OpaqueReason),
    Verdict(Verdict),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub check: CheckId,
    pub name: String,
    pub outcome: CheckOutcome,
    /// Hoisting suppressed after a guard for this site failed
    pub hoisting_disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchReport {
    pub branch: BranchId,
    pub outcome: FusionOutcome,
}

/// Per-compilation state shared by the passes
pub struct Session<'m> {
    pub method: &'m Method,
    pub config: &'m RceConfig,
    pub model: LoopModel,
    pub tracker: CheckTracker,
    pub prover: Prover,
    pub hoister: Hoister,
    pub commands: Vec<RewriteCommand>,
    pub stats: RceStats,
    pub checks: Vec<CheckReport>,
    pub branches: Vec<BranchReport>,
    /// Bytecode indices whose hoisted guards failed before
    pub no_hoist_sites: BTreeSet<u32>,
}

impl<'m> Session<'m> {
    pub fn new(method: &'m Method, config: &'m RceConfig) -> Result<Self> {
        method.validate()?;
        let model = LoopModel::build(method, config.max_classify_depth)?;
        Ok(Session {
            method,
            config,
            model,
            tracker: CheckTracker::new(),
            prover: Prover::new(Budget::new(config.compile_budget), config.loop_predication),
            hoister: Hoister::new(),
            commands: Vec::new(),
            stats: RceStats::new(),
            checks: Vec::new(),
            branches: Vec::new(),
            no_hoist_sites: BTreeSet::new(),
        })
    }

    /// Order in which sites are visited, permuted in stress mode
    pub fn visit_order(&self, count: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..count).collect();
        if self.config.stress.reverse_check_order {
            order.reverse();
        }
        if count > 0 {
            order.rotate_left(self.config.stress.rotate_checks % count);
        }
        order
    }

    /// A transformation changed the shape of `id`; its induction variable
    /// must be derived again before use
    pub fn loop_shape_changed(&mut self, id: LoopId) {
        self.model.invalidate(id);
    }

    pub fn state(&self, site: Site) -> CheckState {
        self.tracker.state(site)
    }
}

/// An optimization over one method
pub trait RcePass {
    /// Name of the optimization pass
    fn name(&self) -> &'static str;

    /// Run the pass, appending commands to the session.
    /// Returns true if any commands were emitted
    fn run(&self, session: &mut Session<'_>) -> Result<bool>;
}

// ============================================================================
// Pipeline
// ============================================================================

/// Everything one compilation produced
#[derive(Debug, Clone, Serialize)]
pub struct Compilation {
    pub method: String,
    pub commands: Vec<RewriteCommand>,
    pub checks: Vec<CheckReport>,
    pub branches: Vec<BranchReport>,
    pub states: Vec<(Site, CheckState)>,
    pub stats: RceStats,
}

impl Compilation {
    /// One command per line
    pub fn render(&self) -> String {
        let mut out = String::new();
        for cmd in &self.commands {
            out.push_str(&cmd.to_string());
            out.push('\n');
        }
        out
    }

    pub fn report(&self, check: &str) -> Option<&CheckReport> {
        self.checks.iter().find(|r| r.name == check)
    }
}

pub struct Pipeline {
    passes: Vec<Box<dyn RcePass>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Passes enabled by `config`
    pub fn for_config(config: &RceConfig) -> Self {
        let mut pipeline = Self::new();
        if config.range_check_elimination {
            pipeline.add_pass(Box::new(RangeCheckElimination));
        }
        if config.fold_compares {
            pipeline.add_pass(Box::new(CompareFusion));
        }
        pipeline
    }

    pub fn add_pass(&mut self, pass: Box<dyn RcePass>) {
        self.passes.push(pass);
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run every pass over `method`.
    ///
    /// With a trap history, sites whose guards failed before are not hoisted
    /// again, and a method over the trap limit skips range-check elimination.
    pub fn run(&self, method: &Method, config: &RceConfig, history: Option<&TrapHistory>) -> Result<Compilation> {
        let mut session = Session::new(method, config)?;
        let mut skip_rce = false;
        if let Some(history) = history {
            session.no_hoist_sites = history.failed_sites(&method.name);
            skip_rce = history.too_many_traps(&method.name, config.per_method_trap_limit);
        }

        for pass in &self.passes {
            if skip_rce && pass.name() == RangeCheckElimination.name() {
                tracing::warn!(method = %method.name, "too many traps, range check elimination disabled");
                continue;
            }
            if config.stress.reshape_loops {
                for lp in &method.loops {
                    session.loop_shape_changed(lp.id);
                }
            }
            let changed = pass.run(&mut session)?;
            tracing::debug!(pass = pass.name(), changed, "pass finished");
        }

        tracing::info!(
            method = %method.name,
            commands = session.commands.len(),
            optimizations = session.stats.total(),
            "compiled"
        );
        Ok(Compilation {
            method: method.name.clone(),
            states: session.tracker.terminal().collect(),
            commands: session.commands,
            checks: session.checks,
            branches: session.branches,
            stats: session.stats,
        })
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the configured pipeline and apply its commands
pub fn compile(
    method: &Method,
    config: &RceConfig,
    history: Option<&TrapHistory>,
) -> Result<(Compilation, CompiledMethod)> {
    let compilation = Pipeline::for_config(config).run(method, config, history)?;
    let compiled = apply(method, &compilation.commands)?;
    Ok((compilation, compiled))
}
