//! Deoptimization runtime model
//!
//! Tracks which hoisted guards have failed and decides how a method is
//! recompiled afterwards:
//!
//! - a method whose guard failed is dropped back to interpreted execution
//! - its next compilation keeps the in-loop check at every failed site
//! - a method that trapped `per_method_trap_limit` times is compiled without
//!   range-check elimination

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::config::RceConfig;
use crate::error::{RceError, Result};
use crate::hoist::{DeoptReason, Guard, GuardId};
use crate::interp::{ExecResult, Execution, Executor, RuntimeError};
use crate::ir::{Bindings, CheckId, LoopId, Method};
use crate::opt::{compile, Compilation, CompiledMethod};

/// One guard failure observed at runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeoptEvent {
    pub guard: GuardId,
    pub loop_id: LoopId,
    pub check: CheckId,
    /// Every site the failed guard stood in for
    pub bcis: Vec<u32>,
    pub reason: DeoptReason,
    pub recompile: bool,
}

impl DeoptEvent {
    pub fn from_guard(guard: &Guard) -> Self {
        DeoptEvent {
            guard: guard.id,
            loop_id: guard.loop_id,
            check: guard.pre.check,
            bcis: guard.deopt.bcis.clone(),
            reason: guard.deopt.reason,
            recompile: guard.deopt.recompile_on_failure,
        }
    }

    /// Fold in another guard that failed at the same loop entry
    pub fn absorb(&mut self, guard: &Guard) {
        for bci in &guard.deopt.bcis {
            if !self.bcis.contains(bci) {
                self.bcis.push(*bci);
            }
        }
        self.recompile |= guard.deopt.recompile_on_failure;
    }
}

#[derive(Debug, Clone, Default)]
struct MethodTraps {
    total: u32,
    sites: BTreeMap<u32, u32>,
}

/// Trap counts per method and site
#[derive(Debug, Clone, Default)]
pub struct TrapHistory {
    traps: BTreeMap<String, MethodTraps>,
}

impl TrapHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one trap against the method and against every site of the
    /// failed guard
    pub fn record(&mut self, method: &str, event: &DeoptEvent) {
        let traps = self.traps.entry(method.to_string()).or_default();
        traps.total += 1;
        for bci in &event.bcis {
            *traps.sites.entry(*bci).or_default() += 1;
        }
    }

    /// Total traps in `method`
    pub fn count(&self, method: &str) -> u32 {
        self.traps.get(method).map(|t| t.total).unwrap_or(0)
    }

    pub fn count_at(&self, method: &str, bci: u32) -> u32 {
        self.traps
            .get(method)
            .and_then(|t| t.sites.get(&bci))
            .copied()
            .unwrap_or(0)
    }

    pub fn too_many_traps(&self, method: &str, limit: u32) -> bool {
        self.count(method) >= limit
    }

    pub fn is_site_disabled(&self, method: &str, bci: u32) -> bool {
        self.count_at(method, bci) > 0
    }

    /// Bytecode indices that trapped at least once
    pub fn failed_sites(&self, method: &str) -> BTreeSet<u32> {
        self.traps
            .get(method)
            .map(|t| t.sites.keys().copied().collect())
            .unwrap_or_default()
    }
}

struct Installed {
    source: Method,
    code: Option<CompiledMethod>,
    last: Compilation,
    compilations: u32,
}

/// Installed methods, their compiled code and trap history
pub struct Runtime {
    config: RceConfig,
    history: TrapHistory,
    methods: BTreeMap<String, Installed>,
}

impl Runtime {
    pub fn new(config: RceConfig) -> Self {
        Runtime { config, history: TrapHistory::new(), methods: BTreeMap::new() }
    }

    pub fn history(&self) -> &TrapHistory {
        &self.history
    }

    /// Compile `method` and make it invocable by name
    pub fn install(&mut self, method: Method) -> Result<&Compilation> {
        let (last, code) = compile(&method, &self.config, Some(&self.history))?;
        let name = method.name.clone();
        let entry = Installed { source: method, code: Some(code), last, compilations: 1 };
        self.methods.insert(name.clone(), entry);
        self.compilation(&name)
            .ok_or_else(|| RceError::malformed(format!("method `{name}` was not installed")))
    }

    pub fn is_compiled(&self, name: &str) -> bool {
        self.methods.get(name).is_some_and(|m| m.code.is_some())
    }

    pub fn compilations(&self, name: &str) -> u32 {
        self.methods.get(name).map(|m| m.compilations).unwrap_or(0)
    }

    /// Report of the most recent compilation
    pub fn compilation(&self, name: &str) -> Option<&Compilation> {
        self.methods.get(name).map(|m| &m.last)
    }

    /// Run `name`, compiled if code is installed.
    ///
    /// A deoptimization records a trap and discards the compiled code; the
    /// method stays interpreted until `recompile` is called.
    pub fn invoke(&mut self, name: &str, args: &Bindings) -> ExecResult<Execution> {
        let installed = self
            .methods
            .get_mut(name)
            .ok_or_else(|| RuntimeError::malformed(&format!("no method named `{name}`")))?;
        let execution = match &installed.code {
            Some(code) => Executor::compiled(code).run(args)?,
            None => Executor::interpreted(&installed.source).run(args)?,
        };
        for event in &execution.deopts {
            self.history.record(name, event);
            if event.recompile {
                installed.code = None;
            }
        }
        if !execution.deopts.is_empty() {
            tracing::warn!(method = name, traps = self.history.count(name), "compiled code invalidated");
        }
        Ok(execution)
    }

    /// Compile `name` again, taking its trap history into account
    pub fn recompile(&mut self, name: &str) -> Result<&Compilation> {
        let installed = self
            .methods
            .get_mut(name)
            .ok_or_else(|| RceError::malformed(format!("no method named `{name}`")))?;
        let (last, code) = compile(&installed.source, &self.config, Some(&self.history))?;
        installed.code = Some(code);
        installed.last = last;
        installed.compilations += 1;
        tracing::info!(method = name, compilations = installed.compilations, "recompiled");
        Ok(&installed.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hoist::DeoptDescriptor;
    use crate::ir::{CheckMode, CmpOp, MethodBuilder, NodeId, StoreId};
    use crate::interp::Outcome;
    use crate::opt::CheckOutcome;
    use crate::prover::{Boundary, PreCheck, Verdict};
    use crate::range::{IntRange, Width};

    fn event(bcis: &[u32]) -> DeoptEvent {
        let guard = Guard {
            id: GuardId(0),
            loop_id: LoopId(0),
            pre: PreCheck {
                check: CheckId(0),
                boundary: Boundary::Init,
                loop_id: LoopId(0),
                scale: 1,
                index: NodeId(0),
                length: NodeId(0),
                mode: CheckMode::Signed,
                short: None,
            },
            deopt: DeoptDescriptor {
                reason: DeoptReason::RangeCheck,
                bcis: bcis.to_vec(),
                recompile_on_failure: true,
            },
        };
        DeoptEvent::from_guard(&guard)
    }

    fn offset_loop() -> Method {
        let w = Width::I32;
        let mut b = MethodBuilder::new("shifted");
        let off = b.param("off", IntRange::new(-10, 10, w));
        let zero = b.konst(0, w);
        let n = b.konst(50, w);
        let len = b.konst(60, w);
        let arr = b.array("a", len);
        let (_, i) = b.begin_loop("i", w, zero, n, 1, CmpOp::Lt);
        let index = b.add(i, off);
        let c0 = b.check("c0", arr, index, CheckMode::Signed, 4);
        b.store("s0", arr, index, 6, &[c0]);
        b.end_loop().unwrap();
        b.finish().unwrap()
    }

    #[test]
    fn test_trap_history_counts() {
        let mut h = TrapHistory::new();
        assert!(!h.too_many_traps("m", 2));
        h.record("m", &event(&[4]));
        h.record("m", &event(&[4]));
        h.record("m", &event(&[9]));
        assert_eq!(h.count("m"), 3);
        assert_eq!(h.count_at("m", 4), 2);
        assert!(h.is_site_disabled("m", 9));
        assert!(!h.is_site_disabled("m", 5));
        assert!(h.too_many_traps("m", 3));
        assert_eq!(h.count("other"), 0);
        assert_eq!(h.failed_sites("m").into_iter().collect::<Vec<_>>(), vec![4, 9]);
    }

    #[test]
    fn test_shared_guard_trap_marks_every_site() {
        let mut h = TrapHistory::new();
        h.record("m", &event(&[4, 8]));
        assert_eq!(h.count("m"), 1);
        assert!(h.is_site_disabled("m", 4));
        assert!(h.is_site_disabled("m", 8));
    }

    /// Two checks over one `a[i + off]` node share both guards
    fn shared_index_loop() -> Method {
        let w = Width::I32;
        let mut b = MethodBuilder::new("two");
        let off = b.param("off", IntRange::new(-10, 10, w));
        let zero = b.konst(0, w);
        let n = b.konst(50, w);
        let len = b.konst(60, w);
        let arr = b.array("a", len);
        let (_, i) = b.begin_loop("i", w, zero, n, 1, CmpOp::Lt);
        let index = b.add(i, off);
        let c0 = b.check("c0", arr, index, CheckMode::Signed, 4);
        b.store("s0", arr, index, 6, &[c0]);
        let c1 = b.check("c1", arr, index, CheckMode::Signed, 8);
        b.store("s1", arr, index, 10, &[c1]);
        b.end_loop().unwrap();
        b.finish().unwrap()
    }

    fn assert_both_sites_dropped(rt: &mut Runtime, name: &str) {
        let args = Bindings::new().with_param("off", -3);
        let run = rt.invoke(name, &args).unwrap();
        assert_eq!(run.deopts.len(), 1);
        assert_eq!(run.deopts[0].bcis, vec![4, 8]);
        assert_eq!(rt.history().count(name), 1);

        let second = rt.recompile(name).unwrap();
        assert_eq!(second.stats.checks_hoisted, 0);
        assert!(second.report("c0").unwrap().hoisting_disabled);
        assert!(second.report("c1").unwrap().hoisting_disabled);

        let again = rt.invoke(name, &args).unwrap();
        assert!(again.deopts.is_empty());
        assert_eq!(again.outcome, Outcome::Threw(crate::ir::ExceptionKind::IndexOutOfBounds));
    }

    #[test]
    fn test_shared_guard_failure_disables_every_site() {
        let mut rt = Runtime::new(RceConfig::default());
        let first = rt.install(shared_index_loop()).unwrap();
        assert_eq!(first.stats.checks_hoisted, 2);
        assert_eq!(first.stats.guards_inserted, 2);
        assert_both_sites_dropped(&mut rt, "two");
    }

    #[test]
    fn test_all_failing_guards_reported_at_entry() {
        let source = "
method parsed {
    param off: i32 in [-10, 10];
    array a: 60;
    for i: i32 = 0; i < 50; i += 1 {
        check c0 @4: a[i + off];
        store s0 @6: a[i + off] after c0;
        check c1 @8: a[i + off];
        store s1 @10: a[i + off] after c1;
    }
}";
        let mut rt = Runtime::new(RceConfig::default());
        let first = rt.install(crate::parser::parse_method(source).unwrap()).unwrap();
        assert_eq!(first.stats.checks_hoisted, 2);
        assert_eq!(first.stats.guards_inserted, 4);
        assert_both_sites_dropped(&mut rt, "parsed");
    }

    #[test]
    fn test_deopt_then_recompile_without_hoisting() {
        let mut rt = Runtime::new(RceConfig::default());
        let first = rt.install(offset_loop()).unwrap();
        assert_eq!(first.stats.checks_hoisted, 1);
        assert!(rt.is_compiled("shifted"));

        let args = Bindings::new().with_param("off", -3);
        let run = rt.invoke("shifted", &args).unwrap();
        assert_eq!(run.outcome, Outcome::Threw(crate::ir::ExceptionKind::IndexOutOfBounds));
        assert_eq!(run.deopts.len(), 1);
        assert!(!rt.is_compiled("shifted"));
        assert_eq!(rt.history().count("shifted"), 1);

        let second = rt.recompile("shifted").unwrap();
        let report = second.report("c0").unwrap();
        assert!(report.hoisting_disabled);
        assert!(matches!(report.outcome, CheckOutcome::Verdict(Verdict::Hoistable { .. })));
        assert_eq!(second.stats.checks_hoisted, 0);
        assert_eq!(rt.compilations("shifted"), 2);

        let again = rt.invoke("shifted", &args).unwrap();
        assert!(again.deopts.is_empty());
        assert_eq!(again.store_count(StoreId(0)), 0);
        assert!(rt.is_compiled("shifted"));
    }

    #[test]
    fn test_trap_limit_disables_rce() {
        let config = RceConfig { per_method_trap_limit: 1, ..RceConfig::default() };
        let mut rt = Runtime::new(config);
        rt.install(offset_loop()).unwrap();
        rt.invoke("shifted", &Bindings::new().with_param("off", -1)).unwrap();
        let second = rt.recompile("shifted").unwrap();
        assert!(second.commands.is_empty());
        assert!(second.checks.is_empty());
    }

    #[test]
    fn test_unknown_method() {
        let mut rt = Runtime::new(RceConfig::default());
        assert!(rt.invoke("missing", &Bindings::new()).is_err());
        assert!(rt.recompile("missing").is_err());
    }
}
