//! Integration tests for the range-check elimination engine
//!
//! Drives the full pipeline through the textual method format:
//! - Parsing and analysis (verdicts per check)
//! - Rewrite plans and their transactional application
//! - Interpreted vs compiled execution, including deoptimization
//! - Recompilation after traps

use rce::config::{RceConfig, StressConfig};
use rce::deopt::Runtime;
use rce::fusion::FusionOutcome;
use rce::interp::{Execution, Executor, Outcome, run_interpreted};
use rce::ir::{Bindings, CheckId, ExceptionKind, StoreId};
use rce::opt::{CheckOutcome, Compilation, CompiledMethod, Pipeline, RewriteCommand, apply, compile};
use rce::parser::parse_method;
use rce::prover::{Boundary, Verdict};
use rce::Method;

/// Helper to parse a method and compile it with the default configuration
fn compile_source(source: &str) -> (Method, Compilation, CompiledMethod) {
    let method = parse_method(source).expect("method should parse");
    let (compilation, code) = compile(&method, &RceConfig::default(), None).expect("method should compile");
    (method, compilation, code)
}

fn bindings(args: &[(&str, i64)]) -> Bindings {
    args.iter().fold(Bindings::new(), |b, (name, v)| b.with_param(name, *v))
}

/// Run both forms and require identical observable behavior
fn run_both(method: &Method, code: &CompiledMethod, args: &[(&str, i64)]) -> (Execution, Execution) {
    let env = bindings(args);
    let interpreted = run_interpreted(method, &env).expect("interpreted run");
    let compiled = Executor::compiled(code).run(&env).expect("compiled run");
    assert!(
        interpreted.same_behavior(&compiled),
        "divergence for {args:?}: {:?} vs {:?}",
        interpreted.outcome,
        compiled.outcome
    );
    (interpreted, compiled)
}

fn verdict<'c>(compilation: &'c Compilation, check: &str) -> &'c Verdict {
    match &compilation.report(check).expect("check was analyzed").outcome {
        CheckOutcome::Verdict(v) => v,
        CheckOutcome::Opaque(reason) => panic!("{check} is opaque: {reason:?}"),
    }
}

const SCALED: &str = "
method scaled {
    param off: i32 in [-10, 10];
    array a: 199;
    for i: i32 = 0; i < 100; i += 1 {
        check c0 @4: a[2 * i + off];
        store s0 @6: a[2 * i + off] after c0;
    }
}";

const RANGE_TEST: &str = "
method range_test {
    param x: i32;
    if x < -100000 || x > 100000 throw IllegalArgument @3;
}";

const EMPTY_INTERVAL: &str = "
method empty_interval {
    param i: i32 in [-128, 127];
    if i < 0 || i > -1 throw IllegalArgument @3;
}";

const WIDE_STRIDE: &str = "
method wide_stride {
    array a: 1000L;
    for i: i64 = 0; i < 100L; i -= 9223372036854775806 {
        check c0 @2: a[i * 7];
    }
}";

const TWO_LENGTHS: &str = "
method two_lengths {
    param n: i32 in [0, 1000];
    array a: 10;
    array b: n;
    for i: i32 = 0; i < 10; i += 1 {
        check c0 @1: b[i];
        store s0 @2: b[i] after c0;
        check c1 @3: a[i];
        store s1 @4: a[i] after c0, c1;
    }
}";

// ============================================
// Scenario 1: scaled index with offset
// ============================================

#[test]
fn test_scaled_index_is_hoistable() {
    let (method, compilation, _) = compile_source(SCALED);
    let Verdict::Hoistable { low, high } = verdict(&compilation, "c0") else {
        panic!("expected hoistable");
    };
    assert_eq!(low.boundary, Boundary::Init);
    assert_eq!(high.boundary, Boundary::Last);

    let env = bindings(&[("off", 0)]);
    assert_eq!(low.boundary_index(&method, &env).unwrap(), Some(0));
    assert_eq!(high.boundary_index(&method, &env).unwrap(), Some(198));
    assert!(low.holds(&method, &env).unwrap() && high.holds(&method, &env).unwrap());
}

#[test]
fn test_scaled_index_plan() {
    let (_, compilation, _) = compile_source(SCALED);
    insta::assert_snapshot!(compilation.render().trim_end(), @r"
    insert-guard g0 before L0: c0@L0:init deopt(range_check @4)
    insert-guard g1 before L0: c0@L0:last deopt(range_check @4)
    remove c0 (hoisted)
    pin s0 to g1
    ");
}

#[test]
fn test_negative_offset_deopts_then_throws_once() {
    let (method, _, code) = compile_source(SCALED);
    let (interpreted, compiled) = run_both(&method, &code, &[("off", -5)]);
    assert_eq!(compiled.outcome, Outcome::Threw(ExceptionKind::IndexOutOfBounds));
    assert_eq!(compiled.thrown_at, Some(4));
    assert_eq!(compiled.deopts.len(), 1);
    assert_eq!(compiled.deopts[0].check, CheckId(0));
    assert_eq!(interpreted.store_count(StoreId(0)), 0);
}

#[test]
fn test_scaled_index_all_offsets_agree() {
    let (method, _, code) = compile_source(SCALED);
    for off in -10..=10 {
        let (_, compiled) = run_both(&method, &code, &[("off", off)]);
        assert_eq!(compiled.deopts.is_empty(), off == 0, "off = {off}");
    }
}

// ============================================
// Scenario 2 and 3: compare fusion
// ============================================

#[test]
fn test_two_sided_test_fuses() {
    let (method, compilation, code) = compile_source(RANGE_TEST);
    assert!(matches!(compilation.branches[0].outcome, FusionOutcome::Fused(_)));
    insta::assert_snapshot!(compilation.render().trim_end(), @"fuse b0: (n0 - (n1+0)) >=u ((n2+0) - (n1+0) + 1)");

    let (_, run) = run_both(&method, &code, &[("x", 42)]);
    assert_eq!(run.outcome, Outcome::Returned);
    let (_, run) = run_both(&method, &code, &[("x", i32::MIN as i64)]);
    assert_eq!(run.outcome, Outcome::Threw(ExceptionKind::IllegalArgument));
    for x in [-100001, -100000, 100000, 100001, i32::MAX as i64] {
        run_both(&method, &code, &[("x", x)]);
    }
}

#[test]
fn test_empty_interval_folds_to_throw() {
    let (method, compilation, code) = compile_source(EMPTY_INTERVAL);
    assert_eq!(compilation.branches[0].outcome, FusionOutcome::AlwaysTrue);
    assert_eq!(compilation.stats.branches_folded, 1);
    assert!(matches!(compilation.commands[0], RewriteCommand::FoldBranch { taken: true, .. }));
    for i in [-128, -1, 0, 127] {
        let (_, run) = run_both(&method, &code, &[("i", i)]);
        assert_eq!(run.outcome, Outcome::Threw(ExceptionKind::IllegalArgument));
    }
}

// ============================================
// Scenario 4: stride near i64::MIN
// ============================================

#[test]
fn test_extreme_long_stride_is_irreducible() {
    let (method, compilation, code) = compile_source(WIDE_STRIDE);
    assert_eq!(verdict(&compilation, "c0"), &Verdict::Irreducible);
    assert!(compilation.commands.is_empty());
    let (_, run) = run_both(&method, &code, &[]);
    assert_eq!(run.outcome, Outcome::Threw(ExceptionKind::IndexOutOfBounds));
}

// ============================================
// Scenario 5: two checks, one index, different lengths
// ============================================

#[test]
fn test_failing_first_check_blocks_store() {
    let (method, compilation, code) = compile_source(TWO_LENGTHS);
    assert!(matches!(verdict(&compilation, "c0"), Verdict::Hoistable { .. }));
    assert_eq!(verdict(&compilation, "c1"), &Verdict::AlwaysPasses);
    assert_eq!(code.pins.get(&StoreId(1)).map(Vec::len), Some(2));

    let (_, run) = run_both(&method, &code, &[("n", 0)]);
    assert_eq!(run.outcome, Outcome::Threw(ExceptionKind::IndexOutOfBounds));
    assert_eq!(run.thrown_at, Some(1));
    assert_eq!(run.writes.len(), 0);

    let (_, run) = run_both(&method, &code, &[("n", 5)]);
    assert_eq!(run.store_count(StoreId(0)), 5);
    assert_eq!(run.store_count(StoreId(1)), 5);

    let (_, run) = run_both(&method, &code, &[("n", 10)]);
    assert_eq!(run.outcome, Outcome::Returned);
    assert!(run.deopts.is_empty());
}

// ============================================
// Checks decided without guards
// ============================================

const ALWAYS_FAILS: &str = "
method always_fails {
    param n: i32 in [0, 50];
    array a: 100;
    for i: i32 = 0; i < n; i += 1 {
        check c0 @5: a[i + 200];
        store s0 @7: a[i + 200] after c0;
    }
}";

const DEAD_LOOP: &str = "
method dead_loop {
    param n: i32 in [0, 5];
    param off: i32;
    array a: 8;
    for i: i32 = 10; i < n; i += 1 {
        check c0 @3: a[i + off];
        store s0 @4: a[i + off] after c0;
    }
}";

#[test]
fn test_always_failing_check_throws_only_when_reached() {
    let (method, compilation, code) = compile_source(ALWAYS_FAILS);
    assert_eq!(verdict(&compilation, "c0"), &Verdict::AlwaysFails);
    assert_eq!(code.throws.get(&CheckId(0)), Some(&ExceptionKind::IndexOutOfBounds));
    assert!(code.guards.is_empty());

    let (_, compiled) = run_both(&method, &code, &[("n", 0)]);
    assert_eq!(compiled.outcome, Outcome::Returned);
    assert!(compiled.writes.is_empty());

    for n in [1, 50] {
        let (interpreted, compiled) = run_both(&method, &code, &[("n", n)]);
        assert_eq!(compiled.outcome, Outcome::Threw(ExceptionKind::IndexOutOfBounds));
        assert_eq!(interpreted.thrown_at, Some(5));
        assert_eq!(compiled.thrown_at, Some(5));
        assert!(compiled.writes.is_empty());
    }
}

#[test]
fn test_unreachable_check_removed() {
    let (method, compilation, code) = compile_source(DEAD_LOOP);
    assert_eq!(verdict(&compilation, "c0"), &Verdict::Unreachable);
    assert!(code.is_removed(CheckId(0)));
    assert!(code.guards.is_empty());
    for (n, off) in [(0, 0), (5, -100), (3, 1_000_000)] {
        let (_, compiled) = run_both(&method, &code, &[("n", n), ("off", off)]);
        assert_eq!(compiled.outcome, Outcome::Returned);
        assert!(compiled.writes.is_empty());
    }
}

// ============================================
// Pipeline properties
// ============================================

#[test]
fn test_compilation_is_idempotent() {
    for source in [SCALED, RANGE_TEST, EMPTY_INTERVAL, WIDE_STRIDE, TWO_LENGTHS] {
        let method = parse_method(source).unwrap();
        let config = RceConfig::default();
        let first = Pipeline::for_config(&config).run(&method, &config, None).unwrap();
        let second = Pipeline::for_config(&config).run(&method, &config, None).unwrap();
        assert_eq!(first.commands, second.commands);
        assert_eq!(first.checks, second.checks);
    }
}

#[test]
fn test_stress_order_preserves_behavior() {
    let method = parse_method(TWO_LENGTHS).unwrap();
    let stressed = RceConfig {
        stress: StressConfig { reverse_check_order: true, rotate_checks: 1, ..StressConfig::default() },
        ..RceConfig::default()
    };
    let (_, plain) = compile(&method, &RceConfig::default(), None).unwrap();
    let (_, shuffled) = compile(&method, &stressed, None).unwrap();
    for n in [0, 3, 9, 10, 1000] {
        let (a, _) = run_both(&method, &plain, &[("n", n)]);
        let (b, _) = run_both(&method, &shuffled, &[("n", n)]);
        assert!(a.same_behavior(&b));
    }
}

#[test]
fn test_reshaped_loops_are_rederived() {
    let method = parse_method(SCALED).unwrap();
    let reshaped = RceConfig {
        stress: StressConfig { reshape_loops: true, ..StressConfig::default() },
        ..RceConfig::default()
    };
    let (plain, _) = compile(&method, &RceConfig::default(), None).unwrap();
    let (again, code) = compile(&method, &reshaped, None).unwrap();
    assert_eq!(plain.commands, again.commands);
    for off in [-3, 0, 4] {
        run_both(&method, &code, &[("off", off)]);
    }
}

#[test]
fn test_disabled_config_emits_nothing() {
    let method = parse_method(SCALED).unwrap();
    let (compilation, code) = compile(&method, &RceConfig::disabled(), None).unwrap();
    assert!(compilation.commands.is_empty());
    assert!(code.guards.is_empty());
}

#[test]
fn test_without_predication_invariant_check_stays() {
    let source = "
        method invariant {
            param k: i32;
            array a: 10;
            for i: i32 = 0; i < 100; i += 1 {
                check c0 @2: a[k];
            }
        }";
    let method = parse_method(source).unwrap();
    let config = RceConfig::default();
    let on = Pipeline::for_config(&config).run(&method, &config, None).unwrap();
    assert!(matches!(verdict(&on, "c0"), Verdict::InvariantHoistable { .. }));

    let off_config = RceConfig { loop_predication: false, ..RceConfig::default() };
    let off = Pipeline::for_config(&off_config).run(&method, &off_config, None).unwrap();
    assert_eq!(verdict(&off, "c0"), &Verdict::Irreducible);

    let (_, code) = compile(&method, &config, None).unwrap();
    for k in [-1, 0, 9, 10] {
        run_both(&method, &code, &[("k", k)]);
    }
}

#[test]
fn test_plan_with_stripped_guards_is_rejected() {
    let (method, compilation, _) = compile_source(SCALED);
    let stripped: Vec<_> = compilation
        .commands
        .iter()
        .filter(|c| !matches!(c, RewriteCommand::InsertGuard(_)))
        .cloned()
        .collect();
    assert!(apply(&method, &stripped).is_err());
}

#[test]
fn test_side_exit_loop_not_hoisted() {
    let source = "
        method early_exit {
            param n: i32 in [0, 100];
            array a: n;
            for i: i32 = 0; i < 100; i += 1 {
                break if i == n;
                check c0 @5: a[i];
            }
        }";
    let (method, compilation, code) = compile_source(source);
    assert_eq!(verdict(&compilation, "c0"), &Verdict::Irreducible);
    for n in [0, 50, 100] {
        run_both(&method, &code, &[("n", n)]);
    }
}

// ============================================
// Deoptimization and recompilation
// ============================================

#[test]
fn test_runtime_recompiles_without_failed_guard() {
    let mut runtime = Runtime::new(RceConfig::default());
    runtime.install(parse_method(SCALED).unwrap()).unwrap();

    let failing = bindings(&[("off", 3)]);
    let run = runtime.invoke("scaled", &failing).unwrap();
    assert_eq!(run.deopts.len(), 1);
    assert!(!runtime.is_compiled("scaled"));

    let recompiled = runtime.recompile("scaled").unwrap();
    assert!(recompiled.report("c0").unwrap().hoisting_disabled);
    assert!(recompiled.commands.is_empty());

    let run = runtime.invoke("scaled", &failing).unwrap();
    assert!(run.deopts.is_empty());
    assert_eq!(run.outcome, Outcome::Threw(ExceptionKind::IndexOutOfBounds));
}

// ============================================
// Diagnostics
// ============================================

#[test]
fn test_parse_error_has_span() {
    let source = "method m { array a: 10; check c0 @1 a[0]; }";
    let err = parse_method(source).unwrap_err();
    let span = err.span().unwrap();
    assert_eq!(&source[span.start..span.end], "a");
    insta::assert_snapshot!(err.to_string(), @"Parser error at 36..37: expected `:`, found `a`");
}
