//! Parser tests for the method description language

use crate::error::RceError;
use crate::ir::{BranchAction, CheckMode, CmpOp, ExceptionKind, LoopId, Method, Node, Stmt, TestShape};
use crate::parser::{parse, parse_method};
use crate::range::{IntRange, Width};
use crate::lexer::Span;

fn parse_ok(source: &str) -> Method {
    parse_method(source).expect("parse should succeed")
}

fn parse_err(source: &str) -> RceError {
    parse_method(source).expect_err("parse should fail")
}

// ============================================
// Declarations
// ============================================

#[test]
fn test_parse_empty_method() {
    let m = parse_ok("method empty { }");
    assert_eq!(m.name, "empty");
    assert!(m.body.is_empty());
}

#[test]
fn test_parse_several_methods() {
    let methods = parse("method a { } method b { }").unwrap();
    let names: Vec<_> = methods.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert!(parse_method("method a { } method b { }").is_err());
}

#[test]
fn test_parse_param_range() {
    let m = parse_ok("method m { param off: i32 in [-10, 10]; param n: i64; }");
    assert_eq!(m.params.len(), 2);
    match m.graph.node(m.params[0]).unwrap() {
        Node::Param { name, range } => {
            assert_eq!(name, "off");
            assert_eq!(*range, IntRange::new(-10, 10, Width::I32));
        }
        other => panic!("expected a param, got {other:?}"),
    }
    match m.graph.node(m.params[1]).unwrap() {
        Node::Param { range, .. } => assert_eq!(*range, IntRange::bottom(Width::I64)),
        other => panic!("expected a param, got {other:?}"),
    }
}

#[test]
fn test_parse_param_range_must_fit() {
    let err = parse_err("method m { param x: i32 in [0, 3000000000]; }");
    assert!(err.message().contains("not a valid i32 range"));
    assert!(parse_method("method m { param x: i32 in [5, 1]; }").is_err());
}

#[test]
fn test_parse_array_length_expression() {
    let m = parse_ok("method m { param n: i32 in [0, 100]; array a: n + 1; }");
    let len = m.arrays[0].length;
    assert!(matches!(m.graph.node(len).unwrap(), Node::Add { .. }));
}

// ============================================
// Loops and sites
// ============================================

#[test]
fn test_parse_counted_loop() {
    let m = parse_ok(
        "method m {
            array a: 199;
            for i: i32 = 0; i < 100; i += 1 {
                check c0 @4: a[2 * i];
                store s0 @6: a[2 * i] after c0;
            }
        }",
    );
    let lp = &m.loops[0];
    assert_eq!(lp.test, CmpOp::Lt);
    assert_eq!(lp.stride, 1);
    assert_eq!(lp.width, Width::I32);
    assert_eq!(lp.body.len(), 2);
    assert_eq!(m.checks[0].bci, 4);
    assert_eq!(m.checks[0].loop_id, Some(LoopId(0)));
    assert_eq!(m.stores[0].guarded_by, vec![m.checks[0].id]);
}

#[test]
fn test_parse_descending_long_loop() {
    let m = parse_ok(
        "method m {
            array a: 100L;
            for i: i64 = 99; i >= 0; i -= 3 { check c0 @1: a[i] unsigned; }
        }",
    );
    assert_eq!(m.loops[0].stride, -3);
    assert_eq!(m.checks[0].mode, CheckMode::UnsignedSubFoldable);
}

#[test]
fn test_parse_nested_loops_scope_ivs() {
    let m = parse_ok(
        "method m {
            array a: 1000;
            for i: i32 = 0; i < 10; i += 1 {
                for j: i32 = 0; j < 10; j += 1 { check c0 @3: a[10 * i + j]; }
            }
        }",
    );
    assert_eq!(m.loops[1].parent, Some(LoopId(0)));
    assert_eq!(m.checks[0].loop_id, Some(LoopId(1)));

    let err = parse_err(
        "method m {
            array a: 1000;
            for i: i32 = 0; i < 10; i += 1 { for j: i32 = 0; j < 10; j += 1 { } }
            check c0 @3: a[j];
        }",
    );
    assert!(err.message().contains("unknown name `j`"));
}

#[test]
fn test_parse_loop_must_test_its_own_variable() {
    let err = parse_err("method m { param n: i32; for i: i32 = 0; n < 10; i += 1 { } }");
    assert!(err.message().contains("loop test must compare `i`"));
}

#[test]
fn test_parse_zero_stride_rejected() {
    assert!(parse_method("method m { for i: i32 = 0; i < 10; i += 0 { } }").is_err());
}

#[test]
fn test_parse_min_stride() {
    let m = parse_ok("method m { for i: i64 = 0; i < 10L; i -= 9223372036854775808 { } }");
    assert_eq!(m.loops[0].stride, i64::MIN);
}

#[test]
fn test_parse_branch_and_break() {
    let m = parse_ok(
        "method m {
            param lo: i32;
            for i: i32 = 0; i < 100; i += 1 {
                if i < -100000 || i > 100000 throw @8;
                if i >= lo && i <= 50 continue @9;
                break if i == 40;
            }
        }",
    );
    let first = &m.branches[0];
    assert_eq!(first.shape, TestShape::Outside);
    assert_eq!(first.action, BranchAction::Throw(ExceptionKind::IllegalArgument));
    assert_eq!(first.first.op, CmpOp::Lt);
    assert_eq!(first.second.op, CmpOp::Gt);
    assert_eq!(m.branches[1].shape, TestShape::Inside);
    assert_eq!(m.branches[1].action, BranchAction::Continue);
    assert!(matches!(m.loops[0].body[2], Stmt::BreakIf(_)));
    assert!(!m.loops[0].is_exact());
}

#[test]
fn test_parse_exception_kind() {
    let m = parse_ok("method m { param x: i32; if x < 0 || x > 9 throw IndexOutOfBounds @2; }");
    assert_eq!(m.branches[0].action, BranchAction::Throw(ExceptionKind::IndexOutOfBounds));
    assert!(parse_method("method m { param x: i32; if x < 0 || x > 9 throw Oops @2; }").is_err());
}

#[test]
fn test_parse_break_outside_loop() {
    let err = parse_err("method m { param x: i32; break if x == 1; }");
    assert!(matches!(err, RceError::Parser { .. }));
}

// ============================================
// Expressions
// ============================================

#[test]
fn test_shift_binds_looser_than_addition() {
    let m = parse_ok("method m { param x: i32; array a: 100; check c0 @0: a[x << 1 + 1]; }");
    match m.graph.node(m.checks[0].index).unwrap() {
        Node::Shl { amount, .. } => assert!(matches!(m.graph.node(*amount).unwrap(), Node::Add { .. })),
        other => panic!("expected a shift, got {other:?}"),
    }
}

#[test]
fn test_literal_takes_operand_width() {
    let m = parse_ok("method m { param x: i64; array a: 100L; check c0 @0: a[x + 5]; }");
    assert_eq!(m.graph.width(m.checks[0].index), Width::I64);
}

#[test]
fn test_long_cast() {
    let m = parse_ok(
        "method m { array a: 100L; for i: i32 = 0; i < 10; i += 1 { check c0 @0: a[(long)(i * 3) + 1]; } }",
    );
    match m.graph.node(m.checks[0].index).unwrap() {
        Node::Add { lhs, .. } => assert!(matches!(m.graph.node(*lhs).unwrap(), Node::ConvI2L { .. })),
        other => panic!("expected an add, got {other:?}"),
    }
}

#[test]
fn test_negation_of_expression() {
    let m = parse_ok("method m { param x: i32; array a: 100; check c0 @0: a[-x]; }");
    assert!(matches!(m.graph.node(m.checks[0].index).unwrap(), Node::Sub { .. }));
}

#[test]
fn test_opaque_value() {
    let m = parse_ok("method m { array a: 100; check c0 @0: a[opaque(load)]; }");
    match m.graph.node(m.checks[0].index).unwrap() {
        Node::Opaque { label, width } => {
            assert_eq!(label, "load");
            assert_eq!(*width, Width::I32);
        }
        other => panic!("expected opaque, got {other:?}"),
    }
}

// ============================================
// Errors
// ============================================

#[test]
fn test_width_mismatch_reports_span() {
    let source = "method m { param x: i64; array a: 10; check c0 @0: a[x]; }";
    let err = parse_err(source);
    let span = err.span().unwrap();
    assert_eq!(&source[span.start..span.end], "x");
    assert!(err.message().contains("expected a i32 value, found i64"));
}

#[test]
fn test_literal_overflow() {
    let err = parse_err("method m { array a: 3000000000; }");
    assert!(err.message().contains("does not fit in i32"));
}

#[test]
fn test_unknown_array_and_check() {
    assert!(parse_err("method m { param i: i32; check c0 @0: b[i]; }").message().contains("unknown array"));
    assert!(parse_err("method m { array a: 10; param i: i32; store s0 @0: a[i] after c9; }")
        .message()
        .contains("unknown check"));
}

#[test]
fn test_duplicate_check_name() {
    let err = parse_err("method m { array a: 10; param i: i32; check c0 @0: a[i]; check c0 @1: a[i]; }");
    assert!(err.message().contains("declared twice"));
}

#[test]
fn test_unexpected_token_message() {
    let err = parse_err("method m { array a 10; }");
    assert_eq!(err.message(), "expected `:`, found `10`");
    assert_eq!(err.span(), Some(Span::new(19, 21)));
}

#[test]
fn test_unexpected_end_of_input() {
    let err = parse_err("method m { array a: 10;");
    assert!(err.message().contains("end of input"));
}
