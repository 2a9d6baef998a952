//! Forward and reverse accumulation must agree on derivative values.

mod common;

use prism::prelude::*;
use prism::source::{let_in, lit, param, select, var};
use rstest::rstest;

/// A small catalogue of one-parameter bodies exercising distinct rule sets.
fn body(which: &str) -> SourceExpr {
    match which {
        "polynomial" => {
            param("x") * param("x") * param("x") + lit(2.0) * param("x") + lit(1.0)
        }
        "transcendental" => param("x").sin() * param("x").exp() + param("x").sqrt(),
        "rational" => (param("x") + lit(1.0)) / (param("x") * param("x") + lit(3.0)),
        "piecewise" => select(
            param("x").lt(lit(1.0)),
            param("x") * lit(3.0),
            param("x") * param("x") * param("x"),
        ),
        "looped" => SourceExpr::For {
            count: 5,
            init: Box::new(lit(1.0)),
            body: Box::new(SourceExpr::Carried * param("x") + lit(0.5)),
        },
        "shared" => let_in(
            "t",
            param("x").sin(),
            var("t") * var("t") + var("t"),
        ),
        other => panic!("unknown body '{other}'"),
    }
}

#[rstest]
#[case("polynomial", 0.3)]
#[case("polynomial", 2.0)]
#[case("transcendental", 0.7)]
#[case("transcendental", 2.4)]
#[case("rational", 0.5)]
#[case("rational", 3.0)]
#[case("piecewise", 0.2)]
#[case("piecewise", 4.0)]
#[case("looped", 1.1)]
#[case("looped", 0.4)]
#[case("shared", 0.9)]
#[case("shared", 2.2)]
fn test_modes_agree(#[case] which: &str, #[case] x: f64) {
    common::setup();

    let mut module = Module::new();
    let fd = build_fd(&SourceFunction::new(
        "subject",
        vec![Param::owned("x", DType::F64)],
        DType::F64,
        body(which),
    ))
    .unwrap();
    module.add(fd.clone()).unwrap();

    let request = ActivityRequest::all_active(1);
    let fwd = differentiate(&mut module, &fd, &request, DiffMode::Forward).unwrap();
    let rev = differentiate(&mut module, &fd, &request, DiffMode::Reverse).unwrap();

    let externs = ExternTable::new();
    let eval = Evaluator::new(&module, &externs);

    let primal = eval.call_fd(&fd, &mut [Value::F64(x)]).unwrap();
    let fwd_out = eval
        .call_fd(&fwd, &mut [Value::F64(x), Value::F64(1.0)])
        .unwrap();
    let rev_out = eval.call_fd(&rev, &mut [Value::F64(x)]).unwrap();

    // Both modes reproduce the primal and agree on the derivative.
    assert!(common::approx_eq(
        common::field_f64(&fwd_out, 0),
        common::as_f64(&primal)
    ));
    assert!(common::approx_eq(
        common::field_f64(&rev_out, 0),
        common::as_f64(&primal)
    ));
    assert!(
        common::approx_eq(common::field_f64(&fwd_out, 1), common::field_f64(&rev_out, 1)),
        "forward {} vs reverse {} for {which} at {x}",
        common::field_f64(&fwd_out, 1),
        common::field_f64(&rev_out, 1)
    );
}

#[rstest]
#[case(0.6, 1.7)]
#[case(2.0, 0.3)]
fn test_modes_agree_per_parameter(#[case] x: f64, #[case] y: f64) {
    common::setup();

    // f(x, y) = x*y + sin(x)/y
    let mut module = Module::new();
    let fd = build_fd(&SourceFunction::new(
        "pairwise",
        vec![
            Param::owned("x", DType::F64),
            Param::owned("y", DType::F64),
        ],
        DType::F64,
        param("x") * param("y") + param("x").sin() / param("y"),
    ))
    .unwrap();
    module.add(fd.clone()).unwrap();

    let request = ActivityRequest::all_active(2);
    let fwd = differentiate(&mut module, &fd, &request, DiffMode::Forward).unwrap();
    let rev = differentiate(&mut module, &fd, &request, DiffMode::Reverse).unwrap();

    let externs = ExternTable::new();
    let eval = Evaluator::new(&module, &externs);
    let rev_out = eval
        .call_fd(&rev, &mut [Value::F64(x), Value::F64(y)])
        .unwrap();

    // Forward mode extracts one column at a time.
    let fwd_dx = eval
        .call_fd(
            &fwd,
            &mut [Value::F64(x), Value::F64(y), Value::F64(1.0), Value::F64(0.0)],
        )
        .unwrap();
    let fwd_dy = eval
        .call_fd(
            &fwd,
            &mut [Value::F64(x), Value::F64(y), Value::F64(0.0), Value::F64(1.0)],
        )
        .unwrap();

    assert!(common::approx_eq(
        common::field_f64(&fwd_dx, 1),
        common::field_f64(&rev_out, 1)
    ));
    assert!(common::approx_eq(
        common::field_f64(&fwd_dy, 1),
        common::field_f64(&rev_out, 2)
    ));
}
