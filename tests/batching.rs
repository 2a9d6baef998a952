//! A batched descriptor must compute exactly what N independent runs of the
//! original compute.

mod common;

use prism::batch::batch;
use prism::prelude::*;
use prism::source::{call, lit, param, select};
use rstest::rstest;

fn subject() -> SourceFunction {
    // Mixes vectorizable arithmetic, a branch, and a counted loop.
    SourceFunction::new(
        "subject",
        vec![
            Param::owned("x", DType::F64),
            Param::owned("y", DType::F64),
        ],
        DType::F64,
        select(
            param("x").lt(param("y")),
            param("x") * param("y"),
            param("x") - param("y"),
        ) + SourceExpr::For {
            count: 3,
            init: Box::new(lit(1.0)),
            body: Box::new(SourceExpr::Carried * param("x").sin()),
        },
    )
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(5)]
fn test_batched_lanes_match_scalar_runs(#[case] width: usize) {
    common::setup();

    let fd = build_fd(&subject()).unwrap();
    let wide = batch(&fd, width).unwrap();
    let mut module = Module::new();
    module.add(fd.clone()).unwrap();

    let externs = ExternTable::new();
    let eval = Evaluator::new(&module, &externs);

    let xs: Vec<f64> = (0..width).map(|k| 0.3 + k as f64).collect();
    let ys: Vec<f64> = (0..width).map(|k| 1.9 - 0.4 * k as f64).collect();

    let batched = eval
        .call_fd(
            &wide,
            &mut [Value::lanes(xs.clone()), Value::lanes(ys.clone())],
        )
        .unwrap();
    let lanes = batched.as_vector().unwrap();

    for k in 0..width {
        let scalar = eval
            .call_fd(&fd, &mut [Value::F64(xs[k]), Value::F64(ys[k])])
            .unwrap();
        assert!(
            common::approx_eq(lanes[k], common::as_f64(&scalar)),
            "lane {k}: batched {} vs scalar {}",
            lanes[k],
            common::as_f64(&scalar)
        );
    }
}

#[test]
fn test_opaque_regions_replicate_per_lane() {
    common::setup();

    let decl = OpaqueDecl::new("halve", vec![DType::F64], DType::F64).device_lowerable();
    let fd = build_fd(&SourceFunction::new(
        "wrapped",
        vec![Param::owned("x", DType::F64)],
        DType::F64,
        SourceExpr::Opaque {
            decl,
            args: vec![param("x")],
        } + lit(1.0),
    ))
    .unwrap();
    let wide = batch(&fd, 3).unwrap();

    let module = {
        let mut m = Module::new();
        m.add(fd).unwrap();
        m
    };
    let mut externs = ExternTable::new();
    externs.register("halve", |args| Ok(Value::F64(args[0].as_f64()? / 2.0)));

    let out = Evaluator::new(&module, &externs)
        .call_fd(&wide, &mut [Value::lanes(vec![2.0, 4.0, 8.0])])
        .unwrap();
    assert_eq!(out, Value::lanes(vec![2.0, 3.0, 5.0]));
}

#[test]
fn test_scalar_callees_replicate_per_lane() {
    common::setup();

    let mut module = Module::new();
    let g = build_fd(&SourceFunction::new(
        "g",
        vec![Param::owned("x", DType::F64)],
        DType::F64,
        param("x") * param("x"),
    ))
    .unwrap();
    module.add(g).unwrap();

    let fd = build_fd(&SourceFunction::new(
        "f",
        vec![Param::owned("x", DType::F64)],
        DType::F64,
        call("g", DType::F64, vec![param("x")]) + lit(1.0),
    ))
    .unwrap();
    module.add(fd.clone()).unwrap();

    let wide = batch(&fd, 2).unwrap();
    let externs = ExternTable::new();
    let out = Evaluator::new(&module, &externs)
        .call_fd(&wide, &mut [Value::lanes(vec![3.0, 5.0])])
        .unwrap();
    assert_eq!(out, Value::lanes(vec![10.0, 26.0]));
}

#[test]
fn test_integer_parameters_do_not_batch() {
    common::setup();
    let fd = build_fd(&SourceFunction::new(
        "indexed",
        vec![Param::owned("n", DType::I64)],
        DType::I64,
        param("n") + SourceExpr::Const(prism::fd::Const::I64(1)),
    ))
    .unwrap();
    assert!(matches!(
        batch(&fd, 4),
        Err(TransformError::UnsupportedConstruct { .. })
    ));
}
