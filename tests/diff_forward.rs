mod common;

use prism::prelude::*;
use prism::source::{call, lit, param, select};

fn register(module: &mut Module, source: SourceFunction) -> FuncDesc {
    let fd = build_fd(&source).unwrap();
    module.add(fd.clone()).unwrap();
    fd
}

fn jvp(module: &mut Module, fd: &FuncDesc, request: ActivityRequest) -> FuncDesc {
    differentiate(module, fd, &request, DiffMode::Forward).unwrap()
}

#[test]
fn test_tangent_of_product() {
    common::setup();
    let mut module = Module::new();
    let fd = register(
        &mut module,
        SourceFunction::new(
            "product",
            vec![
                Param::owned("x", DType::F64),
                Param::owned("y", DType::F64),
            ],
            DType::F64,
            param("x") * param("y"),
        ),
    );
    let tangent = jvp(&mut module, &fd, ActivityRequest::all_active(2).with_constant(1));
    // Signature: x, y, and one tangent input for x.
    assert_eq!(tangent.params().len(), 3);

    let externs = ExternTable::new();
    let out = Evaluator::new(&module, &externs)
        .call_fd(
            &tangent,
            &mut [Value::F64(3.0), Value::F64(4.0), Value::F64(1.0)],
        )
        .unwrap();
    assert!(common::approx_eq(common::field_f64(&out, 0), 12.0));
    assert!(common::approx_eq(common::field_f64(&out, 1), 4.0));
}

#[test]
fn test_tangent_interleaves_through_transcendentals() {
    common::setup();
    let mut module = Module::new();
    let fd = register(
        &mut module,
        SourceFunction::new(
            "wave",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            param("x").sin() * param("x") + param("x").exp(),
        ),
    );
    let tangent = jvp(&mut module, &fd, ActivityRequest::all_active(1));

    let x = 1.3f64;
    let externs = ExternTable::new();
    let out = Evaluator::new(&module, &externs)
        .call_fd(&tangent, &mut [Value::F64(x), Value::F64(1.0)])
        .unwrap();
    let expect = x.cos() * x + x.sin() + x.exp();
    assert!(common::approx_eq(common::field_f64(&out, 1), expect));
}

#[test]
fn test_tangent_through_counted_loop() {
    common::setup();
    let mut module = Module::new();
    let fd = register(
        &mut module,
        SourceFunction::new(
            "pow4",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            SourceExpr::For {
                count: 4,
                init: Box::new(lit(1.0)),
                body: Box::new(SourceExpr::Carried * param("x")),
            },
        ),
    );
    let tangent = jvp(&mut module, &fd, ActivityRequest::all_active(1));

    let externs = ExternTable::new();
    let out = Evaluator::new(&module, &externs)
        .call_fd(&tangent, &mut [Value::F64(2.0), Value::F64(1.0)])
        .unwrap();
    assert!(common::approx_eq(common::field_f64(&out, 0), 16.0));
    assert!(common::approx_eq(common::field_f64(&out, 1), 32.0));
}

#[test]
fn test_tangent_through_dynamic_loop() {
    // Forward mode carries the tangent through the iterations the condition
    // actually runs: f(x) = x doubled until >= 10, so df = 2^iterations.
    common::setup();
    let mut module = Module::new();
    let fd = register(
        &mut module,
        SourceFunction::new(
            "grow",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            SourceExpr::While {
                init: Box::new(param("x")),
                cond: Box::new(SourceExpr::Carried.lt(lit(10.0))),
                body: Box::new(SourceExpr::Carried * lit(2.0)),
            },
        ),
    );
    let tangent = jvp(&mut module, &fd, ActivityRequest::all_active(1));

    let externs = ExternTable::new();
    let out = Evaluator::new(&module, &externs)
        .call_fd(&tangent, &mut [Value::F64(3.0), Value::F64(1.0)])
        .unwrap();
    // 3 -> 6 -> 12: two iterations.
    assert!(common::approx_eq(common::field_f64(&out, 0), 12.0));
    assert!(common::approx_eq(common::field_f64(&out, 1), 4.0));
}

#[test]
fn test_tangent_follows_branch() {
    common::setup();
    let mut module = Module::new();
    let fd = register(
        &mut module,
        SourceFunction::new(
            "piecewise",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            select(param("x").lt(lit(0.0)), -param("x"), param("x") * param("x")),
        ),
    );
    let tangent = jvp(&mut module, &fd, ActivityRequest::all_active(1));

    let externs = ExternTable::new();
    let eval = Evaluator::new(&module, &externs);
    let out = eval
        .call_fd(&tangent, &mut [Value::F64(3.0), Value::F64(1.0)])
        .unwrap();
    assert!(common::approx_eq(common::field_f64(&out, 1), 6.0));
    let out = eval
        .call_fd(&tangent, &mut [Value::F64(-2.0), Value::F64(1.0)])
        .unwrap();
    assert!(common::approx_eq(common::field_f64(&out, 1), -1.0));
}

#[test]
fn test_tangent_through_call() {
    common::setup();
    let mut module = Module::new();
    register(
        &mut module,
        SourceFunction::new(
            "g",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            param("x") * param("x"),
        ),
    );
    let fd = register(
        &mut module,
        SourceFunction::new(
            "f",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            call("g", DType::F64, vec![param("x")]) * param("x"),
        ),
    );
    let tangent = jvp(&mut module, &fd, ActivityRequest::all_active(1));
    assert!(module.contains("g__jvp"));

    let externs = ExternTable::new();
    let out = Evaluator::new(&module, &externs)
        .call_fd(&tangent, &mut [Value::F64(2.0), Value::F64(1.0)])
        .unwrap();
    assert!(common::approx_eq(common::field_f64(&out, 1), 12.0));
}

#[test]
fn test_opaque_with_forward_override() {
    // The override computes both halves of the pair itself.
    common::setup();
    let mut module = Module::new();
    register(
        &mut module,
        SourceFunction::new(
            "blackbox_sq_tan",
            vec![
                Param::owned("x", DType::F64),
                Param::owned("dx", DType::F64),
            ],
            DType::Record(vec![DType::F64, DType::F64]),
            SourceExpr::Pack(vec![
                param("x") * param("x"),
                lit(2.0) * param("x") * param("dx"),
            ]),
        ),
    );
    let decl = OpaqueDecl::new("blackbox_sq", vec![DType::F64], DType::F64)
        .with_custom(CustomDerivative::forward("blackbox_sq_tan"));
    let fd = register(
        &mut module,
        SourceFunction::new(
            "shifted",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            SourceExpr::Opaque {
                decl,
                args: vec![param("x")],
            } + param("x"),
        ),
    );
    let tangent = jvp(&mut module, &fd, ActivityRequest::all_active(1));

    let externs = ExternTable::new();
    let out = Evaluator::new(&module, &externs)
        .call_fd(&tangent, &mut [Value::F64(3.0), Value::F64(1.0)])
        .unwrap();
    assert!(common::approx_eq(common::field_f64(&out, 0), 12.0));
    assert!(common::approx_eq(common::field_f64(&out, 1), 7.0));
}

#[test]
fn test_opaque_without_forward_override_fails() {
    // A reverse-only override does not satisfy a forward request.
    common::setup();
    let mut module = Module::new();
    register(
        &mut module,
        SourceFunction::new(
            "bb_adj",
            vec![
                Param::owned("x", DType::F64),
                Param::owned("seed", DType::F64),
            ],
            DType::Record(vec![DType::F64]),
            SourceExpr::Pack(vec![lit(2.0) * param("x") * param("seed")]),
        ),
    );
    let decl = OpaqueDecl::new("bb", vec![DType::F64], DType::F64)
        .with_custom(CustomDerivative::reverse("bb_adj"));
    let fd = register(
        &mut module,
        SourceFunction::new(
            "wrapped",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            SourceExpr::Opaque {
                decl,
                args: vec![param("x")],
            },
        ),
    );
    let err = differentiate(
        &mut module,
        &fd,
        &ActivityRequest::all_active(1),
        DiffMode::Forward,
    )
    .unwrap_err();
    assert!(matches!(err, TransformError::UnresolvedOpaqueRegion { .. }));
}
