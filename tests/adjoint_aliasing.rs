//! Borrowed-mut adjoint accumulators must alias caller state: two
//! differentiated call sites sharing one accumulator see the exact sum of
//! both contributions — nothing lost, nothing double-counted.

mod common;

use prism::prelude::*;
use prism::source::{call, param, SourceExpr};

/// g(x) = x * x with a borrowed-mut x, so its reverse descriptor accumulates
/// d_x into a caller-supplied slot instead of returning a fresh value.
fn setup_module() -> (Module, FuncDesc) {
    let mut module = Module::new();
    let g = build_fd(&SourceFunction::new(
        "g",
        vec![Param::borrowed_mut("x", DType::F64)],
        DType::F64,
        param("x") * param("x"),
    ))
    .unwrap();
    module.add(g.clone()).unwrap();
    let grad = differentiate(
        &mut module,
        &g,
        &ActivityRequest::all_active(1),
        DiffMode::Reverse,
    )
    .unwrap();
    (module, grad)
}

#[test]
fn test_accumulator_parameter_is_borrowed_mut() {
    common::setup();
    let (_, grad) = setup_module();
    // Signature: primal x, then the aliased accumulator.
    assert_eq!(grad.params().len(), 2);
    assert_eq!(grad.params()[1].ownership, Ownership::BorrowedMut);
    // No adjoint travels through the return value.
    assert_eq!(grad.ret(), &DType::Record(vec![DType::F64]));
}

#[test]
fn test_single_call_increments_in_place() {
    common::setup();
    let (module, grad) = setup_module();
    let externs = ExternTable::new();

    let mut args = [Value::F64(3.0), Value::F64(100.0)];
    Evaluator::new(&module, &externs)
        .call_fd(&grad, &mut args)
        .unwrap();
    // d/dx x^2 = 6 accumulated on top of the existing 100.
    assert!(common::approx_eq(common::as_f64(&args[1]), 106.0));
}

#[test]
fn test_two_call_sites_share_one_accumulator() {
    common::setup();
    let (mut module, _) = setup_module();

    // h(x, acc) calls the derivative twice, both sites aliasing `acc`.
    let h = build_fd(&SourceFunction::new(
        "h",
        vec![
            Param::borrowed_mut("x", DType::F64),
            Param::borrowed_mut("acc", DType::F64),
        ],
        DType::F64,
        SourceExpr::Proj(
            0,
            Box::new(call(
                "g__vjp",
                DType::Record(vec![DType::F64]),
                vec![param("x"), param("acc")],
            )),
        ) + SourceExpr::Proj(
            0,
            Box::new(call(
                "g__vjp",
                DType::Record(vec![DType::F64]),
                vec![param("x"), param("acc")],
            )),
        ),
    ))
    .unwrap();
    module.add(h.clone()).unwrap();

    let externs = ExternTable::new();
    let mut args = [Value::F64(3.0), Value::F64(0.0)];
    let out = Evaluator::new(&module, &externs)
        .call_fd(&h, &mut args)
        .unwrap();

    // Each site contributes exactly 2x = 6; the shared accumulator holds 12.
    assert!(common::approx_eq(common::as_f64(&out), 18.0));
    assert!(common::approx_eq(common::as_f64(&args[1]), 12.0));
}
