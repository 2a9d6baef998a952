//! Local derivative rules shared by the forward and reverse engines.
//!
//! Each rule emits instructions computing one operation's derivative
//! contribution. The sweep that calls a rule decides what to do with the
//! emitted value; the rule only knows the operation and its stored primal
//! values.
//!
//! Stored-vs-recomputed policy: where the primal sweep already computed an
//! expensive value (`exp x`, `sqrt x`, `recip x`, `a / b`), the rule
//! references that stored result instead of re-deriving it; cheap values the
//! primal never computed (`cos x` for the sine rule, branch masks) are
//! re-emitted where the rule runs.

use crate::error::TransformError;
use crate::fd::builder::FdBuilder;
use crate::fd::dtype::{Const, DType};
use crate::fd::node::ValueId;
use crate::fd::op::{BinaryOp, Op, UnaryOp};

pub(crate) fn push_const_f64(b: &mut FdBuilder, v: f64) -> ValueId {
    b.push(Op::Const(Const::F64(v)), vec![], DType::F64)
}

pub(crate) fn mul(b: &mut FdBuilder, lhs: ValueId, rhs: ValueId) -> ValueId {
    let dtype = dominant_dtype(b, lhs, rhs);
    b.push(Op::Binary(BinaryOp::Mul), vec![lhs, rhs], dtype)
}

pub(crate) fn add(b: &mut FdBuilder, lhs: ValueId, rhs: ValueId) -> ValueId {
    let dtype = dominant_dtype(b, lhs, rhs);
    b.push(Op::Binary(BinaryOp::Add), vec![lhs, rhs], dtype)
}

pub(crate) fn sub(b: &mut FdBuilder, lhs: ValueId, rhs: ValueId) -> ValueId {
    let dtype = dominant_dtype(b, lhs, rhs);
    b.push(Op::Binary(BinaryOp::Sub), vec![lhs, rhs], dtype)
}

pub(crate) fn div(b: &mut FdBuilder, lhs: ValueId, rhs: ValueId) -> ValueId {
    let dtype = dominant_dtype(b, lhs, rhs);
    b.push(Op::Binary(BinaryOp::Div), vec![lhs, rhs], dtype)
}

pub(crate) fn neg(b: &mut FdBuilder, arg: ValueId) -> ValueId {
    let dtype = b.dtype(arg).clone();
    b.push(Op::Unary(UnaryOp::Neg), vec![arg], dtype)
}

pub(crate) fn unary(b: &mut FdBuilder, op: UnaryOp, arg: ValueId) -> ValueId {
    let dtype = b.dtype(arg).clone();
    b.push(Op::Unary(op), vec![arg], dtype)
}

pub(crate) fn select(b: &mut FdBuilder, cond: ValueId, then: ValueId, els: ValueId) -> ValueId {
    let dtype = dominant_dtype(b, then, els);
    b.push(Op::Select, vec![cond, then, els], dtype)
}

pub(crate) fn cmp_lt(b: &mut FdBuilder, lhs: ValueId, rhs: ValueId) -> ValueId {
    let dtype = match b.dtype(lhs) {
        DType::Vector(_, n) => DType::vector(DType::Bool, *n),
        _ => DType::Bool,
    };
    b.push(Op::Binary(BinaryOp::CmpLt), vec![lhs, rhs], dtype)
}

/// Scalar constants broadcast across lanes, so the wider operand names the
/// result type.
fn dominant_dtype(b: &FdBuilder, lhs: ValueId, rhs: ValueId) -> DType {
    let lt = b.dtype(lhs);
    if matches!(lt, DType::Vector(_, _)) {
        lt.clone()
    } else {
        b.dtype(rhs).clone()
    }
}

/// A zero of the given type, materialized as instructions.
pub(crate) fn zero(
    b: &mut FdBuilder,
    dtype: &DType,
    at: ValueId,
) -> Result<ValueId, TransformError> {
    match dtype {
        DType::F64 => Ok(push_const_f64(b, 0.0)),
        DType::I64 => Ok(b.push(Op::Const(Const::I64(0)), vec![], DType::I64)),
        DType::Bool => Ok(b.push(Op::Const(Const::Bool(false)), vec![], DType::Bool)),
        DType::Vector(_, n) => {
            let z = push_const_f64(b, 0.0);
            Ok(b.push(Op::Splat(*n), vec![z], dtype.clone()))
        }
        DType::Record(fields) => {
            let zeros = fields
                .iter()
                .map(|f| zero(b, f, at))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(b.push(Op::Pack, zeros, dtype.clone()))
        }
        DType::Named(name) => Err(TransformError::mode(
            at,
            format!("no derivative accumulator exists for foreign type {name}"),
        )),
    }
}

/// Tangent of a unary operation: `dy` given `dx`.
///
/// `px` is the stored primal operand, `py` the stored primal result.
pub(crate) fn unary_tangent(
    b: &mut FdBuilder,
    op: UnaryOp,
    px: ValueId,
    py: ValueId,
    dx: ValueId,
) -> ValueId {
    let partial = unary_partial(b, op, px, py);
    match partial {
        Partial::One => dx,
        Partial::NegOne => neg(b, dx),
        Partial::Value(p) => mul(b, dx, p),
    }
}

/// Adjoint contribution of a unary operation: `d(x) += rule(dy)`.
pub(crate) fn unary_adjoint(
    b: &mut FdBuilder,
    op: UnaryOp,
    px: ValueId,
    py: ValueId,
    dy: ValueId,
) -> ValueId {
    // The local partial is a scalar factor, so tangent and adjoint share it.
    unary_tangent(b, op, px, py, dy)
}

fn merge_sum(
    b: &mut FdBuilder,
    left: Option<ValueId>,
    right: Option<ValueId>,
) -> Option<ValueId> {
    match (left, right) {
        (Some(l), Some(r)) => Some(add(b, l, r)),
        (l, None) => l,
        (None, r) => r,
    }
}

enum Partial {
    One,
    NegOne,
    Value(ValueId),
}

fn unary_partial(b: &mut FdBuilder, op: UnaryOp, px: ValueId, py: ValueId) -> Partial {
    match op {
        UnaryOp::Neg => Partial::NegOne,
        // y = 1/x => dy/dx = -y^2, referencing the stored reciprocal.
        UnaryOp::Recip => {
            let yy = mul(b, py, py);
            Partial::Value(neg(b, yy))
        }
        // y = sqrt(x) => dy/dx = 1 / (2y)
        UnaryOp::Sqrt => {
            let two = push_const_f64(b, 2.0);
            let twoy = mul(b, two, py);
            let one = push_const_f64(b, 1.0);
            Partial::Value(div(b, one, twoy))
        }
        // y = sin(x) => dy/dx = cos(x), re-emitted here
        UnaryOp::Sin => Partial::Value(unary(b, UnaryOp::Cos, px)),
        // y = cos(x) => dy/dx = -sin(x)
        UnaryOp::Cos => {
            let s = unary(b, UnaryOp::Sin, px);
            Partial::Value(neg(b, s))
        }
        // y = exp(x) => dy/dx = y, the stored exponential
        UnaryOp::Exp => Partial::Value(py),
        // y = log(x) => dy/dx = 1/x
        UnaryOp::Log => {
            let one = push_const_f64(b, 1.0);
            Partial::Value(div(b, one, px))
        }
    }
}

/// Tangent of a binary operation given optional operand tangents. `None`
/// means the operand is constant and contributes nothing. Returns `None`
/// when the result carries no tangent (comparisons, two constants).
pub(crate) fn binary_tangent(
    b: &mut FdBuilder,
    op: BinaryOp,
    pa: ValueId,
    pb: ValueId,
    py: ValueId,
    da: Option<ValueId>,
    db: Option<ValueId>,
) -> Option<ValueId> {
    match op {
        BinaryOp::CmpLt | BinaryOp::CmpEq => None,
        BinaryOp::Add => match (da, db) {
            (Some(da), Some(db)) => Some(add(b, da, db)),
            (Some(da), None) => Some(da),
            (None, Some(db)) => Some(db),
            (None, None) => None,
        },
        BinaryOp::Sub => match (da, db) {
            (Some(da), Some(db)) => Some(sub(b, da, db)),
            (Some(da), None) => Some(da),
            (None, Some(db)) => Some(neg(b, db)),
            (None, None) => None,
        },
        // y = a * b => dy = da*b + a*db
        BinaryOp::Mul => {
            let left = da.map(|da| mul(b, da, pb));
            let right = db.map(|db| mul(b, pa, db));
            merge_sum(b, left, right)
        }
        // y = a / b => dy = (da - y*db) / b, referencing the stored quotient
        BinaryOp::Div => {
            let num = match (da, db) {
                (Some(da), Some(db)) => {
                    let ydb = mul(b, py, db);
                    Some(sub(b, da, ydb))
                }
                (Some(da), None) => Some(da),
                (None, Some(db)) => {
                    let ydb = mul(b, py, db);
                    Some(neg(b, ydb))
                }
                (None, None) => None,
            };
            num.map(|num| div(b, num, pb))
        }
        // The winning operand's tangent flows through; ties take the operand
        // the primal result equals first (left for max, right for min).
        BinaryOp::Max | BinaryOp::Min => {
            let (da, db) = match (da, db) {
                (None, None) => return None,
                (da, db) => {
                    let da = da.unwrap_or_else(|| push_const_f64(b, 0.0));
                    let db = db.unwrap_or_else(|| push_const_f64(b, 0.0));
                    (da, db)
                }
            };
            let a_lt_b = cmp_lt(b, pa, pb);
            let (then, els) = match op {
                BinaryOp::Max => (db, da),
                _ => (da, db),
            };
            Some(select(b, a_lt_b, then, els))
        }
    }
}

/// Adjoint contributions of a binary operation: `(d_a, d_b)` increments.
///
/// A side is only emitted when wanted; nothing is computed for a constant
/// operand — it has no shadow.
pub(crate) fn binary_adjoint(
    b: &mut FdBuilder,
    op: BinaryOp,
    pa: ValueId,
    pb: ValueId,
    py: ValueId,
    dy: ValueId,
    want_a: bool,
    want_b: bool,
) -> Result<(Option<ValueId>, Option<ValueId>), TransformError> {
    Ok(match op {
        BinaryOp::CmpLt | BinaryOp::CmpEq => (None, None),
        BinaryOp::Add => (want_a.then_some(dy), want_b.then_some(dy)),
        BinaryOp::Sub => {
            let d_b = if want_b { Some(neg(b, dy)) } else { None };
            (want_a.then_some(dy), d_b)
        }
        // y = a * b => d_a = dy*b, d_b = dy*a
        BinaryOp::Mul => {
            let d_a = if want_a { Some(mul(b, dy, pb)) } else { None };
            let d_b = if want_b { Some(mul(b, dy, pa)) } else { None };
            (d_a, d_b)
        }
        // y = a / b => d_a = dy/b, d_b = -dy*y/b
        BinaryOp::Div => {
            let d_a = if want_a { Some(div(b, dy, pb)) } else { None };
            let d_b = if want_b {
                let dyy = mul(b, dy, py);
                let scaled = div(b, dyy, pb);
                Some(neg(b, scaled))
            } else {
                None
            };
            (d_a, d_b)
        }
        BinaryOp::Max | BinaryOp::Min => {
            if !want_a && !want_b {
                return Ok((None, None));
            }
            let dtype = b.dtype(dy).clone();
            let z = zero(b, &dtype, dy)?;
            let a_lt_b = cmp_lt(b, pa, pb);
            let wins_a = matches!(op, BinaryOp::Min);
            let d_a = if want_a {
                let (then, els) = if wins_a { (dy, z) } else { (z, dy) };
                Some(select(b, a_lt_b, then, els))
            } else {
                None
            };
            let d_b = if want_b {
                let (then, els) = if wins_a { (z, dy) } else { (dy, z) };
                Some(select(b, a_lt_b, then, els))
            } else {
                None
            };
            (d_a, d_b)
        }
    })
}
