//! Reference interpreter over descriptors.
//!
//! This is the in-tree stand-in for the external lowering collaborator: the
//! host device executes descriptors through it, and every equivalence test
//! uses it as the oracle. Batched values are lane vectors; scalar operands
//! broadcast across lanes the way the batching engine expects.
//!
//! Borrowed-mut parameter slots are accumulation targets: `AccumParam` adds
//! into the caller-visible slot, and calls forwarding a borrowed-mut
//! parameter write the callee's mutations back after the call returns.

use std::sync::Arc;

use ndarray::Array1;
use rustc_hash::FxHashMap;

use crate::fd::dtype::{Const, DType};
use crate::fd::function::{FuncDesc, Ownership};
use crate::fd::node::{Body, ValueId};
use crate::fd::op::{BinaryOp, Op, UnaryOp};
use crate::module::Module;

/// A run-time value. Vector lanes are stored as `f64` regardless of element
/// type; instruction dtypes decide how lanes are read back out.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    F64(f64),
    I64(i64),
    Bool(bool),
    Vector(Array1<f64>),
    Record(Vec<Value>),
}

impl Value {
    pub fn unit() -> Self {
        Value::Record(Vec::new())
    }

    pub fn lanes(values: impl Into<Vec<f64>>) -> Self {
        Value::Vector(Array1::from_vec(values.into()))
    }

    pub fn as_f64(&self) -> Result<f64, EvalError> {
        match self {
            Value::F64(v) => Ok(*v),
            other => Err(EvalError::type_error(format!("expected f64, got {other:?}"))),
        }
    }

    pub fn as_i64(&self) -> Result<i64, EvalError> {
        match self {
            Value::I64(v) => Ok(*v),
            other => Err(EvalError::type_error(format!("expected i64, got {other:?}"))),
        }
    }

    pub fn as_bool(&self) -> Result<bool, EvalError> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => Err(EvalError::type_error(format!("expected bool, got {other:?}"))),
        }
    }

    pub fn as_record(&self) -> Result<&[Value], EvalError> {
        match self {
            Value::Record(fields) => Ok(fields),
            other => Err(EvalError::type_error(format!(
                "expected record, got {other:?}"
            ))),
        }
    }

    pub fn as_vector(&self) -> Result<&Array1<f64>, EvalError> {
        match self {
            Value::Vector(v) => Ok(v),
            other => Err(EvalError::type_error(format!(
                "expected vector, got {other:?}"
            ))),
        }
    }

    /// A zero of the given type, used as an adjoint identity.
    pub fn zero_of(dtype: &DType) -> Result<Value, EvalError> {
        match dtype {
            DType::F64 => Ok(Value::F64(0.0)),
            DType::I64 => Ok(Value::I64(0)),
            DType::Bool => Ok(Value::Bool(false)),
            DType::Vector(_, n) => Ok(Value::Vector(Array1::zeros(*n))),
            DType::Record(fields) => fields
                .iter()
                .map(Value::zero_of)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Record),
            DType::Named(name) => Err(EvalError::type_error(format!(
                "no zero for foreign type {name}"
            ))),
        }
    }

    fn numeric_add(&self, other: &Value) -> Result<Value, EvalError> {
        match (self, other) {
            (Value::F64(a), Value::F64(b)) => Ok(Value::F64(a + b)),
            (Value::I64(a), Value::I64(b)) => Ok(Value::I64(a + b)),
            (Value::Vector(a), Value::Vector(b)) => Ok(Value::Vector(a + b)),
            (Value::Record(a), Value::Record(b)) if a.len() == b.len() => a
                .iter()
                .zip(b)
                .map(|(x, y)| x.numeric_add(y))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Record),
            (a, b) => Err(EvalError::type_error(format!(
                "cannot accumulate {b:?} into {a:?}"
            ))),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EvalError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("unknown extern symbol '{0}'")]
    UnknownExtern(String),
    #[error("unknown global '{0}'")]
    UnknownGlobal(String),
    #[error("call to '{name}' passes {got} arguments, expected {want}")]
    Arity {
        name: String,
        got: usize,
        want: usize,
    },
    #[error("type error: {0}")]
    Type(String),
    #[error("residency transfer evaluated outside a host stub at {0}")]
    TransferOutsideStub(ValueId),
}

impl EvalError {
    fn type_error(what: impl Into<String>) -> Self {
        EvalError::Type(what.into())
    }
}

/// Host implementations of opaque symbols. The transformation engines never
/// look in here — it exists purely so descriptors with opaque regions can
/// run.
pub type ExternFn = Arc<dyn Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ExternTable {
    fns: FxHashMap<String, ExternFn>,
}

impl ExternTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        symbol: impl Into<String>,
        f: impl Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    ) {
        self.fns.insert(symbol.into(), Arc::new(f));
    }

    pub fn get(&self, symbol: &str) -> Option<&ExternFn> {
        self.fns.get(symbol)
    }
}

impl std::fmt::Debug for ExternTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternTable")
            .field("symbols", &self.fns.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct Evaluator<'m> {
    module: &'m Module,
    externs: &'m ExternTable,
    globals: FxHashMap<String, Value>,
}

impl<'m> Evaluator<'m> {
    pub fn new(module: &'m Module, externs: &'m ExternTable) -> Self {
        Self {
            module,
            externs,
            globals: FxHashMap::default(),
        }
    }

    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    /// Calls a module function by name. Borrowed-mut argument slots are
    /// updated in place.
    pub fn call(&self, name: &str, args: &mut [Value]) -> Result<Value, EvalError> {
        let fd = self
            .module
            .get(name)
            .ok_or_else(|| EvalError::UnknownFunction(name.to_string()))?;
        self.call_fd(fd, args)
    }

    pub fn call_fd(&self, fd: &FuncDesc, args: &mut [Value]) -> Result<Value, EvalError> {
        if args.len() != fd.params().len() {
            return Err(EvalError::Arity {
                name: fd.name().to_string(),
                got: args.len(),
                want: fd.params().len(),
            });
        }
        let mut frame = Frame {
            env: FxHashMap::default(),
            params: args.to_vec(),
        };
        let result = self.eval_body(fd, fd.body(), &mut frame, None, None)?;
        for (i, param) in fd.params().iter().enumerate() {
            if param.ownership == Ownership::BorrowedMut {
                args[i] = frame.params[i].clone();
            }
        }
        Ok(result)
    }

    fn eval_body(
        &self,
        fd: &FuncDesc,
        body: &Body,
        frame: &mut Frame,
        carried: Option<&Value>,
        index: Option<i64>,
    ) -> Result<Value, EvalError> {
        for instr in &body.instrs {
            let value = match &instr.op {
                Op::Const(c) => const_value(*c),
                Op::Param(i) => frame.params[*i].clone(),
                Op::Global(name) => self
                    .globals
                    .get(name)
                    .cloned()
                    .ok_or_else(|| EvalError::UnknownGlobal(name.clone()))?,
                Op::Carried => carried
                    .cloned()
                    .ok_or_else(|| EvalError::type_error("carried slot outside a loop"))?,
                Op::Index => Value::I64(
                    index.ok_or_else(|| EvalError::type_error("index outside a counted loop"))?,
                ),
                Op::Unary(op) => eval_unary(*op, &frame.get(instr.args[0]))?,
                Op::Binary(op) => {
                    eval_binary(*op, &frame.get(instr.args[0]), &frame.get(instr.args[1]))?
                }
                Op::Select => {
                    let cond = frame.get(instr.args[0]);
                    let then = frame.get(instr.args[1]);
                    let els = frame.get(instr.args[2]);
                    eval_select(&cond, &then, &els)?
                }
                Op::Pack => Value::Record(
                    instr.args.iter().map(|a| frame.get(*a)).collect::<Vec<_>>(),
                ),
                Op::Proj(k) => {
                    let record = frame.get(instr.args[0]);
                    record.as_record()?.get(*k).cloned().ok_or_else(|| {
                        EvalError::type_error(format!("projection {k} out of bounds"))
                    })?
                }
                Op::Splat(n) => {
                    let lane = scalar_as_f64(&frame.get(instr.args[0]))?;
                    Value::Vector(Array1::from_elem(*n, lane))
                }
                Op::ExtractLane(k) => {
                    let v = frame.get(instr.args[0]);
                    let lane = v.as_vector()?[*k];
                    lane_as_value(lane, &instr.dtype)?
                }
                Op::BuildVector => {
                    let lanes = instr
                        .args
                        .iter()
                        .map(|a| scalar_as_f64(&frame.get(*a)))
                        .collect::<Result<Vec<_>, _>>()?;
                    Value::Vector(Array1::from_vec(lanes))
                }
                Op::Call(name) => {
                    let callee = self
                        .module
                        .get(name)
                        .ok_or_else(|| EvalError::UnknownFunction(name.clone()))?;
                    let mut callee_args: Vec<Value> = Vec::with_capacity(instr.args.len());
                    // Forwarded borrowed-mut parameters pass the current
                    // slot, not the value captured at definition time.
                    let mut writebacks: Vec<(usize, usize)> = Vec::new();
                    for (slot, (arg, cp)) in
                        instr.args.iter().zip(callee.params()).enumerate()
                    {
                        if cp.ownership == Ownership::BorrowedMut {
                            let src = body
                                .find(*arg)
                                .or_else(|| fd.body().find(*arg))
                                .expect("argument refers to a defined instruction");
                            if let Op::Param(i) = src.op {
                                writebacks.push((slot, i));
                                callee_args.push(frame.params[i].clone());
                                continue;
                            }
                        }
                        callee_args.push(frame.get(*arg));
                    }
                    let result = self.call_fd(callee, &mut callee_args)?;
                    for (slot, param) in writebacks {
                        frame.params[param] = callee_args[slot].clone();
                    }
                    result
                }
                Op::Opaque(decl) => {
                    let f = self
                        .externs
                        .get(&decl.symbol)
                        .ok_or_else(|| EvalError::UnknownExtern(decl.symbol.clone()))?;
                    let args: Vec<Value> = instr.args.iter().map(|a| frame.get(*a)).collect();
                    f(&args)?
                }
                Op::For { count, body: region } => {
                    let mut slot = frame.get(instr.args[0]);
                    for k in 0..*count {
                        slot = self.eval_body(fd, region, frame, Some(&slot), Some(k as i64))?;
                    }
                    slot
                }
                Op::While { cond, body: region } => {
                    let mut slot = frame.get(instr.args[0]);
                    loop {
                        let go = self
                            .eval_body(fd, cond, frame, Some(&slot), None)?
                            .as_bool()?;
                        if !go {
                            break;
                        }
                        slot = self.eval_body(fd, region, frame, Some(&slot), None)?;
                    }
                    slot
                }
                Op::AccumParam(i) => {
                    let delta = frame.get(instr.args[0]);
                    frame.params[*i] = frame.params[*i].numeric_add(&delta)?;
                    Value::unit()
                }
                Op::Transfer(_) => return Err(EvalError::TransferOutsideStub(instr.id)),
            };
            frame.env.insert(instr.id, value);
        }
        Ok(frame.get(body.result))
    }
}

struct Frame {
    env: FxHashMap<ValueId, Value>,
    params: Vec<Value>,
}

impl Frame {
    fn get(&self, id: ValueId) -> Value {
        self.env
            .get(&id)
            .cloned()
            .expect("instruction evaluated before use")
    }
}

fn const_value(c: Const) -> Value {
    match c {
        Const::F64(v) => Value::F64(v),
        Const::I64(v) => Value::I64(v),
        Const::Bool(v) => Value::Bool(v),
    }
}

fn scalar_as_f64(value: &Value) -> Result<f64, EvalError> {
    match value {
        Value::F64(v) => Ok(*v),
        Value::I64(v) => Ok(*v as f64),
        Value::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
        other => Err(EvalError::type_error(format!(
            "expected scalar lane, got {other:?}"
        ))),
    }
}

fn lane_as_value(lane: f64, dtype: &DType) -> Result<Value, EvalError> {
    match dtype {
        DType::F64 => Ok(Value::F64(lane)),
        DType::I64 => Ok(Value::I64(lane as i64)),
        DType::Bool => Ok(Value::Bool(lane != 0.0)),
        other => Err(EvalError::type_error(format!(
            "cannot extract lane as {other}"
        ))),
    }
}

fn eval_unary(op: UnaryOp, value: &Value) -> Result<Value, EvalError> {
    match value {
        Value::F64(v) => Ok(Value::F64(unary_f64(op, *v))),
        Value::Vector(v) => Ok(Value::Vector(v.mapv(|x| unary_f64(op, x)))),
        other => Err(EvalError::type_error(format!(
            "unary {op:?} on {other:?}"
        ))),
    }
}

fn unary_f64(op: UnaryOp, v: f64) -> f64 {
    match op {
        UnaryOp::Neg => -v,
        UnaryOp::Recip => v.recip(),
        UnaryOp::Sqrt => v.sqrt(),
        UnaryOp::Sin => v.sin(),
        UnaryOp::Cos => v.cos(),
        UnaryOp::Exp => v.exp(),
        UnaryOp::Log => v.ln(),
    }
}

fn eval_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    match (lhs, rhs) {
        (Value::F64(a), Value::F64(b)) => Ok(binary_f64(op, *a, *b)),
        (Value::I64(a), Value::I64(b)) => binary_i64(op, *a, *b),
        (Value::Bool(a), Value::Bool(b)) if op == BinaryOp::CmpEq => Ok(Value::Bool(a == b)),
        // Adjoints of record values sum field-wise.
        (Value::Record(_), Value::Record(_)) if op == BinaryOp::Add => lhs.numeric_add(rhs),
        (Value::Vector(a), Value::Vector(b)) => {
            if a.len() != b.len() {
                return Err(EvalError::type_error(format!(
                    "lane count mismatch: {} vs {}",
                    a.len(),
                    b.len()
                )));
            }
            let lanes: Vec<f64> = a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| binary_lane(op, *x, *y))
                .collect();
            Ok(Value::Vector(Array1::from_vec(lanes)))
        }
        // Scalars broadcast across lanes; the batching engine leaves
        // constants scalar.
        (Value::Vector(a), b) => {
            let b = scalar_as_f64(b)?;
            Ok(Value::Vector(a.mapv(|x| binary_lane(op, x, b))))
        }
        (a, Value::Vector(b)) => {
            let a = scalar_as_f64(a)?;
            Ok(Value::Vector(b.mapv(|y| binary_lane(op, a, y))))
        }
        (a, b) => Err(EvalError::type_error(format!(
            "binary {op:?} on {a:?} and {b:?}"
        ))),
    }
}

fn binary_f64(op: BinaryOp, a: f64, b: f64) -> Value {
    match op {
        BinaryOp::Add => Value::F64(a + b),
        BinaryOp::Sub => Value::F64(a - b),
        BinaryOp::Mul => Value::F64(a * b),
        BinaryOp::Div => Value::F64(a / b),
        BinaryOp::Min => Value::F64(a.min(b)),
        BinaryOp::Max => Value::F64(a.max(b)),
        BinaryOp::CmpLt => Value::Bool(a < b),
        BinaryOp::CmpEq => Value::Bool(a == b),
    }
}

fn binary_i64(op: BinaryOp, a: i64, b: i64) -> Result<Value, EvalError> {
    Ok(match op {
        BinaryOp::Add => Value::I64(a + b),
        BinaryOp::Sub => Value::I64(a - b),
        BinaryOp::Mul => Value::I64(a * b),
        BinaryOp::Div => Value::I64(a / b),
        BinaryOp::Min => Value::I64(a.min(b)),
        BinaryOp::Max => Value::I64(a.max(b)),
        BinaryOp::CmpLt => Value::Bool(a < b),
        BinaryOp::CmpEq => Value::Bool(a == b),
    })
}

/// Lane-wise binary with bools represented as 0/1.
fn binary_lane(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Min => a.min(b),
        BinaryOp::Max => a.max(b),
        BinaryOp::CmpLt => {
            if a < b {
                1.0
            } else {
                0.0
            }
        }
        BinaryOp::CmpEq => {
            if a == b {
                1.0
            } else {
                0.0
            }
        }
    }
}

fn eval_select(cond: &Value, then: &Value, els: &Value) -> Result<Value, EvalError> {
    match cond {
        Value::Bool(c) => Ok(if *c { then.clone() } else { els.clone() }),
        Value::Vector(mask) => {
            let pick = |branch: &Value, k: usize| -> Result<f64, EvalError> {
                match branch {
                    Value::Vector(v) => Ok(v[k]),
                    other => scalar_as_f64(other),
                }
            };
            let lanes: Vec<f64> = (0..mask.len())
                .map(|k| {
                    let branch = if mask[k] != 0.0 { then } else { els };
                    pick(branch, k)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Vector(Array1::from_vec(lanes)))
        }
        other => Err(EvalError::type_error(format!(
            "select condition is {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::builder::build_fd;
    use crate::fd::function::Param;
    use crate::source::{lit, param, select, SourceExpr, SourceFunction};

    fn run(source: SourceFunction, args: &mut [Value]) -> Value {
        let fd = build_fd(&source).unwrap();
        let mut module = Module::new();
        module.add(fd).unwrap();
        let externs = ExternTable::new();
        let name = source.name.clone();
        Evaluator::new(&module, &externs).call(&name, args).unwrap()
    }

    #[test]
    fn test_eval_arithmetic() {
        let source = SourceFunction::new(
            "poly",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            param("x") * param("x") + param("x") * lit(3.0) + lit(1.0),
        );
        let result = run(source, &mut [Value::F64(2.0)]);
        assert_eq!(result, Value::F64(11.0));
    }

    #[test]
    fn test_eval_select_picks_branch() {
        let source = SourceFunction::new(
            "clamp_neg",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            select(param("x").lt(lit(0.0)), lit(0.0), param("x")),
        );
        assert_eq!(run(source.clone(), &mut [Value::F64(-3.0)]), Value::F64(0.0));
        assert_eq!(run(source, &mut [Value::F64(4.0)]), Value::F64(4.0));
    }

    #[test]
    fn test_eval_for_loop_folds() {
        // pow4(x): acc = 1; repeat 4: acc *= x
        let source = SourceFunction::new(
            "pow4",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            SourceExpr::For {
                count: 4,
                init: Box::new(lit(1.0)),
                body: Box::new(SourceExpr::Carried * param("x")),
            },
        );
        assert_eq!(run(source, &mut [Value::F64(3.0)]), Value::F64(81.0));
    }

    #[test]
    fn test_eval_while_loop() {
        // double until >= 10
        let source = SourceFunction::new(
            "grow",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            SourceExpr::While {
                init: Box::new(param("x")),
                cond: Box::new(SourceExpr::Carried.lt(lit(10.0))),
                body: Box::new(SourceExpr::Carried * lit(2.0)),
            },
        );
        assert_eq!(run(source, &mut [Value::F64(3.0)]), Value::F64(12.0));
    }

    #[test]
    fn test_eval_mutable_param_accumulates() {
        // Hand-built descriptor: acc += x * 2, returns unit.
        use crate::fd::builder::FdBuilder;
        use crate::fd::op::Op;

        let mut b = FdBuilder::new();
        let x = b.push(Op::Param(0), vec![], DType::F64);
        let two = b.push(Op::Const(Const::F64(2.0)), vec![], DType::F64);
        let d = b.push(Op::Binary(BinaryOp::Mul), vec![x, two], DType::F64);
        let unit = b.push(Op::AccumParam(1), vec![d], DType::unit());
        let body = b.finish(unit);
        let fd = FuncDesc::new(
            "bump",
            vec![
                Param::owned("x", DType::F64),
                Param::borrowed_mut("acc", DType::F64),
            ],
            DType::unit(),
            body,
        );

        let mut module = Module::new();
        module.add(fd).unwrap();
        let externs = ExternTable::new();
        let mut args = [Value::F64(5.0), Value::F64(1.0)];
        Evaluator::new(&module, &externs)
            .call("bump", &mut args)
            .unwrap();
        assert_eq!(args[1], Value::F64(11.0));
    }

    #[test]
    fn test_eval_vector_broadcast() {
        use crate::fd::builder::FdBuilder;
        use crate::fd::op::Op;

        let mut b = FdBuilder::new();
        let x = b.push(Op::Param(0), vec![], DType::vector(DType::F64, 3));
        let c = b.push(Op::Const(Const::F64(10.0)), vec![], DType::F64);
        let y = b.push(
            Op::Binary(BinaryOp::Add),
            vec![x, c],
            DType::vector(DType::F64, 3),
        );
        let body = b.finish(y);
        let fd = FuncDesc::new(
            "shift",
            vec![Param::owned("x", DType::vector(DType::F64, 3))],
            DType::vector(DType::F64, 3),
            body,
        );

        let mut module = Module::new();
        module.add(fd).unwrap();
        let externs = ExternTable::new();
        let mut args = [Value::lanes(vec![1.0, 2.0, 3.0])];
        let out = Evaluator::new(&module, &externs)
            .call("shift", &mut args)
            .unwrap();
        assert_eq!(out, Value::lanes(vec![11.0, 12.0, 13.0]));
    }
}
