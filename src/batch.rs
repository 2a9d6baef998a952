//! Batching engine: N independent invocations fused into one call.
//!
//! Parameters gain a lane dimension (struct-of-arrays: records become
//! records of lane vectors), elementwise operations become their vector
//! equivalents, and operations with no vector form — opaque regions, calls
//! into scalar descriptors — are replicated once per lane, which is still
//! the same values, just without the vector speedup. Batching never changes
//! results relative to running the original N times.
//!
//! The one structural prerequisite is a single control-flow shape across the
//! batch: a condition-driven loop whose condition can vary per lane would
//! let lanes diverge, so it is refused.

use log::debug;

use crate::activity::{analyze_activity, Activity, ActivityRequest};
use crate::error::TransformError;
use crate::fd::builder::FdBuilder;
use crate::fd::dtype::DType;
use crate::fd::function::{FuncDesc, Param};
use crate::fd::node::{Body, Instr, ValueId};
use crate::fd::op::Op;
use rustc_hash::FxHashMap;

/// Widens `fd` to `width` lanes.
pub fn batch(fd: &FuncDesc, width: usize) -> Result<FuncDesc, TransformError> {
    if width == 0 {
        return Err(TransformError::construct(
            fd.body().result,
            "batch width must be at least 1",
        ));
    }

    // Lane-divergence check: a condition that depends on any parameter can
    // differ between lanes. Parameter dependence is the same fixed point as
    // activity with every parameter marked active.
    let dependence = analyze_activity(fd, &ActivityRequest::all_active(fd.params().len()))?;
    let mut divergent = None;
    fd.body().walk(&mut |instr| {
        if divergent.is_some() {
            return;
        }
        if let Op::While { cond, .. } = &instr.op {
            if dependence.activity(cond.result) != Activity::Constant {
                divergent = Some(instr.id);
            }
        }
    });
    if let Some(node) = divergent {
        return Err(TransformError::NonUniformShape { node });
    }

    let mut params = Vec::with_capacity(fd.params().len());
    for p in fd.params() {
        params.push(Param {
            name: p.name.clone(),
            dtype: widen(&p.dtype, width, fd.body().result)?,
            ownership: p.ownership,
        });
    }
    let ret = widen(fd.ret(), width, fd.body().result)?;

    debug!("batching '{}' to {} lanes", fd.name(), width);

    let mut ctx = Ctx {
        b: FdBuilder::new(),
        width,
        map: FxHashMap::default(),
    };
    let result = ctx.body(fd.body(), None)?;
    let body = ctx.b.finish(result);

    Ok(FuncDesc::new(
        format!("{}__x{}", fd.name(), width),
        params,
        ret,
        body,
    ))
}

/// Adds the lane dimension to a signature type.
fn widen(dtype: &DType, width: usize, at: ValueId) -> Result<DType, TransformError> {
    match dtype {
        DType::F64 | DType::Bool => Ok(DType::vector(dtype.clone(), width)),
        DType::Record(fields) => fields
            .iter()
            .map(|f| widen(f, width, at))
            .collect::<Result<Vec<_>, _>>()
            .map(DType::Record),
        DType::I64 => Err(TransformError::construct(
            at,
            "integer signature types have no lane layout",
        )),
        DType::Vector(_, _) => Err(TransformError::construct(
            at,
            "signature already carries a lane dimension",
        )),
        DType::Named(name) => Err(TransformError::construct(
            at,
            format!("foreign type {name} has no lane layout"),
        )),
    }
}

struct Bind {
    carried: ValueId,
    index: Option<ValueId>,
}

struct Ctx {
    b: FdBuilder,
    width: usize,
    map: FxHashMap<ValueId, ValueId>,
}

impl Ctx {
    fn body(&mut self, body: &Body, bind: Option<&Bind>) -> Result<ValueId, TransformError> {
        for instr in &body.instrs {
            let new = self.instr(instr, bind)?;
            self.map.insert(instr.id, new);
        }
        Ok(self.map[&body.result])
    }

    fn arg(&self, old: ValueId) -> ValueId {
        self.map[&old]
    }

    fn is_lanes(&self, id: ValueId) -> bool {
        matches!(self.b.dtype(id), DType::Vector(_, _))
    }

    fn instr(&mut self, instr: &Instr, bind: Option<&Bind>) -> Result<ValueId, TransformError> {
        match &instr.op {
            Op::Carried => Ok(bind.expect("carried slot outside a region").carried),
            Op::Index => Ok(bind
                .expect("index outside a region")
                .index
                .expect("index outside a counted loop")),

            // Constants and globals are one value shared by every lane; the
            // vector operations broadcast them.
            Op::Const(_) | Op::Global(_) => {
                Ok(self
                    .b
                    .push(instr.op.clone(), vec![], instr.dtype.clone()))
            }

            Op::Param(i) => {
                let dtype = widen(&instr.dtype, self.width, instr.id)?;
                Ok(self.b.push(Op::Param(*i), vec![], dtype))
            }

            Op::Unary(op) => {
                let x = self.arg(instr.args[0]);
                let dtype = if self.is_lanes(x) {
                    DType::vector(instr.dtype.clone(), self.width)
                } else {
                    instr.dtype.clone()
                };
                Ok(self.b.push(Op::Unary(*op), vec![x], dtype))
            }

            Op::Binary(op) => {
                let lhs = self.arg(instr.args[0]);
                let rhs = self.arg(instr.args[1]);
                let dtype = if self.is_lanes(lhs) || self.is_lanes(rhs) {
                    DType::vector(instr.dtype.clone(), self.width)
                } else {
                    instr.dtype.clone()
                };
                Ok(self.b.push(Op::Binary(*op), vec![lhs, rhs], dtype))
            }

            Op::Select => {
                let cond = self.arg(instr.args[0]);
                let then = self.arg(instr.args[1]);
                let els = self.arg(instr.args[2]);
                let dtype = if self.is_lanes(cond) || self.is_lanes(then) || self.is_lanes(els) {
                    DType::vector(instr.dtype.clone(), self.width)
                } else {
                    instr.dtype.clone()
                };
                Ok(self.b.push(Op::Select, vec![cond, then, els], dtype))
            }

            Op::Pack => {
                let args: Vec<ValueId> = instr.args.iter().map(|a| self.arg(*a)).collect();
                let fields: Vec<DType> = args.iter().map(|a| self.b.dtype(*a).clone()).collect();
                Ok(self.b.push(Op::Pack, args, DType::Record(fields)))
            }

            Op::Proj(k) => {
                let record = self.arg(instr.args[0]);
                let dtype = match self.b.dtype(record) {
                    DType::Record(fields) => fields[*k].clone(),
                    other => {
                        return Err(TransformError::construct(
                            instr.id,
                            format!("projection from non-record {other}"),
                        ));
                    }
                };
                Ok(self.b.push(Op::Proj(*k), vec![record], dtype))
            }

            Op::Splat(_) | Op::ExtractLane(_) | Op::BuildVector => {
                Err(TransformError::construct(
                    instr.id,
                    "body already carries a lane dimension",
                ))
            }

            Op::Call(_) | Op::Opaque(_) => self.replicate(instr),

            Op::For { count, body } => {
                let (init, region, carried_ty) = self.loop_region(instr, body, true)?;
                Ok(self.b.push(
                    Op::For {
                        count: *count,
                        body: region,
                    },
                    vec![init],
                    carried_ty,
                ))
            }

            Op::While { cond, body } => {
                let (init, region, carried_ty) = self.loop_region(instr, body, false)?;

                self.b.begin_region();
                let c_carried = self.b.push(Op::Carried, vec![], carried_ty.clone());
                let bind = Bind {
                    carried: c_carried,
                    index: None,
                };
                let c_result = self.body(cond, Some(&bind))?;
                // Divergence was ruled out up front; a lane-typed condition
                // here would mean the check missed something.
                if self.b.dtype(c_result) != &DType::Bool {
                    return Err(TransformError::NonUniformShape { node: instr.id });
                }
                let new_cond = self.b.end_region(c_result);

                Ok(self.b.push(
                    Op::While {
                        cond: new_cond,
                        body: region,
                    },
                    vec![init],
                    carried_ty,
                ))
            }

            Op::AccumParam(i) => {
                let delta = self.arg(instr.args[0]);
                Ok(self
                    .b
                    .push(Op::AccumParam(*i), vec![delta], DType::unit()))
            }

            Op::Transfer(_) => Err(TransformError::construct(
                instr.id,
                "residency transfers do not take a lane dimension",
            )),
        }
    }

    /// Builds a loop's body region, widening the carried slot when the body
    /// turns it lane-valued. A scalar initial value whose loop body mixes in
    /// parameters produces lane-valued iterations, so the slot must take the
    /// lane layout up front; one retry with a widened initial value settles
    /// the type.
    fn loop_region(
        &mut self,
        instr: &Instr,
        body: &Body,
        counted: bool,
    ) -> Result<(ValueId, Body, DType), TransformError> {
        let mut init = self.arg(instr.args[0]);
        for attempt in 0..2 {
            let carried_ty = self.b.dtype(init).clone();
            self.b.begin_region();
            let carried = self.b.push(Op::Carried, vec![], carried_ty.clone());
            let index = if counted {
                Some(self.b.push(Op::Index, vec![], DType::I64))
            } else {
                None
            };
            let bind = Bind { carried, index };
            let result = self.body(body, Some(&bind))?;
            let result_ty = self.b.dtype(result).clone();
            if result_ty == carried_ty {
                return Ok((init, self.b.end_region(result), carried_ty));
            }
            // Discard this attempt's region and retry with the slot already
            // in the lane layout.
            let _ = self.b.end_region(result);
            if attempt == 1 {
                return Err(TransformError::construct(
                    instr.id,
                    format!("loop slot type does not settle: {carried_ty} vs {result_ty}"),
                ));
            }
            init = self.widen_value(init, instr.id)?;
        }
        unreachable!("loop above always returns")
    }

    /// Emits instructions converting a uniform (scalar-typed) value into its
    /// lane layout.
    fn widen_value(&mut self, id: ValueId, at: ValueId) -> Result<ValueId, TransformError> {
        let dtype = self.b.dtype(id).clone();
        match &dtype {
            DType::F64 | DType::Bool => {
                let wide = DType::vector(dtype.clone(), self.width);
                Ok(self.b.push(Op::Splat(self.width), vec![id], wide))
            }
            DType::Record(fields) => {
                let mut parts = Vec::with_capacity(fields.len());
                let mut part_types = Vec::with_capacity(fields.len());
                for (k, field) in fields.clone().into_iter().enumerate() {
                    let proj = self.b.push(Op::Proj(k), vec![id], field);
                    let wide = self.widen_value(proj, at)?;
                    part_types.push(self.b.dtype(wide).clone());
                    parts.push(wide);
                }
                Ok(self.b.push(Op::Pack, parts, DType::Record(part_types)))
            }
            DType::Vector(_, _) => Ok(id),
            other => Err(TransformError::construct(
                at,
                format!("type {other} has no lane layout"),
            )),
        }
    }

    /// No vector form exists for calls and opaque regions: run the scalar
    /// operation once per lane and reassemble. Same values, no speedup.
    fn replicate(&mut self, instr: &Instr) -> Result<ValueId, TransformError> {
        let args: Vec<ValueId> = instr.args.iter().map(|a| self.arg(*a)).collect();
        if !args.iter().any(|a| self.is_lanes(*a)) {
            return Ok(self
                .b
                .push(instr.op.clone(), args, instr.dtype.clone()));
        }

        if !instr.dtype.is_scalar() {
            return Err(TransformError::construct(
                instr.id,
                format!("cannot replicate a result of type {} per lane", instr.dtype),
            ));
        }
        for arg in &args {
            match self.b.dtype(*arg) {
                DType::Vector(_, _) => {}
                d if d.is_scalar() => {}
                other => {
                    return Err(TransformError::construct(
                        instr.id,
                        format!("cannot replicate an operand of type {other} per lane"),
                    ));
                }
            }
        }

        let mut lanes = Vec::with_capacity(self.width);
        for k in 0..self.width {
            let mut lane_args = Vec::with_capacity(args.len());
            for arg in &args {
                let arg = *arg;
                if let DType::Vector(elem, _) = self.b.dtype(arg) {
                    let elem = (**elem).clone();
                    lane_args.push(self.b.push(Op::ExtractLane(k), vec![arg], elem));
                } else {
                    lane_args.push(arg);
                }
            }
            lanes.push(
                self.b
                    .push(instr.op.clone(), lane_args, instr.dtype.clone()),
            );
        }
        let dtype = DType::vector(instr.dtype.clone(), self.width);
        Ok(self.b.push(Op::BuildVector, lanes, dtype))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::builder::build_fd;
    use crate::source::{lit, param, SourceExpr, SourceFunction};

    fn square_plus_one() -> FuncDesc {
        build_fd(&SourceFunction::new(
            "sq1",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            param("x") * param("x") + lit(1.0),
        ))
        .unwrap()
    }

    #[test]
    fn test_batch_widens_signature() {
        let fd = square_plus_one();
        let wide = batch(&fd, 4).unwrap();
        assert_eq!(wide.name(), "sq1__x4");
        assert_eq!(wide.params()[0].dtype, DType::vector(DType::F64, 4));
        assert_eq!(wide.ret(), &DType::vector(DType::F64, 4));
    }

    #[test]
    fn test_batch_width_one_is_allowed() {
        let fd = square_plus_one();
        let wide = batch(&fd, 1).unwrap();
        assert_eq!(wide.ret(), &DType::vector(DType::F64, 1));
    }

    #[test]
    fn test_batch_width_zero_is_rejected() {
        let fd = square_plus_one();
        assert!(batch(&fd, 0).is_err());
    }

    #[test]
    fn test_batch_refuses_divergent_while() {
        // while (c < x) { c * 2 } — the exit test varies per lane.
        let fd = build_fd(&SourceFunction::new(
            "diverge",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            SourceExpr::While {
                init: Box::new(lit(1.0)),
                cond: Box::new(SourceExpr::Carried.lt(param("x"))),
                body: Box::new(SourceExpr::Carried * lit(2.0)),
            },
        ))
        .unwrap();
        let err = batch(&fd, 4).unwrap_err();
        assert!(matches!(err, TransformError::NonUniformShape { .. }));
    }

    #[test]
    fn test_batch_uniform_counted_loop_is_accepted() {
        let fd = build_fd(&SourceFunction::new(
            "pow3",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            SourceExpr::For {
                count: 3,
                init: Box::new(lit(1.0)),
                body: Box::new(SourceExpr::Carried * param("x")),
            },
        ))
        .unwrap();
        assert!(batch(&fd, 8).is_ok());
    }
}
