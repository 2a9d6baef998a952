//! Forward-mode transformation: tangents interleaved with the primal.

use rustc_hash::FxHashMap;

use crate::activity::{ActivityMap, ActivityRequest};
use crate::diff::rules;
use crate::diff::DiffMode;
use crate::error::TransformError;
use crate::fd::builder::FdBuilder;
use crate::fd::dtype::DType;
use crate::fd::function::{FuncDesc, Ownership, Param};
use crate::fd::node::{Body, ValueId};
use crate::fd::op::Op;
use crate::module::Module;

pub(crate) fn transform(
    module: &mut Module,
    fd: &FuncDesc,
    request: &ActivityRequest,
    activity: &ActivityMap,
    stack: &mut Vec<String>,
) -> Result<FuncDesc, TransformError> {
    let mut params = fd.params().to_vec();
    let mut tangent_param = vec![None; fd.params().len()];
    for (i, p) in fd.params().iter().enumerate() {
        if request.is_active(i) {
            tangent_param[i] = Some(params.len());
            params.push(Param {
                name: format!("d_{}", p.name),
                dtype: p.dtype.clone(),
                ownership: Ownership::Owned,
            });
        }
    }

    let mut ctx = Ctx {
        b: FdBuilder::new(),
        module,
        activity,
        stack,
        tangent_param,
        primal: FxHashMap::default(),
        tangent: FxHashMap::default(),
    };

    let (p_res, t_res) = ctx.body(fd.body(), None)?;
    let t_res = match t_res {
        Some(t) => t,
        None => rules::zero(&mut ctx.b, fd.ret(), p_res)?,
    };
    let ret = fd.ret().clone().pair();
    let pair = ctx.b.push(Op::Pack, vec![p_res, t_res], ret.clone());
    let body = ctx.b.finish(pair);

    Ok(FuncDesc::new(
        format!("{}__jvp", fd.name()),
        params,
        ret,
        body,
    ))
}

struct Bind {
    carried_primal: ValueId,
    carried_tangent: Option<ValueId>,
    index: Option<ValueId>,
}

struct Ctx<'a> {
    b: FdBuilder,
    module: &'a mut Module,
    activity: &'a ActivityMap,
    stack: &'a mut Vec<String>,
    tangent_param: Vec<Option<usize>>,
    primal: FxHashMap<ValueId, ValueId>,
    tangent: FxHashMap<ValueId, Option<ValueId>>,
}

impl Ctx<'_> {
    /// Transforms one body, returning the new primal result and its tangent.
    fn body(
        &mut self,
        body: &Body,
        bind: Option<&Bind>,
    ) -> Result<(ValueId, Option<ValueId>), TransformError> {
        for instr in &body.instrs {
            let (p, t) = self.instr(instr, bind)?;
            self.primal.insert(instr.id, p);
            self.tangent.insert(instr.id, t);
        }
        Ok((self.p(body.result), self.t(body.result)))
    }

    fn p(&self, old: ValueId) -> ValueId {
        self.primal[&old]
    }

    fn t(&self, old: ValueId) -> Option<ValueId> {
        self.tangent.get(&old).copied().flatten()
    }

    fn instr(
        &mut self,
        instr: &crate::fd::node::Instr,
        bind: Option<&Bind>,
    ) -> Result<(ValueId, Option<ValueId>), TransformError> {
        match &instr.op {
            Op::Carried => {
                let bind = bind.expect("carried slot outside a region");
                Ok((bind.carried_primal, bind.carried_tangent))
            }
            Op::Index => {
                let bind = bind.expect("index outside a region");
                Ok((bind.index.expect("index outside a counted loop"), None))
            }

            Op::Const(_) | Op::Global(_) => {
                let p = self.b.push(instr.op.clone(), vec![], instr.dtype.clone());
                Ok((p, None))
            }

            Op::Param(i) => {
                let p = self.b.push(Op::Param(*i), vec![], instr.dtype.clone());
                let t = self.tangent_param[*i]
                    .map(|tp| self.b.push(Op::Param(tp), vec![], instr.dtype.clone()));
                Ok((p, t))
            }

            Op::Unary(op) => {
                let px = self.p(instr.args[0]);
                let dx = self.t(instr.args[0]);
                let py = self.b.push(Op::Unary(*op), vec![px], instr.dtype.clone());
                let t = dx.map(|dx| rules::unary_tangent(&mut self.b, *op, px, py, dx));
                Ok((py, t))
            }

            Op::Binary(op) => {
                let pa = self.p(instr.args[0]);
                let pb = self.p(instr.args[1]);
                let da = self.t(instr.args[0]);
                let db = self.t(instr.args[1]);
                let py = self.b.push(Op::Binary(*op), vec![pa, pb], instr.dtype.clone());
                let t = rules::binary_tangent(&mut self.b, *op, pa, pb, py, da, db);
                Ok((py, t))
            }

            Op::Select => {
                let cond = self.p(instr.args[0]);
                let pt = self.p(instr.args[1]);
                let pe = self.p(instr.args[2]);
                let p = self.b.push(Op::Select, vec![cond, pt, pe], instr.dtype.clone());
                let (dt, de) = (self.t(instr.args[1]), self.t(instr.args[2]));
                let t = match (dt, de) {
                    (None, None) => None,
                    (dt, de) => {
                        let dt = match dt {
                            Some(dt) => dt,
                            None => rules::zero(&mut self.b, &instr.dtype, instr.id)?,
                        };
                        let de = match de {
                            Some(de) => de,
                            None => rules::zero(&mut self.b, &instr.dtype, instr.id)?,
                        };
                        Some(self.b.push(Op::Select, vec![cond, dt, de], instr.dtype.clone()))
                    }
                };
                Ok((p, t))
            }

            Op::Pack => {
                let pargs: Vec<ValueId> = instr.args.iter().map(|a| self.p(*a)).collect();
                let p = self.b.push(Op::Pack, pargs, instr.dtype.clone());
                let any_tangent = instr.args.iter().any(|a| self.t(*a).is_some());
                let t = if any_tangent {
                    let fields = match &instr.dtype {
                        DType::Record(fields) => fields.clone(),
                        _ => unreachable!("pack produces a record"),
                    };
                    let mut targs = Vec::with_capacity(instr.args.len());
                    for (arg, field) in instr.args.iter().zip(&fields) {
                        let t = match self.t(*arg) {
                            Some(t) => t,
                            None => rules::zero(&mut self.b, field, instr.id)?,
                        };
                        targs.push(t);
                    }
                    Some(self.b.push(Op::Pack, targs, instr.dtype.clone()))
                } else {
                    None
                };
                Ok((p, t))
            }

            Op::Proj(k) => {
                let pr = self.p(instr.args[0]);
                let p = self.b.push(Op::Proj(*k), vec![pr], instr.dtype.clone());
                let t = self
                    .t(instr.args[0])
                    .map(|tr| self.b.push(Op::Proj(*k), vec![tr], instr.dtype.clone()));
                Ok((p, t))
            }

            // Lane plumbing is linear: the tangent takes the same path.
            Op::Splat(n) => {
                let px = self.p(instr.args[0]);
                let p = self.b.push(Op::Splat(*n), vec![px], instr.dtype.clone());
                let t = self
                    .t(instr.args[0])
                    .map(|tx| self.b.push(Op::Splat(*n), vec![tx], instr.dtype.clone()));
                Ok((p, t))
            }
            Op::ExtractLane(k) => {
                let pv = self.p(instr.args[0]);
                let p = self.b.push(Op::ExtractLane(*k), vec![pv], instr.dtype.clone());
                let t = self
                    .t(instr.args[0])
                    .map(|tv| self.b.push(Op::ExtractLane(*k), vec![tv], instr.dtype.clone()));
                Ok((p, t))
            }
            Op::BuildVector => {
                let pargs: Vec<ValueId> = instr.args.iter().map(|a| self.p(*a)).collect();
                let p = self.b.push(Op::BuildVector, pargs, instr.dtype.clone());
                let any_tangent = instr.args.iter().any(|a| self.t(*a).is_some());
                let t = if any_tangent {
                    let mut targs = Vec::with_capacity(instr.args.len());
                    for arg in &instr.args {
                        let t = match self.t(*arg) {
                            Some(t) => t,
                            None => rules::push_const_f64(&mut self.b, 0.0),
                        };
                        targs.push(t);
                    }
                    Some(self.b.push(Op::BuildVector, targs, instr.dtype.clone()))
                } else {
                    None
                };
                Ok((p, t))
            }

            Op::Call(name) => self.call(instr, name.clone()),
            Op::Opaque(decl) => self.opaque(instr, decl.clone()),

            Op::For { count, body } => self.for_loop(instr, *count, body),
            Op::While { cond, body } => self.while_loop(instr, cond, body),

            Op::AccumParam(_) | Op::Transfer(_) => {
                unreachable!("effectful operations are rejected before transformation")
            }
        }
    }

    fn call(
        &mut self,
        instr: &crate::fd::node::Instr,
        name: String,
    ) -> Result<(ValueId, Option<ValueId>), TransformError> {
        let pargs: Vec<ValueId> = instr.args.iter().map(|a| self.p(*a)).collect();
        let active = instr.args.iter().any(|a| self.t(*a).is_some());
        if !active {
            let p = self
                .b
                .push(Op::Call(name), pargs, instr.dtype.clone());
            return Ok((p, None));
        }

        let callee = self
            .module
            .get(&name)
            .cloned()
            .ok_or_else(|| {
                TransformError::construct(
                    instr.id,
                    format!("call target '{name}' is not registered"),
                )
            })?;
        if !callee.mutable_params().is_empty() {
            return Err(TransformError::mode(
                instr.id,
                format!("differentiating through '{name}', which mutates caller state"),
            ));
        }

        let jvp_name = format!("{name}__jvp");
        if !self.module.contains(&jvp_name) {
            let request = ActivityRequest::all_active(callee.params().len());
            crate::diff::differentiate_inner(
                self.module,
                &callee,
                &request,
                DiffMode::Forward,
                self.stack,
            )?;
        }

        let mut args = pargs;
        for (arg, cp) in instr.args.iter().zip(callee.params()) {
            let t = match self.t(*arg) {
                Some(t) => t,
                None => rules::zero(&mut self.b, &cp.dtype, instr.id)?,
            };
            args.push(t);
        }
        let pair_ty = callee.ret().clone().pair();
        let pair = self.b.push(Op::Call(jvp_name), args, pair_ty);
        let p = self
            .b
            .push(Op::Proj(0), vec![pair], instr.dtype.clone());
        let t = self
            .b
            .push(Op::Proj(1), vec![pair], instr.dtype.clone());
        Ok((p, Some(t)))
    }

    fn opaque(
        &mut self,
        instr: &crate::fd::node::Instr,
        decl: crate::fd::op::OpaqueDecl,
    ) -> Result<(ValueId, Option<ValueId>), TransformError> {
        let pargs: Vec<ValueId> = instr.args.iter().map(|a| self.p(*a)).collect();
        if !self.activity.is_active(instr.id) {
            let p = self
                .b
                .push(Op::Opaque(decl), pargs, instr.dtype.clone());
            return Ok((p, None));
        }

        // Validated in preflight: active opaques carry a forward override.
        let fname = decl
            .custom
            .as_ref()
            .and_then(|c| c.forward.clone())
            .expect("active opaque without a forward override");

        let mut args = pargs;
        for ((arg, dep), dtype) in instr.args.iter().zip(&decl.depends).zip(&decl.inputs) {
            if !dep {
                continue;
            }
            let t = match self.t(*arg) {
                Some(t) => t,
                None => rules::zero(&mut self.b, dtype, instr.id)?,
            };
            args.push(t);
        }
        let pair_ty = decl.output.clone().pair();
        let pair = self.b.push(Op::Call(fname), args, pair_ty);
        let p = self
            .b
            .push(Op::Proj(0), vec![pair], instr.dtype.clone());
        let t = self
            .b
            .push(Op::Proj(1), vec![pair], instr.dtype.clone());
        Ok((p, Some(t)))
    }

    fn for_loop(
        &mut self,
        instr: &crate::fd::node::Instr,
        count: usize,
        region: &Body,
    ) -> Result<(ValueId, Option<ValueId>), TransformError> {
        let init_p = self.p(instr.args[0]);
        let init_t = self.t(instr.args[0]);

        if !self.activity.is_active(instr.id) {
            // Nothing active flows through the slot; clone the loop as-is.
            self.b.begin_region();
            let carried = self.b.push(Op::Carried, vec![], instr.dtype.clone());
            let index = self.b.push(Op::Index, vec![], DType::I64);
            let bind = Bind {
                carried_primal: carried,
                carried_tangent: None,
                index: Some(index),
            };
            let (p_res, _) = self.body(region, Some(&bind))?;
            let new_region = self.b.end_region(p_res);
            let p = self.b.push(
                Op::For {
                    count,
                    body: new_region,
                },
                vec![init_p],
                instr.dtype.clone(),
            );
            return Ok((p, None));
        }

        // The carried slot becomes a (primal, tangent) pair.
        let pair_ty = instr.dtype.clone().pair();
        let init_t = match init_t {
            Some(t) => t,
            None => rules::zero(&mut self.b, &instr.dtype, instr.id)?,
        };
        let init_pair = self
            .b
            .push(Op::Pack, vec![init_p, init_t], pair_ty.clone());

        self.b.begin_region();
        let carried = self.b.push(Op::Carried, vec![], pair_ty.clone());
        let c_p = self
            .b
            .push(Op::Proj(0), vec![carried], instr.dtype.clone());
        let c_t = self
            .b
            .push(Op::Proj(1), vec![carried], instr.dtype.clone());
        let index = self.b.push(Op::Index, vec![], DType::I64);
        let bind = Bind {
            carried_primal: c_p,
            carried_tangent: Some(c_t),
            index: Some(index),
        };
        let (p_res, t_res) = self.body(region, Some(&bind))?;
        let t_res = match t_res {
            Some(t) => t,
            None => rules::zero(&mut self.b, &instr.dtype, instr.id)?,
        };
        let yield_pair = self
            .b
            .push(Op::Pack, vec![p_res, t_res], pair_ty.clone());
        let new_region = self.b.end_region(yield_pair);

        let looped = self.b.push(
            Op::For {
                count,
                body: new_region,
            },
            vec![init_pair],
            pair_ty,
        );
        let p = self
            .b
            .push(Op::Proj(0), vec![looped], instr.dtype.clone());
        let t = self
            .b
            .push(Op::Proj(1), vec![looped], instr.dtype.clone());
        Ok((p, Some(t)))
    }

    fn while_loop(
        &mut self,
        instr: &crate::fd::node::Instr,
        cond: &Body,
        region: &Body,
    ) -> Result<(ValueId, Option<ValueId>), TransformError> {
        let init_p = self.p(instr.args[0]);
        let init_t = self.t(instr.args[0]);

        if !self.activity.is_active(instr.id) {
            self.b.begin_region();
            let c_carried = self.b.push(Op::Carried, vec![], instr.dtype.clone());
            let bind = Bind {
                carried_primal: c_carried,
                carried_tangent: None,
                index: None,
            };
            let (c_res, _) = self.body(cond, Some(&bind))?;
            let new_cond = self.b.end_region(c_res);

            self.b.begin_region();
            let b_carried = self.b.push(Op::Carried, vec![], instr.dtype.clone());
            let bind = Bind {
                carried_primal: b_carried,
                carried_tangent: None,
                index: None,
            };
            let (b_res, _) = self.body(region, Some(&bind))?;
            let new_body = self.b.end_region(b_res);

            let p = self.b.push(
                Op::While {
                    cond: new_cond,
                    body: new_body,
                },
                vec![init_p],
                instr.dtype.clone(),
            );
            return Ok((p, None));
        }

        let pair_ty = instr.dtype.clone().pair();
        let init_t = match init_t {
            Some(t) => t,
            None => rules::zero(&mut self.b, &instr.dtype, instr.id)?,
        };
        let init_pair = self
            .b
            .push(Op::Pack, vec![init_p, init_t], pair_ty.clone());

        // Condition sees the primal half only; no derivative flows through
        // a branch decision.
        self.b.begin_region();
        let c_carried = self.b.push(Op::Carried, vec![], pair_ty.clone());
        let c_p = self
            .b
            .push(Op::Proj(0), vec![c_carried], instr.dtype.clone());
        let bind = Bind {
            carried_primal: c_p,
            carried_tangent: None,
            index: None,
        };
        let (c_res, _) = self.body(cond, Some(&bind))?;
        let new_cond = self.b.end_region(c_res);

        self.b.begin_region();
        let b_carried = self.b.push(Op::Carried, vec![], pair_ty.clone());
        let b_p = self
            .b
            .push(Op::Proj(0), vec![b_carried], instr.dtype.clone());
        let b_t = self
            .b
            .push(Op::Proj(1), vec![b_carried], instr.dtype.clone());
        let bind = Bind {
            carried_primal: b_p,
            carried_tangent: Some(b_t),
            index: None,
        };
        let (p_res, t_res) = self.body(region, Some(&bind))?;
        let t_res = match t_res {
            Some(t) => t,
            None => rules::zero(&mut self.b, &instr.dtype, instr.id)?,
        };
        let yield_pair = self
            .b
            .push(Op::Pack, vec![p_res, t_res], pair_ty.clone());
        let new_body = self.b.end_region(yield_pair);

        let looped = self.b.push(
            Op::While {
                cond: new_cond,
                body: new_body,
            },
            vec![init_pair],
            pair_ty,
        );
        let p = self
            .b
            .push(Op::Proj(0), vec![looped], instr.dtype.clone());
        let t = self
            .b
            .push(Op::Proj(1), vec![looped], instr.dtype.clone());
        Ok((p, Some(t)))
    }
}
