//! Reverse-mode transformation: primal tape forward, adjoints backward.
//!
//! Counted loops are unrolled first — the trip count is static, so the tape
//! stays finite. Loops whose trip count depends on data would need unbounded
//! re-materialization; the engine refuses those instead of inventing a
//! checkpointing schedule behind the caller's back.
//!
//! The reverse sweep walks the tape back to front. The tape is in definition
//! order, so this is exactly reverse topological order over the data
//! dependencies, with definition order breaking ties between independent
//! instructions — the derived descriptor comes out the same on every run.

use rustc_hash::FxHashMap;

use crate::activity::{analyze_activity, ActivityRequest};
use crate::diff::{rules, DiffMode};
use crate::error::TransformError;
use crate::fd::builder::FdBuilder;
use crate::fd::dtype::{Const, DType};
use crate::fd::function::{FuncDesc, Ownership, Param};
use crate::fd::node::{Body, Instr, ValueId};
use crate::fd::op::Op;
use crate::module::Module;

pub(crate) fn transform(
    module: &mut Module,
    fd: &FuncDesc,
    request: &ActivityRequest,
    stack: &mut Vec<String>,
) -> Result<FuncDesc, TransformError> {
    let flat = unroll(fd)?;
    let activity = analyze_activity(&flat, request)?;

    let mut params = fd.params().to_vec();
    let seed_param = if request.seed_from_caller {
        let idx = params.len();
        params.push(Param::owned("seed", fd.ret().clone()));
        Some(idx)
    } else {
        None
    };
    let mut accum_param = vec![None; fd.params().len()];
    for (i, p) in fd.params().iter().enumerate() {
        if request.is_active(i) && p.ownership == Ownership::BorrowedMut {
            accum_param[i] = Some(params.len());
            params.push(Param::borrowed_mut(format!("d_{}", p.name), p.dtype.clone()));
        }
    }

    // Forward sweep: lay the primal down as the tape. `map` translates flat
    // ids into emitted ids; `types` remembers every flat value's type for
    // the rules that need operand shapes.
    let mut b = FdBuilder::new();
    let mut map: FxHashMap<ValueId, ValueId> = FxHashMap::default();
    let mut types: FxHashMap<ValueId, DType> = FxHashMap::default();
    let mut tape: Vec<Instr> = Vec::with_capacity(flat.body().instrs.len());
    for instr in &flat.body().instrs {
        let args: Vec<ValueId> = instr.args.iter().map(|a| map[a]).collect();
        let new_id = b.push(instr.op.clone(), args, instr.dtype.clone());
        map.insert(instr.id, new_id);
        types.insert(instr.id, instr.dtype.clone());
        tape.push(instr.clone());
    }
    let primal_result = map[&flat.body().result];

    let seed = match seed_param {
        Some(idx) => b.push(Op::Param(idx), vec![], fd.ret().clone()),
        None => {
            if fd.ret() != &DType::F64 {
                return Err(TransformError::mode(
                    flat.body().result,
                    format!(
                        "return type {} needs a caller-supplied adjoint seed",
                        fd.ret()
                    ),
                ));
            }
            b.push(Op::Const(Const::F64(1.0)), vec![], DType::F64)
        }
    };

    // Reverse sweep. Adjoints are keyed by flat id and hold emitted ids.
    let mut sweep = Sweep {
        b,
        module,
        stack,
        activity: &activity,
        map: &map,
        types: &types,
        adjoint: FxHashMap::default(),
    };
    sweep.adjoint.insert(flat.body().result, seed);

    for instr in tape.iter().rev() {
        sweep.step(instr)?;
    }

    // Parameter adjoints: one parameter may appear as several instructions;
    // their shadows sum, in definition order.
    let mut param_adj: Vec<Option<ValueId>> = vec![None; fd.params().len()];
    for instr in &tape {
        if let Op::Param(i) = instr.op {
            if let Some(adj) = sweep.adjoint.get(&instr.id).copied() {
                param_adj[i] = Some(match param_adj[i] {
                    Some(prev) => rules::add(&mut sweep.b, prev, adj),
                    None => adj,
                });
            }
        }
    }

    let mut b = sweep.b;
    let mut ret_fields = vec![fd.ret().clone()];
    let mut ret_vals = vec![primal_result];
    for (i, p) in fd.params().iter().enumerate() {
        if !request.is_active(i) {
            continue;
        }
        match accum_param[i] {
            // Borrowed-mut: the shadow aliases the caller's accumulator.
            Some(acc_idx) => {
                if let Some(adj) = param_adj[i] {
                    b.push(Op::AccumParam(acc_idx), vec![adj], DType::unit());
                }
            }
            None => {
                let adj = match param_adj[i] {
                    Some(adj) => adj,
                    None => rules::zero(&mut b, &p.dtype, primal_result)?,
                };
                ret_fields.push(p.dtype.clone());
                ret_vals.push(adj);
            }
        }
    }

    let ret = DType::Record(ret_fields);
    let packed = b.push(Op::Pack, ret_vals, ret.clone());
    let body = b.finish(packed);
    Ok(FuncDesc::new(
        format!("{}__vjp", fd.name()),
        params,
        ret,
        body,
    ))
}

struct Sweep<'a> {
    b: FdBuilder,
    module: &'a mut Module,
    stack: &'a mut Vec<String>,
    activity: &'a crate::activity::ActivityMap,
    map: &'a FxHashMap<ValueId, ValueId>,
    types: &'a FxHashMap<ValueId, DType>,
    adjoint: FxHashMap<ValueId, ValueId>,
}

impl Sweep<'_> {
    fn accum(&mut self, old: ValueId, delta: ValueId) {
        match self.adjoint.get(&old).copied() {
            Some(prev) => {
                let sum = rules::add(&mut self.b, prev, delta);
                self.adjoint.insert(old, sum);
            }
            None => {
                self.adjoint.insert(old, delta);
            }
        }
    }

    fn active(&self, old: ValueId) -> bool {
        self.activity.is_active(old)
    }

    fn step(&mut self, instr: &Instr) -> Result<(), TransformError> {
        let Some(dy) = self.adjoint.get(&instr.id).copied() else {
            return Ok(());
        };

        match &instr.op {
            Op::Const(_) | Op::Param(_) | Op::Global(_) => {}

            Op::Unary(op) => {
                let old_x = instr.args[0];
                if self.active(old_x) {
                    let px = self.map[&old_x];
                    let py = self.map[&instr.id];
                    let d = rules::unary_adjoint(&mut self.b, *op, px, py, dy);
                    self.accum(old_x, d);
                }
            }

            Op::Binary(op) => {
                let (old_a, old_b) = (instr.args[0], instr.args[1]);
                let pa = self.map[&old_a];
                let pb = self.map[&old_b];
                let py = self.map[&instr.id];
                let (want_a, want_b) = (self.active(old_a), self.active(old_b));
                let (da, db) =
                    rules::binary_adjoint(&mut self.b, *op, pa, pb, py, dy, want_a, want_b)?;
                if let Some(d) = da {
                    self.accum(old_a, d);
                }
                if let Some(d) = db {
                    self.accum(old_b, d);
                }
            }

            Op::Select => {
                let cond = self.map[&instr.args[0]];
                let (old_then, old_els) = (instr.args[1], instr.args[2]);
                if self.active(old_then) {
                    let z = rules::zero(&mut self.b, &instr.dtype, instr.id)?;
                    let d = rules::select(&mut self.b, cond, dy, z);
                    self.accum(old_then, d);
                }
                if self.active(old_els) {
                    let z = rules::zero(&mut self.b, &instr.dtype, instr.id)?;
                    let d = rules::select(&mut self.b, cond, z, dy);
                    self.accum(old_els, d);
                }
            }

            Op::Pack => {
                let fields = match &instr.dtype {
                    DType::Record(fields) => fields.clone(),
                    _ => unreachable!("pack produces a record"),
                };
                for (k, old) in instr.args.clone().into_iter().enumerate() {
                    if self.active(old) {
                        let d = self
                            .b
                            .push(Op::Proj(k), vec![dy], fields[k].clone());
                        self.accum(old, d);
                    }
                }
            }

            Op::Proj(k) => {
                let old = instr.args[0];
                if self.active(old) {
                    let fields = match &self.types[&old] {
                        DType::Record(fields) => fields.clone(),
                        other => unreachable!("projection from non-record {other}"),
                    };
                    let mut parts = Vec::with_capacity(fields.len());
                    for (j, field) in fields.iter().enumerate() {
                        if j == *k {
                            parts.push(dy);
                        } else {
                            parts.push(rules::zero(&mut self.b, field, instr.id)?);
                        }
                    }
                    let d = self
                        .b
                        .push(Op::Pack, parts, self.types[&old].clone());
                    self.accum(old, d);
                }
            }

            Op::Splat(n) => {
                let old = instr.args[0];
                if self.active(old) {
                    // The broadcast's adjoint folds every lane back in.
                    let elem = self.types[&old].clone();
                    let mut total = self
                        .b
                        .push(Op::ExtractLane(0), vec![dy], elem.clone());
                    for k in 1..*n {
                        let lane = self
                            .b
                            .push(Op::ExtractLane(k), vec![dy], elem.clone());
                        total = rules::add(&mut self.b, total, lane);
                    }
                    self.accum(old, total);
                }
            }

            Op::ExtractLane(k) => {
                let old = instr.args[0];
                if self.active(old) {
                    let n = match &self.types[&old] {
                        DType::Vector(_, n) => *n,
                        other => unreachable!("lane extraction from non-vector {other}"),
                    };
                    let mut parts = Vec::with_capacity(n);
                    for j in 0..n {
                        if j == *k {
                            parts.push(dy);
                        } else {
                            parts.push(rules::push_const_f64(&mut self.b, 0.0));
                        }
                    }
                    let d = self
                        .b
                        .push(Op::BuildVector, parts, self.types[&old].clone());
                    self.accum(old, d);
                }
            }

            Op::BuildVector => {
                for (k, old) in instr.args.clone().into_iter().enumerate() {
                    if self.active(old) {
                        let d = self
                            .b
                            .push(Op::ExtractLane(k), vec![dy], self.types[&old].clone());
                        self.accum(old, d);
                    }
                }
            }

            Op::Call(name) => self.call(instr, name.clone(), dy)?,
            Op::Opaque(decl) => self.opaque(instr, decl.clone(), dy)?,

            Op::Carried | Op::Index | Op::For { .. } | Op::While { .. } => {
                unreachable!("loops are unrolled before the reverse sweep")
            }
            Op::AccumParam(_) | Op::Transfer(_) => {
                unreachable!("effectful operations are rejected before transformation")
            }
        }
        Ok(())
    }

    fn call(
        &mut self,
        instr: &Instr,
        name: String,
        dy: ValueId,
    ) -> Result<(), TransformError> {
        if !instr.args.iter().any(|a| self.active(*a)) {
            return Ok(());
        }
        let callee = self.module.get(&name).cloned().ok_or_else(|| {
            TransformError::construct(instr.id, format!("call target '{name}' is not registered"))
        })?;
        if !callee.mutable_params().is_empty() {
            return Err(TransformError::mode(
                instr.id,
                format!("differentiating through '{name}', which mutates caller state"),
            ));
        }

        let vjp_name = format!("{name}__vjp");
        if !self.module.contains(&vjp_name) {
            let request =
                ActivityRequest::all_active(callee.params().len()).with_caller_seed();
            crate::diff::differentiate_inner(
                self.module,
                &callee,
                &request,
                DiffMode::Reverse,
                self.stack,
            )?;
        }

        let mut fields = vec![callee.ret().clone()];
        fields.extend(callee.params().iter().map(|p| p.dtype.clone()));
        let vjp_ret = DType::Record(fields);

        let mut args: Vec<ValueId> = instr.args.iter().map(|a| self.map[a]).collect();
        args.push(dy);
        let packed = self.b.push(Op::Call(vjp_name), args, vjp_ret);

        for (j, old) in instr.args.clone().into_iter().enumerate() {
            if self.active(old) {
                let d = self.b.push(
                    Op::Proj(1 + j),
                    vec![packed],
                    callee.params()[j].dtype.clone(),
                );
                self.accum(old, d);
            }
        }
        Ok(())
    }

    fn opaque(
        &mut self,
        instr: &Instr,
        decl: crate::fd::op::OpaqueDecl,
        dy: ValueId,
    ) -> Result<(), TransformError> {
        if !self.activity.is_active(instr.id) {
            return Ok(());
        }
        // Validated in preflight: active opaques carry a reverse override.
        let rname = decl
            .custom
            .as_ref()
            .and_then(|c| c.reverse.clone())
            .expect("active opaque without a reverse override");

        let adj_fields: Vec<DType> = decl
            .inputs
            .iter()
            .zip(&decl.depends)
            .filter(|(_, dep)| **dep)
            .map(|(dtype, _)| dtype.clone())
            .collect();
        let rev_ret = DType::Record(adj_fields.clone());

        let mut args: Vec<ValueId> = instr.args.iter().map(|a| self.map[a]).collect();
        args.push(dy);
        let packed = self.b.push(Op::Call(rname), args, rev_ret);

        let mut pos = 0usize;
        for (j, dep) in decl.depends.iter().enumerate() {
            if !dep {
                continue;
            }
            let old = instr.args[j];
            if self.active(old) {
                let d = self
                    .b
                    .push(Op::Proj(pos), vec![packed], adj_fields[pos].clone());
                self.accum(old, d);
            }
            pos += 1;
        }
        Ok(())
    }
}

/// Replaces every counted loop with its unrolled straight-line form,
/// refusing loops whose trip count the descriptor cannot bound.
fn unroll(fd: &FuncDesc) -> Result<FuncDesc, TransformError> {
    let mut b = FdBuilder::new();
    let mut map = FxHashMap::default();
    let result = unroll_body(&mut b, fd.body(), &mut map, None)?;
    Ok(FuncDesc::new(
        fd.name().to_string(),
        fd.params().to_vec(),
        fd.ret().clone(),
        b.finish(result),
    ))
}

struct Subst {
    carried: ValueId,
    index: Option<ValueId>,
}

fn unroll_body(
    b: &mut FdBuilder,
    body: &Body,
    map: &mut FxHashMap<ValueId, ValueId>,
    subst: Option<&Subst>,
) -> Result<ValueId, TransformError> {
    for instr in &body.instrs {
        match &instr.op {
            Op::Carried => {
                let subst = subst.expect("carried slot outside a region");
                map.insert(instr.id, subst.carried);
            }
            Op::Index => {
                let subst = subst.expect("index outside a region");
                map.insert(
                    instr.id,
                    subst.index.expect("index outside a counted loop"),
                );
            }
            Op::For { count, body: region } => {
                let mut slot = map[&instr.args[0]];
                for k in 0..*count {
                    let idx = b.push(Op::Const(Const::I64(k as i64)), vec![], DType::I64);
                    let s = Subst {
                        carried: slot,
                        index: Some(idx),
                    };
                    slot = unroll_body(b, region, map, Some(&s))?;
                }
                map.insert(instr.id, slot);
            }
            Op::While { .. } => {
                return Err(TransformError::mode(
                    instr.id,
                    "reverse mode through a loop with a data-dependent trip count",
                ));
            }
            _ => {
                let args: Vec<ValueId> = instr.args.iter().map(|a| map[a]).collect();
                let id = b.push(instr.op.clone(), args, instr.dtype.clone());
                map.insert(instr.id, id);
            }
        }
    }
    Ok(map[&body.result])
}
