//! Activity analysis: which values depend on a differentiation input.
//!
//! A forward data-flow fixed point starting from the parameters the request
//! marks active. Every instruction in the descriptor — including those inside
//! loop regions — ends up classified as `Active`, `Constant`, or
//! `OpaqueUnresolved` (an opaque region with no dependency declaration that
//! an active value reaches). The result depends only on the descriptor and
//! the request, never on evaluation order.
//!
//! The analysis also computes the contributes-to-result set: backward
//! reachability from the returned value and from every caller-visible
//! effect. Differentiation uses it to refuse global state that flows into
//! the result, and the offload planner uses it to decide which parameters
//! the device body actually consumes.

use log::trace;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::TransformError;
use crate::fd::function::FuncDesc;
use crate::fd::node::{Body, Instr, ValueId};
use crate::fd::op::{BinaryOp, Op};

/// Classification of one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Depends on an active parameter; needs a tangent or adjoint.
    Active,
    Constant,
    /// Flows out of an opaque region that an active value reaches and that
    /// declares no custom derivative. Differentiation refuses these.
    OpaqueUnresolved,
}

/// Requested activity per parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamActivity {
    Active,
    Constant,
}

/// The per-call differentiation request: which parameters are differentiated
/// and whether the caller supplies the return adjoint seed.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRequest {
    pub params: Vec<ParamActivity>,
    pub seed_from_caller: bool,
}

impl ActivityRequest {
    pub fn all_active(n: usize) -> Self {
        Self {
            params: vec![ParamActivity::Active; n],
            seed_from_caller: false,
        }
    }

    pub fn with_constant(mut self, index: usize) -> Self {
        self.params[index] = ParamActivity::Constant;
        self
    }

    pub fn with_caller_seed(mut self) -> Self {
        self.seed_from_caller = true;
        self
    }

    pub fn is_active(&self, index: usize) -> bool {
        self.params[index] == ParamActivity::Active
    }
}

/// Total classification of a descriptor body, keyed by instruction id.
#[derive(Debug, Clone)]
pub struct ActivityMap {
    activities: FxHashMap<ValueId, Activity>,
    contributes: FxHashSet<ValueId>,
    globals: Vec<(ValueId, String)>,
}

impl ActivityMap {
    pub fn activity(&self, id: ValueId) -> Activity {
        self.activities.get(&id).copied().unwrap_or(Activity::Constant)
    }

    pub fn is_active(&self, id: ValueId) -> bool {
        self.activity(id) == Activity::Active
    }

    /// Whether the value reaches the result or a caller-visible effect.
    pub fn contributes(&self, id: ValueId) -> bool {
        self.contributes.contains(&id)
    }

    /// Global reads that flow into the result, in definition order.
    pub fn contributing_globals(&self) -> &[(ValueId, String)] {
        &self.globals
    }
}

/// Runs the analysis. Fails only if the request does not match the
/// signature.
pub fn analyze_activity(
    fd: &FuncDesc,
    request: &ActivityRequest,
) -> Result<ActivityMap, TransformError> {
    if request.params.len() != fd.params().len() {
        return Err(TransformError::construct(
            fd.body().result,
            format!(
                "activity request covers {} parameters, signature declares {}",
                request.params.len(),
                fd.params().len()
            ),
        ));
    }

    let mut state = FxHashMap::default();
    // Forward fixed point; loop-carried slots couple an iteration's output
    // back to its input, so a single pass is not enough.
    loop {
        let mut changed = false;
        sweep_body(fd.body(), request, None, &mut state, &mut changed);
        if !changed {
            break;
        }
    }

    let contributes = contributes_set(fd.body());

    let mut globals = Vec::new();
    fd.body().walk(&mut |instr| {
        if let Op::Global(name) = &instr.op {
            if contributes.contains(&instr.id) {
                globals.push((instr.id, name.clone()));
            }
        }
    });

    trace!(
        "activity for '{}': {} active of {} instructions",
        fd.name(),
        state.values().filter(|a| **a == Activity::Active).count(),
        fd.body().len_recursive()
    );

    Ok(ActivityMap {
        activities: state,
        contributes,
        globals,
    })
}

/// One forward sweep over a body. `carried` is the activity of the enclosing
/// region's carried slot, if any.
fn sweep_body(
    body: &Body,
    request: &ActivityRequest,
    carried: Option<Activity>,
    state: &mut FxHashMap<ValueId, Activity>,
    changed: &mut bool,
) {
    for instr in &body.instrs {
        let next = match &instr.op {
            Op::Const(_) | Op::Global(_) | Op::Index | Op::AccumParam(_) | Op::Transfer(_) => {
                Activity::Constant
            }
            Op::Param(i) => {
                if request.is_active(*i) {
                    Activity::Active
                } else {
                    Activity::Constant
                }
            }
            Op::Carried => carried.unwrap_or(Activity::Constant),
            Op::Opaque(decl) => match &decl.custom {
                Some(_) => {
                    // The override's declared dependency signature decides
                    // which inputs the output varies with.
                    let deps = instr
                        .args
                        .iter()
                        .zip(&decl.depends)
                        .filter(|(_, dep)| **dep)
                        .map(|(arg, _)| lookup(state, *arg));
                    join_all(deps)
                }
                None => {
                    let reached = join_all(instr.args.iter().map(|a| lookup(state, *a)));
                    if reached == Activity::Constant {
                        Activity::Constant
                    } else {
                        Activity::OpaqueUnresolved
                    }
                }
            },
            Op::For { body: region, .. } | Op::While { body: region, .. } => {
                let slot = join(
                    lookup(state, instr.args[0]),
                    lookup(state, region.result),
                );
                if let Op::While { cond, .. } = &instr.op {
                    sweep_body(cond, request, Some(slot), state, changed);
                }
                sweep_body(region, request, Some(slot), state, changed);
                slot
            }
            _ => join_all(diff_operands(instr).into_iter().map(|a| lookup(state, a))),
        };

        let prev = state.insert(instr.id, next);
        if prev != Some(next) {
            *changed = true;
        }
    }
}

fn lookup(state: &FxHashMap<ValueId, Activity>, id: ValueId) -> Activity {
    state.get(&id).copied().unwrap_or(Activity::Constant)
}

fn join(a: Activity, b: Activity) -> Activity {
    use Activity::*;
    match (a, b) {
        (Active, _) | (_, Active) => Active,
        (OpaqueUnresolved, _) | (_, OpaqueUnresolved) => OpaqueUnresolved,
        _ => Constant,
    }
}

fn join_all(items: impl Iterator<Item = Activity>) -> Activity {
    items.fold(Activity::Constant, join)
}

/// Operands through which derivative information flows. Branch conditions
/// and comparisons contribute no derivative, so they are excluded.
fn diff_operands(instr: &Instr) -> Vec<ValueId> {
    match &instr.op {
        Op::Select => instr.args[1..].to_vec(),
        Op::Binary(BinaryOp::CmpLt) | Op::Binary(BinaryOp::CmpEq) => Vec::new(),
        _ => instr.args.clone(),
    }
}

/// Backward reachability from the result and from caller-visible effects.
/// Loop regions are kept whole: if the loop's value is live, everything the
/// region computes is treated as live.
fn contributes_set(body: &Body) -> FxHashSet<ValueId> {
    let mut live: FxHashSet<ValueId> = FxHashSet::default();
    live.insert(body.result);
    // Effects are always observable.
    body.walk(&mut |instr| {
        if matches!(instr.op, Op::AccumParam(_) | Op::Transfer(_)) {
            live.insert(instr.id);
        }
    });

    loop {
        let mut changed = false;
        mark_live(body, &mut live, &mut changed);
        if !changed {
            break;
        }
    }
    live
}

fn mark_live(body: &Body, live: &mut FxHashSet<ValueId>, changed: &mut bool) {
    for instr in body.instrs.iter().rev() {
        if live.contains(&instr.id) {
            for arg in &instr.args {
                if live.insert(*arg) {
                    *changed = true;
                }
            }
            match &instr.op {
                Op::For { body: region, .. } => {
                    flood_region(region, live, changed);
                }
                Op::While { cond, body: region } => {
                    flood_region(cond, live, changed);
                    flood_region(region, live, changed);
                }
                _ => {}
            }
        }
        // Regions may contain their own effects even when the loop value is
        // dead; recurse to honor them.
        match &instr.op {
            Op::For { body: region, .. } => mark_live(region, live, changed),
            Op::While { cond, body: region } => {
                mark_live(cond, live, changed);
                mark_live(region, live, changed);
            }
            _ => {}
        }
    }
}

fn flood_region(region: &Body, live: &mut FxHashSet<ValueId>, changed: &mut bool) {
    region.walk(&mut |instr| {
        if live.insert(instr.id) {
            *changed = true;
        }
        for arg in &instr.args {
            if live.insert(*arg) {
                *changed = true;
            }
        }
    });
}
