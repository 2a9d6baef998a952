//! Differentiation engine.
//!
//! Consumes a descriptor plus a per-parameter activity request and produces a
//! new descriptor computing the requested derivatives. Two accumulation
//! strategies:
//!
//! - forward: every instruction is paired with its tangent, interleaved with
//!   the primal computation; the result is a `(primal, tangent)` record and
//!   the caller supplies one tangent per active parameter.
//! - reverse: a forward sweep lays down the primal tape, then a reverse
//!   sweep walks it back to front — exact reverse topological order with
//!   definition-order tie-breaks — accumulating adjoints from the return
//!   seed down to the parameters. Counted loops are unrolled first; loops
//!   with data-dependent trip counts are refused rather than checkpointed
//!   behind the caller's back.
//!
//! Borrowed-mut active parameters get their adjoints accumulated into a
//! caller-supplied accumulator parameter, not a fresh local, so reverse-mode
//! chains across call boundaries observe every contribution.
//!
//! Everything the engine cannot prove safe is refused: opaque regions
//! without the needed override, global reads that flow into the result,
//! recursive call chains, effects already present in the body.

mod custom;
mod forward;
mod reverse;
mod rules;

use log::debug;

use crate::activity::{analyze_activity, Activity, ActivityRequest};
use crate::error::TransformError;
use crate::fd::function::FuncDesc;
use crate::fd::op::Op;
use crate::module::Module;

/// Derivative accumulation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffMode {
    Forward,
    Reverse,
}

/// Differentiates `fd` under `request`, registers the derived descriptor in
/// the module (as `<name>__jvp` or `<name>__vjp`), and returns it.
pub fn differentiate(
    module: &mut Module,
    fd: &FuncDesc,
    request: &ActivityRequest,
    mode: DiffMode,
) -> Result<FuncDesc, TransformError> {
    let mut stack = Vec::new();
    differentiate_inner(module, fd, request, mode, &mut stack)
}

pub(crate) fn differentiate_inner(
    module: &mut Module,
    fd: &FuncDesc,
    request: &ActivityRequest,
    mode: DiffMode,
    stack: &mut Vec<String>,
) -> Result<FuncDesc, TransformError> {
    if stack.iter().any(|n| n == fd.name()) {
        return Err(TransformError::mode(
            fd.body().result,
            format!("recursive call chain through '{}'", fd.name()),
        ));
    }

    let activity = analyze_activity(fd, request)?;

    if let Some((node, global)) = activity.contributing_globals().first() {
        return Err(TransformError::GlobalActivityRefused {
            node: *node,
            global: global.clone(),
        });
    }

    preflight(module, fd, &activity, mode)?;

    debug!(
        "differentiating '{}' ({:?}, {} instructions)",
        fd.name(),
        mode,
        fd.body().len_recursive()
    );

    stack.push(fd.name().to_string());
    let result = match mode {
        DiffMode::Forward => forward::transform(module, fd, request, &activity, stack),
        DiffMode::Reverse => reverse::transform(module, fd, request, stack),
    };
    stack.pop();

    let derived = result?;
    log::trace!("derived descriptor:\n{derived}");
    module.add_derived(derived.clone());
    Ok(derived)
}

/// Structural checks that hold for both modes, reported before any
/// instruction of the derived descriptor is emitted.
fn preflight(
    module: &Module,
    fd: &FuncDesc,
    activity: &crate::activity::ActivityMap,
    mode: DiffMode,
) -> Result<(), TransformError> {
    let mut failure = None;
    fd.body().walk(&mut |instr| {
        if failure.is_some() {
            return;
        }
        match &instr.op {
            Op::Opaque(decl) => {
                if activity.activity(instr.id) == Activity::OpaqueUnresolved {
                    failure = Some(TransformError::UnresolvedOpaqueRegion {
                        node: instr.id,
                        symbol: decl.symbol.clone(),
                    });
                    return;
                }
                if activity.is_active(instr.id) {
                    let custom = decl
                        .custom
                        .as_ref()
                        .expect("active opaque region classified without an override");
                    let check = match mode {
                        DiffMode::Forward => match &custom.forward {
                            Some(name) => {
                                custom::validate_forward(module, instr.id, decl, name)
                            }
                            None => Err(TransformError::UnresolvedOpaqueRegion {
                                node: instr.id,
                                symbol: decl.symbol.clone(),
                            }),
                        },
                        DiffMode::Reverse => match &custom.reverse {
                            Some(name) => {
                                custom::validate_reverse(module, instr.id, decl, name)
                            }
                            None => Err(TransformError::UnresolvedOpaqueRegion {
                                node: instr.id,
                                symbol: decl.symbol.clone(),
                            }),
                        },
                    };
                    if let Err(err) = check {
                        failure = Some(err);
                    }
                }
            }
            Op::AccumParam(_) => {
                failure = Some(TransformError::mode(
                    instr.id,
                    "body already accumulates into caller state",
                ));
            }
            Op::Transfer(_) => {
                failure = Some(TransformError::mode(
                    instr.id,
                    "body contains residency transfers",
                ));
            }
            // Values downstream of an unresolved region need no report of
            // their own; the walk reaches the region itself.
            _ => {}
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
