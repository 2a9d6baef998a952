//! Offload dispatcher: device-resident variant plus host-side stub.
//!
//! Consumes a descriptor, a target list and the marshalling registry, and
//! produces (i) the device variant handed to per-target lowering and (ii)
//! the host stub that performs host→device copies, the launch, and
//! device→host copies, with copies elided wherever ownership proves nobody
//! can observe them. Validation fails closed: an operation with no device
//! lowering, or a signature type with no marshalling, aborts the whole
//! offload rather than producing a stub that might misbehave at run time.

pub mod exec;
pub mod host;
pub mod marshal;
pub mod plan;
mod stub;
pub mod target;

use rustc_hash::FxHashSet;

use log::debug;

use crate::error::TransformError;
use crate::fd::function::{FuncDesc, Ownership};
use crate::fd::node::Body;
use crate::fd::op::Op;
use crate::module::Module;
use self::marshal::MarshalRegistry;
use self::plan::{plan_copies, CopyPlan};
use self::target::TargetId;

/// The dispatcher's product: the lowerable device descriptor, the host stub
/// descriptor, and the copy plan both were built from.
#[derive(Debug, Clone)]
pub struct OffloadArtifact {
    pub device_fd: FuncDesc,
    pub host_stub: FuncDesc,
    pub plan: CopyPlan,
    pub targets: Vec<TargetId>,
}

pub fn offload(
    module: &Module,
    fd: &FuncDesc,
    targets: &[TargetId],
    marshal: &MarshalRegistry,
) -> Result<OffloadArtifact, TransformError> {
    if targets.is_empty() {
        return Err(TransformError::construct(
            fd.body().result,
            "offload requires at least one target",
        ));
    }

    let mut visiting = FxHashSet::default();
    validate_device_body(module, fd, fd.body(), &mut visiting)?;

    // Every type reachable from the signature must marshal.
    for p in fd.params() {
        marshal.resolve(&p.dtype, &p.name)?;
    }
    marshal.resolve(fd.ret(), "return value")?;

    let plan = plan_copies(fd)?;

    if targets.len() > 1 {
        for (i, p) in fd.params().iter().enumerate() {
            if p.ownership == Ownership::BorrowedMut && plan.to_host[i] {
                // Each target would produce its own mutation of the same
                // caller slot; there is no sound merge.
                return Err(TransformError::UnsupportedOnDevice {
                    node: fd.body().result,
                    what: format!(
                        "fan-out cannot reconcile per-target mutations of '{}'",
                        p.name
                    ),
                });
            }
        }
    }

    let device_fd = stub::device_variant(fd);
    let host_stub = stub::host_stub(fd, device_fd.name(), targets, &plan);

    debug!(
        "offloaded '{}' to {} target(s); copies over: {:?}, back: {:?}",
        fd.name(),
        targets.len(),
        plan.to_device,
        plan.to_host
    );

    Ok(OffloadArtifact {
        device_fd,
        host_stub,
        plan,
        targets: targets.to_vec(),
    })
}

/// Rejects anything without a device lowering: host-only opaque regions,
/// reads of host-resident globals, nested residency transfers — in the
/// descriptor itself and in everything it calls.
fn validate_device_body(
    module: &Module,
    fd: &FuncDesc,
    body: &Body,
    visiting: &mut FxHashSet<String>,
) -> Result<(), TransformError> {
    for instr in &body.instrs {
        match &instr.op {
            Op::Opaque(decl) if !decl.device_lowerable => {
                return Err(TransformError::UnsupportedOnDevice {
                    node: instr.id,
                    what: format!("opaque region '{}' is host-only", decl.symbol),
                });
            }
            Op::Global(name) => {
                return Err(TransformError::UnsupportedOnDevice {
                    node: instr.id,
                    what: format!("global '{name}' lives in host memory"),
                });
            }
            Op::Transfer(_) => {
                return Err(TransformError::UnsupportedOnDevice {
                    node: instr.id,
                    what: "nested residency transfer".to_string(),
                });
            }
            Op::Call(name) => {
                if visiting.insert(name.clone()) {
                    let callee = module.get(name).ok_or_else(|| {
                        TransformError::construct(
                            instr.id,
                            format!("call target '{name}' is not registered"),
                        )
                    })?;
                    validate_device_body(module, callee, callee.body(), visiting)?;
                }
            }
            Op::For { body: region, .. } => {
                validate_device_body(module, fd, region, visiting)?;
            }
            Op::While { cond, body: region } => {
                validate_device_body(module, fd, cond, visiting)?;
                validate_device_body(module, fd, region, visiting)?;
            }
            _ => {}
        }
    }
    Ok(())
}
