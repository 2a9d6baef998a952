//! Composition driver: ordering legality, then sequential application.
//!
//! Differentiation and batching rewrite descriptors, so they chain freely in
//! the order requested. Offload produces a dispatch boundary; it may sit
//! outermost (everything else runs first, the derivative/batched descriptor
//! is what ships to the device) but a differentiation after it would have to
//! see through the boundary, which this design refuses outright. Batching
//! only changes data layout, so a batch written after the offload commutes
//! in front of it.

use log::debug;

use crate::annot::ModeSpec;
use crate::batch::batch;
use crate::diff::differentiate;
use crate::error::TransformError;
use crate::fd::function::FuncDesc;
use crate::module::Module;
use crate::offload::marshal::MarshalRegistry;
use crate::offload::{offload, OffloadArtifact};

/// What a mode sequence produces: a plain transformed descriptor, or an
/// offload artifact when the sequence ends at a device boundary.
#[derive(Debug, Clone)]
pub enum Composed {
    Plain(FuncDesc),
    Offloaded(OffloadArtifact),
}

pub fn compose(
    module: &mut Module,
    fd: &FuncDesc,
    modes: &[ModeSpec],
    marshal: &MarshalRegistry,
) -> Result<Composed, TransformError> {
    let mut offload_seen = false;
    for spec in modes {
        match spec {
            ModeSpec::Offload { .. } => {
                if offload_seen {
                    return Err(TransformError::ComposeOrderRefused {
                        what: "a mode sequence dispatches to devices at most once".into(),
                    });
                }
                offload_seen = true;
            }
            ModeSpec::Differentiate { .. } if offload_seen => {
                return Err(TransformError::ComposeOrderRefused {
                    what: "differentiating through a device-dispatch boundary".into(),
                });
            }
            _ => {}
        }
    }

    debug!("composing '{}' through {} mode(s)", fd.name(), modes.len());

    let mut current = fd.clone();
    let mut offload_targets = None;
    for spec in modes {
        match spec {
            ModeSpec::Differentiate { request, mode } => {
                current = differentiate(module, &current, request, *mode)?;
            }
            ModeSpec::Batch { width } => {
                current = batch(&current, *width)?;
                module.add_derived(current.clone());
            }
            ModeSpec::Offload { targets } => {
                offload_targets = Some(targets.clone());
            }
        }
    }

    match offload_targets {
        Some(targets) => Ok(Composed::Offloaded(offload(
            module, &current, &targets, marshal,
        )?)),
        None => Ok(Composed::Plain(current)),
    }
}
