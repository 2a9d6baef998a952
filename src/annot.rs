//! The annotation surface: mode requests as the front-end hands them over.
//!
//! Text syntax is the front-end's problem; by the time a request reaches
//! this crate it is structured data — a mode tag plus its parameters.

use crate::activity::ActivityRequest;
use crate::diff::DiffMode;
use crate::offload::target::TargetId;

/// One mode annotation on a function.
#[derive(Debug, Clone, PartialEq)]
pub enum ModeSpec {
    Differentiate {
        request: ActivityRequest,
        mode: DiffMode,
    },
    Batch {
        width: usize,
    },
    Offload {
        targets: Vec<TargetId>,
    },
}
