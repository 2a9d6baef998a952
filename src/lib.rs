//! Prism: function transformation engine
//!
//! Prism takes an ordinary function — normalized into a descriptor — and,
//! under a declared mode, produces a semantically related transformed
//! function without the author rewriting the body.
//!
//! # Architecture
//!
//! - **fd**: function descriptors — signature with ownership kinds, flat
//!   body of id-stable instructions, structured control-flow regions
//! - **activity**: which values depend on a differentiation input
//! - **diff**: forward- and reverse-mode differentiation
//! - **batch**: struct-of-arrays widening to N lanes
//! - **offload**: device variant + host stub with copy elision, marshalling,
//!   and the run-time fan-out executor
//! - **compose**: ordering legality and sequential application of modes
//! - **eval**: the reference interpreter backing the in-tree host device
//!
//! Lowering to machine code and real device drivers are external
//! collaborators behind `offload::target::Device`; parsing and type checking
//! happen upstream of `source::SourceFunction`.

// ============================================================================
// Core Modules
// ============================================================================

pub mod activity;
pub mod annot;
pub mod batch;
pub mod compose;
pub mod diff;
pub mod error;
pub mod eval;
pub mod fd;
pub mod module;
pub mod offload;
pub mod source;

// ============================================================================
// Re-exports
// ============================================================================

pub use activity::{analyze_activity, Activity, ActivityMap, ActivityRequest, ParamActivity};
pub use batch::batch;
pub use compose::{compose, Composed};
pub use diff::{differentiate, DiffMode};
pub use error::TransformError;
pub use fd::{build_fd, DType, FuncDesc, Ownership, Param, ValueId};
pub use module::Module;
pub use offload::{offload, OffloadArtifact};

// ============================================================================
// Prelude
// ============================================================================

/// Prelude module with commonly used types and traits
pub mod prelude {
    pub use crate::activity::{ActivityRequest, ParamActivity};
    pub use crate::annot::ModeSpec;
    pub use crate::compose::{compose, Composed};
    pub use crate::diff::{differentiate, DiffMode};
    pub use crate::error::TransformError;
    pub use crate::eval::{Evaluator, ExternTable, Value};
    pub use crate::fd::{
        build_fd, Const, CustomDerivative, DType, FuncDesc, OpaqueDecl, Ownership, Param,
    };
    pub use crate::module::Module;
    pub use crate::offload::exec::{run, OffloadOutput, OffloadRunError};
    pub use crate::offload::host::HostDevice;
    pub use crate::offload::marshal::{MarshalOps, MarshalRegistry};
    pub use crate::offload::target::{Device, DeviceKind, DeviceRegistry, TargetId};
    pub use crate::offload::{offload, OffloadArtifact};
    pub use crate::source::{SourceExpr, SourceFunction};
}

// ============================================================================
// Tests
// ============================================================================
