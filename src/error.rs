//! Transformation-time error taxonomy.
//!
//! Every variant is a validation failure: it names the offending instruction
//! (or parameter/type, where no instruction exists) and aborts the whole
//! transformation of that function. There is no partial or best-effort
//! output — a silently wrong derivative or device copy is worse than a
//! refused build. The only run-time error in the crate is the partial
//! fan-out failure in `offload::exec`, which has its own type.

use crate::fd::dtype::DType;
use crate::fd::node::ValueId;

#[derive(thiserror::Error, Debug)]
pub enum TransformError {
    /// The body contains a construct the descriptor cannot model, or the
    /// front-end handed over ill-typed structure.
    #[error("unsupported construct at {node}: {what}")]
    UnsupportedConstruct { node: ValueId, what: String },

    /// An opaque region reachable from an active value has no
    /// custom-derivative reference for the requested direction. The engine
    /// refuses rather than guessing a zero derivative.
    #[error("opaque region '{symbol}' at {node} is active and has no custom derivative for the requested mode")]
    UnresolvedOpaqueRegion { node: ValueId, symbol: String },

    /// A read of module-level mutable state contributes to the result.
    /// Differentiation through values not reachable from the declared
    /// parameters is refused as a safety boundary.
    #[error("global '{global}' read at {node} flows into the result; differentiation through non-parameter state is refused")]
    GlobalActivityRefused { node: ValueId, global: String },

    /// The requested mode cannot be supported for this region graph, e.g.
    /// reverse mode through a loop with an unbounded trip count.
    #[error("requested mode unsupported at {node}: {what}")]
    UnsupportedMode { node: ValueId, what: String },

    /// Control flow that can take different shapes per batch lane; fusing
    /// lanes into one call requires a single shape.
    #[error("control flow at {node} may diverge between batch lanes")]
    NonUniformShape { node: ValueId },

    /// A type reachable from an offloaded signature has no marshalling
    /// operation, and none can be derived structurally.
    #[error("no marshalling for type {dtype} (required by {what})")]
    MissingMarshalling { dtype: DType, what: String },

    /// The body contains an operation with no device lowering.
    #[error("no device lowering at {node}: {what}")]
    UnsupportedOnDevice { node: ValueId, what: String },

    /// The mode sequence asks for a composition this design refuses, such as
    /// differentiating through a device-dispatch boundary.
    #[error("refused mode order: {what}")]
    ComposeOrderRefused { what: String },

    /// A custom-derivative reference does not have the contract shape for
    /// its direction.
    #[error("custom derivative '{symbol}' at {node} does not match the contract: {what}")]
    CustomDerivativeSignatureMismatch {
        node: ValueId,
        symbol: String,
        what: String,
    },
}

impl TransformError {
    pub(crate) fn construct(node: ValueId, what: impl Into<String>) -> Self {
        TransformError::UnsupportedConstruct {
            node,
            what: what.into(),
        }
    }

    pub(crate) fn mode(node: ValueId, what: impl Into<String>) -> Self {
        TransformError::UnsupportedMode {
            node,
            what: what.into(),
        }
    }
}
