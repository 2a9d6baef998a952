use crate::fd::dtype::{Const, DType};
use crate::fd::node::Body;
use crate::offload::target::TargetId;

/// Unary numeric operations. Float-valued only; the builder rejects them on
/// integer operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Recip,
    Sqrt,
    Sin,
    Cos,
    Exp,
    Log,
}

/// Binary operations. Comparisons produce `Bool` (lane-wise on vectors);
/// everything else preserves the operand type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    CmpLt,
    CmpEq,
}

/// Declaration of an opaque region: code the engines cannot see into.
///
/// The declaration is all the engines ever know about the region — its
/// signature, which inputs its output depends on, whether a device lowering
/// exists, and the optional user-supplied derivative overrides. The body
/// behind `symbol` only exists at run time, in the evaluator's extern table
/// or behind a real device driver.
#[derive(Debug, Clone, PartialEq)]
pub struct OpaqueDecl {
    pub symbol: String,
    pub inputs: Vec<DType>,
    pub output: DType,
    /// Declared dependency signature: `depends[i]` is false when the output
    /// provably does not vary with input `i`.
    pub depends: Vec<bool>,
    /// Whether the external lowering collaborator can produce device code
    /// for this symbol. Host-only regions make the descriptor unoffloadable.
    pub device_lowerable: bool,
    pub custom: Option<CustomDerivative>,
}

impl OpaqueDecl {
    pub fn new(symbol: impl Into<String>, inputs: Vec<DType>, output: DType) -> Self {
        let n = inputs.len();
        Self {
            symbol: symbol.into(),
            inputs,
            output,
            depends: vec![true; n],
            device_lowerable: false,
            custom: None,
        }
    }

    pub fn with_depends(mut self, depends: Vec<bool>) -> Self {
        self.depends = depends;
        self
    }

    pub fn device_lowerable(mut self) -> Self {
        self.device_lowerable = true;
        self
    }

    pub fn with_custom(mut self, custom: CustomDerivative) -> Self {
        self.custom = Some(custom);
        self
    }
}

/// User-supplied derivative overrides for an opaque region, referencing
/// descriptors registered in the same module by name. Each direction is
/// optional; differentiation fails when the direction it needs is missing.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomDerivative {
    /// Tangent rule: `(inputs..., input tangents for dependent inputs...) ->
    /// (primal, tangent)`.
    pub forward: Option<String>,
    /// Adjoint rule: `(inputs..., output adjoint) -> (input adjoints for
    /// dependent inputs...)`.
    pub reverse: Option<String>,
}

impl CustomDerivative {
    pub fn forward(name: impl Into<String>) -> Self {
        Self {
            forward: Some(name.into()),
            reverse: None,
        }
    }

    pub fn reverse(name: impl Into<String>) -> Self {
        Self {
            forward: None,
            reverse: Some(name.into()),
        }
    }

    pub fn both(forward: impl Into<String>, reverse: impl Into<String>) -> Self {
        Self {
            forward: Some(forward.into()),
            reverse: Some(reverse.into()),
        }
    }
}

/// Run-time residency transfer operations. These only ever appear in host
/// stubs produced by the offload dispatcher; the transformation engines never
/// consume them (the composition driver rules that out before it can arise).
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOp {
    /// Marshal parameter `param` to `target`. Produces a device handle.
    ToDevice { target: TargetId, param: usize },
    /// Launch `symbol` on `target` with device-handle arguments.
    Launch { target: TargetId, symbol: String },
    /// Marshal a device handle's contents back to the host.
    ToHost { target: TargetId },
}

/// The operation of a single instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Const(Const),
    /// Read of the n-th declared parameter.
    Param(usize),
    /// Read of module-level mutable state not reachable from any parameter.
    Global(String),

    Unary(UnaryOp),
    Binary(BinaryOp),
    /// `args: [cond, then, else]`. Data-flow conditional; both branches are
    /// computed, so it batches and differentiates without shape constraints.
    Select,

    /// Record construction from `args`.
    Pack,
    /// Field extraction; `args: [record]`.
    Proj(usize),

    /// Broadcast a scalar into an n-lane vector; `args: [scalar]`.
    Splat(usize),
    /// Extract lane `k` of a vector; `args: [vector]`.
    ExtractLane(usize),
    /// Assemble a vector from scalar lanes in `args`.
    BuildVector,

    /// Call of a named descriptor in the enclosing module.
    Call(String),
    Opaque(OpaqueDecl),

    /// Counted loop with one carried slot. `args: [init]`; the region's
    /// `Carried` reads the current slot, `Index` the iteration counter, and
    /// the region result becomes the next slot value. Produces the slot
    /// after the final iteration.
    For { count: usize, body: Body },
    /// Condition-driven loop with one carried slot. `args: [init]`; `cond`
    /// evaluates the continue condition against the current slot.
    While { cond: Body, body: Body },
    /// Current carried slot of the innermost enclosing region.
    Carried,
    /// Iteration counter (`i64`) of the innermost enclosing `For`.
    Index,

    /// In-place addition into the caller's borrowed-mut parameter `i`;
    /// `args: [delta]`. Produces unit. Emitted by reverse differentiation so
    /// adjoint accumulators alias caller state instead of being fresh locals.
    AccumParam(usize),

    Transfer(TransferOp),
}

impl Op {
    /// Whether this operation may only appear inside a `For`/`While` region.
    pub fn is_region_leaf(&self) -> bool {
        matches!(self, Op::Carried | Op::Index)
    }
}
