use crate::fd::dtype::DType;
use crate::fd::node::Body;

/// How a parameter is passed, which drives both adjoint accumulation and
/// offload copy elision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// The callee owns the value; a device copy never needs to travel back.
    Owned,
    /// Immutable borrow; never copied back.
    Borrowed,
    /// Mutable borrow; observable after the call, so device copies travel
    /// back and reverse-mode adjoints alias the caller's accumulator.
    BorrowedMut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub dtype: DType,
    pub ownership: Ownership,
}

impl Param {
    pub fn owned(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
            ownership: Ownership::Owned,
        }
    }

    pub fn borrowed(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
            ownership: Ownership::Borrowed,
        }
    }

    pub fn borrowed_mut(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
            ownership: Ownership::BorrowedMut,
        }
    }
}

/// A normalized function descriptor.
///
/// Descriptors are immutable once constructed: every engine consumes a
/// descriptor by reference and produces a fresh one, so independent engines
/// can transform the same descriptor without invalidation hazards and the
/// composition driver can order them freely.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncDesc {
    pub(crate) name: String,
    pub(crate) params: Vec<Param>,
    pub(crate) ret: DType,
    pub(crate) body: Body,
}

impl FuncDesc {
    pub fn new(name: impl Into<String>, params: Vec<Param>, ret: DType, body: Body) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
            body,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn ret(&self) -> &DType {
        &self.ret
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Indices of borrowed-mut parameters, in declaration order.
    pub fn mutable_params(&self) -> Vec<usize> {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.ownership == Ownership::BorrowedMut)
            .map(|(i, _)| i)
            .collect()
    }
}
