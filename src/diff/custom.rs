//! Validation of user-supplied derivative overrides for opaque regions.
//!
//! The override is an ordinary descriptor registered in the module; what
//! makes it usable is its shape. The contract is fixed per direction:
//!
//! - forward: `(inputs..., tangents of dependent inputs...) -> (primal, tangent)`
//! - reverse: `(inputs..., output adjoint) -> (adjoints of dependent inputs...)`
//!
//! Anything else — wrong arity, wrong types, mutable parameters, or a
//! reference that resolves to nothing — fails the whole differentiation with
//! `CustomDerivativeSignatureMismatch`.

use crate::error::TransformError;
use crate::fd::dtype::DType;
use crate::fd::function::{FuncDesc, Ownership};
use crate::fd::node::ValueId;
use crate::fd::op::OpaqueDecl;
use crate::module::Module;

pub(crate) fn validate_forward(
    module: &Module,
    node: ValueId,
    decl: &OpaqueDecl,
    name: &str,
) -> Result<(), TransformError> {
    let fd = resolve(module, node, name)?;

    let mut want: Vec<DType> = decl.inputs.clone();
    want.extend(
        decl.inputs
            .iter()
            .zip(&decl.depends)
            .filter(|(_, dep)| **dep)
            .map(|(dtype, _)| dtype.clone()),
    );
    check_params(node, name, fd, &want)?;

    let want_ret = decl.output.clone().pair();
    if fd.ret() != &want_ret {
        return Err(mismatch(
            node,
            name,
            format!("returns {}, contract requires {want_ret}", fd.ret()),
        ));
    }
    Ok(())
}

pub(crate) fn validate_reverse(
    module: &Module,
    node: ValueId,
    decl: &OpaqueDecl,
    name: &str,
) -> Result<(), TransformError> {
    let fd = resolve(module, node, name)?;

    let mut want: Vec<DType> = decl.inputs.clone();
    want.push(decl.output.clone());
    check_params(node, name, fd, &want)?;

    let adjoints: Vec<DType> = decl
        .inputs
        .iter()
        .zip(&decl.depends)
        .filter(|(_, dep)| **dep)
        .map(|(dtype, _)| dtype.clone())
        .collect();
    let want_ret = DType::Record(adjoints);
    if fd.ret() != &want_ret {
        return Err(mismatch(
            node,
            name,
            format!("returns {}, contract requires {want_ret}", fd.ret()),
        ));
    }
    Ok(())
}

fn resolve<'m>(
    module: &'m Module,
    node: ValueId,
    name: &str,
) -> Result<&'m FuncDesc, TransformError> {
    module
        .get(name)
        .ok_or_else(|| mismatch(node, name, "not registered in the module".to_string()))
}

fn check_params(
    node: ValueId,
    name: &str,
    fd: &FuncDesc,
    want: &[DType],
) -> Result<(), TransformError> {
    if fd.params().len() != want.len() {
        return Err(mismatch(
            node,
            name,
            format!(
                "declares {} parameters, contract requires {}",
                fd.params().len(),
                want.len()
            ),
        ));
    }
    for (param, want) in fd.params().iter().zip(want) {
        if &param.dtype != want {
            return Err(mismatch(
                node,
                name,
                format!("parameter '{}' is {}, contract requires {want}", param.name, param.dtype),
            ));
        }
        if param.ownership == Ownership::BorrowedMut {
            return Err(mismatch(
                node,
                name,
                format!("parameter '{}' is borrowed-mut; overrides must be pure", param.name),
            ));
        }
    }
    Ok(())
}

fn mismatch(node: ValueId, symbol: &str, what: String) -> TransformError {
    TransformError::CustomDerivativeSignatureMismatch {
        node,
        symbol: symbol.to_string(),
        what,
    }
}
