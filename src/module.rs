//! A module: the named collection of descriptors a transformation runs in.
//!
//! Calls and custom-derivative references resolve against the module, and
//! cross-function rules are checked when a descriptor is registered, so the
//! engines can assume call sites are well formed.

use rustc_hash::FxHashMap;

use crate::error::TransformError;
use crate::fd::function::{FuncDesc, Ownership};
use crate::fd::node::Body;
use crate::fd::op::Op;

#[derive(Debug, Clone, Default)]
pub struct Module {
    fds: FxHashMap<String, FuncDesc>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&FuncDesc> {
        self.fds.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fds.contains_key(name)
    }

    /// Registers a descriptor, validating every call site against already
    /// registered callees: arity, argument types, and the mutable-argument
    /// rule — an argument bound to a borrowed-mut callee parameter must be a
    /// forwarded borrowed-mut parameter of the caller, so the mutation has a
    /// caller-visible home.
    pub fn add(&mut self, fd: FuncDesc) -> Result<(), TransformError> {
        self.validate_calls(&fd, fd.body())?;
        self.fds.insert(fd.name().to_string(), fd);
        Ok(())
    }

    /// Registers a descriptor produced by an engine without re-validating.
    /// Engines only emit call sites they have already proven well formed.
    pub(crate) fn add_derived(&mut self, fd: FuncDesc) {
        self.fds.insert(fd.name().to_string(), fd);
    }

    fn validate_calls(&self, caller: &FuncDesc, body: &Body) -> Result<(), TransformError> {
        for instr in &body.instrs {
            match &instr.op {
                Op::Call(name) => {
                    let callee = match self.fds.get(name) {
                        Some(callee) => callee,
                        // Forward references resolve when the callee's own
                        // transformation runs; nothing to check yet.
                        None => continue,
                    };
                    if callee.params().len() != instr.args.len() {
                        return Err(TransformError::construct(
                            instr.id,
                            format!(
                                "call to '{name}' passes {} arguments, callee declares {}",
                                instr.args.len(),
                                callee.params().len()
                            ),
                        ));
                    }
                    for (arg, cp) in instr.args.iter().zip(callee.params()) {
                        let arg_instr = body
                            .find(*arg)
                            .or_else(|| caller.body().find(*arg))
                            .expect("call argument refers to a defined instruction");
                        if arg_instr.dtype != cp.dtype {
                            return Err(TransformError::construct(
                                instr.id,
                                format!(
                                    "call to '{name}' passes {} where {} is declared",
                                    arg_instr.dtype, cp.dtype
                                ),
                            ));
                        }
                        if cp.ownership == Ownership::BorrowedMut {
                            let forwarded = matches!(
                                arg_instr.op,
                                Op::Param(i) if caller.params()[i].ownership == Ownership::BorrowedMut
                            );
                            if !forwarded {
                                return Err(TransformError::construct(
                                    instr.id,
                                    format!(
                                        "call to '{name}' binds a computed value to the \
                                         borrowed-mut parameter '{}'",
                                        cp.name
                                    ),
                                ));
                            }
                        }
                    }
                }
                Op::For { body: region, .. } => self.validate_calls(caller, region)?,
                Op::While { cond, body: region } => {
                    self.validate_calls(caller, cond)?;
                    self.validate_calls(caller, region)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}
