//! The in-tree host device: the reference lowering collaborator.
//!
//! "Lowering" here is registration — a loaded kernel is the descriptor plus
//! its copy plan, and a launch unmarshals the argument buffers, runs the
//! reference interpreter, and marshals the result back into a fresh buffer.
//! Real GPU devices live outside the crate behind the same trait; this one
//! exists so offloaded descriptors execute anywhere and so tests have an
//! exact host oracle.

use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::eval::{Evaluator, ExternTable, Value};
use crate::fd::function::FuncDesc;
use crate::module::Module;
use crate::offload::marshal::MarshalRegistry;
use crate::offload::plan::CopyPlan;
use crate::offload::target::{Device, DeviceError, DeviceKind};

#[derive(Debug)]
pub struct HostDevice {
    marshal: MarshalRegistry,
    externs: ExternTable,
    state: Mutex<HostState>,
}

#[derive(Debug, Default)]
struct HostState {
    next_buffer: u64,
    buffers: FxHashMap<u64, Vec<u8>>,
    kernels: FxHashMap<String, HostKernel>,
}

#[derive(Debug, Clone)]
struct HostKernel {
    module: Module,
    fd: FuncDesc,
    plan: CopyPlan,
}

impl HostDevice {
    pub fn new(marshal: MarshalRegistry, externs: ExternTable) -> Self {
        Self {
            marshal,
            externs,
            state: Mutex::new(HostState::default()),
        }
    }

    fn ops_for(
        &self,
        dtype: &crate::fd::dtype::DType,
        context: &str,
    ) -> Result<crate::offload::marshal::MarshalOps, DeviceError> {
        self.marshal
            .resolve(dtype, context)
            .map_err(|e| DeviceError::Marshal(e.to_string()))
    }
}

impl Device for HostDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn load(
        &self,
        module: &Module,
        fd: &FuncDesc,
        plan: &CopyPlan,
    ) -> Result<String, DeviceError> {
        let symbol = fd.name().to_string();
        let mut state = self.state.lock().expect("host device state poisoned");
        state.kernels.insert(
            symbol.clone(),
            HostKernel {
                module: module.clone(),
                fd: fd.clone(),
                plan: plan.clone(),
            },
        );
        Ok(symbol)
    }

    fn alloc(&self, bytes: Vec<u8>) -> Result<u64, DeviceError> {
        let mut state = self.state.lock().expect("host device state poisoned");
        let id = state.next_buffer;
        state.next_buffer += 1;
        state.buffers.insert(id, bytes);
        Ok(id)
    }

    fn read(&self, buffer: u64) -> Result<Vec<u8>, DeviceError> {
        let state = self.state.lock().expect("host device state poisoned");
        state
            .buffers
            .get(&buffer)
            .cloned()
            .ok_or(DeviceError::UnknownBuffer(buffer))
    }

    fn free(&self, buffer: u64) {
        let mut state = self.state.lock().expect("host device state poisoned");
        state.buffers.remove(&buffer);
    }

    fn launch(&self, symbol: &str, args: &[u64]) -> Result<u64, DeviceError> {
        let kernel = {
            let state = self.state.lock().expect("host device state poisoned");
            state
                .kernels
                .get(symbol)
                .cloned()
                .ok_or_else(|| DeviceError::UnknownKernel(symbol.to_string()))?
        };

        // Rebuild parameter values: copied parameters from argument buffers
        // in ascending order, elided ones as zeros the body never reads.
        let mut arg_iter = args.iter();
        let mut values = Vec::with_capacity(kernel.fd.params().len());
        let mut bound: Vec<(usize, u64)> = Vec::new();
        for (i, p) in kernel.fd.params().iter().enumerate() {
            if kernel.plan.to_device[i] {
                let buffer = *arg_iter
                    .next()
                    .ok_or_else(|| DeviceError::Launch("missing argument buffer".into()))?;
                let bytes = self.read(buffer)?;
                let ops = self.ops_for(&p.dtype, &p.name)?;
                values.push((ops.to_host)(&bytes)?);
                bound.push((i, buffer));
            } else {
                values.push(
                    Value::zero_of(&p.dtype)
                        .map_err(|e| DeviceError::Launch(e.to_string()))?,
                );
            }
        }
        if arg_iter.next().is_some() {
            return Err(DeviceError::Launch("too many argument buffers".into()));
        }

        let result = Evaluator::new(&kernel.module, &self.externs)
            .call_fd(&kernel.fd, &mut values)
            .map_err(|e| DeviceError::Launch(e.to_string()))?;

        // Mutable argument buffers are updated in place.
        for (i, buffer) in bound {
            if kernel.plan.to_host[i] {
                let ops = self.ops_for(&kernel.fd.params()[i].dtype, "writeback")?;
                let bytes = (ops.to_device)(&values[i])?;
                let mut state = self.state.lock().expect("host device state poisoned");
                state.buffers.insert(buffer, bytes);
            }
        }

        let ops = self.ops_for(kernel.fd.ret(), "result")?;
        let bytes = (ops.to_device)(&result)?;
        self.alloc(bytes)
    }
}
