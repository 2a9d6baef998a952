//! Device targets and the capability surface the dispatcher is polymorphic
//! over.
//!
//! A target is an opaque id bound to a `Device` at run time. The core never
//! talks to driver APIs; it needs exactly two capabilities from a device —
//! lower a descriptor to a launchable symbol, and move bytes in and out —
//! and everything else stays behind this trait.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::fd::function::FuncDesc;
use crate::module::Module;
use crate::offload::plan::CopyPlan;

/// Identity of one dispatch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u32);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Device kind classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceKind {
    Cpu,
    IntegratedGpu,
    #[default]
    DiscreteGpu,
    Accelerator,
}

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("no device registered for {0}")]
    UnknownTarget(TargetId),
    #[error("kernel '{0}' is not loaded")]
    UnknownKernel(String),
    #[error("unknown device buffer {0}")]
    UnknownBuffer(u64),
    #[error("launch failed: {0}")]
    Launch(String),
    #[error("marshalling failed: {0}")]
    Marshal(String),
}

/// A dispatch target's run-time surface.
///
/// Buffer ids are device-scoped. `launch` consumes argument buffers in
/// ascending parameter order (copied parameters only — the copy plan decides
/// which) and returns a fresh buffer holding the marshalled result. Mutable
/// argument buffers are updated in place by the launch.
pub trait Device: fmt::Debug + Send + Sync {
    fn kind(&self) -> DeviceKind;

    /// Lowers a device-resident descriptor to a launchable symbol.
    fn load(
        &self,
        module: &Module,
        fd: &FuncDesc,
        plan: &CopyPlan,
    ) -> Result<String, DeviceError>;

    fn alloc(&self, bytes: Vec<u8>) -> Result<u64, DeviceError>;

    fn read(&self, buffer: u64) -> Result<Vec<u8>, DeviceError>;

    fn free(&self, buffer: u64);

    fn launch(&self, symbol: &str, args: &[u64]) -> Result<u64, DeviceError>;
}

/// A device allocation owned by the host-stub invocation that created it.
///
/// Dropping the handle frees the allocation on its device, so every exit
/// path — success, per-target failure, panic unwinding out of a worker —
/// releases device memory. No allocation outlives its triggering call.
#[derive(Debug)]
pub struct DeviceBuffer {
    id: u64,
    device: Arc<dyn Device>,
}

impl DeviceBuffer {
    pub fn new(device: Arc<dyn Device>, bytes: Vec<u8>) -> Result<Self, DeviceError> {
        let id = device.alloc(bytes)?;
        Ok(Self { id, device })
    }

    /// Takes ownership of a buffer the device already allocated (a launch
    /// result).
    pub fn adopt(device: Arc<dyn Device>, id: u64) -> Self {
        Self { id, device }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn read(&self) -> Result<Vec<u8>, DeviceError> {
        self.device.read(self.id)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.device.free(self.id);
    }
}

/// Run-time binding from target ids to devices.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: FxHashMap<TargetId, Arc<dyn Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, target: TargetId, device: Arc<dyn Device>) {
        self.devices.insert(target, device);
    }

    pub fn get(&self, target: TargetId) -> Option<Arc<dyn Device>> {
        self.devices.get(&target).cloned()
    }
}
