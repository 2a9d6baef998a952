//! Run-time execution of host stubs: the one concurrency point.
//!
//! Fan-out dispatch runs one worker per target on scoped threads and joins
//! on all of them before returning; a single failing target never cancels
//! the others, and results already copied back stay copied back. The caller
//! receives either every result or the partial outcome report — retrying is
//! transport policy and out of scope here.
//!
//! Numeric contract: a device may reorder float-associative operations
//! relative to the host, so per-target results agree with host execution to
//! a relative tolerance of about 1e-9 for f64 work, not bit-for-bit. That
//! tolerance is documented, not enforced.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::eval::Value;
use crate::module::Module;
use crate::offload::marshal::MarshalRegistry;
use crate::offload::target::{DeviceBuffer, DeviceError, DeviceRegistry, TargetId};
use crate::offload::OffloadArtifact;

/// What one target produced, successful or not, and how long it took.
#[derive(Debug)]
pub struct TargetOutcome {
    pub target: TargetId,
    pub elapsed: Duration,
    pub result: Result<Value, DeviceError>,
}

#[derive(thiserror::Error, Debug)]
pub enum OffloadRunError {
    /// At least one target failed. Successful targets' results are in the
    /// outcomes; nothing is rolled back and nothing is retried.
    #[error("offload fan-out completed partially: {failed} of {total} targets failed")]
    Partial {
        failed: usize,
        total: usize,
        outcomes: Vec<TargetOutcome>,
    },
}

/// Results per target, in the artifact's target order.
#[derive(Debug)]
pub struct OffloadOutput {
    pub per_target: Vec<(TargetId, Value)>,
}

impl OffloadOutput {
    /// The sole result of a single-target dispatch.
    pub fn single(&self) -> &Value {
        assert_eq!(self.per_target.len(), 1, "fan-out output has several results");
        &self.per_target[0].1
    }
}

/// Executes the artifact's stub: copies per the plan, launches every target
/// concurrently, joins, applies borrowed-mut writebacks on full success.
pub fn run(
    module: &Module,
    artifact: &OffloadArtifact,
    devices: &DeviceRegistry,
    marshal: &MarshalRegistry,
    args: &mut [Value],
) -> Result<OffloadOutput, OffloadRunError> {
    assert_eq!(
        args.len(),
        artifact.device_fd.params().len(),
        "argument count does not match the offloaded signature"
    );

    let shared: &[Value] = args;
    let mut raw: Vec<(TargetOutcome, Vec<(usize, Value)>)> =
        thread::scope(|scope| {
            let workers: Vec<_> = artifact
                .targets
                .iter()
                .map(|&target| {
                    scope.spawn(move || {
                        let started = Instant::now();
                        let (result, writebacks) =
                            match run_target(module, artifact, devices, marshal, target, shared) {
                                Ok((value, writebacks)) => (Ok(value), writebacks),
                                Err(err) => (Err(err), Vec::new()),
                            };
                        (
                            TargetOutcome {
                                target,
                                elapsed: started.elapsed(),
                                result,
                            },
                            writebacks,
                        )
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().expect("fan-out worker panicked"))
                .collect()
        });

    let failed = raw.iter().filter(|(o, _)| o.result.is_err()).count();
    if failed > 0 {
        warn!(
            "fan-out of '{}': {failed}/{} targets failed",
            artifact.host_stub.name(),
            raw.len()
        );
        return Err(OffloadRunError::Partial {
            failed,
            total: raw.len(),
            outcomes: raw.into_iter().map(|(o, _)| o).collect(),
        });
    }

    let mut per_target = Vec::with_capacity(raw.len());
    for (outcome, writebacks) in raw.drain(..) {
        debug!(
            "target {} completed in {:?}",
            outcome.target, outcome.elapsed
        );
        for (param, value) in writebacks {
            args[param] = value;
        }
        let value = outcome.result.expect("failure count was zero");
        per_target.push((outcome.target, value));
    }
    Ok(OffloadOutput { per_target })
}

/// One target's round trip. Buffers are RAII handles, so any early return
/// frees everything this invocation allocated on the device.
fn run_target(
    module: &Module,
    artifact: &OffloadArtifact,
    devices: &DeviceRegistry,
    marshal: &MarshalRegistry,
    target: TargetId,
    args: &[Value],
) -> Result<(Value, Vec<(usize, Value)>), DeviceError> {
    let device = devices
        .get(target)
        .ok_or(DeviceError::UnknownTarget(target))?;

    let symbol = device.load(module, &artifact.device_fd, &artifact.plan)?;

    let mut buffers: Vec<(usize, DeviceBuffer)> = Vec::new();
    for i in artifact.plan.copied_params() {
        let param = &artifact.device_fd.params()[i];
        let ops = marshal
            .resolve(&param.dtype, &param.name)
            .map_err(|e| DeviceError::Marshal(e.to_string()))?;
        let bytes = (ops.to_device)(&args[i])?;
        buffers.push((i, DeviceBuffer::new(device.clone(), bytes)?));
    }

    let ids: Vec<u64> = buffers.iter().map(|(_, b)| b.id()).collect();
    let result_buffer = DeviceBuffer::adopt(device.clone(), device.launch(&symbol, &ids)?);

    let ret_ops = marshal
        .resolve(artifact.device_fd.ret(), "result")
        .map_err(|e| DeviceError::Marshal(e.to_string()))?;
    let result = (ret_ops.to_host)(&result_buffer.read()?)?;

    let mut writebacks = Vec::new();
    for (i, buffer) in &buffers {
        if artifact.plan.to_host[*i] {
            let param = &artifact.device_fd.params()[*i];
            let ops = marshal
                .resolve(&param.dtype, &param.name)
                .map_err(|e| DeviceError::Marshal(e.to_string()))?;
            writebacks.push((*i, (ops.to_host)(&buffer.read()?)?));
        }
    }

    Ok((result, writebacks))
}
