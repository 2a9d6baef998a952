//! Offload dispatch: copy plans, fan-out, partial failure, buffer lifetime.

mod common;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use prism::module::Module;
use prism::offload::exec;
use prism::offload::plan::CopyPlan;
use prism::prelude::*;
use prism::source::{lit, param};

fn product_module() -> (Module, FuncDesc) {
    let fd = build_fd(&SourceFunction::new(
        "blend",
        vec![
            Param::owned("x", DType::F64),
            Param::owned("y", DType::F64),
        ],
        DType::F64,
        param("x") * param("y") + param("x").sin(),
    ))
    .unwrap();
    let mut module = Module::new();
    module.add(fd.clone()).unwrap();
    (module, fd)
}

fn host(marshal: &MarshalRegistry) -> Arc<HostDevice> {
    Arc::new(HostDevice::new(marshal.clone(), ExternTable::new()))
}

#[test]
fn test_single_target_matches_host_evaluation() {
    common::setup();
    let (module, fd) = product_module();
    let marshal = MarshalRegistry::new();
    let artifact = offload(&module, &fd, &[TargetId(0)], &marshal).unwrap();

    let mut devices = DeviceRegistry::new();
    devices.register(TargetId(0), host(&marshal));

    let mut args = [Value::F64(2.0), Value::F64(3.0)];
    let out = exec::run(&module, &artifact, &devices, &marshal, &mut args).unwrap();

    let externs = ExternTable::new();
    let direct = Evaluator::new(&module, &externs)
        .call_fd(&fd, &mut [Value::F64(2.0), Value::F64(3.0)])
        .unwrap();
    assert!(common::approx_eq(
        common::as_f64(out.single()),
        common::as_f64(&direct)
    ));
}

#[test]
fn test_fan_out_returns_every_target() {
    common::setup();
    let (module, fd) = product_module();
    let marshal = MarshalRegistry::new();
    let targets = [TargetId(0), TargetId(1), TargetId(2)];
    let artifact = offload(&module, &fd, &targets, &marshal).unwrap();

    let mut devices = DeviceRegistry::new();
    for &t in &targets {
        devices.register(t, host(&marshal));
    }

    let mut args = [Value::F64(1.5), Value::F64(4.0)];
    let out = exec::run(&module, &artifact, &devices, &marshal, &mut args).unwrap();
    assert_eq!(out.per_target.len(), 3);
    let first = common::as_f64(&out.per_target[0].1);
    for (_, value) in &out.per_target {
        assert!(common::approx_eq(common::as_f64(value), first));
    }
}

/// A device whose launches always fail, for exercising the partial-result
/// path. Allocation succeeds so the failure lands mid-flight.
#[derive(Debug, Default)]
struct FaultyDevice {
    next: AtomicI64,
}

impl Device for FaultyDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::DiscreteGpu
    }

    fn load(
        &self,
        _module: &Module,
        fd: &FuncDesc,
        _plan: &CopyPlan,
    ) -> Result<String, prism::offload::target::DeviceError> {
        Ok(fd.name().to_string())
    }

    fn alloc(&self, _bytes: Vec<u8>) -> Result<u64, prism::offload::target::DeviceError> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst) as u64)
    }

    fn read(&self, buffer: u64) -> Result<Vec<u8>, prism::offload::target::DeviceError> {
        Err(prism::offload::target::DeviceError::UnknownBuffer(buffer))
    }

    fn free(&self, _buffer: u64) {}

    fn launch(
        &self,
        _symbol: &str,
        _args: &[u64],
    ) -> Result<u64, prism::offload::target::DeviceError> {
        Err(prism::offload::target::DeviceError::Launch(
            "injected fault".into(),
        ))
    }
}

#[test]
fn test_one_failing_target_surfaces_partial_outcomes() {
    common::setup();
    let (module, fd) = product_module();
    let marshal = MarshalRegistry::new();
    let targets = [TargetId(0), TargetId(1)];
    let artifact = offload(&module, &fd, &targets, &marshal).unwrap();

    let mut devices = DeviceRegistry::new();
    devices.register(TargetId(0), host(&marshal));
    devices.register(TargetId(1), Arc::new(FaultyDevice::default()));

    let mut args = [Value::F64(2.0), Value::F64(3.0)];
    let err = exec::run(&module, &artifact, &devices, &marshal, &mut args).unwrap_err();
    let OffloadRunError::Partial {
        failed,
        total,
        outcomes,
    } = err;
    assert_eq!((failed, total), (1, 2));
    // The healthy target's result is still delivered for the caller to use.
    assert!(outcomes
        .iter()
        .any(|o| o.target == TargetId(0) && o.result.is_ok()));
    assert!(outcomes
        .iter()
        .any(|o| o.target == TargetId(1) && o.result.is_err()));
}

/// Wraps the host device and keeps a live-allocation balance, counting the
/// launch's internally allocated result buffer as well.
#[derive(Debug)]
struct CountingDevice {
    inner: HostDevice,
    live: AtomicI64,
}

impl CountingDevice {
    fn new(marshal: MarshalRegistry) -> Self {
        Self {
            inner: HostDevice::new(marshal, ExternTable::new()),
            live: AtomicI64::new(0),
        }
    }
}

impl Device for CountingDevice {
    fn kind(&self) -> DeviceKind {
        self.inner.kind()
    }

    fn load(
        &self,
        module: &Module,
        fd: &FuncDesc,
        plan: &CopyPlan,
    ) -> Result<String, prism::offload::target::DeviceError> {
        self.inner.load(module, fd, plan)
    }

    fn alloc(&self, bytes: Vec<u8>) -> Result<u64, prism::offload::target::DeviceError> {
        let id = self.inner.alloc(bytes)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    fn read(&self, buffer: u64) -> Result<Vec<u8>, prism::offload::target::DeviceError> {
        self.inner.read(buffer)
    }

    fn free(&self, buffer: u64) {
        self.inner.free(buffer);
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn launch(
        &self,
        symbol: &str,
        args: &[u64],
    ) -> Result<u64, prism::offload::target::DeviceError> {
        let id = self.inner.launch(symbol, args)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }
}

#[test]
fn test_no_allocation_outlives_the_call() {
    common::setup();
    let (module, fd) = product_module();
    let marshal = MarshalRegistry::new();
    let artifact = offload(&module, &fd, &[TargetId(7)], &marshal).unwrap();

    let counting = Arc::new(CountingDevice::new(marshal.clone()));
    let mut devices = DeviceRegistry::new();
    devices.register(TargetId(7), counting.clone());

    let mut args = [Value::F64(2.0), Value::F64(3.0)];
    exec::run(&module, &artifact, &devices, &marshal, &mut args).unwrap();
    assert_eq!(counting.live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_mutable_borrow_travels_back() {
    common::setup();

    // bump(x, acc): acc += x * 2
    use prism::fd::{BinaryOp, Const, FdBuilder, Op};
    let mut b = FdBuilder::new();
    let x = b.push(Op::Param(0), vec![], DType::F64);
    let two = b.push(Op::Const(Const::F64(2.0)), vec![], DType::F64);
    let d = b.push(Op::Binary(BinaryOp::Mul), vec![x, two], DType::F64);
    let unit = b.push(Op::AccumParam(1), vec![d], DType::unit());
    let body = b.finish(unit);
    let fd = FuncDesc::new(
        "bump",
        vec![
            Param::owned("x", DType::F64),
            Param::borrowed_mut("acc", DType::F64),
        ],
        DType::unit(),
        body,
    );
    let mut module = Module::new();
    module.add(fd.clone()).unwrap();

    let marshal = MarshalRegistry::new();
    let artifact = offload(&module, &fd, &[TargetId(0)], &marshal).unwrap();
    assert_eq!(artifact.plan.to_host, vec![false, true]);

    let mut devices = DeviceRegistry::new();
    devices.register(TargetId(0), host(&marshal));

    let mut args = [Value::F64(5.0), Value::F64(1.0)];
    exec::run(&module, &artifact, &devices, &marshal, &mut args).unwrap();
    assert!(common::approx_eq(common::as_f64(&args[1]), 11.0));
}

#[test]
fn test_fan_out_with_mutable_borrow_is_refused() {
    common::setup();

    use prism::fd::{FdBuilder, Op};
    let mut b = FdBuilder::new();
    let x = b.push(Op::Param(0), vec![], DType::F64);
    let unit = b.push(Op::AccumParam(0), vec![x], DType::unit());
    let body = b.finish(unit);
    let fd = FuncDesc::new(
        "selfbump",
        vec![Param::borrowed_mut("x", DType::F64)],
        DType::unit(),
        body,
    );
    let module = Module::new();

    let err = offload(
        &module,
        &fd,
        &[TargetId(0), TargetId(1)],
        &MarshalRegistry::new(),
    )
    .unwrap_err();
    assert!(matches!(err, TransformError::UnsupportedOnDevice { .. }));
}

#[test]
fn test_host_only_opaque_is_refused() {
    common::setup();
    let decl = OpaqueDecl::new("read_sensor", vec![], DType::F64);
    let fd = build_fd(&SourceFunction::new(
        "sample",
        vec![],
        DType::F64,
        SourceExpr::Opaque {
            decl,
            args: vec![],
        } * lit(2.0),
    ))
    .unwrap();
    let module = Module::new();
    let err = offload(&module, &fd, &[TargetId(0)], &MarshalRegistry::new()).unwrap_err();
    assert!(matches!(err, TransformError::UnsupportedOnDevice { .. }));
}

#[test]
fn test_foreign_type_without_marshalling_is_refused() {
    common::setup();
    let decl = OpaqueDecl::new("mesh_volume", vec![DType::Named("mesh".into())], DType::F64)
        .device_lowerable();
    let fd = build_fd(&SourceFunction::new(
        "volume",
        vec![Param::borrowed("m", DType::Named("mesh".into()))],
        DType::F64,
        SourceExpr::Opaque {
            decl,
            args: vec![param("m")],
        },
    ))
    .unwrap();
    let module = Module::new();
    let err = offload(&module, &fd, &[TargetId(0)], &MarshalRegistry::new()).unwrap_err();
    assert!(matches!(err, TransformError::MissingMarshalling { .. }));
}

#[test]
fn test_unknown_target_is_a_runtime_outcome() {
    common::setup();
    let (module, fd) = product_module();
    let marshal = MarshalRegistry::new();
    let artifact = offload(&module, &fd, &[TargetId(9)], &marshal).unwrap();

    let devices = DeviceRegistry::new();
    let mut args = [Value::F64(1.0), Value::F64(1.0)];
    let err = exec::run(&module, &artifact, &devices, &marshal, &mut args).unwrap_err();
    let OffloadRunError::Partial { failed, total, .. } = err;
    assert_eq!((failed, total), (1, 1));
}
