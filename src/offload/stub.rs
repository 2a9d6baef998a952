//! Construction of the device-resident variant and the host-side stub.

use crate::fd::builder::FdBuilder;
use crate::fd::dtype::DType;
use crate::fd::function::FuncDesc;
use crate::fd::op::{Op, TransferOp};
use crate::offload::plan::CopyPlan;
use crate::offload::target::TargetId;

/// The device-resident variant: same semantics, renamed so lowering keys it
/// separately from the host original.
pub(crate) fn device_variant(fd: &FuncDesc) -> FuncDesc {
    FuncDesc::new(
        format!("{}__device", fd.name()),
        fd.params().to_vec(),
        fd.ret().clone(),
        fd.body().clone(),
    )
}

/// The host stub: per target, copy the planned parameters over, launch, copy
/// the result back. With several targets the stub fans out and its result is
/// the record of per-target results, in target order.
pub(crate) fn host_stub(
    fd: &FuncDesc,
    device_name: &str,
    targets: &[TargetId],
    plan: &CopyPlan,
) -> FuncDesc {
    let mut b = FdBuilder::new();
    let mut per_target = Vec::with_capacity(targets.len());

    for &target in targets {
        let mut handles = Vec::new();
        for i in plan.copied_params() {
            let param = b.push(Op::Param(i), vec![], fd.params()[i].dtype.clone());
            let handle = b.push(
                Op::Transfer(TransferOp::ToDevice { target, param: i }),
                vec![param],
                fd.params()[i].dtype.clone(),
            );
            handles.push(handle);
        }
        let launched = b.push(
            Op::Transfer(TransferOp::Launch {
                target,
                symbol: device_name.to_string(),
            }),
            handles,
            fd.ret().clone(),
        );
        let back = b.push(
            Op::Transfer(TransferOp::ToHost { target }),
            vec![launched],
            fd.ret().clone(),
        );
        per_target.push(back);
    }

    let (result, ret) = if per_target.len() == 1 {
        (per_target[0], fd.ret().clone())
    } else {
        let ret = DType::Record(vec![fd.ret().clone(); per_target.len()]);
        (b.push(Op::Pack, per_target, ret.clone()), ret)
    };

    FuncDesc::new(
        format!("{}__stub", fd.name()),
        fd.params().to_vec(),
        ret,
        b.finish(result),
    )
}
