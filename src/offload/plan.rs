//! Copy-elision planning from ownership and use.

use crate::activity::{analyze_activity, ActivityRequest};
use crate::error::TransformError;
use crate::fd::function::{FuncDesc, Ownership};
use crate::fd::op::Op;

/// Which parameters cross the boundary, per direction.
///
/// A parameter travels host→device only when the device body consumes it;
/// it travels back only when the caller can observe it afterwards — that is,
/// when it is borrowed-mut. Owned and immutably borrowed parameters are
/// copied over once and never return; the result value always returns.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyPlan {
    pub to_device: Vec<bool>,
    pub to_host: Vec<bool>,
}

impl CopyPlan {
    /// Parameter indices that travel to the device, ascending.
    pub fn copied_params(&self) -> impl Iterator<Item = usize> + '_ {
        self.to_device
            .iter()
            .enumerate()
            .filter(|(_, copy)| **copy)
            .map(|(i, _)| i)
    }
}

pub(crate) fn plan_copies(fd: &FuncDesc) -> Result<CopyPlan, TransformError> {
    // Liveness reuses the activity machinery's contributes-to-result set;
    // a parameter only read by dead code does not cross the boundary.
    let analysis = analyze_activity(fd, &ActivityRequest::all_active(fd.params().len()))?;

    let mut used = vec![false; fd.params().len()];
    fd.body().walk(&mut |instr| match instr.op {
        Op::Param(i) if analysis.contributes(instr.id) => used[i] = true,
        // Accumulation reads and rewrites the slot, so the original value
        // must be resident.
        Op::AccumParam(i) => used[i] = true,
        _ => {}
    });

    let to_host = fd
        .params()
        .iter()
        .enumerate()
        .map(|(i, p)| used[i] && p.ownership == Ownership::BorrowedMut)
        .collect();

    Ok(CopyPlan {
        to_device: used,
        to_host,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::builder::build_fd;
    use crate::fd::dtype::DType;
    use crate::fd::function::Param;
    use crate::source::{lit, param, SourceFunction};

    #[test]
    fn test_unused_parameter_is_never_copied() {
        let fd = build_fd(&SourceFunction::new(
            "partial",
            vec![
                Param::owned("x", DType::F64),
                Param::borrowed("unused", DType::F64),
            ],
            DType::F64,
            param("x") * lit(2.0),
        ))
        .unwrap();
        let plan = plan_copies(&fd).unwrap();
        assert_eq!(plan.to_device, vec![true, false]);
        assert_eq!(plan.to_host, vec![false, false]);
    }

    #[test]
    fn test_owned_parameter_never_returns() {
        let fd = build_fd(&SourceFunction::new(
            "consume",
            vec![Param::owned("x", DType::F64)],
            DType::F64,
            param("x") + lit(1.0),
        ))
        .unwrap();
        let plan = plan_copies(&fd).unwrap();
        assert_eq!(plan.to_device, vec![true]);
        assert_eq!(plan.to_host, vec![false]);
    }

    #[test]
    fn test_mutated_borrow_returns() {
        use crate::fd::builder::FdBuilder;

        let mut b = FdBuilder::new();
        let x = b.push(Op::Param(0), vec![], DType::F64);
        let unit = b.push(Op::AccumParam(1), vec![x], DType::unit());
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

        let plan = plan_copies(&fd).unwrap();
        assert_eq!(plan.to_device, vec![true, true]);
        assert_eq!(plan.to_host, vec![false, true]);
    }
}
