use std::fmt;

use crate::fd::dtype::DType;
use crate::fd::op::Op;

/// Stable identity of one instruction inside a descriptor.
///
/// Ids are allocated densely by the builder that constructed the descriptor
/// and are unique across the whole body, including nested regions. Every
/// auxiliary map an engine produces (activity, shadow bindings, copy plans)
/// is keyed by `ValueId`, and error reports carry the id of the offending
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One operation in a descriptor body.
///
/// Operands are consistently stored in `args` as references to earlier
/// instructions; the operation itself carries no operand values. Region
/// operations (`For`, `While`) own nested bodies whose instructions share the
/// descriptor-wide id space.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub id: ValueId,
    pub op: Op,
    pub args: Vec<ValueId>,
    pub dtype: DType,
}

/// An instruction sequence in definition order, ending in the value the
/// sequence produces. Arguments always refer to instructions defined earlier,
/// so iterating `instrs` front to back is a topological order and iterating
/// it back to front is the exact reverse topological order with
/// definition-order tie-breaks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Body {
    pub instrs: Vec<Instr>,
    pub result: ValueId,
}

impl Body {
    /// Visits every instruction, recursing into nested regions, in pre-order.
    pub fn walk(&self, f: &mut impl FnMut(&Instr)) {
        for instr in &self.instrs {
            f(instr);
            match &instr.op {
                Op::For { body, .. } => body.walk(f),
                Op::While { cond, body } => {
                    cond.walk(f);
                    body.walk(f);
                }
                _ => {}
            }
        }
    }

    /// Looks up an instruction anywhere in the body, including regions.
    pub fn find(&self, id: ValueId) -> Option<&Instr> {
        for instr in &self.instrs {
            if instr.id == id {
                return Some(instr);
            }
            let nested = match &instr.op {
                Op::For { body, .. } => body.find(id),
                Op::While { cond, body } => cond.find(id).or_else(|| body.find(id)),
                _ => None,
            };
            if nested.is_some() {
                return nested;
            }
        }
        None
    }

    /// Number of instructions including those inside nested regions.
    pub fn len_recursive(&self) -> usize {
        let mut n = 0;
        self.walk(&mut |_| n += 1);
        n
    }
}
