use log::trace;
use rustc_hash::FxHashMap;

use crate::error::TransformError;
use crate::fd::dtype::DType;
use crate::fd::function::FuncDesc;
use crate::fd::node::{Body, Instr, ValueId};
use crate::fd::op::{BinaryOp, Op};
use crate::source::{SourceExpr, SourceFunction};

/// Emits descriptor instructions with dense, descriptor-local ids.
///
/// Ids start at zero for every builder so a transformation's output is
/// reproducible run to run; engines map consumed ids to fresh ones instead
/// of splicing instructions between descriptors.
#[derive(Debug)]
pub struct FdBuilder {
    next: u32,
    frames: Vec<Vec<Instr>>,
    types: FxHashMap<ValueId, DType>,
}

impl FdBuilder {
    pub fn new() -> Self {
        Self {
            next: 0,
            frames: vec![Vec::new()],
            types: FxHashMap::default(),
        }
    }

    pub fn push(&mut self, op: Op, args: Vec<ValueId>, dtype: DType) -> ValueId {
        let id = ValueId(self.next);
        self.next += 1;
        self.types.insert(id, dtype.clone());
        self.frames
            .last_mut()
            .expect("builder has no open frame")
            .push(Instr {
                id,
                op,
                args,
                dtype,
            });
        id
    }

    /// The id the next `push` would allocate; used for error reports about
    /// constructs that never become instructions.
    pub fn next_id(&self) -> ValueId {
        ValueId(self.next)
    }

    pub fn dtype(&self, id: ValueId) -> &DType {
        &self.types[&id]
    }

    /// Opens a nested region frame; instructions pushed until the matching
    /// `end_region` land inside it.
    pub fn begin_region(&mut self) {
        self.frames.push(Vec::new());
    }

    pub fn end_region(&mut self, result: ValueId) -> Body {
        let instrs = self.frames.pop().expect("end_region without begin_region");
        Body { instrs, result }
    }

    pub fn finish(mut self, result: ValueId) -> Body {
        assert_eq!(self.frames.len(), 1, "unclosed region frame");
        let instrs = self.frames.pop().unwrap();
        Body { instrs, result }
    }
}

/// Normalizes a front-end source function into a descriptor.
///
/// Fails with `UnsupportedConstruct` on anything the descriptor cannot
/// model: unstructured transfers, ill-typed operations, loop-carried type
/// mismatches, or references outside any loop region.
pub fn build_fd(source: &SourceFunction) -> Result<FuncDesc, TransformError> {
    trace!("building descriptor for '{}'", source.name);
    let mut lower = Lowerer {
        b: FdBuilder::new(),
        source,
        vars: Vec::new(),
        regions: Vec::new(),
    };
    let result = lower.expr(&source.body)?;
    let got = lower.b.dtype(result).clone();
    if got != source.ret {
        return Err(TransformError::construct(
            result,
            format!("body produces {got}, signature declares {}", source.ret),
        ));
    }
    let body = lower.b.finish(result);
    Ok(FuncDesc::new(
        source.name.clone(),
        source.params.clone(),
        source.ret.clone(),
        body,
    ))
}

struct RegionCtx {
    carried: ValueId,
    index: Option<ValueId>,
}

struct Lowerer<'a> {
    b: FdBuilder,
    source: &'a SourceFunction,
    vars: Vec<(String, ValueId)>,
    regions: Vec<RegionCtx>,
}

impl Lowerer<'_> {
    fn expr(&mut self, expr: &SourceExpr) -> Result<ValueId, TransformError> {
        match expr {
            SourceExpr::Const(c) => Ok(self.b.push(Op::Const(*c), vec![], c.dtype())),

            SourceExpr::Param(name) => {
                let (idx, param) = self
                    .source
                    .params
                    .iter()
                    .enumerate()
                    .find(|(_, p)| &p.name == name)
                    .ok_or_else(|| {
                        TransformError::construct(
                            self.b.next_id(),
                            format!("reference to undeclared parameter '{name}'"),
                        )
                    })?;
                let dtype = param.dtype.clone();
                Ok(self.b.push(Op::Param(idx), vec![], dtype))
            }

            SourceExpr::Global { name, dtype } => Ok(self.b.push(
                Op::Global(name.clone()),
                vec![],
                dtype.clone(),
            )),

            SourceExpr::Unary(op, arg) => {
                let arg = self.expr(arg)?;
                let dtype = self.b.dtype(arg).clone();
                if !dtype.is_float() {
                    return Err(TransformError::construct(
                        arg,
                        format!("unary {op:?} on non-float type {dtype}"),
                    ));
                }
                Ok(self.b.push(Op::Unary(*op), vec![arg], dtype))
            }

            SourceExpr::Binary(op, lhs, rhs) => {
                let lhs = self.expr(lhs)?;
                let rhs = self.expr(rhs)?;
                let lt = self.b.dtype(lhs).clone();
                let rt = self.b.dtype(rhs).clone();
                let dtype = binary_dtype(*op, &lt, &rt).ok_or_else(|| {
                    TransformError::construct(
                        rhs,
                        format!("binary {op:?} on mismatched types {lt} and {rt}"),
                    )
                })?;
                Ok(self.b.push(Op::Binary(*op), vec![lhs, rhs], dtype))
            }

            SourceExpr::Select { cond, then, els } => {
                let cond = self.expr(cond)?;
                let then = self.expr(then)?;
                let els = self.expr(els)?;
                if !matches!(self.b.dtype(cond), DType::Bool | DType::Vector(_, _)) {
                    return Err(TransformError::construct(
                        cond,
                        format!("select condition has type {}", self.b.dtype(cond)),
                    ));
                }
                let tt = self.b.dtype(then).clone();
                if &tt != self.b.dtype(els) {
                    return Err(TransformError::construct(
                        els,
                        format!(
                            "select branches have types {tt} and {}",
                            self.b.dtype(els)
                        ),
                    ));
                }
                Ok(self.b.push(Op::Select, vec![cond, then, els], tt))
            }

            SourceExpr::Pack(items) => {
                let mut args = Vec::with_capacity(items.len());
                let mut fields = Vec::with_capacity(items.len());
                for item in items {
                    let id = self.expr(item)?;
                    fields.push(self.b.dtype(id).clone());
                    args.push(id);
                }
                Ok(self.b.push(Op::Pack, args, DType::Record(fields)))
            }

            SourceExpr::Proj(k, arg) => {
                let arg = self.expr(arg)?;
                let fields = match self.b.dtype(arg) {
                    DType::Record(fields) => fields.clone(),
                    other => {
                        return Err(TransformError::construct(
                            arg,
                            format!("projection from non-record type {other}"),
                        ));
                    }
                };
                let dtype = fields.get(*k).cloned().ok_or_else(|| {
                    TransformError::construct(
                        arg,
                        format!("projection index {k} out of bounds for {} fields", fields.len()),
                    )
                })?;
                Ok(self.b.push(Op::Proj(*k), vec![arg], dtype))
            }

            SourceExpr::Call { name, ret, args } => {
                let mut ids = Vec::with_capacity(args.len());
                for arg in args {
                    ids.push(self.expr(arg)?);
                }
                Ok(self.b.push(Op::Call(name.clone()), ids, ret.clone()))
            }

            SourceExpr::Opaque { decl, args } => {
                if decl.inputs.len() != args.len() || decl.depends.len() != decl.inputs.len() {
                    return Err(TransformError::construct(
                        self.b.next_id(),
                        format!(
                            "opaque '{}' declares {} inputs, {} supplied",
                            decl.symbol,
                            decl.inputs.len(),
                            args.len()
                        ),
                    ));
                }
                let mut ids = Vec::with_capacity(args.len());
                for (arg, want) in args.iter().zip(&decl.inputs) {
                    let id = self.expr(arg)?;
                    let got = self.b.dtype(id);
                    if got != want {
                        return Err(TransformError::construct(
                            id,
                            format!("opaque '{}' expects {want}, got {got}", decl.symbol),
                        ));
                    }
                    ids.push(id);
                }
                let dtype = decl.output.clone();
                Ok(self.b.push(Op::Opaque(decl.clone()), ids, dtype))
            }

            SourceExpr::Let { name, value, body } => {
                let value = self.expr(value)?;
                self.vars.push((name.clone(), value));
                let result = self.expr(body);
                self.vars.pop();
                result
            }

            SourceExpr::Var(name) => self
                .vars
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, id)| *id)
                .ok_or_else(|| {
                    TransformError::construct(
                        self.b.next_id(),
                        format!("reference to unbound variable '{name}'"),
                    )
                }),

            SourceExpr::For { count, init, body } => {
                let init = self.expr(init)?;
                let carried_ty = self.b.dtype(init).clone();
                self.b.begin_region();
                let carried = self.b.push(Op::Carried, vec![], carried_ty.clone());
                let index = self.b.push(Op::Index, vec![], DType::I64);
                self.regions.push(RegionCtx {
                    carried,
                    index: Some(index),
                });
                let result = self.expr(body)?;
                self.regions.pop();
                if self.b.dtype(result) != &carried_ty {
                    return Err(TransformError::construct(
                        result,
                        format!(
                            "loop body yields {}, carried slot is {carried_ty}",
                            self.b.dtype(result)
                        ),
                    ));
                }
                let body = self.b.end_region(result);
                Ok(self.b.push(
                    Op::For {
                        count: *count,
                        body,
                    },
                    vec![init],
                    carried_ty,
                ))
            }

            SourceExpr::While { init, cond, body } => {
                let init = self.expr(init)?;
                let carried_ty = self.b.dtype(init).clone();

                self.b.begin_region();
                let c_carried = self.b.push(Op::Carried, vec![], carried_ty.clone());
                self.regions.push(RegionCtx {
                    carried: c_carried,
                    index: None,
                });
                let cond_result = self.expr(cond)?;
                self.regions.pop();
                if self.b.dtype(cond_result) != &DType::Bool {
                    return Err(TransformError::construct(
                        cond_result,
                        format!("while condition has type {}", self.b.dtype(cond_result)),
                    ));
                }
                let cond = self.b.end_region(cond_result);

                self.b.begin_region();
                let b_carried = self.b.push(Op::Carried, vec![], carried_ty.clone());
                self.regions.push(RegionCtx {
                    carried: b_carried,
                    index: None,
                });
                let result = self.expr(body)?;
                self.regions.pop();
                if self.b.dtype(result) != &carried_ty {
                    return Err(TransformError::construct(
                        result,
                        format!(
                            "loop body yields {}, carried slot is {carried_ty}",
                            self.b.dtype(result)
                        ),
                    ));
                }
                let body = self.b.end_region(result);
                Ok(self.b.push(Op::While { cond, body }, vec![init], carried_ty))
            }

            SourceExpr::Carried => self
                .regions
                .last()
                .map(|r| r.carried)
                .ok_or_else(|| {
                    TransformError::construct(
                        self.b.next_id(),
                        "carried-slot reference outside any loop",
                    )
                }),

            SourceExpr::Index => match self.regions.last() {
                Some(RegionCtx {
                    index: Some(index), ..
                }) => Ok(*index),
                _ => Err(TransformError::construct(
                    self.b.next_id(),
                    "iteration counter outside any counted loop",
                )),
            },

            SourceExpr::Jump(label) => Err(TransformError::construct(
                self.b.next_id(),
                format!("unstructured control transfer to '{label}'"),
            )),
        }
    }
}

fn binary_dtype(op: BinaryOp, lhs: &DType, rhs: &DType) -> Option<DType> {
    if lhs != rhs {
        return None;
    }
    match lhs {
        DType::Vector(elem, n) => {
            let elem = binary_dtype(op, elem, elem)?;
            Some(DType::vector(elem, *n))
        }
        DType::F64 | DType::I64 => match op {
            BinaryOp::CmpLt | BinaryOp::CmpEq => Some(DType::Bool),
            _ => Some(lhs.clone()),
        },
        DType::Bool => match op {
            BinaryOp::CmpEq => Some(DType::Bool),
            _ => None,
        },
        _ => None,
    }
}
