//! Text rendering of descriptors, for logs and test failure output.

use std::fmt;

use crate::fd::function::{FuncDesc, Ownership};
use crate::fd::node::{Body, Instr};
use crate::fd::op::{Op, TransferOp};

impl fmt::Display for FuncDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn {}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let marker = match p.ownership {
                Ownership::Owned => "",
                Ownership::Borrowed => "&",
                Ownership::BorrowedMut => "&mut ",
            };
            write!(f, "{}: {marker}{}", p.name, p.dtype)?;
        }
        writeln!(f, ") -> {} {{", self.ret)?;
        render_body(f, &self.body, 1)?;
        writeln!(f, "}}")
    }
}

fn render_body(f: &mut fmt::Formatter<'_>, body: &Body, depth: usize) -> fmt::Result {
    for instr in &body.instrs {
        render_instr(f, instr, depth)?;
    }
    indent(f, depth)?;
    writeln!(f, "yield {}", body.result)
}

fn render_instr(f: &mut fmt::Formatter<'_>, instr: &Instr, depth: usize) -> fmt::Result {
    indent(f, depth)?;
    write!(f, "{} = ", instr.id)?;
    match &instr.op {
        Op::Const(c) => write!(f, "const {c}")?,
        Op::Param(i) => write!(f, "param {i}")?,
        Op::Global(name) => write!(f, "global {name}")?,
        Op::Unary(op) => write!(f, "{} {}", format!("{op:?}").to_lowercase(), instr.args[0])?,
        Op::Binary(op) => write!(
            f,
            "{} {}, {}",
            format!("{op:?}").to_lowercase(),
            instr.args[0],
            instr.args[1]
        )?,
        Op::Select => write!(
            f,
            "select {}, {}, {}",
            instr.args[0], instr.args[1], instr.args[2]
        )?,
        Op::Pack => {
            write!(f, "pack")?;
            write_args(f, &instr.args)?;
        }
        Op::Proj(k) => write!(f, "proj.{k} {}", instr.args[0])?,
        Op::Splat(n) => write!(f, "splat.{n} {}", instr.args[0])?,
        Op::ExtractLane(k) => write!(f, "lane.{k} {}", instr.args[0])?,
        Op::BuildVector => {
            write!(f, "vector")?;
            write_args(f, &instr.args)?;
        }
        Op::Call(name) => {
            write!(f, "call {name}")?;
            write_args(f, &instr.args)?;
        }
        Op::Opaque(decl) => {
            write!(f, "opaque {}", decl.symbol)?;
            write_args(f, &instr.args)?;
        }
        Op::Carried => write!(f, "carried")?,
        Op::Index => write!(f, "index")?,
        Op::AccumParam(i) => write!(f, "accum param {i}, {}", instr.args[0])?,
        Op::Transfer(t) => match t {
            TransferOp::ToDevice { target, param } => {
                write!(f, "to_device {target} param {param}")?
            }
            TransferOp::Launch { target, symbol } => {
                write!(f, "launch {target} {symbol}")?;
                write_args(f, &instr.args)?;
            }
            TransferOp::ToHost { target } => write!(f, "to_host {target} {}", instr.args[0])?,
        },
        Op::For { count, body } => {
            writeln!(f, "for {count} ({}) {{", instr.args[0])?;
            render_body(f, body, depth + 1)?;
            indent(f, depth)?;
            write!(f, "}}")?;
        }
        Op::While { cond, body } => {
            writeln!(f, "while ({}) {{", instr.args[0])?;
            indent(f, depth)?;
            writeln!(f, "cond {{")?;
            render_body(f, cond, depth + 1)?;
            indent(f, depth)?;
            writeln!(f, "}} do {{")?;
            render_body(f, body, depth + 1)?;
            indent(f, depth)?;
            write!(f, "}}")?;
        }
    }
    writeln!(f, " : {}", instr.dtype)
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[crate::fd::node::ValueId]) -> fmt::Result {
    write!(f, "(")?;
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{arg}")?;
    }
    write!(f, ")")
}

fn indent(f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    write!(f, "{}", "    ".repeat(depth))
}

#[cfg(test)]
mod tests {
    use crate::fd::builder::build_fd;
    use crate::fd::dtype::DType;
    use crate::fd::function::Param;
    use crate::source::{lit, param, SourceExpr, SourceFunction};

    #[test]
    fn test_render_shows_signature_and_loops() {
        let fd = build_fd(&SourceFunction::new(
            "powish",
            vec![Param::borrowed_mut("x", DType::F64)],
            DType::F64,
            SourceExpr::For {
                count: 3,
                init: Box::new(lit(1.0)),
                body: Box::new(SourceExpr::Carried * param("x")),
            },
        ))
        .unwrap();
        let text = fd.to_string();
        assert!(text.starts_with("fn powish(x: &mut f64) -> f64 {"));
        assert!(text.contains("for 3 (v0) {"));
        assert!(text.contains("carried"));
        assert!(text.contains("yield"));
    }
}
