//! Display implementations and text dump for debugging.

use std::fmt;
use std::fmt::Write;

use crate::arena::Handle;
use crate::expr::{BinaryOp, Expression};
use crate::module::Module;
use crate::stmt::{AttrKey, AttrNode, Statement};
use crate::types::{DataType, DeviceApi, ForKind, ScalarKind};

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ScalarKind::Int => "int",
            ScalarKind::UInt => "uint",
            ScalarKind::Float => "float",
            ScalarKind::Handle => "handle",
        };
        write!(f, "{}{}", kind, self.bits)?;
        if self.lanes > 1 {
            write!(f, "x{}", self.lanes)?;
        }
        Ok(())
    }
}

impl fmt::Display for ForKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Serial => "serial",
            Self::Parallel => "parallel",
            Self::Vectorized => "vectorized",
            Self::Unrolled => "unrolled",
        })
    }
}

impl fmt::Display for DeviceApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Host => "host",
        })
    }
}

impl fmt::Display for AttrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VirtualThread => f.write_str("virtual_thread"),
            Self::CoprocScope => f.write_str("coproc_scope"),
            Self::CoprocUopScope => f.write_str("coproc_uop_scope"),
            Self::BufferBound => f.write_str("buffer_bound"),
            Self::Other(key) => f.write_str(key),
        }
    }
}

/// Renders a statement tree as indented text.
pub fn dump_stmt(m: &Module, stmt: Handle<Statement>) -> String {
    let mut out = String::new();
    write_stmt(m, stmt, 0, &mut out);
    out
}

fn pad(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn write_stmt(m: &Module, s: Handle<Statement>, depth: usize, out: &mut String) {
    // Blocks flatten into their sequence; everything else gets a line.
    if let Statement::Block { first, rest } = &m.stmts[s] {
        let (first, rest) = (*first, *rest);
        write_stmt(m, first, depth, out);
        write_stmt(m, rest, depth, out);
        return;
    }
    pad(out, depth);
    match &m.stmts[s] {
        Statement::Let { var, value, body } => {
            let _ = writeln!(out, "let {} = {}", m.vars[*var].name, fmt_expr(m, *value));
            write_stmt(m, *body, depth, out);
        }
        Statement::Attr {
            node,
            key,
            value,
            body,
        } => {
            let target = match node {
                AttrNode::None => "_".to_string(),
                AttrNode::Var(v) => m.vars[*v].name.clone(),
                AttrNode::IterVar(iv) => {
                    format!("{}:{}", m.vars[iv.var].name, iv.thread_tag)
                }
            };
            let _ = writeln!(out, "// attr [{target}] {key} = {}", fmt_expr(m, *value));
            write_stmt(m, *body, depth, out);
        }
        Statement::Store {
            buffer,
            value,
            index,
            predicate,
        } => {
            let _ = write!(
                out,
                "{}[{}] = {}",
                m.vars[*buffer].name,
                fmt_expr(m, *index),
                fmt_expr(m, *value)
            );
            if !is_const_true(m, *predicate) {
                let _ = write!(out, " if {}", fmt_expr(m, *predicate));
            }
            out.push('\n');
        }
        Statement::For {
            loop_var,
            min,
            extent,
            kind,
            body,
            ..
        } => {
            let _ = writeln!(
                out,
                "for ({}, {}, {}) {kind} {{",
                m.vars[*loop_var].name,
                fmt_expr(m, *min),
                fmt_expr(m, *extent)
            );
            write_stmt(m, *body, depth + 1, out);
            pad(out, depth);
            out.push_str("}\n");
        }
        Statement::Allocate {
            buffer,
            dtype,
            extents,
            body,
            ..
        } => {
            let dims: Vec<String> = extents.iter().map(|&e| fmt_expr(m, e)).collect();
            let _ = writeln!(
                out,
                "allocate {}[{dtype} * {}] {{",
                m.vars[*buffer].name,
                dims.join(" * ")
            );
            write_stmt(m, *body, depth + 1, out);
            pad(out, depth);
            out.push_str("}\n");
        }
        Statement::IfThenElse {
            condition,
            then_case,
            else_case,
        } => {
            let _ = writeln!(out, "if {} {{", fmt_expr(m, *condition));
            write_stmt(m, *then_case, depth + 1, out);
            if let Some(else_case) = else_case {
                pad(out, depth);
                out.push_str("} else {\n");
                write_stmt(m, *else_case, depth + 1, out);
            }
            pad(out, depth);
            out.push_str("}\n");
        }
        Statement::Block { .. } => unreachable!("blocks are flattened above"),
        Statement::Evaluate { value } => {
            let _ = writeln!(out, "eval {}", fmt_expr(m, *value));
        }
        Statement::Assert {
            condition,
            message,
            body,
        } => {
            let _ = writeln!(
                out,
                "assert({}, {})",
                fmt_expr(m, *condition),
                fmt_expr(m, *message)
            );
            write_stmt(m, *body, depth, out);
        }
        Statement::Provide {
            buffer,
            value,
            args,
        } => {
            let dims: Vec<String> = args.iter().map(|&a| fmt_expr(m, a)).collect();
            let _ = writeln!(
                out,
                "provide {}({}) = {}",
                m.vars[*buffer].name,
                dims.join(", "),
                fmt_expr(m, *value)
            );
        }
    }
}

fn is_const_true(m: &Module, e: Handle<Expression>) -> bool {
    m.const_int(e) == Some(1)
}

fn fmt_expr(m: &Module, e: Handle<Expression>) -> String {
    match &m.exprs[e] {
        Expression::Var(v) => m.vars[*v].name.clone(),
        Expression::IntImm { value, .. } => value.to_string(),
        Expression::FloatImm { value, .. } => format!("{value}f"),
        Expression::StringImm(s) => format!("{s:?}"),
        Expression::Cast { dtype, value } => format!("{dtype}({})", fmt_expr(m, *value)),
        Expression::Binary { op, lhs, rhs } => {
            let sym = match op {
                BinaryOp::Add => "+",
                BinaryOp::Mul => "*",
                BinaryOp::Div => "/",
                BinaryOp::Ge => ">=",
                BinaryOp::Lt => "<",
                BinaryOp::And => "&&",
            };
            format!("({} {sym} {})", fmt_expr(m, *lhs), fmt_expr(m, *rhs))
        }
        Expression::Ramp {
            base,
            stride,
            lanes,
        } => format!(
            "ramp({}, {}, {lanes})",
            fmt_expr(m, *base),
            fmt_expr(m, *stride)
        ),
        Expression::Load { buffer, index, .. } => {
            format!("{}[{}]", m.vars[*buffer].name, fmt_expr(m, *index))
        }
        Expression::Call { name, args, .. } => {
            let args: Vec<String> = args.iter().map(|&a| fmt_expr(m, a)).collect();
            format!("{name}({})", args.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::CallType;
    use crate::types::{DataType, DeviceApi, ForKind};

    #[test]
    fn dump_store_in_loop() {
        let mut m = Module::new();
        let a = m.var("A", DataType::handle());
        let i = m.var("i", DataType::int32());
        let iv = m.var_expr(i);
        let v = m.int(DataType::int32(), 42);
        let p = m.const_true(1);
        let store = m.store(a, v, iv, p);
        let zero = m.zero(DataType::int32());
        let n = m.int(DataType::int32(), 8);
        let loop_ = m.for_loop(i, zero, n, ForKind::Serial, DeviceApi::None, store);

        let text = dump_stmt(&m, loop_);
        assert_eq!(text, "for (i, 0, 8) serial {\n  A[i] = 42\n}\n");
    }

    #[test]
    fn dump_flattens_blocks() {
        let mut m = Module::new();
        let a = m.var("A", DataType::handle());
        let p = m.const_true(1);
        let i0 = m.int(DataType::int32(), 0);
        let i1 = m.int(DataType::int32(), 1);
        let v = m.int(DataType::int32(), 7);
        let s0 = m.store(a, v, i0, p);
        let s1 = m.store(a, v, i1, p);
        let blk = m.block(s0, s1);

        let text = dump_stmt(&m, blk);
        assert_eq!(text, "A[0] = 7\nA[1] = 7\n");
    }

    #[test]
    fn dump_call_and_cast() {
        let mut m = Module::new();
        let x = m.var("x", DataType::int32());
        let xv = m.var_expr(x);
        let wide = m.cast(DataType::int64(), xv);
        let call = m.call(
            DataType::int32(),
            "min",
            vec![wide, xv],
            CallType::PureIntrinsic,
        );
        let stmt = m.evaluate(call);
        assert_eq!(dump_stmt(&m, stmt), "eval min(int64(x), x)\n");
    }
}
