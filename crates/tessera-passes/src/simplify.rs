//! Best-effort algebraic simplification.
//!
//! Folds integer-immediate arithmetic bottom-up and applies the unit and
//! absorber identities. Anything it cannot improve is returned unchanged,
//! handle included, so callers can detect a no-op with an equality check.

use tessera_ir::{BinaryOp, DataType, Expression, Handle, Module};

/// Simplifies an expression tree.
pub fn simplify(m: &mut Module, e: Handle<Expression>) -> Handle<Expression> {
    match m.exprs[e].clone() {
        Expression::Binary { op, lhs, rhs } => {
            let lhs2 = simplify(m, lhs);
            let rhs2 = simplify(m, rhs);
            if let Some(folded) = fold_binary(m, op, lhs2, rhs2) {
                return folded;
            }
            if lhs2 == lhs && rhs2 == rhs {
                e
            } else {
                m.binary(op, lhs2, rhs2)
            }
        }
        Expression::Cast { dtype, value } => {
            let value2 = simplify(m, value);
            if m.expr_dtype(value2) == dtype {
                return value2;
            }
            if dtype.is_int() && dtype.is_scalar() {
                if let Some(v) = m.const_int(value2) {
                    return m.int(dtype, v);
                }
            }
            if value2 == value {
                e
            } else {
                m.cast(dtype, value2)
            }
        }
        Expression::Ramp {
            base,
            stride,
            lanes,
        } => {
            let base2 = simplify(m, base);
            let stride2 = simplify(m, stride);
            if base2 == base && stride2 == stride {
                e
            } else {
                m.ramp(base2, stride2, lanes)
            }
        }
        Expression::Load {
            dtype,
            buffer,
            index,
            predicate,
        } => {
            let index2 = simplify(m, index);
            let predicate2 = simplify(m, predicate);
            if index2 == index && predicate2 == predicate {
                e
            } else {
                m.load(dtype, buffer, index2, predicate2)
            }
        }
        Expression::Call {
            dtype,
            name,
            args,
            call_type,
        } => {
            let mut changed = false;
            let mut args2 = Vec::with_capacity(args.len());
            for &a in &args {
                let a2 = simplify(m, a);
                changed |= a2 != a;
                args2.push(a2);
            }
            if changed {
                m.call(dtype, name, args2, call_type)
            } else {
                e
            }
        }
        Expression::Var(_)
        | Expression::IntImm { .. }
        | Expression::FloatImm { .. }
        | Expression::StringImm(_) => e,
    }
}

fn fold_binary(
    m: &mut Module,
    op: BinaryOp,
    lhs: Handle<Expression>,
    rhs: Handle<Expression>,
) -> Option<Handle<Expression>> {
    let lc = m.const_int(lhs);
    let rc = m.const_int(rhs);

    if let (Some(a), Some(b)) = (lc, rc) {
        let dtype = m.expr_dtype(lhs);
        let bool_t = DataType::uint1();
        let (dtype, value) = match op {
            BinaryOp::Add => (dtype, a.wrapping_add(b)),
            BinaryOp::Mul => (dtype, a.wrapping_mul(b)),
            BinaryOp::Div => {
                if b == 0 {
                    return None;
                }
                (dtype, a.wrapping_div(b))
            }
            BinaryOp::Ge => (bool_t, i64::from(a >= b)),
            BinaryOp::Lt => (bool_t, i64::from(a < b)),
            BinaryOp::And => (bool_t, i64::from(a != 0 && b != 0)),
        };
        return Some(m.int(dtype, value));
    }

    match op {
        BinaryOp::Add => {
            if rc == Some(0) {
                return Some(lhs);
            }
            if lc == Some(0) {
                return Some(rhs);
            }
        }
        BinaryOp::Mul => {
            if rc == Some(1) {
                return Some(lhs);
            }
            if lc == Some(1) {
                return Some(rhs);
            }
            // The zero operand already carries the result.
            if rc == Some(0) {
                return Some(rhs);
            }
            if lc == Some(0) {
                return Some(lhs);
            }
        }
        BinaryOp::Div => {
            if rc == Some(1) {
                return Some(lhs);
            }
        }
        BinaryOp::And => {
            if lc == Some(1) {
                return Some(rhs);
            }
            if rc == Some(1) {
                return Some(lhs);
            }
        }
        BinaryOp::Ge | BinaryOp::Lt => {}
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_constants() {
        let mut m = Module::new();
        let a = m.int(DataType::int32(), 6);
        let b = m.int(DataType::int32(), 7);
        let prod = m.mul(a, b);
        let out = simplify(&mut m, prod);
        assert_eq!(m.const_int(out), Some(42));
        assert_eq!(m.expr_dtype(out), DataType::int32());
    }

    #[test]
    fn folds_comparisons_to_bool() {
        let mut m = Module::new();
        let a = m.int(DataType::int32(), 3);
        let b = m.int(DataType::int32(), 5);
        let lt = m.binary(BinaryOp::Lt, a, b);
        let out = simplify(&mut m, lt);
        assert_eq!(m.const_int(out), Some(1));
        assert_eq!(m.expr_dtype(out), DataType::uint1());
    }

    #[test]
    fn unit_identities() {
        let mut m = Module::new();
        let x = m.var("x", DataType::int32());
        let xv = m.var_expr(x);
        let zero = m.zero(DataType::int32());
        let one = m.int(DataType::int32(), 1);

        let add = m.add(xv, zero);
        assert_eq!(simplify(&mut m, add), xv);

        let mul = m.mul(one, xv);
        assert_eq!(simplify(&mut m, mul), xv);

        let div = m.binary(BinaryOp::Div, xv, one);
        assert_eq!(simplify(&mut m, div), xv);

        let absorbed = m.mul(xv, zero);
        assert_eq!(simplify(&mut m, absorbed), zero);
    }

    #[test]
    fn division_by_zero_is_left_alone() {
        let mut m = Module::new();
        let a = m.int(DataType::int32(), 9);
        let zero = m.zero(DataType::int32());
        let div = m.binary(BinaryOp::Div, a, zero);
        assert_eq!(simplify(&mut m, div), div);
    }

    #[test]
    fn collapses_immediate_casts() {
        let mut m = Module::new();
        let a = m.int(DataType::int32(), 128);
        let wide = m.cast(DataType::int64(), a);
        let out = simplify(&mut m, wide);
        assert_eq!(m.const_int(out), Some(128));
        assert_eq!(m.expr_dtype(out), DataType::int64());
    }

    #[test]
    fn drops_noop_casts() {
        let mut m = Module::new();
        let x = m.var("x", DataType::int32());
        let xv = m.var_expr(x);
        let cast = m.cast(DataType::int32(), xv);
        assert_eq!(simplify(&mut m, cast), xv);
    }

    #[test]
    fn irreducible_is_identical() {
        let mut m = Module::new();
        let x = m.var("x", DataType::int32());
        let y = m.var("y", DataType::int32());
        let xv = m.var_expr(x);
        let yv = m.var_expr(y);
        let sum = m.add(xv, yv);
        assert_eq!(simplify(&mut m, sum), sum);
    }

    #[test]
    fn reduces_inside_ramp() {
        let mut m = Module::new();
        let x = m.var("x", DataType::int32());
        let xv = m.var_expr(x);
        let zero = m.zero(DataType::int32());
        let base = m.add(xv, zero);
        let one = m.int(DataType::int32(), 1);
        let ramp = m.ramp(base, one, 4);
        let out = simplify(&mut m, ramp);
        assert_ne!(out, ramp);
        match m.exprs[out] {
            Expression::Ramp { base, .. } => assert_eq!(base, xv),
            _ => panic!("expected Ramp"),
        }
    }
}
