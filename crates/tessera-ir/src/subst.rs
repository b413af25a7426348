//! Capture-free variable substitution.

use rustc_hash::FxHashMap;

use crate::arena::Handle;
use crate::expr::{Expression, Variable};
use crate::module::Module;
use crate::stmt::{AttrNode, IterVar, Statement};

/// The substitution map: variables to replacement expressions.
pub type VarMap = FxHashMap<Handle<Variable>, Handle<Expression>>;

/// Replaces free occurrences of mapped variables in a statement tree.
///
/// Buffer-variable positions (`Load`, `Store`, `Provide`, `Allocate`,
/// attribute nodes) are only replaced when the mapped expression is
/// itself a variable. Binders are not renamed; the input is assumed to
/// have globally unique definitions, so capture cannot occur. Unchanged
/// subtrees are returned by handle.
pub fn substitute(m: &mut Module, stmt: Handle<Statement>, map: &VarMap) -> Handle<Statement> {
    if map.is_empty() {
        return stmt;
    }
    subst_stmt(m, stmt, map)
}

/// Expression counterpart of [`substitute`].
pub fn substitute_expr(m: &mut Module, expr: Handle<Expression>, map: &VarMap) -> Handle<Expression> {
    if map.is_empty() {
        return expr;
    }
    subst_expr(m, expr, map)
}

/// Remaps a variable in a buffer position: only var-to-var mappings apply.
fn subst_var(m: &Module, var: Handle<Variable>, map: &VarMap) -> Handle<Variable> {
    match map.get(&var) {
        Some(&e) => match m.exprs[e] {
            Expression::Var(w) => w,
            _ => var,
        },
        None => var,
    }
}

fn subst_stmt(m: &mut Module, s: Handle<Statement>, map: &VarMap) -> Handle<Statement> {
    match m.stmts[s].clone() {
        Statement::Let { var, value, body } => {
            let value2 = subst_expr(m, value, map);
            let body2 = subst_stmt(m, body, map);
            if value2 == value && body2 == body {
                s
            } else {
                m.let_stmt(var, value2, body2)
            }
        }
        Statement::Attr {
            node,
            key,
            value,
            body,
        } => {
            let (node2, node_changed) = subst_attr_node(m, &node, map);
            let value2 = subst_expr(m, value, map);
            let body2 = subst_stmt(m, body, map);
            if !node_changed && value2 == value && body2 == body {
                s
            } else {
                m.attr(node2, key, value2, body2)
            }
        }
        Statement::Store {
            buffer,
            value,
            index,
            predicate,
        } => {
            let buffer2 = subst_var(m, buffer, map);
            let value2 = subst_expr(m, value, map);
            let index2 = subst_expr(m, index, map);
            let predicate2 = subst_expr(m, predicate, map);
            if buffer2 == buffer && value2 == value && index2 == index && predicate2 == predicate {
                s
            } else {
                m.store(buffer2, value2, index2, predicate2)
            }
        }
        Statement::For {
            loop_var,
            min,
            extent,
            kind,
            device,
            body,
        } => {
            let min2 = subst_expr(m, min, map);
            let extent2 = subst_expr(m, extent, map);
            let body2 = subst_stmt(m, body, map);
            if min2 == min && extent2 == extent && body2 == body {
                s
            } else {
                m.for_loop(loop_var, min2, extent2, kind, device, body2)
            }
        }
        Statement::Allocate {
            buffer,
            dtype,
            extents,
            condition,
            body,
            new_expr,
            free_fn,
        } => {
            let buffer2 = subst_var(m, buffer, map);
            let mut changed = buffer2 != buffer;
            let mut extents2 = Vec::with_capacity(extents.len());
            for &e in &extents {
                let e2 = subst_expr(m, e, map);
                changed |= e2 != e;
                extents2.push(e2);
            }
            let condition2 = subst_expr(m, condition, map);
            let body2 = subst_stmt(m, body, map);
            let new_expr2 = new_expr.map(|e| subst_expr(m, e, map));
            if !changed && condition2 == condition && body2 == body && new_expr2 == new_expr {
                s
            } else {
                m.allocate(buffer2, dtype, extents2, condition2, body2, new_expr2, free_fn)
            }
        }
        Statement::IfThenElse {
            condition,
            then_case,
            else_case,
        } => {
            let condition2 = subst_expr(m, condition, map);
            let then2 = subst_stmt(m, then_case, map);
            let else2 = else_case.map(|e| subst_stmt(m, e, map));
            if condition2 == condition && then2 == then_case && else2 == else_case {
                s
            } else {
                m.if_then_else(condition2, then2, else2)
            }
        }
        Statement::Block { first, rest } => {
            let first2 = subst_stmt(m, first, map);
            let rest2 = subst_stmt(m, rest, map);
            if first2 == first && rest2 == rest {
                s
            } else {
                m.block(first2, rest2)
            }
        }
        Statement::Evaluate { value } => {
            let value2 = subst_expr(m, value, map);
            if value2 == value {
                s
            } else {
                m.evaluate(value2)
            }
        }
        Statement::Assert {
            condition,
            message,
            body,
        } => {
            let condition2 = subst_expr(m, condition, map);
            let message2 = subst_expr(m, message, map);
            let body2 = subst_stmt(m, body, map);
            if condition2 == condition && message2 == message && body2 == body {
                s
            } else {
                m.assert_stmt(condition2, message2, body2)
            }
        }
        Statement::Provide {
            buffer,
            value,
            args,
        } => {
            let buffer2 = subst_var(m, buffer, map);
            let value2 = subst_expr(m, value, map);
            let mut changed = buffer2 != buffer || value2 != value;
            let mut args2 = Vec::with_capacity(args.len());
            for &a in &args {
                let a2 = subst_expr(m, a, map);
                changed |= a2 != a;
                args2.push(a2);
            }
            if changed {
                m.provide(buffer2, value2, args2)
            } else {
                s
            }
        }
    }
}

fn subst_attr_node(m: &Module, node: &AttrNode, map: &VarMap) -> (AttrNode, bool) {
    match node {
        AttrNode::Var(v) => {
            let v2 = subst_var(m, *v, map);
            if v2 == *v {
                (node.clone(), false)
            } else {
                (AttrNode::Var(v2), true)
            }
        }
        AttrNode::IterVar(iv) => {
            let v2 = subst_var(m, iv.var, map);
            if v2 == iv.var {
                (node.clone(), false)
            } else {
                (
                    AttrNode::IterVar(IterVar {
                        var: v2,
                        thread_tag: iv.thread_tag.clone(),
                    }),
                    true,
                )
            }
        }
        AttrNode::None => (AttrNode::None, false),
    }
}

fn subst_expr(m: &mut Module, e: Handle<Expression>, map: &VarMap) -> Handle<Expression> {
    match m.exprs[e].clone() {
        Expression::Var(v) => map.get(&v).copied().unwrap_or(e),
        Expression::IntImm { .. } | Expression::FloatImm { .. } | Expression::StringImm(_) => e,
        Expression::Cast { dtype, value } => {
            let value2 = subst_expr(m, value, map);
            if value2 == value {
                e
            } else {
                m.cast(dtype, value2)
            }
        }
        Expression::Binary { op, lhs, rhs } => {
            let lhs2 = subst_expr(m, lhs, map);
            let rhs2 = subst_expr(m, rhs, map);
            if lhs2 == lhs && rhs2 == rhs {
                e
            } else {
                m.binary(op, lhs2, rhs2)
            }
        }
        Expression::Ramp {
            base,
            stride,
            lanes,
        } => {
            let base2 = subst_expr(m, base, map);
            let stride2 = subst_expr(m, stride, map);
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
            let buffer2 = subst_var(m, buffer, map);
            let index2 = subst_expr(m, index, map);
            let predicate2 = subst_expr(m, predicate, map);
            if buffer2 == buffer && index2 == index && predicate2 == predicate {
                e
            } else {
                m.load(dtype, buffer2, index2, predicate2)
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
                let a2 = subst_expr(m, a, map);
                changed |= a2 != a;
                args2.push(a2);
            }
            if changed {
                m.call(dtype, name, args2, call_type)
            } else {
                e
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn unmapped_tree_is_identical() {
        let mut m = Module::new();
        let a = m.var("a", DataType::handle());
        let i = m.var("i", DataType::int32());
        let iv = m.var_expr(i);
        let v = m.int(DataType::int32(), 7);
        let p = m.const_true(1);
        let store = m.store(a, v, iv, p);

        let map = VarMap::default();
        assert_eq!(substitute(&mut m, store, &map), store);

        let mut map = VarMap::default();
        let unused = m.var("unused", DataType::int32());
        map.insert(unused, v);
        assert_eq!(substitute(&mut m, store, &map), store);
    }

    #[test]
    fn var_use_replaced_by_constant() {
        let mut m = Module::new();
        let a = m.var("a", DataType::handle());
        let i = m.var("i", DataType::int32());
        let iv = m.var_expr(i);
        let v = m.int(DataType::int32(), 7);
        let p = m.const_true(1);
        let store = m.store(a, v, iv, p);

        let mut map = VarMap::default();
        let three = m.int(DataType::int32(), 3);
        map.insert(i, three);
        let out = substitute(&mut m, store, &map);
        assert_ne!(out, store);
        match m.stmts[out] {
            Statement::Store { index, .. } => assert_eq!(m.const_int(index), Some(3)),
            _ => panic!("expected Store"),
        }
    }

    #[test]
    fn buffer_position_needs_var_target() {
        let mut m = Module::new();
        let a = m.var("a", DataType::handle());
        let b = m.var("b", DataType::handle());
        let idx = m.int(DataType::int32(), 0);
        let val = m.int(DataType::int32(), 1);
        let p = m.const_true(1);
        let store = m.store(a, val, idx, p);

        // Mapping a buffer to a non-variable leaves the buffer alone.
        let mut map = VarMap::default();
        let c = m.int(DataType::int32(), 9);
        map.insert(a, c);
        let out = substitute(&mut m, store, &map);
        match m.stmts[out] {
            Statement::Store { buffer, .. } => assert_eq!(buffer, a),
            _ => panic!("expected Store"),
        }

        // Mapping to a variable renames the buffer.
        let mut map = VarMap::default();
        let bv = m.var_expr(b);
        map.insert(a, bv);
        let out = substitute(&mut m, store, &map);
        match m.stmts[out] {
            Statement::Store { buffer, .. } => assert_eq!(buffer, b),
            _ => panic!("expected Store"),
        }
    }
}
