//! Unique-definition restoration.
//!
//! Unrolling a virtual-thread body duplicates its binders: two copies of
//! a `Let`, `For`, or `Allocate` now define the same variable. This pass
//! renames every definition after the first to a fresh variable (same
//! name hint) and redirects the uses in its scope, including buffer
//! positions and attribute nodes.

use rustc_hash::{FxHashMap, FxHashSet};

use tessera_ir::{AttrNode, Expression, Handle, IterVar, Module, Statement, Variable};

/// Renames re-defined variables so every binder in `stmt` is unique.
/// A tree that already has unique definitions is returned unchanged.
pub fn convert_ssa(m: &mut Module, stmt: Handle<Statement>) -> Handle<Statement> {
    let mut converter = SsaConverter::default();
    converter.rewrite_stmt(m, stmt)
}

#[derive(Default)]
struct SsaConverter {
    /// Variables whose first definition has been seen.
    defined: FxHashSet<Handle<Variable>>,
    /// Active renames, innermost last.
    scope: FxHashMap<Handle<Variable>, Vec<Handle<Variable>>>,
}

impl SsaConverter {
    /// The in-scope replacement for a variable use.
    fn current(&self, var: Handle<Variable>) -> Handle<Variable> {
        self.scope
            .get(&var)
            .and_then(|stack| stack.last().copied())
            .unwrap_or(var)
    }

    /// Enters a definition site. The first site keeps its variable;
    /// later sites get a fresh one pushed onto the rename stack.
    fn define(&mut self, m: &mut Module, var: Handle<Variable>) -> (Handle<Variable>, bool) {
        if self.defined.insert(var) {
            (var, false)
        } else {
            let fresh = {
                let template = m.vars[var].clone();
                m.vars.append(template)
            };
            self.scope.entry(var).or_default().push(fresh);
            (fresh, true)
        }
    }

    fn undefine(&mut self, var: Handle<Variable>, pushed: bool) {
        if pushed {
            if let Some(stack) = self.scope.get_mut(&var) {
                stack.pop();
            }
        }
    }

    fn rewrite_stmt(&mut self, m: &mut Module, s: Handle<Statement>) -> Handle<Statement> {
        match m.stmts[s].clone() {
            Statement::Let { var, value, body } => {
                let value2 = self.rewrite_expr(m, value);
                let (var2, pushed) = self.define(m, var);
                let body2 = self.rewrite_stmt(m, body);
                self.undefine(var, pushed);
                if var2 == var && value2 == value && body2 == body {
                    s
                } else {
                    m.let_stmt(var2, value2, body2)
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
                let min2 = self.rewrite_expr(m, min);
                let extent2 = self.rewrite_expr(m, extent);
                let (loop_var2, pushed) = self.define(m, loop_var);
                let body2 = self.rewrite_stmt(m, body);
                self.undefine(loop_var, pushed);
                if loop_var2 == loop_var && min2 == min && extent2 == extent && body2 == body {
                    s
                } else {
                    m.for_loop(loop_var2, min2, extent2, kind, device, body2)
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
                let mut changed = false;
                let mut extents2 = Vec::with_capacity(extents.len());
                for &e in &extents {
                    let e2 = self.rewrite_expr(m, e);
                    changed |= e2 != e;
                    extents2.push(e2);
                }
                let condition2 = self.rewrite_expr(m, condition);
                let new_expr2 = new_expr.map(|e| self.rewrite_expr(m, e));
                let (buffer2, pushed) = self.define(m, buffer);
                let body2 = self.rewrite_stmt(m, body);
                self.undefine(buffer, pushed);
                if !changed
                    && buffer2 == buffer
                    && condition2 == condition
                    && new_expr2 == new_expr
                    && body2 == body
                {
                    s
                } else {
                    m.allocate(
                        buffer2, dtype, extents2, condition2, body2, new_expr2, free_fn,
                    )
                }
            }
            Statement::Store {
                buffer,
                value,
                index,
                predicate,
            } => {
                let buffer2 = self.current(buffer);
                let value2 = self.rewrite_expr(m, value);
                let index2 = self.rewrite_expr(m, index);
                let predicate2 = self.rewrite_expr(m, predicate);
                if buffer2 == buffer && value2 == value && index2 == index && predicate2 == predicate
                {
                    s
                } else {
                    m.store(buffer2, value2, index2, predicate2)
                }
            }
            Statement::Attr {
                node,
                key,
                value,
                body,
            } => {
                let (node2, node_changed) = self.rewrite_attr_node(&node);
                let value2 = self.rewrite_expr(m, value);
                let body2 = self.rewrite_stmt(m, body);
                if !node_changed && value2 == value && body2 == body {
                    s
                } else {
                    m.attr(node2, key, value2, body2)
                }
            }
            Statement::IfThenElse {
                condition,
                then_case,
                else_case,
            } => {
                let condition2 = self.rewrite_expr(m, condition);
                let then2 = self.rewrite_stmt(m, then_case);
                let else2 = else_case.map(|e| self.rewrite_stmt(m, e));
                if condition2 == condition && then2 == then_case && else2 == else_case {
                    s
                } else {
                    m.if_then_else(condition2, then2, else2)
                }
            }
            Statement::Block { first, rest } => {
                let first2 = self.rewrite_stmt(m, first);
                let rest2 = self.rewrite_stmt(m, rest);
                if first2 == first && rest2 == rest {
                    s
                } else {
                    m.block(first2, rest2)
                }
            }
            Statement::Evaluate { value } => {
                let value2 = self.rewrite_expr(m, value);
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
                let condition2 = self.rewrite_expr(m, condition);
                let message2 = self.rewrite_expr(m, message);
                let body2 = self.rewrite_stmt(m, body);
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
                let buffer2 = self.current(buffer);
                let value2 = self.rewrite_expr(m, value);
                let mut changed = buffer2 != buffer || value2 != value;
                let mut args2 = Vec::with_capacity(args.len());
                for &a in &args {
                    let a2 = self.rewrite_expr(m, a);
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

    fn rewrite_attr_node(&self, node: &AttrNode) -> (AttrNode, bool) {
        match node {
            AttrNode::Var(v) => {
                let v2 = self.current(*v);
                if v2 == *v {
                    (node.clone(), false)
                } else {
                    (AttrNode::Var(v2), true)
                }
            }
            AttrNode::IterVar(iv) => {
                let v2 = self.current(iv.var);
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

    fn rewrite_expr(&mut self, m: &mut Module, e: Handle<Expression>) -> Handle<Expression> {
        match m.exprs[e].clone() {
            Expression::Var(v) => {
                let v2 = self.current(v);
                if v2 == v {
                    e
                } else {
                    m.var_expr(v2)
                }
            }
            Expression::IntImm { .. } | Expression::FloatImm { .. } | Expression::StringImm(_) => e,
            Expression::Cast { dtype, value } => {
                let value2 = self.rewrite_expr(m, value);
                if value2 == value {
                    e
                } else {
                    m.cast(dtype, value2)
                }
            }
            Expression::Binary { op, lhs, rhs } => {
                let lhs2 = self.rewrite_expr(m, lhs);
                let rhs2 = self.rewrite_expr(m, rhs);
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
                let base2 = self.rewrite_expr(m, base);
                let stride2 = self.rewrite_expr(m, stride);
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
                let buffer2 = self.current(buffer);
                let index2 = self.rewrite_expr(m, index);
                let predicate2 = self.rewrite_expr(m, predicate);
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
                    let a2 = self.rewrite_expr(m, a);
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_ir::{DataType, DeviceApi, ForKind};

    #[test]
    fn unique_definitions_untouched() {
        let mut m = Module::new();
        let a = m.var("A", DataType::handle());
        let i = m.var("i", DataType::int32());
        let iv = m.var_expr(i);
        let v = m.int(DataType::int32(), 1);
        let p = m.const_true(1);
        let store = m.store(a, v, iv, p);
        let zero = m.zero(DataType::int32());
        let n = m.int(DataType::int32(), 4);
        let tree = m.for_loop(i, zero, n, ForKind::Serial, DeviceApi::None, store);

        assert_eq!(convert_ssa(&mut m, tree), tree);
    }

    #[test]
    fn duplicated_let_renamed_apart() {
        let mut m = Module::new();
        let x = m.var("x", DataType::int32());
        let a = m.var("A", DataType::handle());
        let one = m.int(DataType::int32(), 1);
        let two = m.int(DataType::int32(), 2);
        let xv = m.var_expr(x);
        let p = m.const_true(1);
        let zero = m.zero(DataType::int32());

        let store1 = m.store(a, xv, zero, p);
        let store2 = m.store(a, xv, one, p);
        let def1 = m.let_stmt(x, one, store1);
        let def2 = m.let_stmt(x, two, store2);
        let tree = m.block(def1, def2);

        let out = convert_ssa(&mut m, tree);
        assert_ne!(out, tree);

        let Statement::Block { first, rest } = m.stmts[out].clone() else {
            panic!("expected Block");
        };
        let Statement::Let { var: v1, body: b1, .. } = m.stmts[first].clone() else {
            panic!("expected Let");
        };
        let Statement::Let { var: v2, body: b2, .. } = m.stmts[rest].clone() else {
            panic!("expected Let");
        };
        assert_eq!(v1, x, "first definition keeps its variable");
        assert_ne!(v2, x, "second definition is renamed");
        assert_eq!(m.vars[v2].name, "x", "name hint survives");

        // Uses follow their binder.
        let Statement::Store { value: u1, .. } = m.stmts[b1] else {
            panic!("expected Store");
        };
        let Statement::Store { value: u2, .. } = m.stmts[b2] else {
            panic!("expected Store");
        };
        assert!(matches!(m.exprs[u1], Expression::Var(v) if v == x));
        assert!(matches!(m.exprs[u2], Expression::Var(v) if v == v2));
    }

    #[test]
    fn duplicated_allocation_renames_buffer_uses() {
        let mut m = Module::new();
        let b = m.var("B", DataType::handle());
        let four = m.int(DataType::int32(), 4);
        let t = m.const_true(1);
        let zero = m.zero(DataType::int32());
        let one = m.int(DataType::int32(), 1);

        let store1 = m.store(b, one, zero, t);
        let alloc1 = m.allocate(b, DataType::int32(), vec![four], t, store1, None, None);
        let store2 = m.store(b, one, zero, t);
        let alloc2 = m.allocate(b, DataType::int32(), vec![four], t, store2, None, None);
        let tree = m.block(alloc1, alloc2);

        let out = convert_ssa(&mut m, tree);
        let Statement::Block { first, rest } = m.stmts[out].clone() else {
            panic!("expected Block");
        };
        let Statement::Allocate { buffer: b1, .. } = m.stmts[first].clone() else {
            panic!("expected Allocate");
        };
        let Statement::Allocate {
            buffer: b2,
            body: body2,
            ..
        } = m.stmts[rest].clone()
        else {
            panic!("expected Allocate");
        };
        assert_eq!(b1, b);
        assert_ne!(b2, b);
        let Statement::Store { buffer: sb, .. } = m.stmts[body2] else {
            panic!("expected Store");
        };
        assert_eq!(sb, b2, "store inside second copy targets the fresh buffer");
    }
}
