//! Out-of-bounds store instrumentation.
//!
//! A pre-pass harvests declared buffer extents from `buffer_bound`
//! attributes; the mutator then wraps every instrumentable store in a
//! conditional that checks each indexed access (the store itself and the
//! loads feeding it) against its buffer's attested size, asserting on
//! failure. Stores that cannot be checked soundly — unknown shape,
//! unrecognized index form, or a lazy select in the value — are emitted
//! unwrapped.

use rustc_hash::FxHashMap;

use tessera_ir::{
    intrinsics, AttrKey, AttrNode, BinaryOp, DataType, Expression, Handle, Module, Statement,
    Variable,
};

use crate::simplify;

/// Diagnostic carried by the emitted assertion.
const ERROR_MESSAGE: &str = "OUT OF THE BOUNDS";

/// Runs the collector, then the instrumenting mutator.
pub fn instrument_bound_checkers(m: &mut Module, stmt: Handle<Statement>) -> Handle<Statement> {
    let mut shapes = FxHashMap::default();
    collect_bounds(m, stmt, &mut shapes);
    log::debug!("bound checker: {} attested buffers", shapes.len());
    let mut checker = BoundChecker {
        mem_to_shape: shapes,
        collector: Vec::new(),
        process_store: false,
        unsafe_rewritten: false,
    };
    checker.rewrite_stmt(m, stmt)
}

/// Harvests `buffer_bound` attributes into a shape table.
fn collect_bounds(
    m: &Module,
    s: Handle<Statement>,
    out: &mut FxHashMap<Handle<Variable>, Handle<Expression>>,
) {
    match &m.stmts[s] {
        Statement::Attr {
            node,
            key,
            value,
            body,
        } => {
            if *key == AttrKey::BufferBound {
                if let AttrNode::Var(buffer) = node {
                    out.insert(*buffer, *value);
                }
            }
            collect_bounds(m, *body, out);
        }
        Statement::Let { body, .. }
        | Statement::For { body, .. }
        | Statement::Allocate { body, .. }
        | Statement::Assert { body, .. } => collect_bounds(m, *body, out),
        Statement::IfThenElse {
            then_case,
            else_case,
            ..
        } => {
            collect_bounds(m, *then_case, out);
            if let Some(e) = else_case {
                collect_bounds(m, *e, out);
            }
        }
        Statement::Block { first, rest } => {
            collect_bounds(m, *first, out);
            collect_bounds(m, *rest, out);
        }
        Statement::Store { .. } | Statement::Evaluate { .. } | Statement::Provide { .. } => {}
    }
}

struct BoundChecker {
    /// Buffer identity to scalarized element count.
    mem_to_shape: FxHashMap<Handle<Variable>, Handle<Expression>>,
    /// `(index, shape)` pairs gathered under the store being processed.
    collector: Vec<(Handle<Expression>, Handle<Expression>)>,
    process_store: bool,
    unsafe_rewritten: bool,
}

impl BoundChecker {
    fn rewrite_stmt(&mut self, m: &mut Module, s: Handle<Statement>) -> Handle<Statement> {
        match m.stmts[s].clone() {
            Statement::Allocate {
                buffer,
                dtype,
                extents,
                condition,
                body,
                new_expr,
                free_fn,
            } => {
                // A redeclaration overrides the attested shape.
                if self.mem_to_shape.contains_key(&buffer) {
                    self.update_shape(m, buffer, &extents, dtype);
                }
                for &e in &extents {
                    self.visit_expr(m, e);
                }
                self.visit_expr(m, condition);
                if let Some(e) = new_expr {
                    self.visit_expr(m, e);
                }
                let body2 = self.rewrite_stmt(m, body);
                if body2 == body {
                    s
                } else {
                    m.allocate(buffer, dtype, extents, condition, body2, new_expr, free_fn)
                }
            }
            Statement::Store {
                buffer,
                value,
                index,
                predicate,
            } => {
                self.collector.clear();
                self.process_store = true;
                self.unsafe_rewritten = false;
                self.visit_expr(m, value);
                self.visit_expr(m, index);
                self.visit_expr(m, predicate);
                self.process_store = false;
                if self.can_instrument(m, index, buffer) {
                    self.collect(index, buffer);
                }
                if let Some(condition) = self.make_condition(m) {
                    // Simplification never yields a string here; kept as
                    // a guard against a degenerate rewrite upstream.
                    if !matches!(m.exprs[condition], Expression::StringImm(_)) {
                        let one = m.int(DataType::int32(), 1);
                        let nop = m.evaluate(one);
                        let message = m.string(ERROR_MESSAGE);
                        let failure = m.assert_stmt(condition, message, nop);
                        return m.if_then_else(condition, s, Some(failure));
                    }
                }
                s
            }
            Statement::Let { var, value, body } => {
                self.visit_expr(m, value);
                let body2 = self.rewrite_stmt(m, body);
                if body2 == body {
                    s
                } else {
                    m.let_stmt(var, value, body2)
                }
            }
            Statement::Attr {
                node,
                key,
                value,
                body,
            } => {
                self.visit_expr(m, value);
                let body2 = self.rewrite_stmt(m, body);
                if body2 == body {
                    s
                } else {
                    m.attr(node, key, value, body2)
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
                self.visit_expr(m, min);
                self.visit_expr(m, extent);
                let body2 = self.rewrite_stmt(m, body);
                if body2 == body {
                    s
                } else {
                    m.for_loop(loop_var, min, extent, kind, device, body2)
                }
            }
            Statement::IfThenElse {
                condition,
                then_case,
                else_case,
            } => {
                self.visit_expr(m, condition);
                let then2 = self.rewrite_stmt(m, then_case);
                let else2 = else_case.map(|e| self.rewrite_stmt(m, e));
                if then2 == then_case && else2 == else_case {
                    s
                } else {
                    m.if_then_else(condition, then2, else2)
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
                self.visit_expr(m, value);
                s
            }
            Statement::Assert {
                condition,
                message,
                body,
            } => {
                self.visit_expr(m, condition);
                self.visit_expr(m, message);
                let body2 = self.rewrite_stmt(m, body);
                if body2 == body {
                    s
                } else {
                    m.assert_stmt(condition, message, body2)
                }
            }
            Statement::Provide {
                value, ref args, ..
            } => {
                self.visit_expr(m, value);
                for &a in args {
                    self.visit_expr(m, a);
                }
                s
            }
        }
    }

    /// Read-only expression walk: gathers instrumentable loads and flags
    /// the lazy-select intrinsic inside store values. This pass never
    /// rewrites expressions.
    fn visit_expr(&mut self, m: &Module, e: Handle<Expression>) {
        match &m.exprs[e] {
            Expression::Load {
                buffer,
                index,
                predicate,
                ..
            } => {
                if self.can_instrument(m, *index, *buffer) {
                    self.collect(*index, *buffer);
                }
                self.visit_expr(m, *index);
                self.visit_expr(m, *predicate);
            }
            Expression::Call { name, args, .. } => {
                if self.process_store && name == intrinsics::IF_THEN_ELSE {
                    self.unsafe_rewritten = true;
                }
                for &a in args {
                    self.visit_expr(m, a);
                }
            }
            Expression::Binary { lhs, rhs, .. } => {
                self.visit_expr(m, *lhs);
                self.visit_expr(m, *rhs);
            }
            Expression::Cast { value, .. } => self.visit_expr(m, *value),
            Expression::Ramp { base, stride, .. } => {
                self.visit_expr(m, *base);
                self.visit_expr(m, *stride);
            }
            Expression::Var(_)
            | Expression::IntImm { .. }
            | Expression::FloatImm { .. }
            | Expression::StringImm(_) => {}
        }
    }

    /// Recomputes a redeclared buffer's shape as the unsigned 64-bit
    /// product of its extents, each scaled by the lane count. Malformed
    /// extents leave the previous shape in place.
    fn update_shape(
        &mut self,
        m: &mut Module,
        buffer: Handle<Variable>,
        extents: &[Handle<Expression>],
        dtype: DataType,
    ) {
        if extents.is_empty() {
            return;
        }
        for &e in extents {
            if !m.expr_dtype(e).is_scalar() || m.is_negative_const(e) {
                return;
            }
        }
        let u64t = DataType::uint64();
        let lanes = i64::from(dtype.lanes);
        let scale = m.int(u64t, lanes);
        let first = m.cast(u64t, extents[0]);
        let mut shape = m.mul(scale, first);
        for &e in &extents[1..] {
            // Unsigned math sidesteps signed overflow on the product.
            let scale = m.int(u64t, lanes);
            let dim = m.cast(u64t, e);
            let term = m.mul(scale, dim);
            shape = m.mul(shape, term);
        }
        self.mem_to_shape.insert(buffer, shape);
    }

    fn index_is_valid(&self, m: &Module, index: Handle<Expression>) -> bool {
        if let Expression::Ramp {
            base,
            stride,
            lanes,
        } = m.exprs[index]
        {
            m.expr_dtype(base).is_scalar() && m.expr_dtype(stride).is_scalar() && lanes > 0
        } else {
            true
        }
    }

    fn can_instrument(
        &self,
        m: &Module,
        index: Handle<Expression>,
        buffer: Handle<Variable>,
    ) -> bool {
        self.mem_to_shape.contains_key(&buffer)
            && self.index_is_valid(m, index)
            && !self.unsafe_rewritten
    }

    fn collect(&mut self, index: Handle<Expression>, buffer: Handle<Variable>) {
        self.collector.push((index, self.mem_to_shape[&buffer]));
    }

    /// Conjunction over the collected accesses:
    /// `0 <= index && index < shape` per pair, in collection order.
    /// Returns `None` when nothing was collected.
    fn make_condition(&mut self, m: &mut Module) -> Option<Handle<Expression>> {
        let pairs = std::mem::take(&mut self.collector);
        let mut condition: Option<Handle<Expression>> = None;
        for (index, upper_bound) in pairs {
            // A vector access is in bounds iff its maximum lane is;
            // stride is non-negative after index normalization.
            let index = match m.exprs[index].clone() {
                Expression::Ramp {
                    base,
                    stride,
                    lanes,
                } => {
                    let stride_dtype = m.expr_dtype(stride);
                    let last_lane = m.int(stride_dtype, i64::from(lanes) - 1);
                    let span = m.mul(stride, last_lane);
                    m.add(base, span)
                }
                _ => index,
            };
            let index = simplify(m, index);
            let upper_bound = simplify(m, upper_bound);

            // Signed compare so the lower bound is meaningful.
            let i64t = DataType::int64();
            let index = m.cast(i64t, index);
            let upper_bound = m.cast(i64t, upper_bound);
            let lower_bound = m.zero(i64t);

            let ge = m.binary(BinaryOp::Ge, index, lower_bound);
            let lt = m.binary(BinaryOp::Lt, index, upper_bound);
            let current = m.binary(BinaryOp::And, ge, lt);
            condition = Some(match condition {
                None => current,
                Some(c) => m.binary(BinaryOp::And, c, current),
            });
        }
        condition
    }
}
