//! Virtual-thread lowering.
//!
//! Replaces each `virtual_thread` attribute scope with either an unrolled
//! block sequence or a serial loop over the thread index. Allocations
//! whose contents depend on the thread variable grow an outer dimension
//! sized by the thread count, and every access to them is offset by
//! `thread * stride` where the stride is the original allocation size.
//!
//! The loop (or unrolled sequence) lands at the lowest statement that
//! dominates every touched read and write: the rewrite propagates a
//! "touched" flag upward while mutating, and the first statement that
//! sees the flag wraps itself.

use rustc_hash::{FxHashMap, FxHashSet};

use tessera_analysis::touched_vars;
use tessera_ir::{
    intrinsics, substitute, AttrKey, AttrNode, BinaryOp, DataType, DeviceApi, Expression, ForKind,
    Handle, Module, Statement, VarMap, Variable,
};

use crate::{convert_ssa, PassError};

/// Thread counts below this unroll into straight-line blocks, provided no
/// loop or branch survives beneath the injection point.
const UNROLL_LIMIT: i64 = 16;

/// Lowers every `virtual_thread` scope in `stmt`, then restores unique
/// definitions over the result.
pub fn inject_virtual_thread(
    m: &mut Module,
    stmt: Handle<Statement>,
) -> Result<Handle<Statement>, PassError> {
    let stmt = rewrite_virtual_threads(m, stmt)?;
    Ok(convert_ssa(m, stmt))
}

/// Top-level mutator: walks the tree bottom-up so nested virtual-thread
/// scopes lower innermost-first, and replaces each `virtual_thread`
/// attribute with its injected body.
fn rewrite_virtual_threads(
    m: &mut Module,
    s: Handle<Statement>,
) -> Result<Handle<Statement>, PassError> {
    match m.stmts[s].clone() {
        Statement::Provide { .. } => Err(PassError::StorageFlattenRequired),
        Statement::Attr {
            node,
            key,
            value,
            body,
        } => {
            let body2 = rewrite_virtual_threads(m, body)?;
            if key == AttrKey::VirtualThread {
                let AttrNode::IterVar(iv) = node else {
                    return Err(PassError::ExpectedIterVar);
                };
                let Some(num_threads) = m.const_int(value) else {
                    return Err(PassError::ExpectedThreadCount);
                };
                let allow_share = iv.thread_tag == "vthread";
                let touched = touched_vars(m, body2, iv.var)?;
                log::debug!(
                    "virtual_thread {}: {} threads, {} touched vars, share={}",
                    m.vars[iv.var].name,
                    num_threads,
                    touched.len(),
                    allow_share
                );
                let mut injector = VtInjector::new(iv.var, num_threads, &touched, allow_share);
                injector.rewrite_stmt(m, body2)
            } else if body2 == body {
                Ok(s)
            } else {
                Ok(m.attr(node, key, value, body2))
            }
        }
        Statement::Let { var, value, body } => {
            let body2 = rewrite_virtual_threads(m, body)?;
            if body2 == body {
                Ok(s)
            } else {
                Ok(m.let_stmt(var, value, body2))
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
            let body2 = rewrite_virtual_threads(m, body)?;
            if body2 == body {
                Ok(s)
            } else {
                Ok(m.for_loop(loop_var, min, extent, kind, device, body2))
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
            let body2 = rewrite_virtual_threads(m, body)?;
            if body2 == body {
                Ok(s)
            } else {
                Ok(m.allocate(buffer, dtype, extents, condition, body2, new_expr, free_fn))
            }
        }
        Statement::IfThenElse {
            condition,
            then_case,
            else_case,
        } => {
            let then2 = rewrite_virtual_threads(m, then_case)?;
            let else2 = match else_case {
                Some(e) => Some(rewrite_virtual_threads(m, e)?),
                None => None,
            };
            if then2 == then_case && else2 == else_case {
                Ok(s)
            } else {
                Ok(m.if_then_else(condition, then2, else2))
            }
        }
        Statement::Block { first, rest } => {
            let first2 = rewrite_virtual_threads(m, first)?;
            let rest2 = rewrite_virtual_threads(m, rest)?;
            if first2 == first && rest2 == rest {
                Ok(s)
            } else {
                Ok(m.block(first2, rest2))
            }
        }
        Statement::Assert {
            condition,
            message,
            body,
        } => {
            let body2 = rewrite_virtual_threads(m, body)?;
            if body2 == body {
                Ok(s)
            } else {
                Ok(m.assert_stmt(condition, message, body2))
            }
        }
        Statement::Store { .. } | Statement::Evaluate { .. } => Ok(s),
    }
}

/// Rewrites one virtual-thread scope.
///
/// The flags form a small state machine coupled to visit order:
/// `visit_touched` propagates "a touched variable was read" upward,
/// `trigger_base_inject` forces the loop to wrap at least up to the
/// current write in privatized regions, and `vt_loop_injected` guards the
/// re-mutation performed while wrapping so nothing injects twice.
struct VtInjector<'a> {
    var: Handle<Variable>,
    num_threads: i64,
    touched: &'a FxHashSet<Handle<Variable>>,
    allow_share: bool,
    vt_loop_injected: bool,
    visit_touched: bool,
    trigger_base_inject: bool,
    /// Loops/branches/blocks seen below the current point after mutation;
    /// nonzero disables unrolling.
    max_loop_depth: u32,
    /// Privatized buffers and their per-thread stride.
    alloc_remap: FxHashMap<Handle<Variable>, Handle<Expression>>,
}

impl<'a> VtInjector<'a> {
    fn new(
        var: Handle<Variable>,
        num_threads: i64,
        touched: &'a FxHashSet<Handle<Variable>>,
        allow_share: bool,
    ) -> Self {
        Self {
            var,
            num_threads,
            touched,
            allow_share,
            vt_loop_injected: false,
            visit_touched: false,
            trigger_base_inject: false,
            max_loop_depth: 0,
            alloc_remap: FxHashMap::default(),
        }
    }

    /// Statement dispatch plus the injection check: if mutating the node
    /// surfaced a touched dependency and no loop has wrapped this path
    /// yet, wrap the mutated statement here.
    fn rewrite_stmt(
        &mut self,
        m: &mut Module,
        s: Handle<Statement>,
    ) -> Result<Handle<Statement>, PassError> {
        let stmt = self.mutate_stmt(m, s)?;
        if self.visit_touched || self.trigger_base_inject {
            if !self.vt_loop_injected {
                return self.inject_loop(m, stmt, false);
            }
            self.visit_touched = false;
            self.trigger_base_inject = false;
        }
        Ok(stmt)
    }

    fn mutate_stmt(
        &mut self,
        m: &mut Module,
        s: Handle<Statement>,
    ) -> Result<Handle<Statement>, PassError> {
        match m.stmts[s].clone() {
            Statement::Provide { .. } => Err(PassError::StorageFlattenRequired),
            Statement::Evaluate { value } => {
                self.trigger_base_inject = !self.allow_share;
                let value2 = self.rewrite_expr(m, value)?;
                if value2 == value {
                    Ok(s)
                } else {
                    Ok(m.evaluate(value2))
                }
            }
            Statement::Store {
                buffer,
                value,
                index,
                predicate,
            } => {
                let value2 = self.rewrite_expr(m, value)?;
                let index2 = self.rewrite_expr(m, index)?;
                let predicate2 = self.rewrite_expr(m, predicate)?;
                if self.touched.contains(&buffer) {
                    self.visit_touched = true;
                }
                self.trigger_base_inject = !self.allow_share;
                if let Some(stride) = self.alloc_remap.get(&buffer).copied() {
                    let index3 = self.rewrite_index(m, index2, stride);
                    Ok(m.store(buffer, value2, index3, predicate2))
                } else if value2 == value && index2 == index && predicate2 == predicate {
                    Ok(s)
                } else {
                    Ok(m.store(buffer, value2, index2, predicate2))
                }
            }
            Statement::Attr {
                node,
                key,
                value,
                body,
            } => {
                let value2 = self.rewrite_expr(m, value)?;
                if self.visit_touched && !self.vt_loop_injected {
                    self.inject_loop(m, s, true)
                } else if !self.allow_share
                    && !self.vt_loop_injected
                    && matches!(key, AttrKey::CoprocUopScope | AttrKey::CoprocScope)
                {
                    // Co-processor scopes cannot straddle thread instances
                    // when buffers are private.
                    self.inject_loop(m, s, true)
                } else {
                    let body2 = self.rewrite_stmt(m, body)?;
                    if value2 == value && body2 == body {
                        Ok(s)
                    } else {
                        Ok(m.attr(node, key, value2, body2))
                    }
                }
            }
            Statement::Let { var, value, body } => {
                let value2 = self.rewrite_expr(m, value)?;
                if self.visit_touched && !self.vt_loop_injected {
                    return self.inject_loop(m, s, true);
                }
                self.visit_touched = false;
                let body2 = self.rewrite_stmt(m, body)?;
                if value2 == value && body2 == body {
                    Ok(s)
                } else {
                    Ok(m.let_stmt(var, value2, body2))
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
                if !m.is_zero(min) {
                    return Err(PassError::NonZeroLoopMin(m.vars[loop_var].name.clone()));
                }
                let extent2 = self.rewrite_expr(m, extent)?;
                if self.visit_touched && !self.vt_loop_injected {
                    let stmt = self.inject_loop(m, s, true)?;
                    self.max_loop_depth += 1;
                    return Ok(stmt);
                }
                self.visit_touched = false;
                let body2 = self.rewrite_stmt(m, body)?;
                self.max_loop_depth += 1;
                if extent2 == extent && body2 == body {
                    Ok(s)
                } else {
                    Ok(m.for_loop(loop_var, min, extent2, kind, device, body2))
                }
            }
            Statement::IfThenElse {
                condition,
                then_case,
                else_case,
            } => {
                let condition2 = self.rewrite_expr(m, condition)?;
                if self.visit_touched && !self.vt_loop_injected {
                    return self.inject_loop(m, s, true);
                }
                self.visit_touched = false;
                debug_assert_eq!(self.max_loop_depth, 0);
                let then2 = self.rewrite_stmt(m, then_case)?;
                let else2 = match else_case {
                    Some(e) => {
                        let depth = self.max_loop_depth;
                        self.max_loop_depth = 0;
                        let e2 = self.rewrite_stmt(m, e)?;
                        self.max_loop_depth = self.max_loop_depth.max(depth);
                        Some(e2)
                    }
                    None => None,
                };
                if condition2 == condition && then2 == then_case && else2 == else_case {
                    Ok(s)
                } else {
                    Ok(m.if_then_else(condition2, then2, else2))
                }
            }
            Statement::Block { first, rest } => {
                debug_assert_eq!(self.max_loop_depth, 0);
                let first2 = self.rewrite_stmt(m, first)?;
                let depth = self.max_loop_depth;
                self.max_loop_depth = 0;
                let rest2 = self.rewrite_stmt(m, rest)?;
                self.max_loop_depth = self.max_loop_depth.max(depth);
                if first2 == first && rest2 == rest {
                    Ok(s)
                } else {
                    Ok(m.block(first2, rest2))
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
                // An externally sourced allocation cannot be reshaped;
                // the loop must wrap it whole.
                if new_expr.is_some() && !self.vt_loop_injected {
                    return self.inject_loop(m, s, true);
                }
                let condition2 = self.rewrite_expr(m, condition)?;
                if self.visit_touched && !self.vt_loop_injected {
                    return self.inject_loop(m, s, true);
                }
                let mut changed = false;
                let mut extents2 = Vec::with_capacity(extents.len());
                for &e in &extents {
                    let e2 = self.rewrite_expr(m, e)?;
                    if self.visit_touched && !self.vt_loop_injected {
                        return self.inject_loop(m, s, true);
                    }
                    changed |= e2 != e;
                    extents2.push(e2);
                }
                self.visit_touched = false;

                // Privatize when the buffer is touched; without sharing,
                // every allocation is per-thread.
                let body2 = if self.touched.contains(&buffer) || !self.allow_share {
                    let stride = self.alloc_stride(m, &extents, dtype);
                    let ext_dtype = extents
                        .first()
                        .map(|&e| m.expr_dtype(e))
                        .unwrap_or(DataType::int32());
                    let threads = m.int(ext_dtype, self.num_threads);
                    let mut with_thread = Vec::with_capacity(extents2.len() + 1);
                    with_thread.push(threads);
                    with_thread.append(&mut extents2);
                    extents2 = with_thread;
                    changed = true;
                    self.alloc_remap.insert(buffer, stride);
                    self.rewrite_stmt(m, body)?
                } else {
                    self.rewrite_stmt(m, body)?
                };
                if !changed && body2 == body && condition2 == condition {
                    Ok(s)
                } else {
                    Ok(m.allocate(buffer, dtype, extents2, condition2, body2, new_expr, free_fn))
                }
            }
            Statement::Assert {
                condition,
                message,
                body,
            } => {
                let condition2 = self.rewrite_expr(m, condition)?;
                let message2 = self.rewrite_expr(m, message)?;
                let body2 = self.rewrite_stmt(m, body)?;
                if condition2 == condition && message2 == message && body2 == body {
                    Ok(s)
                } else {
                    Ok(m.assert_stmt(condition2, message2, body2))
                }
            }
        }
    }

    fn rewrite_expr(
        &mut self,
        m: &mut Module,
        e: Handle<Expression>,
    ) -> Result<Handle<Expression>, PassError> {
        match m.exprs[e].clone() {
            Expression::Var(v) => {
                if self.alloc_remap.contains_key(&v) {
                    // A bare reference to a privatized buffer would leak
                    // an unindexable pointer.
                    return Err(PassError::RemappedBufferRef(m.vars[v].name.clone()));
                }
                if self.touched.contains(&v) {
                    self.visit_touched = true;
                }
                Ok(e)
            }
            Expression::Load {
                dtype,
                buffer,
                index,
                predicate,
            } => {
                let index2 = self.rewrite_expr(m, index)?;
                let predicate2 = self.rewrite_expr(m, predicate)?;
                if self.touched.contains(&buffer) {
                    self.visit_touched = true;
                }
                if let Some(stride) = self.alloc_remap.get(&buffer).copied() {
                    let index3 = self.rewrite_index(m, index2, stride);
                    Ok(m.load(dtype, buffer, index3, predicate2))
                } else if index2 == index && predicate2 == predicate {
                    Ok(e)
                } else {
                    Ok(m.load(dtype, buffer, index2, predicate2))
                }
            }
            Expression::Call {
                dtype,
                name,
                args,
                call_type,
            } => {
                if name == intrinsics::ACCESS_PTR {
                    if args.len() != 5 {
                        return Err(PassError::MalformedAccessPtr(args.len()));
                    }
                    let buffer = match m.exprs[args[1]] {
                        Expression::Var(v) => Some(v),
                        _ => None,
                    };
                    let remap = buffer.and_then(|b| self.alloc_remap.get(&b).copied());
                    if let Some(remap) = remap {
                        self.visit_touched = true;
                        let offset = self.rewrite_expr(m, args[2])?;
                        let extent = self.rewrite_expr(m, args[3])?;
                        // The remap stride counts elements of the raw
                        // allocation; the pointer offset is in units of
                        // the access element type.
                        let elem = m.expr_dtype(args[0]);
                        let offset_dtype = m.expr_dtype(offset);
                        let lanes = m.int(offset_dtype, i64::from(elem.lanes));
                        let stride = m.binary(BinaryOp::Div, remap, lanes);
                        let var_ref = m.var_expr(self.var);
                        let scaled = m.mul(stride, var_ref);
                        let offset2 = m.add(scaled, offset);
                        return Ok(m.call(
                            dtype,
                            intrinsics::ACCESS_PTR,
                            vec![args[0], args[1], offset2, extent, args[4]],
                            call_type,
                        ));
                    }
                } else if name == intrinsics::CONTEXT_ID {
                    // Each thread instance owns its context.
                    return if self.allow_share {
                        Ok(e)
                    } else {
                        Ok(m.var_expr(self.var))
                    };
                }
                let mut changed = false;
                let mut args2 = Vec::with_capacity(args.len());
                for &a in &args {
                    let a2 = self.rewrite_expr(m, a)?;
                    changed |= a2 != a;
                    args2.push(a2);
                }
                if changed {
                    Ok(m.call(dtype, name, args2, call_type))
                } else {
                    Ok(e)
                }
            }
            Expression::Binary { op, lhs, rhs } => {
                let lhs2 = self.rewrite_expr(m, lhs)?;
                let rhs2 = self.rewrite_expr(m, rhs)?;
                if lhs2 == lhs && rhs2 == rhs {
                    Ok(e)
                } else {
                    Ok(m.binary(op, lhs2, rhs2))
                }
            }
            Expression::Cast { dtype, value } => {
                let value2 = self.rewrite_expr(m, value)?;
                if value2 == value {
                    Ok(e)
                } else {
                    Ok(m.cast(dtype, value2))
                }
            }
            Expression::Ramp {
                base,
                stride,
                lanes,
            } => {
                let base2 = self.rewrite_expr(m, base)?;
                let stride2 = self.rewrite_expr(m, stride)?;
                if base2 == base && stride2 == stride {
                    Ok(e)
                } else {
                    Ok(m.ramp(base2, stride2, lanes))
                }
            }
            Expression::IntImm { .. } | Expression::FloatImm { .. } | Expression::StringImm(_) => {
                Ok(e)
            }
        }
    }

    /// `index + var * stride` — shifts an access into the current
    /// thread's slice of the expanded allocation.
    fn rewrite_index(
        &mut self,
        m: &mut Module,
        index: Handle<Expression>,
        stride: Handle<Expression>,
    ) -> Handle<Expression> {
        let var_ref = m.var_expr(self.var);
        let scaled = m.mul(var_ref, stride);
        m.add(index, scaled)
    }

    /// Element count of one thread's view: the product of the original
    /// extents times the lane count.
    fn alloc_stride(
        &self,
        m: &mut Module,
        extents: &[Handle<Expression>],
        dtype: DataType,
    ) -> Handle<Expression> {
        let ext_dtype = extents
            .first()
            .map(|&e| m.expr_dtype(e))
            .unwrap_or(DataType::int32());
        let lanes = m.int(ext_dtype, i64::from(dtype.lanes));
        let mut product = match extents.first() {
            Some(&e) => e,
            None => return lanes,
        };
        for &e in &extents[1..] {
            product = m.mul(product, e);
        }
        m.mul(product, lanes)
    }

    /// Wraps `stmt` in the virtual-thread iteration.
    ///
    /// `before_mutation` means `stmt` has not been rewritten yet (the
    /// caller decided to inject while inspecting a value expression), so
    /// the mutator re-runs over it with injection disabled.
    fn inject_loop(
        &mut self,
        m: &mut Module,
        stmt: Handle<Statement>,
        before_mutation: bool,
    ) -> Result<Handle<Statement>, PassError> {
        if self.vt_loop_injected {
            return Err(PassError::LoopAlreadyInjected);
        }
        self.visit_touched = false;
        self.trigger_base_inject = false;
        self.vt_loop_injected = true;
        let stmt = if before_mutation {
            self.rewrite_stmt(m, stmt)?
        } else {
            stmt
        };
        self.vt_loop_injected = false;
        self.visit_touched = false;

        let dtype = m.vars[self.var].dtype;
        if self.max_loop_depth == 0 && self.num_threads < UNROLL_LIMIT {
            log::debug!("unrolling {} virtual threads", self.num_threads);
            // Right-associated chain: thread 0 runs first.
            let mut chain = self.thread_copy(m, stmt, self.num_threads - 1, dtype);
            for i in (0..self.num_threads - 1).rev() {
                let copy = self.thread_copy(m, stmt, i, dtype);
                chain = m.block(copy, chain);
            }
            Ok(chain)
        } else {
            log::debug!("serializing {} virtual threads into a loop", self.num_threads);
            let name = format!("{}.s", m.vars[self.var].name);
            let idx = m.var(name, dtype);
            let idx_ref = m.var_expr(idx);
            let mut map = VarMap::default();
            map.insert(self.var, idx_ref);
            let body = substitute(m, stmt, &map);
            let zero = m.zero(dtype);
            let extent = m.int(dtype, self.num_threads);
            Ok(m.for_loop(idx, zero, extent, ForKind::Serial, DeviceApi::None, body))
        }
    }

    /// One unrolled instance: `stmt` with the thread variable pinned to `i`.
    fn thread_copy(
        &self,
        m: &mut Module,
        stmt: Handle<Statement>,
        i: i64,
        dtype: DataType,
    ) -> Handle<Statement> {
        let value = if i == 0 {
            m.zero(dtype)
        } else {
            m.int(dtype, i)
        };
        let mut map = VarMap::default();
        map.insert(self.var, value);
        substitute(m, stmt, &map)
    }
}
