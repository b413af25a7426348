//! Thread-variable touch analysis.
//!
//! Computes the set of variables whose stored values can differ across
//! virtual-thread instances: everything that transitively depends on the
//! thread variable through assignment, loop induction, store indices, or
//! indirect writes via the access-pointer intrinsic. The result drives
//! allocation privatization in the virtual-thread injector.

use rustc_hash::{FxHashMap, FxHashSet};

use tessera_ir::{intrinsics, Expression, Handle, Module, Statement, Variable};

/// Errors during touch analysis.
///
/// These indicate malformed intrinsic calls produced upstream, not bad
/// input data.
#[derive(Debug, thiserror::Error)]
pub enum TouchError {
    /// The access-pointer intrinsic takes exactly five arguments.
    #[error("access pointer intrinsic expects 5 arguments, got {0}")]
    AccessPtrArity(usize),
    /// The read/write mask argument must be an integer immediate.
    #[error("access pointer read/write mask must be an integer constant")]
    AccessPtrMask,
    /// The buffer argument must be a plain variable reference.
    #[error("access pointer buffer argument must be a variable")]
    AccessPtrBuffer,
}

/// Expression walk: does this expression read any touched variable?
///
/// Also remembers the variables it read (`used_vars`, in case they become
/// touched later through a loop) and the variables written through the
/// access-pointer intrinsic (`write_vars`). When `check_write` is false
/// the walk stops at the first touched read.
struct ExprTouch<'a> {
    touched: &'a FxHashSet<Handle<Variable>>,
    check_write: bool,
    expr_touched: bool,
    used_vars: Vec<Handle<Variable>>,
    write_vars: Vec<Handle<Variable>>,
}

impl<'a> ExprTouch<'a> {
    fn new(touched: &'a FxHashSet<Handle<Variable>>, check_write: bool) -> Self {
        Self {
            touched,
            check_write,
            expr_touched: false,
            used_vars: Vec::new(),
            write_vars: Vec::new(),
        }
    }

    fn visit(&mut self, m: &Module, e: Handle<Expression>) -> Result<(), TouchError> {
        // Early stop once touched, unless write intents are still needed.
        if self.expr_touched && !self.check_write {
            return Ok(());
        }
        match &m.exprs[e] {
            Expression::Var(v) => self.use_var(*v),
            Expression::Load {
                buffer,
                index,
                predicate,
                ..
            } => {
                self.use_var(*buffer);
                self.visit(m, *index)?;
                self.visit(m, *predicate)?;
            }
            Expression::Call { name, args, .. } if name == intrinsics::ACCESS_PTR => {
                if args.len() != 5 {
                    return Err(TouchError::AccessPtrArity(args.len()));
                }
                let mask = m.const_int(args[4]).ok_or(TouchError::AccessPtrMask)?;
                let Expression::Var(buffer) = m.exprs[args[1]] else {
                    return Err(TouchError::AccessPtrBuffer);
                };
                if mask & 1 != 0 {
                    self.use_var(buffer);
                }
                if mask & 2 != 0 {
                    self.write_vars.push(buffer);
                }
                // Only the offset argument carries a data dependence.
                self.visit(m, args[2])?;
            }
            Expression::Call { args, .. } => {
                for &a in args {
                    self.visit(m, a)?;
                }
            }
            Expression::Binary { lhs, rhs, .. } => {
                self.visit(m, *lhs)?;
                self.visit(m, *rhs)?;
            }
            Expression::Cast { value, .. } => self.visit(m, *value)?,
            Expression::Ramp { base, stride, .. } => {
                self.visit(m, *base)?;
                self.visit(m, *stride)?;
            }
            Expression::IntImm { .. } | Expression::FloatImm { .. } | Expression::StringImm(_) => {}
        }
        Ok(())
    }

    fn use_var(&mut self, var: Handle<Variable>) {
        if self.touched.contains(&var) {
            self.expr_touched = true;
        }
        // Remember the read in case the variable gets touched later in
        // a loop; the closure pass propagates through it.
        if !self.expr_touched {
            self.used_vars.push(var);
        }
    }
}

/// Statement walk recording which variables each defining form depends on.
#[derive(Default)]
struct VarTouched {
    touched: FxHashSet<Handle<Variable>>,
    /// `affect[r]` lists the variables defined by a statement that read `r`.
    affect: FxHashMap<Handle<Variable>, Vec<Handle<Variable>>>,
}

impl VarTouched {
    fn visit_stmt(&mut self, m: &Module, s: Handle<Statement>) -> Result<(), TouchError> {
        match &m.stmts[s] {
            Statement::Let { var, value, body } => {
                let mut tc = ExprTouch::new(&self.touched, false);
                tc.visit(m, *value)?;
                let (hit, used) = (tc.expr_touched, tc.used_vars);
                self.record(*var, hit, &used);
                self.visit_stmt(m, *body)
            }
            Statement::Store {
                buffer,
                value,
                index,
                ..
            } => {
                let mut tc = ExprTouch::new(&self.touched, false);
                tc.visit(m, *value)?;
                tc.visit(m, *index)?;
                let (hit, used) = (tc.expr_touched, tc.used_vars);
                self.record(*buffer, hit, &used);
                Ok(())
            }
            Statement::For {
                loop_var,
                min,
                extent,
                body,
                ..
            } => {
                let mut tc = ExprTouch::new(&self.touched, false);
                tc.visit(m, *min)?;
                tc.visit(m, *extent)?;
                let (hit, used) = (tc.expr_touched, tc.used_vars);
                self.record(*loop_var, hit, &used);
                self.visit_stmt(m, *body)
            }
            // External call: anything written through an access pointer
            // depends on everything the call reads.
            Statement::Evaluate { value } => {
                let mut tc = ExprTouch::new(&self.touched, true);
                tc.visit(m, *value)?;
                let (hit, used, writes) = (tc.expr_touched, tc.used_vars, tc.write_vars);
                for w in writes {
                    self.record(w, hit, &used);
                }
                Ok(())
            }
            Statement::Allocate {
                buffer,
                extents,
                condition,
                body,
                new_expr,
                ..
            } => {
                let mut tc = ExprTouch::new(&self.touched, false);
                for &e in extents {
                    tc.visit(m, e)?;
                }
                tc.visit(m, *condition)?;
                if let Some(e) = new_expr {
                    tc.visit(m, *e)?;
                }
                let (hit, used) = (tc.expr_touched, tc.used_vars);
                self.record(*buffer, hit, &used);
                self.visit_stmt(m, *body)
            }
            // Non-defining forms just recurse.
            Statement::Attr { body, .. } | Statement::Assert { body, .. } => {
                self.visit_stmt(m, *body)
            }
            Statement::IfThenElse {
                then_case,
                else_case,
                ..
            } => {
                self.visit_stmt(m, *then_case)?;
                if let Some(e) = else_case {
                    self.visit_stmt(m, *e)?;
                }
                Ok(())
            }
            Statement::Block { first, rest } => {
                self.visit_stmt(m, *first)?;
                self.visit_stmt(m, *rest)
            }
            Statement::Provide { .. } => Ok(()),
        }
    }

    fn record(&mut self, def: Handle<Variable>, expr_touched: bool, used: &[Handle<Variable>]) {
        if self.touched.contains(&def) {
            return;
        }
        if expr_touched {
            self.touched.insert(def);
        } else {
            for &r in used {
                if r != def {
                    self.affect.entry(r).or_default().push(def);
                }
            }
        }
    }
}

/// Returns every variable whose value can be influenced by `var`.
///
/// Seeds the touched set with `var`, walks the statement once recording
/// direct dependencies, then closes over the affect graph with a
/// worklist. Each variable enters the set at most once, so the closure
/// terminates at the least fixed point even with cyclic dependencies
/// (loop induction).
pub fn touched_vars(
    m: &Module,
    stmt: Handle<Statement>,
    var: Handle<Variable>,
) -> Result<FxHashSet<Handle<Variable>>, TouchError> {
    let mut analysis = VarTouched::default();
    analysis.touched.insert(var);
    analysis.visit_stmt(m, stmt)?;

    let mut pending: Vec<Handle<Variable>> = analysis.touched.iter().copied().collect();
    while let Some(v) = pending.pop() {
        if let Some(deps) = analysis.affect.get(&v) {
            for &w in deps {
                if analysis.touched.insert(w) {
                    pending.push(w);
                }
            }
        }
    }
    Ok(analysis.touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_ir::{CallType, DataType, DeviceApi, ForKind};

    fn store_of(
        m: &mut Module,
        buffer: Handle<Variable>,
        value: Handle<Expression>,
        index: Handle<Expression>,
    ) -> Handle<Statement> {
        let p = m.const_true(1);
        m.store(buffer, value, index, p)
    }

    #[test]
    fn let_value_dependence() {
        let mut m = Module::new();
        let vt = m.var("vt", DataType::int32());
        let a = m.var("a", DataType::int32());
        let b = m.var("b", DataType::int32());

        let vt_ref = m.var_expr(vt);
        let one = m.int(DataType::int32(), 1);
        let a_val = m.add(vt_ref, one);
        let a_ref = m.var_expr(a);
        let nop = m.evaluate(one);
        let inner = m.let_stmt(b, a_ref, nop);
        let tree = m.let_stmt(a, a_val, inner);

        let touched = touched_vars(&m, tree, vt).unwrap();
        assert!(touched.contains(&vt));
        assert!(touched.contains(&a));
        assert!(touched.contains(&b), "dependence chains through `a`");
    }

    #[test]
    fn untouched_stays_out() {
        let mut m = Module::new();
        let vt = m.var("vt", DataType::int32());
        let c = m.var("c", DataType::int32());

        let seven = m.int(DataType::int32(), 7);
        let nop = m.evaluate(seven);
        let tree = m.let_stmt(c, seven, nop);

        let touched = touched_vars(&m, tree, vt).unwrap();
        assert!(touched.contains(&vt));
        assert!(!touched.contains(&c));
    }

    #[test]
    fn store_index_touches_buffer() {
        let mut m = Module::new();
        let vt = m.var("vt", DataType::int32());
        let buf = m.var("A", DataType::handle());

        let vt_ref = m.var_expr(vt);
        let val = m.int(DataType::int32(), 42);
        let tree = store_of(&mut m, buf, val, vt_ref);

        let touched = touched_vars(&m, tree, vt).unwrap();
        assert!(touched.contains(&buf));
    }

    #[test]
    fn loop_extent_touches_induction_var() {
        let mut m = Module::new();
        let vt = m.var("vt", DataType::int32());
        let i = m.var("i", DataType::int32());
        let buf = m.var("A", DataType::handle());

        let zero = m.zero(DataType::int32());
        let vt_ref = m.var_expr(vt);
        let i_ref = m.var_expr(i);
        let val = m.int(DataType::int32(), 1);
        let body = store_of(&mut m, buf, val, i_ref);
        let tree = m.for_loop(i, zero, vt_ref, ForKind::Serial, DeviceApi::None, body);

        let touched = touched_vars(&m, tree, vt).unwrap();
        assert!(touched.contains(&i));
        assert!(touched.contains(&buf), "indexing with a touched loop var");
    }

    #[test]
    fn use_before_touch_resolved_by_closure() {
        // `a` reads buffer `b` before the statement that makes `b`
        // depend on the thread variable; the worklist closure must still
        // propagate the touch back through the affect edge.
        let mut m = Module::new();
        let vt = m.var("vt", DataType::int32());
        let a = m.var("a", DataType::int32());
        let b = m.var("b", DataType::handle());

        let zero = m.zero(DataType::int32());
        let p = m.const_true(1);
        let b_load = m.load(DataType::int32(), b, zero, p);
        let vt_ref = m.var_expr(vt);
        let one = m.int(DataType::int32(), 1);
        let nop = m.evaluate(one);
        let first = m.let_stmt(a, b_load, nop);
        let second = store_of(&mut m, b, vt_ref, zero);
        let tree = m.block(first, second);

        let touched = touched_vars(&m, tree, vt).unwrap();
        assert!(touched.contains(&b));
        assert!(touched.contains(&a));
    }

    #[test]
    fn access_ptr_write_bit_defines_buffer() {
        let mut m = Module::new();
        let vt = m.var("vt", DataType::int32());
        let buf = m.var("B", DataType::handle());

        let ann = m.zero(DataType::float32());
        let buf_ref = m.var_expr(buf);
        let vt_ref = m.var_expr(vt);
        let extent = m.int(DataType::int32(), 16);
        let mask = m.int(DataType::int32(), 2);
        let call = m.call(
            DataType::handle(),
            intrinsics::ACCESS_PTR,
            vec![ann, buf_ref, vt_ref, extent, mask],
            CallType::Intrinsic,
        );
        let tree = m.evaluate(call);

        let touched = touched_vars(&m, tree, vt).unwrap();
        assert!(touched.contains(&buf), "offset depends on thread var");
    }

    #[test]
    fn access_ptr_extent_carries_no_dependence() {
        let mut m = Module::new();
        let vt = m.var("vt", DataType::int32());
        let buf = m.var("B", DataType::handle());

        let ann = m.zero(DataType::float32());
        let buf_ref = m.var_expr(buf);
        let offset = m.zero(DataType::int32());
        let vt_ref = m.var_expr(vt);
        let mask = m.int(DataType::int32(), 2);
        let call = m.call(
            DataType::handle(),
            intrinsics::ACCESS_PTR,
            vec![ann, buf_ref, offset, vt_ref, mask],
            CallType::Intrinsic,
        );
        let tree = m.evaluate(call);

        let touched = touched_vars(&m, tree, vt).unwrap();
        assert!(
            !touched.contains(&buf),
            "only the offset argument is walked"
        );
    }

    #[test]
    fn malformed_access_ptr_is_an_error() {
        let mut m = Module::new();
        let vt = m.var("vt", DataType::int32());
        let buf = m.var("B", DataType::handle());

        let buf_ref = m.var_expr(buf);
        let call = m.call(
            DataType::handle(),
            intrinsics::ACCESS_PTR,
            vec![buf_ref],
            CallType::Intrinsic,
        );
        let tree = m.evaluate(call);

        assert!(matches!(
            touched_vars(&m, tree, vt),
            Err(TouchError::AccessPtrArity(1))
        ));
    }

    #[test]
    fn idempotent_on_result() {
        let mut m = Module::new();
        let vt = m.var("vt", DataType::int32());
        let a = m.var("a", DataType::int32());
        let buf = m.var("A", DataType::handle());

        let vt_ref = m.var_expr(vt);
        let a_ref = m.var_expr(a);
        let store = store_of(&mut m, buf, vt_ref, a_ref);
        let tree = m.let_stmt(a, vt_ref, store);

        let first = touched_vars(&m, tree, vt).unwrap();
        let second = touched_vars(&m, tree, vt).unwrap();
        assert_eq!(first, second);
    }
}
