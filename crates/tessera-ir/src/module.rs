//! The `Module` container and node-construction helpers.

use crate::arena::{Arena, Handle};
use crate::expr::{BinaryOp, CallType, Expression, Variable};
use crate::stmt::{AttrKey, AttrNode, Statement};
use crate::types::{DataType, DeviceApi, ForKind, ScalarKind};

/// Owns the arenas backing a statement tree.
///
/// Passes thread a `&mut Module` through their visits: new nodes are
/// appended, unchanged subtrees keep their handles, and roots from
/// different pipeline stages share structure freely.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub vars: Arena<Variable>,
    pub exprs: Arena<Expression>,
    pub stmts: Arena<Statement>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- variables ----

    pub fn var(&mut self, name: impl Into<String>, dtype: DataType) -> Handle<Variable> {
        self.vars.append(Variable {
            name: name.into(),
            dtype,
        })
    }

    /// A fresh `Var` expression referencing `var`.
    pub fn var_expr(&mut self, var: Handle<Variable>) -> Handle<Expression> {
        self.exprs.append(Expression::Var(var))
    }

    // ---- immediates ----

    /// An integer immediate of the given type.
    pub fn int(&mut self, dtype: DataType, value: i64) -> Handle<Expression> {
        self.exprs.append(Expression::IntImm { dtype, value })
    }

    /// The zero value of a type.
    pub fn zero(&mut self, dtype: DataType) -> Handle<Expression> {
        if dtype.kind == ScalarKind::Float {
            self.exprs.append(Expression::FloatImm { dtype, value: 0.0 })
        } else {
            self.int(dtype, 0)
        }
    }

    /// The all-lanes-true predicate.
    pub fn const_true(&mut self, lanes: u16) -> Handle<Expression> {
        self.int(DataType::uint1().with_lanes(lanes), 1)
    }

    pub fn string(&mut self, value: impl Into<String>) -> Handle<Expression> {
        self.exprs.append(Expression::StringImm(value.into()))
    }

    // ---- expressions ----

    pub fn binary(
        &mut self,
        op: BinaryOp,
        lhs: Handle<Expression>,
        rhs: Handle<Expression>,
    ) -> Handle<Expression> {
        self.exprs.append(Expression::Binary { op, lhs, rhs })
    }

    pub fn add(&mut self, lhs: Handle<Expression>, rhs: Handle<Expression>) -> Handle<Expression> {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: Handle<Expression>, rhs: Handle<Expression>) -> Handle<Expression> {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn cast(&mut self, dtype: DataType, value: Handle<Expression>) -> Handle<Expression> {
        self.exprs.append(Expression::Cast { dtype, value })
    }

    pub fn ramp(
        &mut self,
        base: Handle<Expression>,
        stride: Handle<Expression>,
        lanes: u16,
    ) -> Handle<Expression> {
        self.exprs.append(Expression::Ramp {
            base,
            stride,
            lanes,
        })
    }

    pub fn load(
        &mut self,
        dtype: DataType,
        buffer: Handle<Variable>,
        index: Handle<Expression>,
        predicate: Handle<Expression>,
    ) -> Handle<Expression> {
        self.exprs.append(Expression::Load {
            dtype,
            buffer,
            index,
            predicate,
        })
    }

    pub fn call(
        &mut self,
        dtype: DataType,
        name: impl Into<String>,
        args: Vec<Handle<Expression>>,
        call_type: CallType,
    ) -> Handle<Expression> {
        self.exprs.append(Expression::Call {
            dtype,
            name: name.into(),
            args,
            call_type,
        })
    }

    // ---- statements ----

    pub fn let_stmt(
        &mut self,
        var: Handle<Variable>,
        value: Handle<Expression>,
        body: Handle<Statement>,
    ) -> Handle<Statement> {
        self.stmts.append(Statement::Let { var, value, body })
    }

    pub fn attr(
        &mut self,
        node: AttrNode,
        key: AttrKey,
        value: Handle<Expression>,
        body: Handle<Statement>,
    ) -> Handle<Statement> {
        self.stmts.append(Statement::Attr {
            node,
            key,
            value,
            body,
        })
    }

    pub fn store(
        &mut self,
        buffer: Handle<Variable>,
        value: Handle<Expression>,
        index: Handle<Expression>,
        predicate: Handle<Expression>,
    ) -> Handle<Statement> {
        self.stmts.append(Statement::Store {
            buffer,
            value,
            index,
            predicate,
        })
    }

    pub fn for_loop(
        &mut self,
        loop_var: Handle<Variable>,
        min: Handle<Expression>,
        extent: Handle<Expression>,
        kind: ForKind,
        device: DeviceApi,
        body: Handle<Statement>,
    ) -> Handle<Statement> {
        self.stmts.append(Statement::For {
            loop_var,
            min,
            extent,
            kind,
            device,
            body,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn allocate(
        &mut self,
        buffer: Handle<Variable>,
        dtype: DataType,
        extents: Vec<Handle<Expression>>,
        condition: Handle<Expression>,
        body: Handle<Statement>,
        new_expr: Option<Handle<Expression>>,
        free_fn: Option<String>,
    ) -> Handle<Statement> {
        self.stmts.append(Statement::Allocate {
            buffer,
            dtype,
            extents,
            condition,
            body,
            new_expr,
            free_fn,
        })
    }

    pub fn if_then_else(
        &mut self,
        condition: Handle<Expression>,
        then_case: Handle<Statement>,
        else_case: Option<Handle<Statement>>,
    ) -> Handle<Statement> {
        self.stmts.append(Statement::IfThenElse {
            condition,
            then_case,
            else_case,
        })
    }

    pub fn block(&mut self, first: Handle<Statement>, rest: Handle<Statement>) -> Handle<Statement> {
        self.stmts.append(Statement::Block { first, rest })
    }

    pub fn evaluate(&mut self, value: Handle<Expression>) -> Handle<Statement> {
        self.stmts.append(Statement::Evaluate { value })
    }

    pub fn assert_stmt(
        &mut self,
        condition: Handle<Expression>,
        message: Handle<Expression>,
        body: Handle<Statement>,
    ) -> Handle<Statement> {
        self.stmts.append(Statement::Assert {
            condition,
            message,
            body,
        })
    }

    pub fn provide(
        &mut self,
        buffer: Handle<Variable>,
        value: Handle<Expression>,
        args: Vec<Handle<Expression>>,
    ) -> Handle<Statement> {
        self.stmts.append(Statement::Provide {
            buffer,
            value,
            args,
        })
    }

    // ---- inspection ----

    /// The value of an integer immediate, if `expr` is one.
    pub fn const_int(&self, expr: Handle<Expression>) -> Option<i64> {
        match self.exprs[expr] {
            Expression::IntImm { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn is_zero(&self, expr: Handle<Expression>) -> bool {
        self.const_int(expr) == Some(0)
    }

    pub fn is_negative_const(&self, expr: Handle<Expression>) -> bool {
        matches!(self.const_int(expr), Some(v) if v < 0)
    }

    /// Derives the type of an expression.
    ///
    /// Comparisons and conjunctions are boolean with the lane count of
    /// their left operand; a `Ramp` re-lanes its base type.
    pub fn expr_dtype(&self, expr: Handle<Expression>) -> DataType {
        match &self.exprs[expr] {
            Expression::Var(v) => self.vars[*v].dtype,
            Expression::IntImm { dtype, .. } | Expression::FloatImm { dtype, .. } => *dtype,
            Expression::StringImm(_) => DataType::handle(),
            Expression::Cast { dtype, .. } => *dtype,
            Expression::Binary { op, lhs, .. } => {
                let operand = self.expr_dtype(*lhs);
                match op {
                    BinaryOp::Ge | BinaryOp::Lt | BinaryOp::And => {
                        DataType::uint1().with_lanes(operand.lanes)
                    }
                    _ => operand,
                }
            }
            Expression::Ramp { base, lanes, .. } => self.expr_dtype(*base).with_lanes(*lanes),
            Expression::Load { dtype, .. } => *dtype,
            Expression::Call { dtype, .. } => *dtype,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_inspection() {
        let mut m = Module::new();
        let five = m.int(DataType::int32(), 5);
        let neg = m.int(DataType::int32(), -3);
        let zero = m.zero(DataType::int32());
        assert_eq!(m.const_int(five), Some(5));
        assert!(m.is_negative_const(neg));
        assert!(!m.is_negative_const(five));
        assert!(m.is_zero(zero));
    }

    #[test]
    fn float_zero_is_float_imm() {
        let mut m = Module::new();
        let z = m.zero(DataType::float32());
        assert!(matches!(
            m.exprs[z],
            Expression::FloatImm { value, .. } if value == 0.0
        ));
        assert!(!m.is_zero(z));
    }

    #[test]
    fn expr_dtype_derivation() {
        let mut m = Module::new();
        let i = m.var("i", DataType::int32());
        let iv = m.var_expr(i);
        let one = m.int(DataType::int32(), 1);
        let sum = m.add(iv, one);
        assert_eq!(m.expr_dtype(sum), DataType::int32());

        let cmp = m.binary(BinaryOp::Lt, sum, one);
        assert_eq!(m.expr_dtype(cmp), DataType::uint1());

        let stride = m.int(DataType::int32(), 1);
        let ramp = m.ramp(sum, stride, 4);
        assert_eq!(m.expr_dtype(ramp), DataType::int32().with_lanes(4));

        let wide = m.cast(DataType::int64(), sum);
        assert_eq!(m.expr_dtype(wide), DataType::int64());
    }

    #[test]
    fn const_true_lanes() {
        let mut m = Module::new();
        let p = m.const_true(4);
        assert_eq!(m.expr_dtype(p), DataType::uint1().with_lanes(4));
        assert_eq!(m.const_int(p), Some(1));
    }
}
