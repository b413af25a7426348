//! Expression nodes — pure values referenced by handle.

use crate::arena::Handle;
use crate::types::DataType;

/// Intrinsic call names recognized by the lowering passes.
pub mod intrinsics {
    /// `tvm_access_ptr(type, buffer, offset, extent, rw_mask)` — builds a
    /// typed pointer into a buffer. Bit 0 of `rw_mask` signals a read,
    /// bit 1 a write.
    pub const ACCESS_PTR: &str = "tvm_access_ptr";
    /// Opaque per-thread context handle.
    pub const CONTEXT_ID: &str = "tvm_context_id";
    /// Lazily evaluated select. A store whose value contains one cannot
    /// be instrumented safely.
    pub const IF_THEN_ELSE: &str = "tvm_if_then_else";
}

/// A variable. Identity is the arena handle; the name is a hint for
/// diagnostics and dumps.
#[derive(Clone, Debug)]
pub struct Variable {
    pub name: String,
    pub dtype: DataType,
}

/// How a `Call` target is resolved.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum CallType {
    Intrinsic,
    PureIntrinsic,
    Extern,
    PureExtern,
}

/// A binary operator.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum BinaryOp {
    Add,
    Mul,
    Div,
    /// Greater-or-equal comparison.
    Ge,
    /// Less-than comparison.
    Lt,
    /// Boolean conjunction.
    And,
}

/// An expression in the IR.
///
/// Expressions are pure; rewriters build new nodes for changed subtrees
/// and return the original handle otherwise.
#[derive(Clone, Debug)]
pub enum Expression {
    /// Reference to a variable.
    Var(Handle<Variable>),
    /// Integer immediate. Carries signed, unsigned, and boolean values
    /// depending on `dtype`.
    IntImm { dtype: DataType, value: i64 },
    /// Floating-point immediate.
    FloatImm { dtype: DataType, value: f64 },
    /// String immediate (diagnostic messages).
    StringImm(String),
    /// Value conversion.
    Cast {
        dtype: DataType,
        value: Handle<Expression>,
    },
    /// Binary arithmetic, comparison, or conjunction.
    Binary {
        op: BinaryOp,
        lhs: Handle<Expression>,
        rhs: Handle<Expression>,
    },
    /// Vectorized affine index: `base + stride * i` for `i in 0..lanes`.
    Ramp {
        base: Handle<Expression>,
        stride: Handle<Expression>,
        lanes: u16,
    },
    /// Read from a buffer.
    Load {
        dtype: DataType,
        buffer: Handle<Variable>,
        index: Handle<Expression>,
        predicate: Handle<Expression>,
    },
    /// Intrinsic or external call.
    Call {
        dtype: DataType,
        name: String,
        args: Vec<Handle<Expression>>,
        call_type: CallType,
    },
}
