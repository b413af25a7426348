//! Statement nodes — side effects and control flow.

use crate::arena::Handle;
use crate::expr::{Expression, Variable};
use crate::types::{DataType, DeviceApi, ForKind};

/// Scoped attribute keys recognized by the passes.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum AttrKey {
    /// The decorated scope iterates over virtual threads. The attribute
    /// value is the thread count; the node is the iteration variable.
    VirtualThread,
    /// Co-processor execution scope.
    CoprocScope,
    /// Co-processor micro-op scope.
    CoprocUopScope,
    /// Attests the logical extent of the buffer named by the node.
    BufferBound,
    /// Any other key, carried through untouched.
    Other(String),
}

/// An iteration variable bound by a scoped attribute.
#[derive(Clone, Debug)]
pub struct IterVar {
    pub var: Handle<Variable>,
    /// Hardware thread axis this variable is bound to. The tag
    /// `"vthread"` permits buffer sharing between thread instances.
    pub thread_tag: String,
}

/// The object a scoped attribute decorates.
#[derive(Clone, Debug)]
pub enum AttrNode {
    None,
    Var(Handle<Variable>),
    IterVar(IterVar),
}

/// A statement in the IR.
#[derive(Clone, Debug)]
pub enum Statement {
    /// Bind `var` to `value` within `body`.
    Let {
        var: Handle<Variable>,
        value: Handle<Expression>,
        body: Handle<Statement>,
    },
    /// Attach metadata to a statement subtree.
    Attr {
        node: AttrNode,
        key: AttrKey,
        value: Handle<Expression>,
        body: Handle<Statement>,
    },
    /// Write `value` to `buffer` at `index` where `predicate` holds.
    Store {
        buffer: Handle<Variable>,
        value: Handle<Expression>,
        index: Handle<Expression>,
        predicate: Handle<Expression>,
    },
    /// Loop `loop_var` over `[min, min + extent)`.
    For {
        loop_var: Handle<Variable>,
        min: Handle<Expression>,
        extent: Handle<Expression>,
        kind: ForKind,
        device: DeviceApi,
        body: Handle<Statement>,
    },
    /// Scoped buffer allocation.
    Allocate {
        buffer: Handle<Variable>,
        dtype: DataType,
        extents: Vec<Handle<Expression>>,
        condition: Handle<Expression>,
        body: Handle<Statement>,
        /// Custom allocation expression, if the buffer aliases storage
        /// produced elsewhere.
        new_expr: Option<Handle<Expression>>,
        /// Deallocation function paired with `new_expr`.
        free_fn: Option<String>,
    },
    /// Conditional branch.
    IfThenElse {
        condition: Handle<Expression>,
        then_case: Handle<Statement>,
        else_case: Option<Handle<Statement>>,
    },
    /// Two statements in sequence.
    Block {
        first: Handle<Statement>,
        rest: Handle<Statement>,
    },
    /// Evaluate an expression for its side effects.
    Evaluate { value: Handle<Expression> },
    /// Abort with `message` unless `condition` holds, then run `body`.
    Assert {
        condition: Handle<Expression>,
        message: Handle<Expression>,
        body: Handle<Statement>,
    },
    /// Multi-dimensional tensor store, only present before storage
    /// flattening. The lowering passes reject trees containing it.
    Provide {
        buffer: Handle<Variable>,
        value: Handle<Expression>,
        args: Vec<Handle<Expression>>,
    },
}
