//! tessera intermediate representation.
//!
//! A handle-and-arena statement/expression tree for the lowering stage of
//! a tensor-program compiler. Nodes live in append-only arenas owned by a
//! [`Module`]; rewriters append new nodes for changed subtrees and return
//! the original handle otherwise, so pass outputs share structure with
//! their inputs and "did anything change" is a handle compare.

pub mod arena;
mod display;
mod expr;
mod module;
mod stmt;
pub mod subst;
mod types;

pub use arena::{Arena, Handle};
pub use display::dump_stmt;
pub use expr::{intrinsics, BinaryOp, CallType, Expression, Variable};
pub use module::Module;
pub use stmt::{AttrKey, AttrNode, IterVar, Statement};
pub use subst::{substitute, substitute_expr, VarMap};
pub use types::{DataType, DeviceApi, ForKind, ScalarKind};
