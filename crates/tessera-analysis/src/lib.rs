//! IR analyses for the tessera lowering pipeline.

pub mod touch;

pub use touch::{touched_vars, TouchError};
