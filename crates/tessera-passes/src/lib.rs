//! Statement-lowering passes for the tessera pipeline.
//!
//! Provides the two tree-rewriting passes — virtual-thread injection and
//! bounds-checker instrumentation — together with the collaborators they
//! lean on (algebraic simplification, unique-definition restoration) and
//! a small [`Pipeline`] for composing passes in sequence.

mod bounds;
mod simplify;
mod ssa;
mod vthread;

pub use bounds::instrument_bound_checkers;
pub use simplify::simplify;
pub use ssa::convert_ssa;
pub use vthread::inject_virtual_thread;

use std::fmt::Debug;

use tessera_analysis::TouchError;
use tessera_ir::{Handle, Module, Statement};

/// Errors from the lowering passes.
///
/// Every variant is a precondition violation: either the pass pipeline
/// ran in the wrong order or an upstream stage produced malformed IR.
#[derive(Debug, thiserror::Error)]
pub enum PassError {
    /// The tree still contains `Provide` nodes.
    #[error("virtual thread injection requires flattened storage (found a Provide node)")]
    StorageFlattenRequired,
    /// Loops must be normalized to start at zero.
    #[error("loop over `{0}` must start at zero before virtual thread injection")]
    NonZeroLoopMin(String),
    /// A privatized buffer was referenced outside an indexed access.
    #[error("buffer `{0}` address may get rewritten in virtual thread")]
    RemappedBufferRef(String),
    /// Internal invariant: one loop per virtual-thread scope.
    #[error("virtual thread loop injected twice")]
    LoopAlreadyInjected,
    /// A `virtual_thread` attribute without an iteration variable.
    #[error("virtual_thread attribute must bind an iteration variable")]
    ExpectedIterVar,
    /// A `virtual_thread` attribute whose value is not a constant.
    #[error("virtual_thread attribute value must be an integer immediate")]
    ExpectedThreadCount,
    /// The access-pointer intrinsic takes exactly five arguments.
    #[error("access pointer intrinsic expects 5 arguments, got {0}")]
    MalformedAccessPtr(usize),
    /// Touch analysis rejected the tree.
    #[error(transparent)]
    Touch(#[from] TouchError),
}

/// A lowering pass over a statement tree.
pub trait Pass: Debug {
    /// Human-readable name of the pass.
    fn name(&self) -> &str;

    /// Runs the pass, returning the (possibly shared) new root.
    fn run(
        &self,
        module: &mut Module,
        root: Handle<Statement>,
    ) -> Result<Handle<Statement>, PassError>;
}

/// Virtual-thread lowering as a [`Pass`].
#[derive(Debug)]
pub struct InjectVirtualThread;

impl Pass for InjectVirtualThread {
    fn name(&self) -> &str {
        "inject-virtual-thread"
    }

    fn run(
        &self,
        module: &mut Module,
        root: Handle<Statement>,
    ) -> Result<Handle<Statement>, PassError> {
        inject_virtual_thread(module, root)
    }
}

/// Bounds instrumentation as a [`Pass`].
#[derive(Debug)]
pub struct InstrumentBoundCheckers;

impl Pass for InstrumentBoundCheckers {
    fn name(&self) -> &str {
        "instrument-bound-checkers"
    }

    fn run(
        &self,
        module: &mut Module,
        root: Handle<Statement>,
    ) -> Result<Handle<Statement>, PassError> {
        Ok(instrument_bound_checkers(module, root))
    }
}

/// Runs passes in sequence, threading the root through each.
#[derive(Default)]
pub struct Pipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl Pipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a pass.
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Runs all passes; the first failure aborts the pipeline.
    pub fn run(
        &self,
        module: &mut Module,
        mut root: Handle<Statement>,
    ) -> Result<Handle<Statement>, PassError> {
        for pass in &self.passes {
            let before = root;
            root = pass.run(module, root)?;
            log::debug!(
                "{}: {}",
                pass.name(),
                if root == before { "no change" } else { "rewrote tree" }
            );
        }
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_ir::DataType;

    #[test]
    fn empty_pipeline_is_identity() {
        let mut m = Module::new();
        let one = m.int(DataType::int32(), 1);
        let root = m.evaluate(one);
        let pipeline = Pipeline::new();
        assert_eq!(pipeline.run(&mut m, root).unwrap(), root);
    }

    #[test]
    fn pipeline_runs_both_passes() {
        let mut m = Module::new();
        let one = m.int(DataType::int32(), 1);
        let root = m.evaluate(one);

        let mut pipeline = Pipeline::new();
        pipeline.add_pass(Box::new(InjectVirtualThread));
        pipeline.add_pass(Box::new(InstrumentBoundCheckers));
        // A plain evaluate has nothing to lower or instrument.
        assert_eq!(pipeline.run(&mut m, root).unwrap(), root);
    }
}
