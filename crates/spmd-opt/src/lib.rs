//! Optimization passes for SPMD programs.
//!
//! Provides a [`Pass`] trait, a [`PassManager`] with fixed-point iteration,
//! and built-in passes (IR validation, collective-reduction combining, dead
//! code elimination).

pub mod collective_pairs;
pub mod combine;
pub mod dce;
mod error;
mod reduce_combiner;
mod validation;

pub use collective_pairs::{
    Branch, ChainLink, CollectivePairFinder, CombinableGroup, Rejection, find_combinable_groups,
};
pub use combine::{RewritePlan, plan_rewrite};
pub use dce::DeadCodeElimination;
pub use error::OptError;
pub use reduce_combiner::ReduceCombiner;
pub use spmd_analysis::instructions_compute_same_value;
pub use validation::IrValidation;

use std::fmt::Debug;

use spmd_ir::Module;

/// An optimization pass that transforms an IR module.
pub trait Pass: Debug {
    /// Human-readable name of the pass.
    fn name(&self) -> &str;

    /// Run the pass on a module. Returns `true` if anything was modified.
    fn run(&self, module: &mut Module) -> Result<bool, OptError>;
}

/// Optimization level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptLevel {
    /// No optimizations.
    O0,
    /// Validation only.
    O1,
    /// Validation, reduce combining and DCE.
    O2,
}

/// Maximum number of fixed-point iterations before giving up.
const MAX_ITERATIONS: usize = 10;

/// Runs passes in sequence with fixed-point iteration.
#[derive(Debug)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PassManager {
    /// Creates an empty pass manager with no passes.
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Creates a pass manager with passes appropriate for the given level.
    ///
    /// `num_partitions` is the number of sharded copies the reduce combiner
    /// merges.
    pub fn for_level(level: OptLevel, num_partitions: usize) -> Self {
        let mut pm = Self::new();
        match level {
            OptLevel::O0 => {}
            OptLevel::O1 => {
                pm.add_pass(Box::new(IrValidation));
            }
            OptLevel::O2 => {
                pm.add_pass(Box::new(IrValidation));
                pm.add_pass(Box::new(ReduceCombiner::new(num_partitions)));
                pm.add_pass(Box::new(DeadCodeElimination));
            }
        }
        pm
    }

    /// Adds a pass to the pipeline.
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Runs all passes until a fixed point is reached or the iteration limit.
    ///
    /// Returns `true` if any pass modified the module.
    pub fn run(&self, module: &mut Module) -> Result<bool, OptError> {
        let mut any_changed = false;
        for iteration in 0..MAX_ITERATIONS {
            let mut changed = false;
            for pass in &self.passes {
                let pass_changed = pass.run(module)?;
                if pass_changed {
                    log::debug!("pass '{}' changed the module (iteration {iteration})", pass.name());
                }
                changed |= pass_changed;
            }
            any_changed |= changed;
            if !changed {
                break;
            }
        }
        Ok(any_changed)
    }
}

/// Convenience function: runs O2 optimization passes on a module.
pub fn optimize(module: &mut Module, num_partitions: usize) -> Result<bool, OptError> {
    PassManager::for_level(OptLevel::O2, num_partitions).run(module)
}
