//! Read-only analyses over the SPMD IR.
//!
//! - [`CallGraph`]: who calls which computation, callee-first ordering.
//! - [`ValueOracle`]: proves that two instructions compute the same value.

pub mod call_graph;
pub mod same_value;

pub use call_graph::{CallContext, CallGraph, CallGraphError, CallSite};
pub use same_value::{
    ValueOracle, instructions_compute_same_value, is_sum_reducer, reducer_kind, same_reducer,
};
