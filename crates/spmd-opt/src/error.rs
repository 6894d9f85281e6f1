//! Error types for optimization passes.

use spmd_analysis::CallGraphError;
use spmd_ir::IrError;

/// Errors that abort a pass pipeline.
#[derive(Debug, thiserror::Error)]
pub enum OptError {
    /// A group accepted by the collective-pair finder no longer satisfies
    /// the conditions the rewriter relies on.
    #[error(
        "reduce-combiner contract violated for grouping key {grouping_key} \
         ({partial_reduces}): {reason}"
    )]
    ContractViolation {
        grouping_key: u64,
        partial_reduces: String,
        reason: String,
    },

    #[error(transparent)]
    Ir(#[from] IrError),

    #[error(transparent)]
    CallGraph(#[from] CallGraphError),
}
