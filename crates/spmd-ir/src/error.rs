//! Error types for the SPMD IR.

/// Errors that can occur when constructing, mutating or verifying IR.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// A handle index is out of bounds for its arena.
    #[error("handle index {index} out of bounds (arena size: {size})")]
    BadHandle { index: usize, size: usize },

    /// A handle refers to an instruction that has already been removed.
    #[error("computation '{computation}' references removed instruction [{index}]")]
    RemovedInstruction { computation: String, index: usize },

    /// An instruction cannot be removed while something still reads it.
    #[error("cannot remove '{name}': it still has {users} user(s)")]
    InstructionHasUsers { name: String, users: usize },

    /// Parameters define a computation's signature and are never removed.
    #[error("cannot remove parameter '{name}'")]
    RemoveParameter { name: String },

    /// A computation has no root instruction.
    #[error("computation '{computation}' has no root instruction")]
    MissingRoot { computation: String },

    /// The module has no entry computation.
    #[error("module has no entry computation")]
    MissingEntry,

    /// An instruction calls a computation that is not part of the module.
    #[error("reference to unknown computation [{index}]")]
    UnknownComputation { index: usize },
}
