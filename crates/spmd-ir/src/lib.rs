//! SPMD intermediate representation.
//!
//! An arena-based dataflow IR for sharded numerical programs: a [`Module`]
//! owns computations, each computation owns an acyclic graph of
//! instructions, and collectives carry replica groups and partition
//! placement.

pub mod arena;
pub mod builder;
mod computation;
mod display;
mod error;
mod instr;
mod sharding;
mod types;
mod verify;

pub use arena::{Arena, Handle};
pub use builder::{ComputationBuilder, scalar_reducer};
pub use computation::Computation;
pub use display::dump_module;
pub use error::IrError;
pub use instr::{ComparisonDirection, InstrKind, Instruction, Literal, Opcode};
pub use sharding::{
    ReplicaGroup, Sharding, flatten_replica_ids, is_noop_grouping, replica_groups, replica_id_set,
};
pub use types::{PrimitiveType, Shape};

/// Module-wide identity of an instruction.
///
/// Ordering is by computation, then by allocation order within it.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct InstrRef {
    pub computation: Handle<Computation>,
    pub instruction: Handle<Instruction>,
}

impl InstrRef {
    pub fn new(computation: Handle<Computation>, instruction: Handle<Instruction>) -> Self {
        Self {
            computation,
            instruction,
        }
    }
}

/// A compiled SPMD program.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub name: String,
    /// All computations, entry and called ones alike.
    pub computations: Arena<Computation>,
    /// The computation the program starts in.
    pub entry: Option<Handle<Computation>>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_computation(&mut self, computation: Computation) -> Handle<Computation> {
        self.computations.append(computation)
    }

    pub fn set_entry(&mut self, entry: Handle<Computation>) {
        self.entry = Some(entry);
    }

    pub fn computation(&self, handle: Handle<Computation>) -> Result<&Computation, IrError> {
        self.computations
            .try_get(handle)
            .ok_or(IrError::UnknownComputation {
                index: handle.index(),
            })
    }

    pub fn computation_mut(
        &mut self,
        handle: Handle<Computation>,
    ) -> Result<&mut Computation, IrError> {
        self.computations
            .try_get_mut(handle)
            .ok_or(IrError::UnknownComputation {
                index: handle.index(),
            })
    }

    pub fn entry_computation(&self) -> Result<&Computation, IrError> {
        self.computation(self.entry.ok_or(IrError::MissingEntry)?)
    }

    /// The instruction behind a module-wide reference.
    pub fn instr(&self, r: InstrRef) -> Result<&Instruction, IrError> {
        self.computation(r.computation)?.get(r.instruction)
    }

    /// Looks up an instruction by name, searching computations in order.
    pub fn find_instruction(&self, name: &str) -> Option<InstrRef> {
        self.computations.iter().find_map(|(ch, comp)| {
            comp.instructions
                .iter()
                .find(|(_, instr)| instr.name == name)
                .map(|(ih, _)| InstrRef::new(ch, ih))
        })
    }
}
