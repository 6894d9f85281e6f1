//! Dead code elimination.
//!
//! [`DeadCodeElimination`] removes every instruction not reachable from its
//! computation's root. [`remove_dead_operands`] is the targeted variant used
//! after a rewrite: it only follows operands of instructions that were just
//! removed, so unrelated dead code is left alone.

use spmd_ir::{Computation, Handle, InstrKind, Instruction, IrError, Module};

use crate::{OptError, Pass};

/// Removes instructions unreachable from each computation's root.
///
/// Parameters are always kept; they define the computation's signature.
#[derive(Debug)]
pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &str {
        "dce"
    }

    fn run(&self, module: &mut Module) -> Result<bool, OptError> {
        let mut changed = false;
        for (_, comp) in module.computations.iter_mut() {
            changed |= run_on_computation(comp)?;
        }
        Ok(changed)
    }
}

fn run_on_computation(comp: &mut Computation) -> Result<bool, IrError> {
    if comp.root().is_none() {
        return Ok(false);
    }
    let live = comp.reachable_from_root();
    // Users before operands, so every removal finds its target unused.
    let dead: Vec<Handle<Instruction>> = comp
        .post_order()
        .into_iter()
        .rev()
        .filter(|h| !live.contains(h) && !is_parameter(comp, *h))
        .collect();
    for &handle in &dead {
        comp.remove_instruction(handle)?;
    }
    Ok(!dead.is_empty())
}

fn is_parameter(comp: &Computation, handle: Handle<Instruction>) -> bool {
    matches!(
        comp.instructions.try_get(handle).map(|i| &i.kind),
        Some(InstrKind::Parameter { .. })
    )
}

/// Removes instructions among `candidates` (and, transitively, their
/// operands) that have no users left.
///
/// Parameters and the root are never removed. Returns the number of removed
/// instructions.
pub fn remove_dead_operands(
    comp: &mut Computation,
    candidates: impl IntoIterator<Item = Handle<Instruction>>,
) -> Result<usize, IrError> {
    let mut worklist: Vec<Handle<Instruction>> = candidates.into_iter().collect();
    let mut removed = 0;
    while let Some(handle) = worklist.pop() {
        if !comp.instructions.contains(handle)
            || is_parameter(comp, handle)
            || comp.root() == Some(handle)
            || comp.user_count(handle) > 0
        {
            continue;
        }
        let instr = comp.remove_instruction(handle)?;
        removed += 1;
        worklist.extend(instr.operands);
    }
    Ok(removed)
}
