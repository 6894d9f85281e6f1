//! IR validation pass.
//!
//! Checks structural invariants of the IR module and logs warnings for
//! problems found. This pass never modifies the module.

use spmd_ir::Module;

use crate::{OptError, Pass};

/// Validates IR structural invariants. Returns `false` (never modifies the module).
#[derive(Debug)]
pub struct IrValidation;

impl Pass for IrValidation {
    fn name(&self) -> &str {
        "ir-validation"
    }

    fn run(&self, module: &mut Module) -> Result<bool, OptError> {
        validate_module(module);
        Ok(false)
    }
}

fn validate_module(module: &Module) {
    if let Err(err) = module.verify() {
        log::warn!("module '{}' failed verification: {err}", module.name);
    }

    // Collectives that are about to be combined must be placed on a partition.
    for (_, comp) in module.computations.iter() {
        for (handle, instr) in comp.instructions.iter() {
            if instr.grouping_key().is_some() && instr.sharding.is_none() {
                log::warn!(
                    "computation '{}': partial-reduce '{}' ({handle:?}) has a grouping key but no sharding",
                    comp.name,
                    instr.name,
                );
            }
        }
    }
}
