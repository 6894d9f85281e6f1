//! Structural verification of a module.

use crate::Module;
use crate::computation::Computation;
use crate::error::IrError;

impl Module {
    /// Checks that the module is well formed.
    ///
    /// Every computation must have a live root, every operand must refer to a
    /// live instruction of the same computation, and every called
    /// computation must exist. Returns the first problem found.
    pub fn verify(&self) -> Result<(), IrError> {
        self.entry_computation()?;
        for (_, comp) in self.computations.iter() {
            self.verify_computation(comp)?;
        }
        Ok(())
    }

    fn verify_computation(&self, comp: &Computation) -> Result<(), IrError> {
        let root = comp.root().ok_or_else(|| IrError::MissingRoot {
            computation: comp.name.clone(),
        })?;
        comp.get(root)?;
        for &param in &comp.parameters {
            comp.get(param)?;
        }
        for (_, instr) in comp.instructions.iter() {
            for &operand in &instr.operands {
                comp.get(operand)?;
            }
            for callee in instr.kind.called_computations() {
                self.computation(callee)?;
            }
        }
        Ok(())
    }
}
