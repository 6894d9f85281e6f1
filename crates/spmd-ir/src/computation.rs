//! Computations: acyclic instruction graphs with a single root.

use std::collections::HashSet;

use crate::arena::{Arena, Handle};
use crate::error::IrError;
use crate::instr::{InstrKind, Instruction};

/// An acyclic dataflow graph of instructions with one root.
///
/// The computation exclusively owns its instructions; operand handles always
/// point into its own arena.
#[derive(Clone, Debug)]
pub struct Computation {
    pub name: String,
    /// Instruction arena for this computation.
    pub instructions: Arena<Instruction>,
    /// Parameter instructions, indexed by parameter number.
    pub parameters: Vec<Handle<Instruction>>,
    root: Option<Handle<Instruction>>,
}

impl Computation {
    /// Creates an empty computation with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Arena::new(),
            parameters: Vec::new(),
            root: None,
        }
    }

    /// Appends an instruction. Parameters are also registered by number.
    pub fn add_instruction(&mut self, instruction: Instruction) -> Handle<Instruction> {
        let number = match instruction.kind {
            InstrKind::Parameter { number } => Some(number),
            _ => None,
        };
        let handle = self.instructions.append(instruction);
        if let Some(number) = number {
            if self.parameters.len() <= number {
                self.parameters.resize(number + 1, handle);
            }
            self.parameters[number] = handle;
        }
        handle
    }

    pub fn root(&self) -> Option<Handle<Instruction>> {
        self.root
    }

    pub fn set_root(&mut self, root: Handle<Instruction>) {
        self.root = Some(root);
    }

    pub fn parameter(&self, number: usize) -> Option<Handle<Instruction>> {
        self.parameters.get(number).copied()
    }

    /// Returns the instruction behind `handle`, or an error naming this computation.
    pub fn get(&self, handle: Handle<Instruction>) -> Result<&Instruction, IrError> {
        self.instructions
            .try_get(handle)
            .ok_or_else(|| self.dangling(handle))
    }

    pub fn get_mut(&mut self, handle: Handle<Instruction>) -> Result<&mut Instruction, IrError> {
        if !self.instructions.contains(handle) {
            return Err(self.dangling(handle));
        }
        Ok(&mut self.instructions[handle])
    }

    fn dangling(&self, handle: Handle<Instruction>) -> IrError {
        if handle.index() < self.instructions.capacity_used() {
            IrError::RemovedInstruction {
                computation: self.name.clone(),
                index: handle.index(),
            }
        } else {
            IrError::BadHandle {
                index: handle.index(),
                size: self.instructions.capacity_used(),
            }
        }
    }

    /// Distinct instructions that read `handle`, in allocation order.
    pub fn users(&self, handle: Handle<Instruction>) -> Vec<Handle<Instruction>> {
        self.instructions
            .iter()
            .filter(|(_, instr)| instr.operands.contains(&handle))
            .map(|(h, _)| h)
            .collect()
    }

    /// Number of distinct users of `handle`.
    pub fn user_count(&self, handle: Handle<Instruction>) -> usize {
        self.instructions
            .iter()
            .filter(|(_, instr)| instr.operands.contains(&handle))
            .count()
    }

    /// Rewires every operand slot of `user` that reads `old` to read `new`.
    pub fn replace_use(
        &mut self,
        user: Handle<Instruction>,
        old: Handle<Instruction>,
        new: Handle<Instruction>,
    ) -> Result<(), IrError> {
        self.get(new)?;
        for operand in &mut self.get_mut(user)?.operands {
            if *operand == old {
                *operand = new;
            }
        }
        Ok(())
    }

    /// Rewires every reader of `old`, and the root if it is `old`, to `new`.
    pub fn replace_all_uses(
        &mut self,
        old: Handle<Instruction>,
        new: Handle<Instruction>,
    ) -> Result<(), IrError> {
        self.get(new)?;
        for user in self.users(old) {
            self.replace_use(user, old, new)?;
        }
        if self.root == Some(old) {
            self.root = Some(new);
        }
        Ok(())
    }

    /// Removes an instruction that nothing reads any more.
    pub fn remove_instruction(&mut self, handle: Handle<Instruction>) -> Result<Instruction, IrError> {
        let instr = self.get(handle)?;
        if matches!(instr.kind, InstrKind::Parameter { .. }) {
            return Err(IrError::RemoveParameter {
                name: instr.name.clone(),
            });
        }
        let users = self.user_count(handle) + usize::from(self.root == Some(handle));
        if users > 0 {
            return Err(IrError::InstructionHasUsers {
                name: instr.name.clone(),
                users,
            });
        }
        self.instructions
            .remove(handle)
            .ok_or_else(|| self.dangling(handle))
    }

    /// Every live instruction, operands before users.
    ///
    /// Ties are broken by allocation order, so the result is deterministic.
    pub fn post_order(&self) -> Vec<Handle<Instruction>> {
        let mut visited: HashSet<Handle<Instruction>> = HashSet::new();
        let mut order = Vec::with_capacity(self.instructions.len());
        for (start, _) in self.instructions.iter() {
            if visited.contains(&start) {
                continue;
            }
            // Iterative DFS: (node, next operand index to visit).
            let mut stack = vec![(start, 0usize)];
            visited.insert(start);
            while let Some((node, next)) = stack.pop() {
                let operands = &self.instructions[node].operands;
                if let Some(&operand) = operands.get(next) {
                    stack.push((node, next + 1));
                    if self.instructions.contains(operand) && visited.insert(operand) {
                        stack.push((operand, 0));
                    }
                } else {
                    order.push(node);
                }
            }
        }
        order
    }

    /// Instructions reachable from the root through operand edges.
    pub fn reachable_from_root(&self) -> HashSet<Handle<Instruction>> {
        let mut reachable = HashSet::new();
        let mut worklist: Vec<Handle<Instruction>> = self.root.into_iter().collect();
        while let Some(handle) = worklist.pop() {
            if !reachable.insert(handle) {
                continue;
            }
            if let Some(instr) = self.instructions.try_get(handle) {
                worklist.extend(instr.operands.iter().copied());
            }
        }
        reachable
    }
}
