//! Rewriter: fuses a validated group into one union reduce per copy.
//!
//! Per branch, the partial reduce is spliced out and the union reduce is
//! replaced by one that spans the concatenated replica ids of every branch.
//! Chain ops stay where they are, except:
//!
//! - a trailing run of `Multiply` links moves after the fused reduction,
//!   since `k * sum(x) == sum(k * x)`;
//! - an `Add`/`Subtract` leaf `c` becomes `c / P`, since the fused reduction
//!   adds it once per partition.
//!
//! Rewriting happens in two steps. [`plan_rewrite`] only reads the module
//! and fails if the group breaks the finder's guarantees;
//! [`RewritePlan::apply`] then mutates exactly the instructions it names.

use spmd_ir::{
    Computation, Handle, InstrKind, Instruction, Literal, Module, Opcode, ReplicaGroup,
    flatten_replica_ids, replica_id_set,
};

use crate::OptError;
use crate::collective_pairs::{Branch, ChainLink, CombinableGroup, is_hoistable};
use crate::dce::remove_dead_operands;

#[derive(Clone, Debug)]
struct BranchPlan {
    computation: Handle<Computation>,
    partial_reduce: Handle<Instruction>,
    /// Links that stay below the reduction.
    in_place: Vec<ChainLink>,
    /// Trailing multiplies re-created after the fused reduction.
    hoisted: Vec<ChainLink>,
    union_reduce: Handle<Instruction>,
}

/// A checked, ready-to-apply rewrite of one [`CombinableGroup`].
#[derive(Clone, Debug)]
pub struct RewritePlan {
    grouping_key: u64,
    num_partitions: usize,
    partial_reduces: String,
    fused_groups: Vec<ReplicaGroup>,
    branches: Vec<BranchPlan>,
}

/// Checks `group` against the current module and plans its rewrite.
///
/// # Errors
///
/// Returns [`OptError::ContractViolation`] if the group no longer meets the
/// conditions the rewrite depends on, and [`OptError::Ir`] if it refers to
/// instructions that do not exist.
pub fn plan_rewrite(
    module: &Module,
    group: &CombinableGroup,
    num_partitions: usize,
) -> Result<RewritePlan, OptError> {
    let mut names = Vec::with_capacity(group.branches.len());
    for branch in &group.branches {
        names.push(module.instr(branch.partial_reduce_ref())?.name.clone());
    }
    let violation = |reason: String| OptError::ContractViolation {
        grouping_key: group.grouping_key,
        partial_reduces: names.join(", "),
        reason,
    };

    if group.branches.len() != num_partitions {
        return Err(violation(format!(
            "{} branches, expected {num_partitions}",
            group.branches.len()
        )));
    }

    let mut fused_ids = Vec::new();
    let mut group_size = None;
    let mut participants = None;
    let mut branches = Vec::with_capacity(group.branches.len());
    for branch in &group.branches {
        let comp = module.computation(branch.computation)?;
        let pr = comp.get(branch.partial_reduce)?;
        let ur = comp.get(branch.union_reduce)?;

        let (InstrKind::PartialReduce { replica_groups, .. }, [_]) = (&pr.kind, &pr.operands[..])
        else {
            return Err(violation(format!("'{}' is not a unary partial-reduce", pr.name)));
        };
        let (InstrKind::UnionReduce { replica_groups: ur_groups, .. }, [_]) =
            (&ur.kind, &ur.operands[..])
        else {
            return Err(violation(format!("'{}' is not a unary union-reduce", ur.name)));
        };
        let users = comp.user_count(branch.partial_reduce)
            + usize::from(comp.root() == Some(branch.partial_reduce));
        if users != 1 {
            return Err(violation(format!("'{}' has {users} users", pr.name)));
        }

        let ids = flatten_replica_ids(replica_groups);
        if *group_size.get_or_insert(ids.len()) != ids.len() {
            return Err(violation(format!(
                "replica group cardinality of '{}' differs",
                pr.name
            )));
        }
        if ids.iter().any(|id| fused_ids.contains(id)) {
            return Err(violation(format!("replica ids of '{}' overlap", pr.name)));
        }
        fused_ids.extend(ids);

        if ur_groups.len() != 1 {
            return Err(violation(format!(
                "'{}' has {} replica groups",
                ur.name,
                ur_groups.len()
            )));
        }
        let ur_ids = replica_id_set(ur_groups);
        if *participants.get_or_insert_with(|| ur_ids.clone()) != ur_ids {
            return Err(violation(format!(
                "'{}' reduces over different replicas",
                ur.name
            )));
        }

        branches.push(plan_branch(comp, branch).map_err(violation)?);
    }

    if participants != Some(fused_ids.iter().copied().collect()) {
        return Err(violation(format!(
            "partial-reduce replica ids {fused_ids:?} do not match the union-reduce participants"
        )));
    }

    Ok(RewritePlan {
        grouping_key: group.grouping_key,
        num_partitions,
        partial_reduces: names.join(", "),
        fused_groups: vec![ReplicaGroup::new(fused_ids)],
        branches,
    })
}

/// Splits a branch's chain into links kept in place and hoisted multiplies.
fn plan_branch(comp: &Computation, branch: &Branch) -> Result<BranchPlan, String> {
    let mut opcodes = Vec::with_capacity(branch.chain.len());
    for link in &branch.chain {
        let instr = comp
            .get(link.instruction)
            .map_err(|err| err.to_string())?;
        if !is_hoistable(instr.opcode()) || instr.operand(link.chain_operand).is_none() {
            return Err(format!("'{}' is not a valid chain link", instr.name));
        }
        opcodes.push(instr.opcode());
    }
    let trailing = opcodes
        .iter()
        .rev()
        .take_while(|&&op| op == Opcode::Multiply)
        .count();
    let split = branch.chain.len() - trailing;
    Ok(BranchPlan {
        computation: branch.computation,
        partial_reduce: branch.partial_reduce,
        in_place: branch.chain[..split].to_vec(),
        hoisted: branch.chain[split..].to_vec(),
        union_reduce: branch.union_reduce,
    })
}

impl RewritePlan {
    pub fn grouping_key(&self) -> u64 {
        self.grouping_key
    }

    /// Replica ids of the fused reduction, in branch order.
    pub fn fused_replica_ids(&self) -> Vec<u64> {
        flatten_replica_ids(&self.fused_groups)
    }

    fn violation(&self, reason: impl Into<String>) -> OptError {
        OptError::ContractViolation {
            grouping_key: self.grouping_key,
            partial_reduces: self.partial_reduces.clone(),
            reason: reason.into(),
        }
    }

    /// Performs the rewrite.
    ///
    /// Operands are read at apply time, so plans for disjoint groups may be
    /// applied one after another.
    pub fn apply(&self, module: &mut Module) -> Result<(), OptError> {
        for branch in &self.branches {
            let comp = module.computation_mut(branch.computation)?;
            self.apply_branch(comp, branch)?;
        }
        log::info!(
            "reduce-combiner: combined grouping key {} ({} branches) over replicas {:?}",
            self.grouping_key,
            self.branches.len(),
            self.fused_replica_ids()
        );
        Ok(())
    }

    fn apply_branch(&self, comp: &mut Computation, branch: &BranchPlan) -> Result<(), OptError> {
        for link in &branch.in_place {
            self.divide_leaf(comp, link)?;
        }

        // Splice out the partial reduce.
        let pr_operand = comp
            .get(branch.partial_reduce)?
            .operand(0)
            .ok_or_else(|| self.violation("partial-reduce lost its operand"))?;
        comp.replace_all_uses(branch.partial_reduce, pr_operand)?;
        comp.remove_instruction(branch.partial_reduce)?;

        // The fused reduction reads the value below the hoisted multiplies.
        let old = comp.get(branch.union_reduce)?.clone();
        let below = match branch.hoisted.first() {
            Some(link) => comp.get(link.instruction)?.operand(link.chain_operand),
            None => old.operand(0),
        }
        .ok_or_else(|| self.violation("chain lost its operand"))?;
        let to_apply = old
            .to_apply()
            .ok_or_else(|| self.violation(format!("'{}' has no reducer", old.name)))?;
        let mut fused = Instruction::new(
            old.name.clone(),
            InstrKind::UnionReduce {
                replica_groups: self.fused_groups.clone(),
                to_apply,
            },
            old.shape.clone(),
            [below],
        );
        fused.sharding = old.sharding.clone();
        let mut result = comp.add_instruction(fused);

        for link in &branch.hoisted {
            let mul = comp.get(link.instruction)?.clone();
            let mut operands = mul.operands;
            if let Some(slot) = operands.get_mut(link.chain_operand) {
                *slot = result;
            }
            let mut hoisted = Instruction::new(mul.name, mul.kind, mul.shape, operands);
            hoisted.sharding = mul.sharding;
            result = comp.add_instruction(hoisted);
        }

        comp.replace_all_uses(branch.union_reduce, result)?;
        let removed = comp.remove_instruction(branch.union_reduce)?;
        remove_dead_operands(comp, removed.operands)?;
        Ok(())
    }

    /// Replaces the leaf `c` of an Add/Subtract link with `c / P`.
    fn divide_leaf(&self, comp: &mut Computation, link: &ChainLink) -> Result<(), OptError> {
        let instr = comp.get(link.instruction)?;
        if !matches!(instr.opcode(), Opcode::Add | Opcode::Subtract) {
            return Ok(());
        }
        let leaf_slot = 1 - link.chain_operand;
        let Some(leaf) = instr.operand(leaf_slot) else {
            return Err(self.violation(format!("'{}' has no leaf operand", instr.name)));
        };
        let link_name = instr.name.clone();
        let sharding = instr.sharding.clone();
        let leaf_instr = comp.get(leaf)?;
        let leaf_name = leaf_instr.name.clone();
        let shape = leaf_instr.shape.clone();

        let mut divisor = Instruction::new(
            format!("{link_name}.divisor"),
            InstrKind::Constant(Literal::splat(&shape, self.num_partitions as f64)),
            shape.clone(),
            [],
        );
        divisor.sharding = sharding.clone();
        let divisor = comp.add_instruction(divisor);

        let mut scaled = Instruction::new(
            format!("{leaf_name}.scaled"),
            InstrKind::Divide,
            shape,
            [leaf, divisor],
        );
        scaled.sharding = sharding;
        let scaled = comp.add_instruction(scaled);

        if let Some(slot) = comp.get_mut(link.instruction)?.operands.get_mut(leaf_slot) {
            *slot = scaled;
        }
        Ok(())
    }
}
