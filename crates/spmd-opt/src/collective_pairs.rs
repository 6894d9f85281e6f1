//! Collective-pair finder and match validator.
//!
//! A partial reduce with a grouping key runs once per sharded copy of the
//! program. Each copy's partial reduce feeds, through a short single-user
//! chain of elementwise ops, a union reduce over all participants. This
//! module finds those copies, traces their chains and checks that the copies
//! differ only in which replicas they reduce over.
//!
//! Candidates that fail any check are dropped and logged at `debug`; nothing
//! here is an error.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use spmd_analysis::{CallGraph, ValueOracle, is_sum_reducer};
use spmd_ir::{
    Computation, Handle, InstrKind, InstrRef, Instruction, IrError, Module, Opcode,
    PrimitiveType, Shape, flatten_replica_ids, is_noop_grouping, replica_id_set,
};

/// Ops a partial reduce's value may flow through on its way to the union reduce.
pub fn is_hoistable(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Convert
            | Opcode::Bitcast
            | Opcode::Reshape
            | Opcode::Transpose
            | Opcode::Negate
            | Opcode::Multiply
            | Opcode::Add
            | Opcode::Subtract
    )
}

/// One op on the path from a partial reduce to its union reduce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainLink {
    pub instruction: Handle<Instruction>,
    /// Operand slot that carries the reduced value; any other slot is a leaf.
    pub chain_operand: usize,
}

/// One sharded copy of a combinable reduction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Branch {
    pub computation: Handle<Computation>,
    pub partial_reduce: Handle<Instruction>,
    /// Links in dataflow order, starting at the partial reduce's user.
    pub chain: Vec<ChainLink>,
    pub union_reduce: Handle<Instruction>,
}

impl Branch {
    pub fn partial_reduce_ref(&self) -> InstrRef {
        InstrRef::new(self.computation, self.partial_reduce)
    }

    pub fn union_reduce_ref(&self) -> InstrRef {
        InstrRef::new(self.computation, self.union_reduce)
    }

    pub fn link_ref(&self, link: &ChainLink) -> InstrRef {
        InstrRef::new(self.computation, link.instruction)
    }

    /// Every instruction this branch would rewrite.
    fn owned(&self) -> impl Iterator<Item = InstrRef> + '_ {
        [self.partial_reduce_ref(), self.union_reduce_ref()]
            .into_iter()
            .chain(self.chain.iter().map(|l| self.link_ref(l)))
    }
}

/// Partial reduces sharing a grouping key that can be fused into their
/// union reduces.
#[derive(Clone, Debug)]
pub struct CombinableGroup {
    pub grouping_key: u64,
    /// One per sharded copy, in discovery order.
    pub branches: Vec<Branch>,
    /// Apply computation of the partial reduces.
    pub apply_computation: Handle<Computation>,
}

impl CombinableGroup {
    pub fn partial_reduces(&self) -> Vec<InstrRef> {
        self.branches.iter().map(Branch::partial_reduce_ref).collect()
    }

    pub fn union_reduces(&self) -> Vec<InstrRef> {
        self.branches.iter().map(Branch::union_reduce_ref).collect()
    }
}

/// Why a grouping key was not combined.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("'{name}' has {users} users; a chain value needs exactly one")]
    UserCount { name: String, users: usize },

    #[error("'{name}' is a computation result")]
    FeedsRoot { name: String },

    #[error("'{name}' ({opcode}) cannot move across a reduction")]
    NotHoistable { name: String, opcode: Opcode },

    #[error("'{name}' reads the chain value more than once")]
    ChainValueReadTwice { name: String },

    #[error("'{name}' does {element} arithmetic; only floating-point arithmetic can move across a reduction")]
    IntegerArithmetic { name: String, element: PrimitiveType },

    #[error("'{name}' converts {from} to {to}, which does not distribute over a sum")]
    LossyConvert {
        name: String,
        from: PrimitiveType,
        to: PrimitiveType,
    },

    #[error("'{name}' reinterprets {from} bits as {to}")]
    TypeChangingBitcast {
        name: String,
        from: PrimitiveType,
        to: PrimitiveType,
    },

    #[error("leaf of '{name}' is not a broadcast scalar")]
    NonScalarLeaf { name: String },

    #[error("branches reach their union-reduce through chains of different length")]
    UnequalChainLengths,

    #[error("union-reduce '{name}' is claimed by grouping key {winner}")]
    LostUnionReduce { name: String, winner: u64 },

    #[error("found {found} branches, expected {expected}")]
    BranchCount { found: usize, expected: usize },

    #[error("'{name}' has no sharding")]
    MissingSharding { name: String },

    #[error("'{name}' shares its sharding with another branch")]
    DuplicateSharding { name: String },

    #[error("reducer of '{name}' is not a sum")]
    NotSum { name: String },

    #[error("union-reduce '{name}' only has singleton replica groups")]
    NoopUnionReduce { name: String },

    #[error("union-reduce '{name}' has {groups} replica groups; only a single group can be fused")]
    MultipleUnionGroups { name: String, groups: usize },

    #[error("union-reduce '{name}' differs from the first branch's")]
    UnionReduceMismatch { name: String },

    #[error("'{name}' belongs to more than one branch")]
    SharedInstruction { name: String },

    #[error("'{name}' has a different shape from the first branch")]
    ShapeMismatch { name: String },

    #[error("operand of '{name}' may differ from the first branch's")]
    OperandsDiffer { name: String },

    #[error("chain op '{name}' at position {position} differs from the first branch's")]
    ChainMismatch { position: usize, name: String },

    #[error("leaf of '{name}' at position {position} may differ from the first branch's")]
    LeavesDiffer { position: usize, name: String },

    #[error("'{name}' names a replica id more than once")]
    DuplicateReplicaId { name: String },

    #[error("replica id {id} appears in more than one branch")]
    OverlappingReplicaIds { id: u64 },

    #[error("branches reduce over different numbers of replicas")]
    UnequalGroupSizes,

    #[error("branch replica ids do not match the participants of '{name}'")]
    ParticipantsChanged { name: String },

    #[error(transparent)]
    Malformed(#[from] IrError),
}

/// Finds combinable groups across a whole module.
#[derive(Debug)]
pub struct CollectivePairFinder<'a> {
    module: &'a Module,
    call_graph: &'a CallGraph,
    num_partitions: usize,
    oracle: ValueOracle<'a>,
    rejected: BTreeMap<u64, Rejection>,
}

impl<'a> CollectivePairFinder<'a> {
    pub fn new(module: &'a Module, call_graph: &'a CallGraph, num_partitions: usize) -> Self {
        Self {
            module,
            call_graph,
            num_partitions,
            oracle: ValueOracle::new(module, call_graph),
            rejected: BTreeMap::new(),
        }
    }

    /// Grouping keys dropped by the last [`find`](Self::find), with the reason.
    pub fn rejected(&self) -> &BTreeMap<u64, Rejection> {
        &self.rejected
    }

    /// Returns every combinable group, ordered by grouping key.
    pub fn find(&mut self) -> Vec<CombinableGroup> {
        self.rejected.clear();
        let buckets = self.collect_branches();
        let buckets = self.reserve_union_reduces(buckets);
        let mut groups = Vec::new();
        for (key, branches) in buckets {
            match self.validate(key, branches) {
                Ok(group) => groups.push(group),
                Err(reason) => self.reject(key, reason),
            }
        }
        groups
    }

    fn reject(&mut self, key: u64, reason: Rejection) {
        log::debug!("reduce-combiner: rejecting grouping key {key}: {reason}");
        self.rejected.entry(key).or_insert(reason);
    }

    /// Traces every keyed partial reduce, bucketed by grouping key.
    fn collect_branches(&mut self) -> BTreeMap<u64, Vec<Branch>> {
        let mut buckets: BTreeMap<u64, Vec<Branch>> = BTreeMap::new();
        let mut failed: BTreeMap<u64, Rejection> = BTreeMap::new();

        for &comp_handle in self.call_graph.post_order() {
            let Ok(comp) = self.module.computation(comp_handle) else {
                continue;
            };
            for (handle, instr) in comp.instructions.iter() {
                let InstrKind::PartialReduce {
                    grouping_key: Some(key),
                    ..
                } = instr.kind
                else {
                    continue;
                };
                if failed.contains_key(&key) {
                    continue;
                }
                match trace_branch(comp_handle, comp, handle) {
                    Ok(branch) => buckets.entry(key).or_default().push(branch),
                    Err(reason) => {
                        failed.insert(key, reason);
                    }
                }
            }
        }

        for (key, reason) in failed {
            buckets.remove(&key);
            self.reject(key, reason);
        }
        buckets
    }

    /// Lets each union reduce be claimed by a single grouping key.
    ///
    /// When two keys reach the same union reduce, the one with the longer
    /// chain keeps it and the other is dropped entirely.
    fn reserve_union_reduces(
        &mut self,
        mut buckets: BTreeMap<u64, Vec<Branch>>,
    ) -> BTreeMap<u64, Vec<Branch>> {
        let mut distances: BTreeMap<u64, usize> = BTreeMap::new();
        let mut losers: BTreeMap<u64, Rejection> = BTreeMap::new();
        for (&key, branches) in &buckets {
            let distance = branches.first().map_or(0, |b| b.chain.len());
            if branches.iter().all(|b| b.chain.len() == distance) {
                distances.insert(key, distance);
            } else {
                losers.insert(key, Rejection::UnequalChainLengths);
            }
        }

        let mut claims: BTreeMap<InstrRef, u64> = BTreeMap::new();
        for (&key, branches) in &buckets {
            let Some(&distance) = distances.get(&key) else {
                continue;
            };
            for branch in branches {
                let ur = branch.union_reduce_ref();
                let Some(holder) = claims.get(&ur).copied() else {
                    claims.insert(ur, key);
                    continue;
                };
                if holder == key {
                    continue;
                }
                let name = self.name_of(ur);
                if distance > distances.get(&holder).copied().unwrap_or(0) {
                    claims.retain(|_, k| *k != holder);
                    losers.insert(holder, Rejection::LostUnionReduce { name, winner: key });
                    claims.insert(ur, key);
                } else {
                    claims.retain(|_, k| *k != key);
                    losers.insert(
                        key,
                        Rejection::LostUnionReduce {
                            name,
                            winner: holder,
                        },
                    );
                    break;
                }
            }
        }

        for (key, reason) in losers {
            buckets.remove(&key);
            self.reject(key, reason);
        }
        buckets
    }

    fn name_of(&self, r: InstrRef) -> String {
        self.module
            .instr(r)
            .map(|i| i.name.clone())
            .unwrap_or_default()
    }

    /// Checks that the branches are interchangeable copies of one reduction.
    fn validate(&mut self, key: u64, branches: Vec<Branch>) -> Result<CombinableGroup, Rejection> {
        let module = self.module;
        if branches.len() != self.num_partitions || branches.len() < 2 {
            return Err(Rejection::BranchCount {
                found: branches.len(),
                expected: self.num_partitions,
            });
        }
        let first = &branches[0];
        let first_pr = module.instr(first.partial_reduce_ref())?;
        let first_ur = module.instr(first.union_reduce_ref())?;

        // One branch per partition.
        let mut shardings = HashSet::new();
        for branch in &branches {
            let pr = module.instr(branch.partial_reduce_ref())?;
            let Some(sharding) = &pr.sharding else {
                return Err(Rejection::MissingSharding {
                    name: pr.name.clone(),
                });
            };
            if !shardings.insert(sharding.clone()) {
                return Err(Rejection::DuplicateSharding {
                    name: pr.name.clone(),
                });
            }
        }

        // Both reductions are sums, and every copy's union reduce agrees.
        for branch in &branches {
            let pr = module.instr(branch.partial_reduce_ref())?;
            let ur = module.instr(branch.union_reduce_ref())?;
            for instr in [pr, ur] {
                if !instr.to_apply().is_some_and(|c| is_sum_reducer(module, c)) {
                    return Err(Rejection::NotSum {
                        name: instr.name.clone(),
                    });
                }
            }
            let groups = ur.replica_groups().unwrap_or_default();
            if is_noop_grouping(groups) {
                return Err(Rejection::NoopUnionReduce {
                    name: ur.name.clone(),
                });
            }
            if groups.len() != 1 {
                return Err(Rejection::MultipleUnionGroups {
                    name: ur.name.clone(),
                    groups: groups.len(),
                });
            }
            if groups != first_ur.replica_groups().unwrap_or_default() {
                return Err(Rejection::UnionReduceMismatch {
                    name: ur.name.clone(),
                });
            }
        }

        let mut owned = HashSet::new();
        for branch in &branches {
            for r in branch.owned() {
                if !owned.insert(r) {
                    return Err(Rejection::SharedInstruction {
                        name: self.name_of(r),
                    });
                }
            }
        }

        // Every leaf is a scalar spread over the chain value.
        for branch in &branches {
            for link in &branch.chain {
                let r = branch.link_ref(link);
                let op = module.instr(r)?;
                if leaf_ref(r, op, link).is_some_and(|leaf| !is_broadcast_scalar(module, leaf)) {
                    return Err(Rejection::NonScalarLeaf {
                        name: op.name.clone(),
                    });
                }
            }
        }

        // The copies reduce the same value...
        let first_operand = operand_ref(first.partial_reduce_ref(), first_pr, 0);
        for branch in &branches[1..] {
            let pr = module.instr(branch.partial_reduce_ref())?;
            if pr.shape != first_pr.shape {
                return Err(Rejection::ShapeMismatch {
                    name: pr.name.clone(),
                });
            }
            let operand = operand_ref(branch.partial_reduce_ref(), pr, 0);
            let same = match (first_operand, operand) {
                (Some(a), Some(b)) => self.oracle.same_value(a, b),
                _ => false,
            };
            if !same {
                return Err(Rejection::OperandsDiffer {
                    name: pr.name.clone(),
                });
            }
        }

        // ...and push it through the same ops with the same leaves.
        for (position, link0) in first.chain.iter().enumerate() {
            let op0 = module.instr(first.link_ref(link0))?;
            for branch in &branches[1..] {
                let Some(link) = branch.chain.get(position) else {
                    return Err(Rejection::UnequalChainLengths);
                };
                let op = module.instr(branch.link_ref(link))?;
                if op.kind != op0.kind
                    || op.shape != op0.shape
                    || link.chain_operand != link0.chain_operand
                {
                    return Err(Rejection::ChainMismatch {
                        position,
                        name: op.name.clone(),
                    });
                }
                let leaf0 = leaf_ref(first.link_ref(link0), op0, link0);
                let leaf = leaf_ref(branch.link_ref(link), op, link);
                let same = match (leaf0, leaf) {
                    (None, None) => true,
                    (Some(a), Some(b)) => self.oracle.same_value(a, b),
                    _ => false,
                };
                if !same {
                    return Err(Rejection::LeavesDiffer {
                        position,
                        name: op.name.clone(),
                    });
                }
            }
        }

        // Replica ids: disjoint, equally sized, and exactly the union reduce's.
        let mut all_ids = BTreeSet::new();
        let mut size = None;
        for branch in &branches {
            let pr = module.instr(branch.partial_reduce_ref())?;
            let groups = pr.replica_groups().unwrap_or_default();
            let ids = flatten_replica_ids(groups);
            if replica_id_set(groups).len() != ids.len() {
                return Err(Rejection::DuplicateReplicaId {
                    name: pr.name.clone(),
                });
            }
            if *size.get_or_insert(ids.len()) != ids.len() {
                return Err(Rejection::UnequalGroupSizes);
            }
            for id in ids {
                if !all_ids.insert(id) {
                    return Err(Rejection::OverlappingReplicaIds { id });
                }
            }
        }
        if all_ids != replica_id_set(first_ur.replica_groups().unwrap_or_default()) {
            return Err(Rejection::ParticipantsChanged {
                name: first_ur.name.clone(),
            });
        }

        let Some(apply_computation) = first_pr.to_apply() else {
            return Err(Rejection::NotSum {
                name: first_pr.name.clone(),
            });
        };
        Ok(CombinableGroup {
            grouping_key: key,
            branches,
            apply_computation,
        })
    }
}

/// Convenience wrapper: runs a fresh [`CollectivePairFinder`].
pub fn find_combinable_groups(
    module: &Module,
    call_graph: &CallGraph,
    num_partitions: usize,
) -> Vec<CombinableGroup> {
    CollectivePairFinder::new(module, call_graph, num_partitions).find()
}

/// Follows the single-user chain from `partial_reduce` to a union reduce.
fn trace_branch(
    comp_handle: Handle<Computation>,
    comp: &Computation,
    partial_reduce: Handle<Instruction>,
) -> Result<Branch, Rejection> {
    let mut chain = Vec::new();
    let mut current = partial_reduce;
    loop {
        let current_instr = comp.get(current)?;
        if comp.root() == Some(current) {
            return Err(Rejection::FeedsRoot {
                name: current_instr.name.clone(),
            });
        }
        let users = comp.users(current);
        let [user] = users[..] else {
            return Err(Rejection::UserCount {
                name: current_instr.name.clone(),
                users: users.len(),
            });
        };
        let user_instr = comp.get(user)?;
        match user_instr.opcode() {
            Opcode::UnionReduce => {
                return Ok(Branch {
                    computation: comp_handle,
                    partial_reduce,
                    chain,
                    union_reduce: user,
                });
            }
            opcode if is_hoistable(opcode) => {
                let position = user_instr.operands.iter().position(|&o| o == current);
                let (Some(chain_operand), 1) = (position, user_instr.operand_occurrences(current))
                else {
                    return Err(Rejection::ChainValueReadTwice {
                        name: user_instr.name.clone(),
                    });
                };
                check_link(current_instr, user_instr)?;
                chain.push(ChainLink {
                    instruction: user,
                    chain_operand,
                });
                current = user;
            }
            opcode => {
                return Err(Rejection::NotHoistable {
                    name: user_instr.name.clone(),
                    opcode,
                });
            }
        }
    }
}

/// Checks that moving `link` across the reduction keeps the summed value.
///
/// Arithmetic must be floating point. Conversions stay on one side of the
/// float/integer boundary, and bitcasts keep the element type.
fn check_link(input: &Instruction, link: &Instruction) -> Result<(), Rejection> {
    let opcode = link.opcode();
    let (Some(from), Some(to)) = (input.shape.element_type(), link.shape.element_type()) else {
        return Err(Rejection::NotHoistable {
            name: link.name.clone(),
            opcode,
        });
    };
    match opcode {
        Opcode::Convert => {
            let same_domain =
                (from.is_float() && to.is_float()) || (from.is_integer() && to.is_integer());
            if !same_domain {
                return Err(Rejection::LossyConvert {
                    name: link.name.clone(),
                    from,
                    to,
                });
            }
        }
        Opcode::Bitcast if from != to => {
            return Err(Rejection::TypeChangingBitcast {
                name: link.name.clone(),
                from,
                to,
            });
        }
        Opcode::Add | Opcode::Subtract | Opcode::Multiply => {
            if !to.is_float() {
                return Err(Rejection::IntegerArithmetic {
                    name: link.name.clone(),
                    element: to,
                });
            }
        }
        _ => {}
    }
    Ok(())
}

/// A splat constant, or a broadcast of a rank-0 value.
fn is_broadcast_scalar(module: &Module, r: InstrRef) -> bool {
    let Ok(instr) = module.instr(r) else {
        return false;
    };
    match &instr.kind {
        InstrKind::Constant(literal) => literal.is_splat(),
        InstrKind::Broadcast { .. } => operand_ref(r, instr, 0)
            .and_then(|op| module.instr(op).ok())
            .is_some_and(|op| matches!(&op.shape, Shape::Array { dims, .. } if dims.is_empty())),
        _ => false,
    }
}

fn operand_ref(r: InstrRef, instr: &Instruction, index: usize) -> Option<InstrRef> {
    instr
        .operand(index)
        .map(|h| InstrRef::new(r.computation, h))
}

/// The non-chain operand of a binary link.
fn leaf_ref(r: InstrRef, instr: &Instruction, link: &ChainLink) -> Option<InstrRef> {
    if instr.operands.len() != 2 {
        return None;
    }
    operand_ref(r, instr, 1 - link.chain_operand)
}
