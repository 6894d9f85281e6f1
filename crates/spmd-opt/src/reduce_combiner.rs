//! Reduce combiner pass.
//!
//! Fuses each group of per-partition partial reduces with the union reduces
//! they feed, so the cross-replica reduction happens once over the union of
//! their replicas.

use spmd_analysis::CallGraph;
use spmd_ir::Module;

use crate::collective_pairs::find_combinable_groups;
use crate::combine::{RewritePlan, plan_rewrite};
use crate::{OptError, Pass};

/// Combines partial reduces sharing a grouping key with their union reduces.
#[derive(Debug)]
pub struct ReduceCombiner {
    num_partitions: usize,
}

impl ReduceCombiner {
    /// `num_partitions` is the number of sharded copies merged per group.
    pub fn new(num_partitions: usize) -> Self {
        Self { num_partitions }
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Finds and plans every group without touching the module.
    fn plan(&self, module: &Module) -> Result<Vec<RewritePlan>, OptError> {
        let call_graph = CallGraph::build(module)?;
        let groups = find_combinable_groups(module, &call_graph, self.num_partitions);
        groups
            .iter()
            .map(|group| plan_rewrite(module, group, self.num_partitions))
            .collect()
    }
}

impl Pass for ReduceCombiner {
    fn name(&self) -> &str {
        "reduce-combiner"
    }

    fn run(&self, module: &mut Module) -> Result<bool, OptError> {
        if module.entry.is_none() {
            log::debug!("reduce-combiner: module '{}' has no entry", module.name);
            return Ok(false);
        }
        let plans = self.plan(module)?;
        for plan in &plans {
            plan.apply(module)?;
        }
        Ok(!plans.is_empty())
    }
}
