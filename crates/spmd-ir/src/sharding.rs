//! Partition placement and replica grouping for collectives.

use std::collections::BTreeSet;

/// Which partition (device) an instruction's value lives on.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum Sharding {
    /// The value is replicated on every partition.
    Replicated,
    /// The whole value lives on a single device.
    Maximal { device: u32 },
    /// Per-element placement of a tuple-shaped value.
    Tuple(Vec<Sharding>),
}

impl Sharding {
    pub fn maximal(device: u32) -> Self {
        Self::Maximal { device }
    }

    /// The device of a maximal sharding.
    pub fn device(&self) -> Option<u32> {
        match self {
            Self::Maximal { device } => Some(*device),
            Self::Replicated | Self::Tuple(_) => None,
        }
    }
}

/// A set of replica ids that jointly execute one instance of a collective.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct ReplicaGroup {
    pub replica_ids: Vec<u64>,
}

impl ReplicaGroup {
    pub fn new(replica_ids: impl Into<Vec<u64>>) -> Self {
        Self {
            replica_ids: replica_ids.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.replica_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replica_ids.is_empty()
    }
}

/// Builds a group list from nested id slices, e.g. `replica_groups(&[&[0], &[1]])`.
pub fn replica_groups(groups: &[&[u64]]) -> Vec<ReplicaGroup> {
    groups.iter().map(|ids| ReplicaGroup::new(*ids)).collect()
}

/// All replica ids named by `groups`, in order of appearance.
pub fn flatten_replica_ids(groups: &[ReplicaGroup]) -> Vec<u64> {
    groups
        .iter()
        .flat_map(|g| g.replica_ids.iter().copied())
        .collect()
}

/// The distinct replica ids named by `groups`.
pub fn replica_id_set(groups: &[ReplicaGroup]) -> BTreeSet<u64> {
    groups
        .iter()
        .flat_map(|g| g.replica_ids.iter().copied())
        .collect()
}

/// A collective over these groups exchanges nothing: every group is a singleton.
pub fn is_noop_grouping(groups: &[ReplicaGroup]) -> bool {
    groups.iter().all(|g| g.len() <= 1)
}
