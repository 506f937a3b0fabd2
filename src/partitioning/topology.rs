//! Partition ownership as delivered by a topology exchange.

use crate::types::{ExchangeId, NodeId, PartitionId, TopologyVersion};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// State of a partition replica on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionState {
    /// Holds complete data and serves it.
    Owning,
    /// Assigned to the node but data is still being rebalanced.
    Moving,
    /// No longer assigned; data is kept until eviction.
    Renting,
    /// Data has been evicted.
    Evicted,
    /// Data was lost together with every owner.
    Lost,
}

impl PartitionState {
    /// Whether a replica in this state can supply data.
    pub fn can_supply(&self) -> bool {
        matches!(self, PartitionState::Owning)
    }
}

/// Owners of one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOwners {
    /// Affinity owners in priority order (primary first).
    pub owners: Vec<NodeId>,
    /// Replica state per node that holds (or held) the partition.
    pub states: BTreeMap<NodeId, PartitionState>,
}

impl PartitionOwners {
    /// State of the replica on `node`, if any.
    pub fn state(&self, node: NodeId) -> Option<PartitionState> {
        self.states.get(&node).copied()
    }

    /// Whether `node` is an affinity owner.
    pub fn is_owner(&self, node: NodeId) -> bool {
        self.owners.contains(&node)
    }

    /// Nodes able to supply the partition, in ascending node order.
    pub fn suppliers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.states
            .iter()
            .filter(|(_, state)| state.can_supply())
            .map(|(node, _)| *node)
    }
}

/// Partition to owners mapping for one topology version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipMap {
    partitions: BTreeMap<PartitionId, PartitionOwners>,
}

impl OwnershipMap {
    /// Create an empty ownership map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the affinity owners of a partition.
    pub fn set_owners(&mut self, partition: PartitionId, owners: Vec<NodeId>) {
        self.partitions.entry(partition).or_default().owners = owners;
    }

    /// Set the replica state of a partition on a node.
    pub fn set_state(&mut self, partition: PartitionId, node: NodeId, state: PartitionState) {
        self.partitions
            .entry(partition)
            .or_default()
            .states
            .insert(node, state);
    }

    /// Builder form of [`set_owners`](Self::set_owners) and [`set_state`](Self::set_state).
    pub fn with_partition(
        mut self,
        partition: PartitionId,
        owners: &[(NodeId, PartitionState)],
    ) -> Self {
        self.set_owners(partition, owners.iter().map(|(node, _)| *node).collect());
        for (node, state) in owners {
            self.set_state(partition, *node, *state);
        }
        self
    }

    /// Owners of a partition.
    pub fn get(&self, partition: PartitionId) -> Option<&PartitionOwners> {
        self.partitions.get(&partition)
    }

    /// State of a partition on a node.
    pub fn state(&self, partition: PartitionId, node: NodeId) -> Option<PartitionState> {
        self.partitions.get(&partition).and_then(|o| o.state(node))
    }

    /// Iterate over all partitions.
    pub fn iter(&self) -> impl Iterator<Item = (PartitionId, &PartitionOwners)> {
        self.partitions.iter().map(|(p, o)| (*p, o))
    }

    /// Number of partitions in the map.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Whether the map has no partitions.
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Partitions whose owners or replica states differ from `previous`.
    pub fn changed_since(&self, previous: &OwnershipMap) -> BTreeSet<PartitionId> {
        let mut changed: BTreeSet<PartitionId> = self
            .partitions
            .iter()
            .filter(|(p, owners)| previous.partitions.get(p) != Some(owners))
            .map(|(p, _)| *p)
            .collect();

        changed.extend(
            previous
                .partitions
                .keys()
                .filter(|p| !self.partitions.contains_key(p)),
        );

        changed
    }
}

/// Result of a completed topology exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyExchange {
    /// Exchange identifier, carrying the resulting topology version.
    pub id: ExchangeId,
    /// Partition ownership at the new version.
    pub ownership: OwnershipMap,
    /// Partitions whose every owner was lost.
    pub lost_partitions: BTreeSet<PartitionId>,
}

impl TopologyExchange {
    /// Create a new exchange result.
    pub fn new(id: ExchangeId, ownership: OwnershipMap) -> Self {
        Self {
            id,
            ownership,
            lost_partitions: BTreeSet::new(),
        }
    }

    /// Mark partitions as lost.
    pub fn with_lost_partitions(mut self, lost: impl IntoIterator<Item = PartitionId>) -> Self {
        self.lost_partitions.extend(lost);
        self
    }

    /// Topology version produced by this exchange.
    pub fn version(&self) -> TopologyVersion {
        self.id.version
    }
}
