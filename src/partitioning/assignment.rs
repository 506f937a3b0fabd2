//! Rebalance plan computation.
//!
//! For every partition the local node should own, the plan names where its data
//! comes from: it is already held locally, it is fetched from a supplier, or no
//! supplier exists and the partition is missed.

use super::topology::{OwnershipMap, PartitionState, TopologyExchange};
use crate::types::{NodeId, PartitionId, TopologyVersion};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Where the data of one partition comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionSource {
    /// The local node already owns the data.
    Local,
    /// Data is fetched from the given node.
    Supplier(NodeId),
    /// No node can supply the data.
    Missed,
}

/// Rebalance plan of one node for one topology version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    version: TopologyVersion,
    local_node: NodeId,
    sources: BTreeMap<PartitionId, PartitionSource>,
}

impl PartitionAssignment {
    /// An assignment with nothing to fetch.
    pub fn empty(version: TopologyVersion, local_node: NodeId) -> Self {
        Self {
            version,
            local_node,
            sources: BTreeMap::new(),
        }
    }

    /// Compute the plan of `local_node` from the ownership at `version`.
    ///
    /// Suppliers are chosen among nodes with an owning replica, preferring the
    /// one with the fewest partitions assigned so far and then the lowest id,
    /// which keeps the result deterministic and the load spread.
    pub fn compute(version: TopologyVersion, ownership: &OwnershipMap, local_node: NodeId) -> Self {
        let mut sources = BTreeMap::new();
        let mut load: HashMap<NodeId, usize> = HashMap::new();

        for (partition, owners) in ownership.iter() {
            if !owners.is_owner(local_node) {
                continue;
            }

            if owners.state(local_node) == Some(PartitionState::Owning) {
                sources.insert(partition, PartitionSource::Local);
                continue;
            }

            let supplier = owners
                .suppliers()
                .filter(|node| *node != local_node)
                .min_by_key(|node| (load.get(node).copied().unwrap_or(0), *node));

            let source = match supplier {
                Some(node) => {
                    *load.entry(node).or_insert(0) += 1;
                    PartitionSource::Supplier(node)
                }
                None => PartitionSource::Missed,
            };
            sources.insert(partition, source);
        }

        Self {
            version,
            local_node,
            sources,
        }
    }

    /// Compute the plan for an exchange result, marking lost partitions missed.
    pub fn for_exchange(exchange: &TopologyExchange, local_node: NodeId) -> Self {
        let mut assignment = Self::compute(exchange.version(), &exchange.ownership, local_node);

        for partition in &exchange.lost_partitions {
            if let Some(source) = assignment.sources.get_mut(partition) {
                if *source != PartitionSource::Local {
                    *source = PartitionSource::Missed;
                }
            }
        }

        assignment
    }

    /// Topology version the plan was computed for.
    pub fn version(&self) -> TopologyVersion {
        self.version
    }

    /// Node the plan belongs to.
    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Source of a partition, if the local node should own it.
    pub fn source(&self, partition: PartitionId) -> Option<PartitionSource> {
        self.sources.get(&partition).copied()
    }

    /// Iterate over all planned partitions.
    pub fn iter(&self) -> impl Iterator<Item = (PartitionId, PartitionSource)> + '_ {
        self.sources.iter().map(|(p, s)| (*p, *s))
    }

    /// Partitions grouped by the supplier they are fetched from.
    pub fn suppliers(&self) -> BTreeMap<NodeId, BTreeSet<PartitionId>> {
        let mut by_supplier: BTreeMap<NodeId, BTreeSet<PartitionId>> = BTreeMap::new();
        for (partition, source) in &self.sources {
            if let PartitionSource::Supplier(node) = source {
                by_supplier.entry(*node).or_default().insert(*partition);
            }
        }
        by_supplier
    }

    /// Partitions that have to be fetched from a supplier.
    pub fn partitions_to_fetch(&self) -> BTreeSet<PartitionId> {
        self.partitions_matching(|s| matches!(s, PartitionSource::Supplier(_)))
    }

    /// Partitions no node can supply.
    pub fn missed(&self) -> BTreeSet<PartitionId> {
        self.partitions_matching(|s| *s == PartitionSource::Missed)
    }

    /// Partitions already owned locally.
    pub fn local(&self) -> BTreeSet<PartitionId> {
        self.partitions_matching(|s| *s == PartitionSource::Local)
    }

    /// Whether any partition needs rebalancing (fetched or missed).
    pub fn needs_rebalance(&self) -> bool {
        self.sources.values().any(|s| *s != PartitionSource::Local)
    }

    /// Whether two plans move the same partitions from the same sources,
    /// regardless of version.
    pub fn same_plan(&self, other: &PartitionAssignment) -> bool {
        self.local_node == other.local_node && self.sources == other.sources
    }

    fn partitions_matching(&self, f: impl Fn(&PartitionSource) -> bool) -> BTreeSet<PartitionId> {
        self.sources
            .iter()
            .filter(|(_, s)| f(s))
            .map(|(p, _)| *p)
            .collect()
    }
}

impl fmt::Display for PartitionAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "assignment(ver={}, node={}, fetch={}, missed={}, local={})",
            self.version,
            self.local_node,
            self.partitions_to_fetch().len(),
            self.missed().len(),
            self.local().len()
        )
    }
}
