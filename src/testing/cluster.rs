//! Multi-node harness for rebalancing scenarios.
//!
//! A [`TestGrid`] wires N nodes (storage, dispatcher, coordinator) onto one
//! [`InMemoryNetwork`] and hands out topology exchanges with increasing
//! versions.

use super::chaos::{ChaosConfig, ChaosController};
use crate::config::RebalanceConfig;
use crate::error::{Error, Result};
use crate::network::{FaultInjector, InMemoryNetwork, MessageDispatcher};
use crate::partitioning::{Affinity, OwnershipMap, PartitionState, TopologyExchange};
use crate::rebalancing::{RebalanceCoordinator, RebalanceFuture};
use crate::storage::{GridEntry, InMemoryPartitionStorage};
use crate::types::{ExchangeId, ExchangeKind, GroupId, NodeId, PartitionId, TopologyVersion};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// One node of a [`TestGrid`].
#[derive(Debug, Clone)]
pub struct GridNode {
    pub id: NodeId,
    pub storage: Arc<InMemoryPartitionStorage>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub coordinator: Arc<RebalanceCoordinator>,
}

/// In-process cluster running one cache group.
#[derive(Debug)]
pub struct TestGrid {
    group_id: GroupId,
    config: RebalanceConfig,
    affinity: Affinity,
    network: Arc<InMemoryNetwork>,
    chaos: Arc<ChaosController>,
    nodes: BTreeMap<NodeId, GridNode>,
    version: TopologyVersion,
}

impl TestGrid {
    /// Create a grid on a reliable network. Must be called within a tokio runtime.
    pub fn new(nodes: &[NodeId], partitions: u32, config: RebalanceConfig) -> Result<Self> {
        Self::build(nodes, partitions, config, ChaosConfig::default())
    }

    /// Create a grid whose network is subject to chaos. Chaos starts disabled.
    pub fn with_chaos(
        nodes: &[NodeId],
        partitions: u32,
        config: RebalanceConfig,
        chaos: ChaosConfig,
    ) -> Result<Self> {
        Self::build(nodes, partitions, config, chaos)
    }

    fn build(
        nodes: &[NodeId],
        partitions: u32,
        config: RebalanceConfig,
        chaos: ChaosConfig,
    ) -> Result<Self> {
        let chaos = Arc::new(ChaosController::new(chaos));
        let mut grid = Self {
            group_id: 1,
            config,
            affinity: Affinity::new(partitions),
            network: InMemoryNetwork::with_faults(Arc::clone(&chaos) as Arc<dyn FaultInjector>),
            chaos,
            nodes: BTreeMap::new(),
            version: TopologyVersion::NONE,
        };

        for node in nodes {
            grid.add_node(*node)?;
        }
        Ok(grid)
    }

    /// Start a node and attach it to the network.
    pub fn add_node(&mut self, id: NodeId) -> Result<&GridNode> {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let transport = self.network.register(id, Arc::clone(&dispatcher));
        let storage = Arc::new(InMemoryPartitionStorage::new());

        let coordinator = Arc::new(RebalanceCoordinator::new(
            self.group_id,
            self.config.clone(),
            self.affinity,
            storage.clone(),
            transport,
        ));
        coordinator.register_handlers(&dispatcher);
        coordinator.start()?;

        let node = GridNode {
            id,
            storage,
            dispatcher,
            coordinator,
        };
        Ok(self.nodes.entry(id).or_insert(node))
    }

    /// Stop a node and detach it from the network.
    pub fn remove_node(&mut self, id: NodeId) -> Option<GridNode> {
        let node = self.nodes.remove(&id)?;
        node.coordinator.stop();
        self.network.unregister(id);
        Some(node)
    }

    /// A node by ID.
    pub fn node(&self, id: NodeId) -> Result<&GridNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| Error::Internal(format!("no node {}", id)))
    }

    /// Coordinator of a node.
    pub fn coordinator(&self, id: NodeId) -> Result<&Arc<RebalanceCoordinator>> {
        Ok(&self.node(id)?.coordinator)
    }

    /// Storage of a node.
    pub fn storage(&self, id: NodeId) -> Result<&Arc<InMemoryPartitionStorage>> {
        Ok(&self.node(id)?.storage)
    }

    /// IDs of all running nodes.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// The chaos controller of the network.
    pub fn chaos(&self) -> &Arc<ChaosController> {
        &self.chaos
    }

    /// The network.
    pub fn network(&self) -> &Arc<InMemoryNetwork> {
        &self.network
    }

    /// Number of partitions.
    pub fn partitions(&self) -> u32 {
        self.affinity.partitions()
    }

    /// Write `per_partition` entries into every partition of `node`.
    ///
    /// Returns the number of entries written.
    pub fn load(&self, node: NodeId, per_partition: usize, value_size: usize) -> Result<usize> {
        let storage = self.storage(node)?;
        let mut written = 0;
        for p in 0..self.partitions() {
            for i in 0..per_partition {
                let key = format!("p{:04}-key{:06}", p, i);
                if storage.put(p, GridEntry::new(key, vec![b'v'; value_size], 1))? {
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    /// Build the next exchange from explicit per-partition states.
    pub fn exchange(
        &mut self,
        kind: ExchangeKind,
        event_node: NodeId,
        states: impl Fn(PartitionId) -> Vec<(NodeId, PartitionState)>,
    ) -> TopologyExchange {
        self.version = self.version.next_major();

        let mut ownership = OwnershipMap::new();
        for p in 0..self.partitions() {
            ownership = ownership.with_partition(p, &states(p));
        }
        TopologyExchange::new(ExchangeId::new(self.version, event_node, kind), ownership)
    }

    /// `joining` becomes an owner of every partition held by `owners`.
    pub fn join_exchange(&mut self, owners: &[NodeId], joining: NodeId) -> TopologyExchange {
        let owners = owners.to_vec();
        self.exchange(ExchangeKind::NodeJoined, joining, move |_| {
            let mut states: Vec<_> = owners
                .iter()
                .map(|n| (*n, PartitionState::Owning))
                .collect();
            states.push((joining, PartitionState::Moving));
            states
        })
    }

    /// Deliver an exchange to every node. Returns the campaigns that started.
    pub fn apply(&self, exchange: &TopologyExchange) -> Result<BTreeMap<NodeId, RebalanceFuture>> {
        let mut started = BTreeMap::new();
        for (id, node) in &self.nodes {
            if let Some(future) = node.coordinator.on_topology_changed(exchange.clone())? {
                started.insert(*id, future);
            }
        }

        info!(
            topology_version = %exchange.version(),
            campaigns = started.len(),
            "Exchange applied"
        );
        Ok(started)
    }

    /// Whether `a` and `b` hold the same keys in `partition`.
    pub fn same_keys(&self, a: NodeId, b: NodeId, partition: PartitionId) -> Result<bool> {
        Ok(self.storage(a)?.keys(partition) == self.storage(b)?.keys(partition))
    }

    /// Stop every node.
    pub fn shutdown(&mut self) {
        for id in self.node_ids() {
            self.remove_node(id);
        }
    }
}
