//! Supply side of the rebalance protocol.
//!
//! Every demand is answered with one supply message per requested partition.
//! A message carries at most `batch_size` bytes of entries read after the
//! demanded resume token, or a per-partition error when the local node
//! cannot serve the partition at the demanded topology version.

use super::predicate::PreloadPredicate;
use crate::error::Result;
use crate::metrics::RebalanceMetrics;
use crate::network::{
    DemandMessage, ForceKeysRequest, ForceKeysResponse, Message, SupplyError, SupplyMessage,
    Transport,
};
use crate::partitioning::{OwnershipMap, PartitionState, TopologyExchange};
use crate::storage::{GridEntry, PartitionStorage, ResumeToken};
use crate::types::{GroupId, NodeId, PartitionId, TopologyVersion};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Supplier's view of partition ownership.
#[derive(Debug, Default)]
struct SupplierView {
    version: TopologyVersion,
    ownership: OwnershipMap,
    /// Version at which each partition last changed ownership.
    changed_at: HashMap<PartitionId, TopologyVersion>,
}

/// State of one demand stream, keyed by (demander node, demander index).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupplyContext {
    /// Latest campaign served on this stream.
    pub rebalance_id: u64,
    /// Topology version of that campaign.
    pub topology_version: TopologyVersion,
    /// Demands answered.
    pub demands_served: u64,
    /// Supply messages sent.
    pub messages_sent: u64,
    /// Entries sent.
    pub entries_sent: u64,
    /// Bytes sent.
    pub bytes_sent: u64,
}

/// Serves demands for one cache group from local storage.
pub struct Supplier {
    group_id: GroupId,
    local_node: NodeId,
    batch_size: usize,
    storage: Arc<dyn PartitionStorage>,
    transport: Arc<dyn Transport>,
    metrics: Arc<RebalanceMetrics>,
    view: RwLock<SupplierView>,
    predicate: RwLock<Option<PreloadPredicate>>,
    contexts: DashMap<(NodeId, u32), SupplyContext>,
}

impl Supplier {
    /// Create a supplier.
    pub fn new(
        group_id: GroupId,
        batch_size: usize,
        storage: Arc<dyn PartitionStorage>,
        transport: Arc<dyn Transport>,
        metrics: Arc<RebalanceMetrics>,
    ) -> Self {
        Self {
            group_id,
            local_node: transport.local_node(),
            batch_size: batch_size.max(1),
            storage,
            transport,
            metrics,
            view: RwLock::new(SupplierView::default()),
            predicate: RwLock::new(None),
            contexts: DashMap::new(),
        }
    }

    /// Adopt the ownership of a completed exchange.
    ///
    /// Older exchanges are ignored. Streams of nodes that no longer appear in
    /// the ownership are dropped.
    pub fn update_topology(&self, exchange: &TopologyExchange) {
        let mut view = self.view.write();
        if exchange.version() < view.version {
            return;
        }

        let version = exchange.version();
        for partition in exchange.ownership.changed_since(&view.ownership) {
            view.changed_at.insert(partition, version);
        }
        for partition in &exchange.lost_partitions {
            view.changed_at.insert(*partition, version);
        }
        view.version = version;
        view.ownership = exchange.ownership.clone();

        let nodes: BTreeSet<NodeId> = view
            .ownership
            .iter()
            .flat_map(|(_, owners)| owners.states.keys().copied())
            .collect();
        drop(view);

        self.contexts.retain(|(node, _), _| nodes.contains(node));
    }

    /// Set or clear the preload predicate.
    pub fn set_predicate(&self, predicate: Option<PreloadPredicate>) {
        *self.predicate.write() = predicate;
    }

    /// Topology version of the current view.
    pub fn topology_version(&self) -> TopologyVersion {
        self.view.read().version
    }

    /// Snapshot of all demand streams.
    pub fn contexts(&self) -> Vec<((NodeId, u32), SupplyContext)> {
        let mut contexts: Vec<_> = self
            .contexts
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        contexts.sort_by_key(|(key, _)| *key);
        contexts
    }

    /// Answer a demand from `from`.
    pub async fn handle_demand(&self, from: NodeId, demand: DemandMessage) -> Result<()> {
        let stream = (from, demand.demander_index);

        // The exchange has not reached this node yet; the demander retries.
        if demand.topology_version > self.topology_version() {
            debug!(
                group_id = self.group_id,
                demander = from,
                topology_version = %demand.topology_version,
                local_version = %self.topology_version(),
                "Demand ahead of local topology, not served"
            );
            return Ok(());
        }

        {
            let mut ctx = self.contexts.entry(stream).or_default();
            if demand.rebalance_id < ctx.rebalance_id {
                debug!(
                    group_id = self.group_id,
                    demander = from,
                    rebalance_id = demand.rebalance_id,
                    current = ctx.rebalance_id,
                    "Ignoring demand from a superseded campaign"
                );
                return Ok(());
            }
            ctx.rebalance_id = demand.rebalance_id;
            ctx.topology_version = demand.topology_version;
            ctx.demands_served += 1;
        }

        let replies = self.build_replies(&demand);

        let mut entries_sent = 0;
        let mut bytes_sent = 0;
        let mut messages_sent = 0;

        for reply in replies {
            let entries = reply.entries.len() as u64;
            let bytes = reply.estimated_bytes;

            if let Err(e) = self.transport.send(from, Message::Supply(reply)).await {
                warn!(
                    group_id = self.group_id,
                    demander = from,
                    error = %e,
                    "Failed to send supply message"
                );
                break;
            }

            self.metrics.supply_messages_sent.inc();
            messages_sent += 1;
            entries_sent += entries;
            bytes_sent += bytes;
        }

        if let Some(mut ctx) = self.contexts.get_mut(&stream) {
            ctx.messages_sent += messages_sent;
            ctx.entries_sent += entries_sent;
            ctx.bytes_sent += bytes_sent;
        }

        debug!(
            group_id = self.group_id,
            demander = from,
            rebalance_id = demand.rebalance_id,
            sequence = demand.sequence,
            messages = messages_sent,
            entries = entries_sent,
            bytes = bytes_sent,
            "Demand served"
        );

        Ok(())
    }

    /// Build the replies to a demand. Only storage iterators are used, no lock
    /// is held once this returns.
    fn build_replies(&self, demand: &DemandMessage) -> Vec<SupplyMessage> {
        let predicate = self.predicate.read().clone();
        let checks: Vec<(PartitionId, Option<SupplyError>)> = {
            let view = self.view.read();
            demand
                .partitions
                .keys()
                .map(|p| (*p, self.check_partition(&view, *p, demand.topology_version)))
                .collect()
        };

        checks
            .into_iter()
            .map(|(partition, check)| match check {
                Some(err) => {
                    debug!(
                        group_id = self.group_id,
                        partition,
                        error = %err,
                        "Cannot supply partition"
                    );
                    SupplyMessage::error(demand, partition, err)
                }
                None => {
                    let from = demand.partitions.get(&partition).cloned().flatten();
                    self.read_batch(demand, partition, from.as_ref(), predicate.as_ref())
                }
            })
            .collect()
    }

    fn check_partition(
        &self,
        view: &SupplierView,
        partition: PartitionId,
        demanded: TopologyVersion,
    ) -> Option<SupplyError> {
        if view
            .changed_at
            .get(&partition)
            .is_some_and(|changed| *changed > demanded)
        {
            return Some(SupplyError::ExpiredTopology);
        }

        let owners = view.ownership.get(partition);
        match owners.and_then(|o| o.state(self.local_node)) {
            Some(PartitionState::Owning) => None,
            Some(PartitionState::Renting) | Some(PartitionState::Evicted) => {
                Some(SupplyError::Reassigned)
            }
            None if !owners.is_some_and(|o| o.is_owner(self.local_node)) => {
                Some(SupplyError::Reassigned)
            }
            _ => Some(SupplyError::PartitionMissing),
        }
    }

    fn read_batch(
        &self,
        demand: &DemandMessage,
        partition: PartitionId,
        from: Option<&ResumeToken>,
        predicate: Option<&PreloadPredicate>,
    ) -> SupplyMessage {
        let iter = match self.storage.iterate(partition, from) {
            Ok(iter) => iter,
            Err(e) => {
                error!(
                    group_id = self.group_id,
                    partition,
                    error = %e,
                    "Failed to iterate partition"
                );
                return SupplyMessage::error(demand, partition, SupplyError::PartitionMissing);
            }
        };

        let mut batch: Vec<GridEntry> = Vec::new();
        let mut bytes = 0;
        let mut last = true;

        for entry in iter {
            if predicate.is_some_and(|p| !p(partition, &entry)) {
                continue;
            }
            let size = entry.size();
            if !batch.is_empty() && bytes + size > self.batch_size {
                last = false;
                break;
            }
            bytes += size;
            batch.push(entry);
        }

        SupplyMessage::batch(demand, partition, batch, last)
    }

    /// Answer an on-demand key fetch from `from`.
    pub async fn handle_force_keys(&self, from: NodeId, request: ForceKeysRequest) -> Result<()> {
        let response = self.read_keys(&request);
        self.transport
            .send(from, Message::ForceKeysResponse(response))
            .await
    }

    fn read_keys(&self, request: &ForceKeysRequest) -> ForceKeysResponse {
        let mut entries = Vec::new();
        let mut missed_keys = Vec::new();

        for (partition, key) in &request.keys {
            let owning = self.view.read().ownership.state(*partition, self.local_node)
                == Some(PartitionState::Owning);
            if !owning {
                missed_keys.push(key.clone());
                continue;
            }

            match self.storage.read(*partition, key) {
                Ok(Some(entry)) => entries.push((*partition, entry)),
                Ok(None) => missed_keys.push(key.clone()),
                Err(e) => return ForceKeysResponse::error(request, e.to_string()),
            }
        }

        ForceKeysResponse {
            request_id: request.request_id,
            group_id: request.group_id,
            entries,
            missed_keys,
            error: None,
        }
    }
}

impl std::fmt::Debug for Supplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supplier")
            .field("group_id", &self.group_id)
            .field("local_node", &self.local_node)
            .field("topology_version", &self.topology_version())
            .field("streams", &self.contexts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryPartitionStorage;
    use crate::types::{ExchangeId, ExchangeKind};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use PartitionState::*;

    const LOCAL: NodeId = 2;
    const DEMANDER: NodeId = 1;

    #[derive(Debug, Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(NodeId, Message)>>,
    }

    impl RecordingTransport {
        fn supplies(&self) -> Vec<SupplyMessage> {
            self.sent
                .lock()
                .iter()
                .filter_map(|(_, m)| match m {
                    Message::Supply(s) => Some(s.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn local_node(&self) -> NodeId {
            LOCAL
        }

        async fn send(&self, to: NodeId, message: Message) -> Result<()> {
            self.sent.lock().push((to, message));
            Ok(())
        }
    }

    fn exchange(version: TopologyVersion, map: OwnershipMap) -> TopologyExchange {
        TopologyExchange::new(ExchangeId::new(version, DEMANDER, ExchangeKind::NodeJoined), map)
    }

    fn setup(batch_size: usize) -> (Supplier, Arc<InMemoryPartitionStorage>, Arc<RecordingTransport>) {
        let storage = Arc::new(InMemoryPartitionStorage::new());
        let transport = Arc::new(RecordingTransport::default());
        let supplier = Supplier::new(
            1,
            batch_size,
            storage.clone(),
            transport.clone(),
            Arc::new(RebalanceMetrics::new()),
        );

        let map = OwnershipMap::new()
            .with_partition(0, &[(DEMANDER, Moving), (LOCAL, Owning)])
            .with_partition(1, &[(DEMANDER, Moving), (LOCAL, Moving)])
            .with_partition(2, &[(DEMANDER, Moving), (3, Owning)]);
        supplier.update_topology(&exchange(TopologyVersion::new(1, 0), map));

        (supplier, storage, transport)
    }

    fn demand(version: TopologyVersion, rebalance_id: u64, partitions: &[(PartitionId, Option<ResumeToken>)]) -> DemandMessage {
        DemandMessage {
            group_id: 1,
            topology_version: version,
            rebalance_id,
            demander_index: 0,
            sequence: 1,
            partitions: partitions.iter().cloned().collect::<BTreeMap<_, _>>(),
            timeout_ms: 1_000,
        }
    }

    fn fill(storage: &InMemoryPartitionStorage, n: usize) {
        for i in 0..n {
            storage
                .put(0, GridEntry::new(format!("k-{:03}", i), "0123456789", 1))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_batches_respect_byte_budget() {
        let entry_size = GridEntry::new("k-000", "0123456789", 1).size();
        let (supplier, storage, transport) = setup(entry_size * 4);
        fill(&storage, 10);

        supplier
            .handle_demand(DEMANDER, demand(TopologyVersion::new(1, 0), 1, &[(0, None)]))
            .await
            .unwrap();

        let supplies = transport.supplies();
        assert_eq!(supplies.len(), 1);
        assert_eq!(supplies[0].entries.len(), 4);
        assert!(!supplies[0].last);
        assert_eq!(supplies[0].next_token, Some(ResumeToken::after("k-003")));
    }

    #[tokio::test]
    async fn test_resume_reaches_end() {
        let (supplier, storage, transport) = setup(1024 * 1024);
        fill(&storage, 10);

        let token = Some(ResumeToken::after("k-006"));
        supplier
            .handle_demand(DEMANDER, demand(TopologyVersion::new(1, 0), 1, &[(0, token)]))
            .await
            .unwrap();

        let supply = &transport.supplies()[0];
        assert_eq!(supply.entries.len(), 3);
        assert!(supply.last);
    }

    #[tokio::test]
    async fn test_partition_errors() {
        let (supplier, _storage, transport) = setup(1024);

        supplier
            .handle_demand(
                DEMANDER,
                demand(TopologyVersion::new(1, 0), 1, &[(1, None), (2, None)]),
            )
            .await
            .unwrap();

        let supplies = transport.supplies();
        assert_eq!(supplies[0].error, Some(SupplyError::PartitionMissing));
        assert_eq!(supplies[1].error, Some(SupplyError::Reassigned));
    }

    #[tokio::test]
    async fn test_expired_topology() {
        let (supplier, _storage, transport) = setup(1024);

        let newer = OwnershipMap::new()
            .with_partition(0, &[(DEMANDER, Moving), (LOCAL, Owning), (3, Moving)]);
        supplier.update_topology(&exchange(TopologyVersion::new(2, 0), newer));

        supplier
            .handle_demand(DEMANDER, demand(TopologyVersion::new(1, 0), 1, &[(0, None)]))
            .await
            .unwrap();

        assert_eq!(
            transport.supplies()[0].error,
            Some(SupplyError::ExpiredTopology)
        );
    }

    #[tokio::test]
    async fn test_demand_ahead_of_local_topology_unanswered() {
        let (supplier, storage, transport) = setup(1024);
        fill(&storage, 3);

        supplier
            .handle_demand(DEMANDER, demand(TopologyVersion::new(3, 0), 1, &[(0, None)]))
            .await
            .unwrap();

        assert!(transport.supplies().is_empty());
        assert!(supplier.contexts().is_empty());
    }

    #[tokio::test]
    async fn test_predicate_skips_entries() {
        let (supplier, storage, transport) = setup(1024 * 1024);
        fill(&storage, 4);
        supplier.set_predicate(Some(Arc::new(|_: PartitionId, e: &GridEntry| {
            e.key.as_ref() != b"k-001"
        })));

        supplier
            .handle_demand(DEMANDER, demand(TopologyVersion::new(1, 0), 1, &[(0, None)]))
            .await
            .unwrap();

        let keys: Vec<Bytes> = transport.supplies()[0]
            .entries
            .iter()
            .map(|e| e.key.clone())
            .collect();
        assert_eq!(keys.len(), 3);
        assert!(!keys.contains(&Bytes::from_static(b"k-001")));
    }

    #[tokio::test]
    async fn test_superseded_stream_ignored() {
        let (supplier, _storage, transport) = setup(1024);

        supplier
            .handle_demand(DEMANDER, demand(TopologyVersion::new(1, 0), 5, &[(0, None)]))
            .await
            .unwrap();
        supplier
            .handle_demand(DEMANDER, demand(TopologyVersion::new(1, 0), 4, &[(0, None)]))
            .await
            .unwrap();

        assert_eq!(transport.supplies().len(), 1);
        let contexts = supplier.contexts();
        assert_eq!(contexts[0].0, (DEMANDER, 0));
        assert_eq!(contexts[0].1.rebalance_id, 5);
        assert_eq!(contexts[0].1.demands_served, 1);
    }

    #[tokio::test]
    async fn test_force_keys() {
        let (supplier, storage, transport) = setup(1024);
        fill(&storage, 2);

        let request = ForceKeysRequest {
            request_id: 9,
            group_id: 1,
            topology_version: TopologyVersion::new(1, 0),
            keys: vec![
                (0, Bytes::from_static(b"k-000")),
                (0, Bytes::from_static(b"nope")),
                (1, Bytes::from_static(b"k-000")),
            ],
        };
        supplier.handle_force_keys(DEMANDER, request).await.unwrap();

        let sent = transport.sent.lock();
        let Message::ForceKeysResponse(response) = &sent[0].1 else {
            panic!("expected force keys response");
        };
        assert_eq!(response.request_id, 9);
        assert_eq!(response.entries.len(), 1);
        assert_eq!(response.missed_keys.len(), 2);
    }
}
