//! On-demand key fetching.
//!
//! A read for a key whose partition is still being rebalanced cannot wait for
//! the whole campaign. The fetcher asks an owning node for exactly those keys
//! and writes the answer into local storage.

use crate::error::{Error, RebalanceError, Result};
use crate::metrics::RebalanceMetrics;
use crate::network::{ForceKeysRequest, ForceKeysResponse, Message, Transport};
use crate::partitioning::{Affinity, OwnershipMap, PartitionState};
use crate::storage::{GridEntry, PartitionStorage};
use crate::types::{GroupId, NodeId, PartitionId, TopologyVersion};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Outcome of an on-demand fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForceKeysResult {
    /// Entries written into local storage.
    pub fetched: usize,
    /// Keys already present locally in an owned partition.
    pub local: usize,
    /// Keys no owner had.
    pub missed: Vec<Bytes>,
}

/// Fetches specific keys from owning nodes.
pub struct ForceKeysFetcher {
    group_id: GroupId,
    local_node: NodeId,
    affinity: Affinity,
    timeout: Duration,
    storage: Arc<dyn PartitionStorage>,
    transport: Arc<dyn Transport>,
    metrics: Arc<RebalanceMetrics>,
    pending: RwLock<HashMap<u64, oneshot::Sender<ForceKeysResponse>>>,
    next_request_id: AtomicU64,
}

impl ForceKeysFetcher {
    /// Create a fetcher.
    pub fn new(
        group_id: GroupId,
        affinity: Affinity,
        timeout: Duration,
        storage: Arc<dyn PartitionStorage>,
        transport: Arc<dyn Transport>,
        metrics: Arc<RebalanceMetrics>,
    ) -> Self {
        Self {
            group_id,
            local_node: transport.local_node(),
            affinity,
            timeout,
            storage,
            transport,
            metrics,
            pending: RwLock::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fetch `keys` not yet owned locally from their owners.
    pub async fn fetch(
        &self,
        keys: Vec<Bytes>,
        version: TopologyVersion,
        ownership: &OwnershipMap,
    ) -> Result<ForceKeysResult> {
        let mut result = ForceKeysResult::default();
        let mut by_owner: BTreeMap<NodeId, Vec<(PartitionId, Bytes)>> = BTreeMap::new();

        for key in keys {
            let partition = self.affinity.partition(&key);
            let Some(owners) = ownership.get(partition) else {
                result.missed.push(key);
                continue;
            };

            if owners.state(self.local_node) == Some(PartitionState::Owning) {
                result.local += 1;
                continue;
            }

            // Prefer affinity owners in priority order, then any other holder.
            let owner = owners
                .owners
                .iter()
                .copied()
                .find(|n| *n != self.local_node && owners.state(*n) == Some(PartitionState::Owning))
                .or_else(|| owners.suppliers().find(|n| *n != self.local_node));

            match owner {
                Some(node) => by_owner.entry(node).or_default().push((partition, key)),
                None => {
                    debug!(group_id = self.group_id, partition, "No owner for forced key");
                    result.missed.push(key);
                }
            }
        }

        for (node, keys) in by_owner {
            let response = self.request_from(node, version, keys).await?;
            if let Some(reason) = response.error {
                return Err(RebalanceError::Remote { node, reason }.into());
            }

            let mut by_partition: BTreeMap<PartitionId, Vec<GridEntry>> = BTreeMap::new();
            for (partition, entry) in response.entries {
                by_partition.entry(partition).or_default().push(entry);
            }
            for (partition, entries) in by_partition {
                result.fetched += entries.len();
                self.storage.write_batch(partition, entries)?;
            }
            result.missed.extend(response.missed_keys);
        }

        Ok(result)
    }

    async fn request_from(
        &self,
        node: NodeId,
        version: TopologyVersion,
        keys: Vec<(PartitionId, Bytes)>,
    ) -> Result<ForceKeysResponse> {
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.write().insert(request_id, tx);
        self.metrics.force_key_requests.inc();

        debug!(
            group_id = self.group_id,
            node,
            request_id,
            keys = keys.len(),
            "Requesting forced keys"
        );

        let request = ForceKeysRequest {
            request_id,
            group_id: self.group_id,
            topology_version: version,
            keys,
        };

        if let Err(e) = self
            .transport
            .send(node, Message::ForceKeysRequest(request))
            .await
        {
            self.pending.write().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.write().remove(&request_id);
                Err(Error::Cancelled)
            }
            Err(_) => {
                self.pending.write().remove(&request_id);
                warn!(group_id = self.group_id, node, request_id, "Forced key fetch timed out");
                Err(Error::Timeout)
            }
        }
    }

    /// Complete the pending request a response belongs to.
    pub fn on_response(&self, response: ForceKeysResponse) {
        match self.pending.write().remove(&response.request_id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(
                group_id = self.group_id,
                request_id = response.request_id,
                "Dropping response to unknown forced key request"
            ),
        }
    }

    /// Fail every pending request.
    pub fn cancel_all(&self) {
        self.pending.write().clear();
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.read().len()
    }
}

impl std::fmt::Debug for ForceKeysFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForceKeysFetcher")
            .field("group_id", &self.group_id)
            .field("pending", &self.pending_requests())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryPartitionStorage;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Answers every request inline through the fetcher it is attached to.
    #[derive(Debug, Default)]
    struct LoopbackTransport {
        fetcher: Mutex<Option<Arc<ForceKeysFetcher>>>,
        remote: Arc<InMemoryPartitionStorage>,
        requests: AtomicU64,
        silent: bool,
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        fn local_node(&self) -> NodeId {
            1
        }

        async fn send(&self, _to: NodeId, message: Message) -> Result<()> {
            let Message::ForceKeysRequest(request) = message else {
                return Ok(());
            };
            self.requests.fetch_add(1, Ordering::Relaxed);
            if self.silent {
                return Ok(());
            }

            let mut entries = Vec::new();
            let mut missed_keys = Vec::new();
            for (partition, key) in &request.keys {
                match self.remote.read(*partition, key)? {
                    Some(entry) => entries.push((*partition, entry)),
                    None => missed_keys.push(key.clone()),
                }
            }

            let fetcher = self.fetcher.lock().clone();
            if let Some(fetcher) = fetcher {
                fetcher.on_response(ForceKeysResponse {
                    request_id: request.request_id,
                    group_id: request.group_id,
                    entries,
                    missed_keys,
                    error: None,
                });
            }
            Ok(())
        }
    }

    fn setup(silent: bool) -> (Arc<ForceKeysFetcher>, Arc<LoopbackTransport>, Arc<InMemoryPartitionStorage>) {
        let local = Arc::new(InMemoryPartitionStorage::new());
        let transport = Arc::new(LoopbackTransport {
            silent,
            ..Default::default()
        });
        let fetcher = Arc::new(ForceKeysFetcher::new(
            1,
            Affinity::new(4),
            Duration::from_millis(50),
            local.clone(),
            transport.clone(),
            Arc::new(RebalanceMetrics::new()),
        ));
        *transport.fetcher.lock() = Some(fetcher.clone());
        (fetcher, transport, local)
    }

    fn ownership(local_state: PartitionState) -> OwnershipMap {
        let mut map = OwnershipMap::new();
        for p in 0..4 {
            map = map.with_partition(p, &[(1, local_state), (2, PartitionState::Owning)]);
        }
        map
    }

    #[tokio::test]
    async fn test_fetches_missing_keys() {
        let (fetcher, transport, local) = setup(false);
        let affinity = Affinity::new(4);
        let key = Bytes::from_static(b"user:1");
        let partition = affinity.partition(&key);
        transport
            .remote
            .put(partition, GridEntry::new(key.clone(), "alice", 3))
            .unwrap();

        let result = fetcher
            .fetch(
                vec![key.clone(), Bytes::from_static(b"user:2")],
                TopologyVersion::new(1, 0),
                &ownership(PartitionState::Moving),
            )
            .await
            .unwrap();

        assert_eq!(result.fetched, 1);
        assert_eq!(result.missed, vec![Bytes::from_static(b"user:2")]);
        assert_eq!(local.read(partition, &key).unwrap().unwrap().version, 3);
        assert_eq!(fetcher.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_owned_keys_are_not_fetched() {
        let (fetcher, transport, _local) = setup(false);

        let result = fetcher
            .fetch(
                vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
                TopologyVersion::new(1, 0),
                &ownership(PartitionState::Owning),
            )
            .await
            .unwrap();

        assert_eq!(result.local, 2);
        assert_eq!(transport.requests.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_timeout() {
        let (fetcher, _transport, _local) = setup(true);

        let err = fetcher
            .fetch(
                vec![Bytes::from_static(b"a")],
                TopologyVersion::new(1, 0),
                &ownership(PartitionState::Moving),
            )
            .await
            .unwrap_err();

        assert_eq!(err, Error::Timeout);
        assert_eq!(fetcher.pending_requests(), 0);
    }
}
