//! Demand side of the rebalance protocol.
//!
//! One [`Demander`] runs per supplier node of a campaign. It repeatedly
//! demands a batch of outstanding partitions, waits for the matching supply
//! messages and applies them to local storage.
//!
//! ```text
//!            ┌──────────────────────────────────────────┐
//!            ▼                                          │
//! IDLE → DEMANDING → AWAITING_SUPPLY → APPLYING ────────┤
//!            │               │                          │
//!            │               └── timeout: retry/missed ─┘
//!            ▼
//!     DONE | CANCELLED
//! ```
//!
//! Progress per partition is a resume token. A supply message is applied only
//! if it continues from the current token, so duplicated or late messages are
//! dropped without touching storage or progress.

use super::future::RebalanceFuture;
use super::pause::PauseGate;
use super::predicate::PreloadPredicate;
use crate::config::RebalanceConfig;
use crate::metrics::RebalanceMetrics;
use crate::network::{DemandMessage, Message, SupplyError, SupplyMessage, Transport};
use crate::storage::{GridEntry, PartitionStorage, ResumeToken};
use crate::types::{GroupId, NodeId, PartitionId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State of a demander.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DemanderState {
    Idle = 0,
    Demanding = 1,
    AwaitingSupply = 2,
    Applying = 3,
    Done = 4,
    Cancelled = 5,
}

impl DemanderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => DemanderState::Idle,
            1 => DemanderState::Demanding,
            2 => DemanderState::AwaitingSupply,
            3 => DemanderState::Applying,
            4 => DemanderState::Done,
            _ => DemanderState::Cancelled,
        }
    }

    /// Whether the demander has stopped.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DemanderState::Done | DemanderState::Cancelled)
    }
}

impl fmt::Display for DemanderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DemanderState::Idle => "IDLE",
            DemanderState::Demanding => "DEMANDING",
            DemanderState::AwaitingSupply => "AWAITING_SUPPLY",
            DemanderState::Applying => "APPLYING",
            DemanderState::Done => "DONE",
            DemanderState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Dependencies shared by the demanders of one cache group.
#[derive(Clone)]
pub struct DemanderContext {
    pub group_id: GroupId,
    pub config: RebalanceConfig,
    pub storage: Arc<dyn PartitionStorage>,
    pub transport: Arc<dyn Transport>,
    pub pause: Arc<PauseGate>,
    pub metrics: Arc<RebalanceMetrics>,
    pub predicate: Option<PreloadPredicate>,
}

/// Per-demander counters.
#[derive(Debug, Default)]
pub struct DemanderStats {
    demands_sent: AtomicU64,
    supplies_received: AtomicU64,
    entries_applied: AtomicU64,
    bytes_received: AtomicU64,
    duplicates_dropped: AtomicU64,
    retries: AtomicU64,
    first_demand_at: Mutex<Option<Instant>>,
    last_demand_at: Mutex<Option<Instant>>,
}

impl DemanderStats {
    fn record_demand(&self) {
        let now = Instant::now();
        self.demands_sent.fetch_add(1, Ordering::Relaxed);
        self.first_demand_at.lock().get_or_insert(now);
        *self.last_demand_at.lock() = Some(now);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> DemanderStatsSnapshot {
        let first = *self.first_demand_at.lock();
        let last = *self.last_demand_at.lock();

        DemanderStatsSnapshot {
            demands_sent: self.demands_sent.load(Ordering::Relaxed),
            supplies_received: self.supplies_received.load(Ordering::Relaxed),
            entries_applied: self.entries_applied.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            demand_span: first.zip(last).map(|(first, last)| last.duration_since(first)),
        }
    }
}

/// Snapshot of [`DemanderStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemanderStatsSnapshot {
    pub demands_sent: u64,
    pub supplies_received: u64,
    pub entries_applied: u64,
    pub bytes_received: u64,
    pub duplicates_dropped: u64,
    pub retries: u64,
    /// Time between the first and the last demand sent.
    pub demand_span: Option<Duration>,
}

/// Worker fetching the partitions of one campaign from one supplier.
pub struct Demander {
    supplier: NodeId,
    index: u32,
    future: RebalanceFuture,
    ctx: DemanderContext,
    /// Outstanding partitions and where to resume each.
    tokens: BTreeMap<PartitionId, Option<ResumeToken>>,
    retries: HashMap<PartitionId, u32>,
    sequence: u64,
    state: Arc<AtomicU8>,
    stats: Arc<DemanderStats>,
    inbox: mpsc::UnboundedReceiver<SupplyMessage>,
}

impl Demander {
    /// Start a demander task for `partitions` supplied by `supplier`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        supplier: NodeId,
        index: u32,
        partitions: BTreeSet<PartitionId>,
        future: RebalanceFuture,
        ctx: DemanderContext,
    ) -> DemanderHandle {
        let (tx, inbox) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(DemanderState::Idle as u8));
        let stats = Arc::new(DemanderStats::default());

        let demander = Demander {
            supplier,
            index,
            future: future.clone(),
            ctx,
            tokens: partitions.iter().map(|p| (*p, None)).collect(),
            retries: HashMap::new(),
            sequence: 0,
            state: Arc::clone(&state),
            stats: Arc::clone(&stats),
            inbox,
        };

        let task = tokio::spawn(demander.run());

        DemanderHandle {
            supplier,
            index,
            partitions,
            future,
            state,
            stats,
            tx,
            task,
        }
    }

    async fn run(mut self) {
        let cancel = self.future.cancellation_token();
        self.ctx.metrics.active_demanders.inc();

        info!(
            group_id = self.ctx.group_id,
            supplier = self.supplier,
            topology_version = %self.future.topology_version(),
            rebalance_id = self.future.rebalance_id(),
            partitions = self.tokens.len(),
            "Demander started"
        );

        let outcome = self.demand_loop(&cancel).await;
        self.set_state(outcome);
        self.ctx.metrics.active_demanders.dec();

        let stats = self.stats.snapshot();
        match outcome {
            DemanderState::Done => info!(
                group_id = self.ctx.group_id,
                supplier = self.supplier,
                rebalance_id = self.future.rebalance_id(),
                demands = stats.demands_sent,
                entries = stats.entries_applied,
                bytes = stats.bytes_received,
                "Demander finished"
            ),
            _ => debug!(
                group_id = self.ctx.group_id,
                supplier = self.supplier,
                rebalance_id = self.future.rebalance_id(),
                outstanding = self.tokens.len(),
                "Demander cancelled"
            ),
        }
    }

    async fn demand_loop(&mut self, cancel: &CancellationToken) -> DemanderState {
        let mut first = true;

        loop {
            if cancel.is_cancelled() {
                return DemanderState::Cancelled;
            }
            if self.tokens.is_empty() {
                return DemanderState::Done;
            }

            if self.ctx.pause.is_paused() {
                debug!(
                    group_id = self.ctx.group_id,
                    supplier = self.supplier,
                    "Demander paused"
                );
            }
            if !self.ctx.pause.wait_resumed(cancel).await {
                return DemanderState::Cancelled;
            }

            let throttle = self.ctx.config.throttle;
            if !first && !throttle.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(throttle) => {}
                    _ = cancel.cancelled() => return DemanderState::Cancelled,
                }
            }
            first = false;

            let mut awaiting = self.send_demand().await;
            self.set_state(DemanderState::AwaitingSupply);

            while !awaiting.is_empty() {
                let received = tokio::select! {
                    _ = cancel.cancelled() => return DemanderState::Cancelled,
                    r = tokio::time::timeout(self.ctx.config.timeout, self.inbox.recv()) => r,
                };

                match received {
                    Err(_) => {
                        self.on_timeout(&awaiting);
                        break;
                    }
                    Ok(None) => return DemanderState::Cancelled,
                    Ok(Some(msg)) => {
                        self.set_state(DemanderState::Applying);
                        if !self.on_supply(msg, &mut awaiting) {
                            return DemanderState::Cancelled;
                        }
                        self.set_state(DemanderState::AwaitingSupply);
                    }
                }
            }
        }
    }

    /// Demand the next batch of partitions and return the ones now awaited.
    async fn send_demand(&mut self) -> BTreeSet<PartitionId> {
        self.set_state(DemanderState::Demanding);
        self.sequence += 1;

        let partitions: BTreeMap<PartitionId, Option<ResumeToken>> = self
            .tokens
            .iter()
            .take(self.ctx.config.batches_prefetch_count.max(1))
            .map(|(p, t)| (*p, t.clone()))
            .collect();

        for partition in partitions.keys() {
            self.future.on_partition_started(*partition);
        }
        let awaiting: BTreeSet<PartitionId> = partitions.keys().copied().collect();

        let demand = DemandMessage {
            group_id: self.ctx.group_id,
            topology_version: self.future.topology_version(),
            rebalance_id: self.future.rebalance_id(),
            demander_index: self.index,
            sequence: self.sequence,
            partitions,
            timeout_ms: self.ctx.config.timeout.as_millis() as u64,
        };

        debug!(
            group_id = self.ctx.group_id,
            supplier = self.supplier,
            rebalance_id = self.future.rebalance_id(),
            sequence = self.sequence,
            partitions = ?awaiting,
            "Sending demand"
        );

        self.stats.record_demand();
        self.ctx.metrics.demand_messages_sent.inc();

        // A failed send is handled like a lost message: the wait times out and retries.
        if let Err(e) = self
            .ctx
            .transport
            .send(self.supplier, Message::Demand(demand))
            .await
        {
            warn!(
                group_id = self.ctx.group_id,
                supplier = self.supplier,
                error = %e,
                "Failed to send demand"
            );
        }

        awaiting
    }

    fn on_timeout(&mut self, awaiting: &BTreeSet<PartitionId>) {
        let max_retries = self.ctx.config.max_retries;

        for partition in awaiting {
            let retries = self.retries.entry(*partition).or_insert(0);
            *retries += 1;

            if *retries > max_retries {
                warn!(
                    group_id = self.ctx.group_id,
                    supplier = self.supplier,
                    partition,
                    retries = max_retries,
                    "No supply after retries, partition missed"
                );
                self.tokens.remove(partition);
                if self.future.on_partition_missed(*partition) {
                    self.ctx.metrics.partitions_missed.inc();
                }
            } else {
                debug!(
                    group_id = self.ctx.group_id,
                    supplier = self.supplier,
                    partition,
                    attempt = *retries,
                    "Supply timed out, retrying demand"
                );
                self.future.on_partition_reset(*partition);
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                self.ctx.metrics.demand_retries.inc();
            }
        }
    }

    /// Handle one supply message. Returns false if the demander must stop.
    fn on_supply(&mut self, msg: SupplyMessage, awaiting: &mut BTreeSet<PartitionId>) -> bool {
        self.stats.supplies_received.fetch_add(1, Ordering::Relaxed);
        let partition = msg.partition;

        let expected = msg.rebalance_id == self.future.rebalance_id()
            && msg.topology_version == self.future.topology_version()
            && awaiting.contains(&partition)
            && self.tokens.get(&partition) == Some(&msg.resume_from);

        if !expected {
            debug!(
                group_id = self.ctx.group_id,
                supplier = self.supplier,
                partition,
                rebalance_id = msg.rebalance_id,
                sequence = msg.sequence,
                "Dropping stale or duplicate supply message"
            );
            self.stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            self.ctx.metrics.duplicates_dropped.inc();
            return true;
        }

        if let Some(err) = msg.error {
            awaiting.remove(&partition);
            self.tokens.remove(&partition);
            self.on_supply_error(partition, err);
            return true;
        }

        let SupplyMessage {
            entries,
            next_token,
            last,
            estimated_bytes,
            ..
        } = msg;

        let entries: Vec<GridEntry> = match &self.ctx.predicate {
            Some(predicate) => entries
                .into_iter()
                .filter(|e| predicate(partition, e))
                .collect(),
            None => entries,
        };

        let storage = &self.ctx.storage;
        let applied = self.future.try_apply(|| {
            if entries.is_empty() {
                Ok(0)
            } else {
                storage.write_batch(partition, entries)
            }
        });

        match applied {
            None => false,
            Some(Err(e)) => {
                error!(
                    group_id = self.ctx.group_id,
                    supplier = self.supplier,
                    partition,
                    error = %e,
                    "Failed to apply supply batch"
                );
                self.future.fail(e);
                false
            }
            Some(Ok(count)) => {
                self.stats
                    .entries_applied
                    .fetch_add(count as u64, Ordering::Relaxed);
                self.stats
                    .bytes_received
                    .fetch_add(estimated_bytes, Ordering::Relaxed);
                self.ctx.metrics.entries_applied.inc_by(count as u64);
                self.ctx.metrics.bytes_received.inc_by(estimated_bytes);

                awaiting.remove(&partition);
                self.retries.remove(&partition);

                if last {
                    self.tokens.remove(&partition);
                    if self.future.on_partition_done(partition) {
                        self.ctx.metrics.partitions_done.inc();
                        debug!(
                            group_id = self.ctx.group_id,
                            supplier = self.supplier,
                            partition,
                            "Partition rebalanced"
                        );
                    }
                } else {
                    self.tokens.insert(partition, next_token);
                }
                true
            }
        }
    }

    fn on_supply_error(&self, partition: PartitionId, err: SupplyError) {
        match err {
            SupplyError::PartitionMissing => {
                warn!(
                    group_id = self.ctx.group_id,
                    supplier = self.supplier,
                    partition,
                    "Supplier has no data, partition missed"
                );
                if self.future.on_partition_missed(partition) {
                    self.ctx.metrics.partitions_missed.inc();
                }
            }
            SupplyError::Reassigned | SupplyError::ExpiredTopology => {
                debug!(
                    group_id = self.ctx.group_id,
                    supplier = self.supplier,
                    partition,
                    error = %err,
                    "Abandoning partition, a newer plan owns it"
                );
                self.future.on_partition_reset(partition);
            }
        }
    }

    fn set_state(&self, state: DemanderState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Coordinator-side handle to a running [`Demander`].
pub struct DemanderHandle {
    supplier: NodeId,
    index: u32,
    partitions: BTreeSet<PartitionId>,
    future: RebalanceFuture,
    state: Arc<AtomicU8>,
    stats: Arc<DemanderStats>,
    tx: mpsc::UnboundedSender<SupplyMessage>,
    task: JoinHandle<()>,
}

impl DemanderHandle {
    /// Supplier node.
    pub fn supplier(&self) -> NodeId {
        self.supplier
    }

    /// Demander index on this node.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Partitions assigned to the demander.
    pub fn partitions(&self) -> &BTreeSet<PartitionId> {
        &self.partitions
    }

    /// Campaign the demander works for.
    pub fn future(&self) -> &RebalanceFuture {
        &self.future
    }

    /// Current state.
    pub fn state(&self) -> DemanderState {
        DemanderState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Counters.
    pub fn stats(&self) -> DemanderStatsSnapshot {
        self.stats.snapshot()
    }

    /// Hand a supply message to the demander. Returns false if it has stopped.
    pub fn deliver(&self, msg: SupplyMessage) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to exit.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

impl fmt::Debug for DemanderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DemanderHandle")
            .field("supplier", &self.supplier)
            .field("index", &self.index)
            .field("state", &self.state())
            .field("partitions", &self.partitions.len())
            .finish()
    }
}
