//! Rebalance coordinator for one cache group.
//!
//! The coordinator owns the active campaign and its demanders. Every plan
//! transition (prepare, topology change, force, stop, reconnect) runs under a
//! single state write lock; progress queries and message routing take the
//! read lock. Campaigns are cancelled only after the lock is released, because
//! cancellation runs listeners that may call back into the coordinator.

use super::completion::Completion;
use super::demander::{Demander, DemanderContext, DemanderHandle, DemanderState, DemanderStatsSnapshot};
use super::force_keys::{ForceKeysFetcher, ForceKeysResult};
use super::future::{CompoundRebalanceFuture, RebalanceFuture, RebalanceResult};
use super::pause::PauseGate;
use super::predicate::PreloadPredicate;
use super::supplier::{SupplyContext, Supplier};
use crate::config::RebalanceConfig;
use crate::error::{Error, RebalanceError, Result};
use crate::metrics::{RebalanceMetrics, RebalanceMetricsSnapshot};
use crate::network::{DemandMessage, Message, MessageDispatcher, MessageHandler, SupplyMessage, Transport};
use crate::partitioning::{Affinity, PartitionAssignment, PartitionState, TopologyExchange};
use crate::storage::PartitionStorage;
use crate::types::{GroupId, NodeId, PartitionId, TopologyVersion};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Finished campaigns kept for diagnostics.
const MAX_HISTORY: usize = 100;

/// Summary of a finished campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignSummary {
    pub rebalance_id: u64,
    pub topology_version: TopologyVersion,
    pub outcome: RebalanceResult,
    pub duration: Duration,
    pub done: usize,
    pub missed: usize,
}

impl fmt::Display for CampaignSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={} ver={} outcome={} duration={:?} done={} missed={}",
            self.rebalance_id,
            self.topology_version,
            self.outcome,
            self.duration,
            self.done,
            self.missed
        )
    }
}

/// Diagnostic view of one demander.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemanderDebugInfo {
    pub supplier: NodeId,
    pub index: u32,
    pub state: DemanderState,
    pub partitions: BTreeSet<PartitionId>,
    pub stats: DemanderStatsSnapshot,
}

/// Diagnostic dump of a coordinator.
#[derive(Debug, Clone)]
pub struct RebalanceDebugInfo {
    pub group_id: GroupId,
    pub local_node: NodeId,
    pub topology_version: Option<TopologyVersion>,
    pub started: bool,
    pub stopped: bool,
    pub paused: bool,
    pub active: Option<String>,
    pub demanders: Vec<DemanderDebugInfo>,
    pub supplier_streams: Vec<((NodeId, u32), SupplyContext)>,
    pub history: Vec<CampaignSummary>,
    pub metrics: RebalanceMetricsSnapshot,
}

impl fmt::Display for RebalanceDebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Rebalance state [grp={}, node={}, topVer={}, started={}, stopped={}, paused={}]",
            self.group_id,
            self.local_node,
            self.topology_version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "NONE".to_string()),
            self.started,
            self.stopped,
            self.paused
        )?;
        writeln!(
            f,
            "  active: {}",
            self.active.as_deref().unwrap_or("none")
        )?;
        for d in &self.demanders {
            writeln!(
                f,
                "  demander supplier={} idx={} state={} partitions={:?} demands={} entries={} dups={} retries={}",
                d.supplier,
                d.index,
                d.state,
                d.partitions,
                d.stats.demands_sent,
                d.stats.entries_applied,
                d.stats.duplicates_dropped,
                d.stats.retries
            )?;
        }
        for ((node, index), ctx) in &self.supplier_streams {
            writeln!(
                f,
                "  supplying node={} idx={} rebalanceId={} demands={} messages={} entries={}",
                node, index, ctx.rebalance_id, ctx.demands_served, ctx.messages_sent, ctx.entries_sent
            )?;
        }
        for summary in &self.history {
            writeln!(f, "  finished {}", summary)?;
        }
        write!(f, "  metrics: {:?}", self.metrics)
    }
}

struct CoordinatorState {
    active: Option<RebalanceFuture>,
    demanders: Vec<DemanderHandle>,
    last_exchange: Option<TopologyExchange>,
}

/// Orchestrates rebalancing of one cache group on the local node.
pub struct RebalanceCoordinator {
    group_id: GroupId,
    local_node: NodeId,
    config: RebalanceConfig,
    storage: Arc<dyn PartitionStorage>,
    transport: Arc<dyn Transport>,
    metrics: Arc<RebalanceMetrics>,
    pause: Arc<PauseGate>,
    supplier: Supplier,
    force_keys: ForceKeysFetcher,
    state: RwLock<CoordinatorState>,
    predicate: RwLock<Option<PreloadPredicate>>,
    history: Arc<RwLock<VecDeque<CampaignSummary>>>,
    next_rebalance_id: AtomicU64,
    started: AtomicBool,
    stopped: AtomicBool,
    start_future: Arc<Completion<Result<()>>>,
    sync_future: Arc<Completion<bool>>,
}

impl RebalanceCoordinator {
    /// Create a coordinator for `group_id`.
    pub fn new(
        group_id: GroupId,
        config: RebalanceConfig,
        affinity: Affinity,
        storage: Arc<dyn PartitionStorage>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let metrics = Arc::new(RebalanceMetrics::new());
        let supplier = Supplier::new(
            group_id,
            config.batch_size,
            Arc::clone(&storage),
            Arc::clone(&transport),
            Arc::clone(&metrics),
        );
        let force_keys = ForceKeysFetcher::new(
            group_id,
            affinity,
            config.force_keys_timeout,
            Arc::clone(&storage),
            Arc::clone(&transport),
            Arc::clone(&metrics),
        );

        Self {
            group_id,
            local_node: transport.local_node(),
            config,
            storage,
            transport,
            metrics,
            pause: Arc::new(PauseGate::new()),
            supplier,
            force_keys,
            state: RwLock::new(CoordinatorState {
                active: None,
                demanders: Vec::new(),
                last_exchange: None,
            }),
            predicate: RwLock::new(None),
            history: Arc::new(RwLock::new(VecDeque::new())),
            next_rebalance_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            start_future: Arc::new(Completion::new()),
            sync_future: Arc::new(Completion::new()),
        }
    }

    /// Register this coordinator for every message kind of its group.
    pub fn register_handlers(self: &Arc<Self>, dispatcher: &MessageDispatcher) {
        dispatcher.register_all(self.group_id, Arc::clone(self) as Arc<dyn MessageHandler>);
    }

    /// Cache group.
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Local node.
    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Counters of this coordinator.
    pub fn metrics(&self) -> &Arc<RebalanceMetrics> {
        &self.metrics
    }

    /// Mint a fresh rebalance id.
    pub fn next_rebalance_id(&self) -> u64 {
        self.next_rebalance_id.fetch_add(1, Ordering::Relaxed)
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Start the coordinator.
    pub fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        self.config.validate()?;

        if !self.started.swap(true, Ordering::AcqRel) {
            info!(
                group_id = self.group_id,
                node = self.local_node,
                timeout = ?self.config.timeout,
                prefetch = self.config.batches_prefetch_count,
                throttle = ?self.config.throttle,
                batch_size = self.config.batch_size,
                "Rebalance coordinator started"
            );
        }
        Ok(())
    }

    /// Stop the coordinator: cancel the active campaign and refuse new ones.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let (active, demanders) = {
            let mut state = self.state.write();
            (state.active.take(), std::mem::take(&mut state.demanders))
        };

        if let Some(active) = &active {
            active.cancel("node stopping");
        }
        self.force_keys.cancel_all();
        self.start_future.complete(Err(Error::Stopped));
        self.sync_future.complete(false);

        info!(
            group_id = self.group_id,
            node = self.local_node,
            demanders = demanders.len(),
            "Rebalance coordinator stopped"
        );
    }

    /// Kernal stop callback; equivalent to [`stop`](Self::stop).
    pub fn on_kernal_stop(&self) {
        self.stop();
    }

    /// Whether [`start`](Self::start) has been called.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether the coordinator has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Client reconnect: drop the active campaign and the cached exchange so
    /// the next exchange plans from scratch.
    pub fn on_reconnected(&self) {
        let active = {
            let mut state = self.state.write();
            state.demanders.clear();
            state.last_exchange = None;
            state.active.take()
        };

        if let Some(active) = active {
            active.cancel("client reconnected");
        }
        info!(group_id = self.group_id, node = self.local_node, "Rebalancing reset after reconnect");
    }

    /// Completion of the initial exchange; resolves the start future.
    pub fn on_initial_exchange_complete(&self, err: Option<Error>) {
        let result = match err {
            None => Ok(()),
            Some(e) => {
                warn!(group_id = self.group_id, error = %e, "Initial exchange failed");
                Err(e)
            }
        };
        self.start_future.complete(result);
    }

    // ---------------------------------------------------------------------
    // Planning
    // ---------------------------------------------------------------------

    /// Plan a campaign for `exchange`, or for the last seen exchange if None.
    ///
    /// Returns None when nothing needs rebalancing. Otherwise the new campaign
    /// is chained after `next` (or the active campaign), which is cancelled,
    /// demanders are started and the campaign is added to the optional
    /// compound futures.
    ///
    /// Must be called from within a tokio runtime.
    pub fn prepare(
        &self,
        exchange: Option<TopologyExchange>,
        rebalance_id: u64,
        next: Option<&RebalanceFuture>,
        forced: Option<&CompoundRebalanceFuture>,
        compatible: Option<&CompoundRebalanceFuture>,
    ) -> Result<Option<RebalanceFuture>> {
        self.plan(exchange, Some(rebalance_id), next, forced, compatible)
    }

    /// Shared body of [`prepare`](Self::prepare). With no `rebalance_id` a
    /// fresh one is minted under the state lock, so it orders after every
    /// campaign already installed.
    fn plan(
        &self,
        exchange: Option<TopologyExchange>,
        rebalance_id: Option<u64>,
        next: Option<&RebalanceFuture>,
        forced: Option<&CompoundRebalanceFuture>,
        compatible: Option<&CompoundRebalanceFuture>,
    ) -> Result<Option<RebalanceFuture>> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        if !self.is_started() {
            return Err(Error::NotStarted);
        }

        let mut state = self.state.write();

        let rebalance_id = match rebalance_id {
            Some(id) => {
                self.next_rebalance_id
                    .fetch_max(id.saturating_add(1), Ordering::Relaxed);
                id
            }
            None => self.next_rebalance_id(),
        };

        let exchange = match exchange {
            Some(exchange) => exchange,
            None => state
                .last_exchange
                .clone()
                .ok_or(RebalanceError::NoTopology)?,
        };
        let version = exchange.version();

        let (active_version, active_id) = match &state.active {
            Some(active) => active.order_key(),
            None => (
                state
                    .last_exchange
                    .as_ref()
                    .map(|e| e.version())
                    .unwrap_or(TopologyVersion::NONE),
                0,
            ),
        };
        if (version, rebalance_id) <= (active_version, active_id) || version < active_version {
            return Err(RebalanceError::StalePlan {
                offered_version: version,
                offered_id: rebalance_id,
                active_version,
                active_id,
            }
            .into());
        }

        self.supplier.update_topology(&exchange);
        let assignment = PartitionAssignment::for_exchange(&exchange, self.local_node);
        state.last_exchange = Some(exchange);

        let mut predecessors: Vec<RebalanceFuture> = next.cloned().into_iter().collect();
        if let Some(active) = state.active.take() {
            if !predecessors.iter().any(|p| p.same_campaign(&active)) {
                predecessors.push(active);
            }
        }
        let old_demanders = std::mem::take(&mut state.demanders);

        if !assignment.needs_rebalance() {
            drop(state);
            drop(old_demanders);
            for predecessor in &predecessors {
                predecessor.cancel("no rebalancing needed");
            }
            self.sync_future.complete(true);
            debug!(
                group_id = self.group_id,
                topology_version = %version,
                rebalance_id,
                "Nothing to rebalance"
            );
            return Ok(None);
        }

        let future = RebalanceFuture::new(self.group_id, rebalance_id, Arc::new(assignment));
        self.track(&future);

        let ctx = DemanderContext {
            group_id: self.group_id,
            config: self.config.clone(),
            storage: Arc::clone(&self.storage),
            transport: Arc::clone(&self.transport),
            pause: Arc::clone(&self.pause),
            metrics: Arc::clone(&self.metrics),
            predicate: self.predicate.read().clone(),
        };

        let suppliers = future.assignment().suppliers();
        for (index, (supplier, partitions)) in suppliers.into_iter().enumerate() {
            state.demanders.push(Demander::spawn(
                supplier,
                index as u32,
                partitions,
                future.clone(),
                ctx.clone(),
            ));
        }
        state.active = Some(future.clone());
        drop(state);

        // Cancellation runs completion listeners, which may call back in.
        for predecessor in &predecessors {
            if let Err(e) = predecessor.chain_next(&future) {
                debug!(group_id = self.group_id, error = %e, "Predecessor not chained");
            }
            if predecessor.cancel(&format!("superseded by {}/{}", version, rebalance_id)) {
                info!(
                    group_id = self.group_id,
                    topology_version = %predecessor.topology_version(),
                    rebalance_id = predecessor.rebalance_id(),
                    successor_version = %version,
                    successor_id = rebalance_id,
                    "Rebalance campaign superseded"
                );
            }
        }
        drop(old_demanders);

        let missed = future.missed_partitions();
        if !missed.is_empty() {
            warn!(
                group_id = self.group_id,
                topology_version = %version,
                partitions = ?missed,
                "Partitions have no supplier and are missed"
            );
        }

        if let Some(forced) = forced {
            forced.add(&future);
        }
        if let Some(compatible) = compatible {
            compatible.add(&future);
        }

        info!(
            group_id = self.group_id,
            topology_version = %version,
            rebalance_id,
            fetch = future.remaining_partitions().len(),
            missed = missed.len(),
            suppliers = ?future.assignment().suppliers().keys().collect::<Vec<_>>(),
            "Rebalance campaign prepared"
        );

        Ok(Some(future))
    }

    /// Record the outcome of a campaign once it resolves.
    fn track(&self, future: &RebalanceFuture) {
        self.metrics.campaigns_started.inc();
        self.metrics
            .partitions_missed
            .inc_by(future.missed_partitions().len() as u64);

        let metrics = Arc::clone(&self.metrics);
        let history = Arc::clone(&self.history);
        let sync_future = Arc::clone(&self.sync_future);
        let campaign = future.clone();

        future.listen(move |outcome| {
            match &outcome {
                RebalanceResult::Success => {
                    metrics.campaigns_succeeded.inc();
                    sync_future.complete(true);
                }
                RebalanceResult::Cancelled => metrics.campaigns_cancelled.inc(),
                RebalanceResult::Failed(_) => metrics.campaigns_failed.inc(),
            }

            let summary = CampaignSummary {
                rebalance_id: campaign.rebalance_id(),
                topology_version: campaign.topology_version(),
                outcome,
                duration: campaign.duration(),
                done: campaign.done_partitions().len(),
                missed: campaign.missed_partitions().len(),
            };
            info!(group_id = campaign.group_id(), %summary, "Rebalance campaign finished");

            let mut history = history.write();
            history.push_back(summary);
            while history.len() > MAX_HISTORY {
                history.pop_front();
            }
        });
    }

    /// A newer exchange completed.
    ///
    /// The active campaign keeps running if the new plan moves the same
    /// partitions from the same suppliers. Otherwise it is cancelled and a new
    /// campaign is prepared.
    pub fn on_topology_changed(&self, exchange: TopologyExchange) -> Result<Option<RebalanceFuture>> {
        if self.is_stopped() {
            return Ok(None);
        }

        let still_valid = {
            let mut state = self.state.write();
            if state
                .last_exchange
                .as_ref()
                .is_some_and(|last| exchange.version() < last.version())
            {
                debug!(
                    group_id = self.group_id,
                    topology_version = %exchange.version(),
                    "Ignoring outdated exchange"
                );
                return Ok(None);
            }

            // Suppliers reject demands for partitions whose ownership moved on.
            let mut touched = state
                .last_exchange
                .as_ref()
                .map(|last| exchange.ownership.changed_since(&last.ownership))
                .unwrap_or_default();
            touched.extend(exchange.lost_partitions.iter().copied());

            let assignment = PartitionAssignment::for_exchange(&exchange, self.local_node);
            let valid = state.active.as_ref().is_some_and(|a| {
                !a.is_done()
                    && a.assignment().same_plan(&assignment)
                    && a.remaining_partitions().is_disjoint(&touched)
            });
            if valid {
                self.supplier.update_topology(&exchange);
                state.last_exchange = Some(exchange.clone());
            }
            valid
        };

        if still_valid {
            debug!(
                group_id = self.group_id,
                topology_version = %exchange.version(),
                "Active rebalance still valid for new topology"
            );
            return Ok(None);
        }

        self.plan(Some(exchange), None, None, None, None)
    }

    /// Replan immediately for the current topology with a fresh rebalance id.
    ///
    /// The returned compound resolves `true` once the forced campaign succeeds,
    /// or right away if nothing needs rebalancing.
    pub fn force_rebalance(&self) -> Result<CompoundRebalanceFuture> {
        let forced = CompoundRebalanceFuture::new();

        let future = self.plan(None, None, None, Some(&forced), None)?;
        info!(
            group_id = self.group_id,
            rebalance_id = future.as_ref().map(|f| f.rebalance_id()),
            "Forced rebalance"
        );
        forced.mark_initialized();

        Ok(forced)
    }

    /// Transition the DONE partitions of a finished campaign to locally owned.
    ///
    /// Stale (version, id) pairs are ignored. Returns whether the campaign matched.
    pub fn finish_preloading(&self, version: TopologyVersion, rebalance_id: u64) -> bool {
        let mut state = self.state.write();

        let Some(active) = state.active.clone() else {
            return false;
        };
        if active.order_key() != (version, rebalance_id) {
            debug!(
                group_id = self.group_id,
                topology_version = %version,
                rebalance_id,
                "Ignoring finish for a stale campaign"
            );
            return false;
        }

        let done = active.done_partitions();
        if let Some(exchange) = state.last_exchange.as_mut() {
            for partition in &done {
                exchange
                    .ownership
                    .set_state(*partition, self.local_node, PartitionState::Owning);
            }
            self.supplier.update_topology(exchange);
        }
        drop(state);

        self.sync_future.complete(true);
        info!(
            group_id = self.group_id,
            topology_version = %version,
            rebalance_id,
            owned = done.len(),
            "Preloading finished"
        );
        true
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// The active campaign.
    pub fn rebalance_future(&self) -> Option<RebalanceFuture> {
        self.state.read().active.clone()
    }

    /// Resolves once initial preloading completes.
    pub fn sync_future(&self) -> Arc<Completion<bool>> {
        Arc::clone(&self.sync_future)
    }

    /// Resolves once the node is ready to serve requests.
    pub fn start_future(&self) -> Arc<Completion<Result<()>>> {
        Arc::clone(&self.start_future)
    }

    /// True once rebalancing has completed for the current topology.
    pub fn need_force_keys(&self) -> bool {
        let state = self.state.read();
        match &state.active {
            Some(active) => active.outcome() == Some(RebalanceResult::Success),
            None => state.last_exchange.is_some(),
        }
    }

    /// Fetch specific keys from their owners ahead of the bulk campaign.
    pub async fn request(&self, keys: Vec<Bytes>, version: TopologyVersion) -> Result<ForceKeysResult> {
        let ownership = self
            .state
            .read()
            .last_exchange
            .as_ref()
            .map(|e| e.ownership.clone())
            .ok_or(RebalanceError::NoTopology)?;

        self.force_keys.fetch(keys, version, &ownership).await
    }

    /// Snapshot of the coordinator for diagnostics, also logged at info.
    pub fn dump_debug_info(&self) -> RebalanceDebugInfo {
        let (topology_version, active, demanders) = {
            let state = self.state.read();
            (
                state.last_exchange.as_ref().map(|e| e.version()),
                state.active.as_ref().map(|a| a.to_string()),
                state
                    .demanders
                    .iter()
                    .map(|d| DemanderDebugInfo {
                        supplier: d.supplier(),
                        index: d.index(),
                        state: d.state(),
                        partitions: d.partitions().clone(),
                        stats: d.stats(),
                    })
                    .collect(),
            )
        };

        let info = RebalanceDebugInfo {
            group_id: self.group_id,
            local_node: self.local_node,
            topology_version,
            started: self.is_started(),
            stopped: self.is_stopped(),
            paused: self.pause.is_paused(),
            active,
            demanders,
            supplier_streams: self.supplier.contexts(),
            history: self.history(),
            metrics: self.metrics.snapshot(),
        };

        info!(group_id = self.group_id, "{}", info);
        info
    }

    /// Finished campaigns, oldest first.
    pub fn history(&self) -> Vec<CampaignSummary> {
        self.history.read().iter().cloned().collect()
    }

    // ---------------------------------------------------------------------
    // Flow control
    // ---------------------------------------------------------------------

    /// Stop issuing new demands. In-flight supply messages are still applied.
    pub fn pause(&self) {
        if self.pause.pause() {
            warn!(group_id = self.group_id, node = self.local_node, "Rebalancing paused");
        }
    }

    /// Resume issuing demands from the last resume tokens.
    pub fn resume(&self) {
        if self.pause.resume() {
            info!(group_id = self.group_id, node = self.local_node, "Rebalancing resumed");
        }
    }

    /// Whether rebalancing is paused.
    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// Wait budget for each supply message.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Batches in flight per supplier.
    pub fn batches_prefetch_count(&self) -> usize {
        self.config.batches_prefetch_count
    }

    /// Delay between demand messages.
    pub fn throttle(&self) -> Duration {
        self.config.throttle
    }

    /// Byte budget of a supply message.
    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Set or clear the preload predicate.
    ///
    /// Applies to supplying immediately and to demanders of the next campaign.
    pub fn set_preload_predicate(&self, predicate: Option<PreloadPredicate>) {
        self.supplier.set_predicate(predicate.clone());
        *self.predicate.write() = predicate;
    }

    /// The preload predicate, if any.
    pub fn preload_predicate(&self) -> Option<PreloadPredicate> {
        self.predicate.read().clone()
    }

    // ---------------------------------------------------------------------
    // Message handlers
    // ---------------------------------------------------------------------

    /// Route a supply message to the demander of its supplier.
    pub fn handle_supply_message(&self, from: NodeId, msg: SupplyMessage) {
        let rebalance_id = msg.rebalance_id;
        let partition = msg.partition;

        let delivered = {
            let state = self.state.read();
            match state
                .demanders
                .iter()
                .find(|d| d.supplier() == from && d.future().rebalance_id() == rebalance_id)
            {
                Some(demander) => demander.deliver(msg),
                None => false,
            }
        };

        if !delivered {
            debug!(
                group_id = self.group_id,
                supplier = from,
                rebalance_id,
                partition,
                "Dropping supply message for an inactive campaign"
            );
            self.metrics.duplicates_dropped.inc();
        }
    }

    /// Serve a demand received on demander stream `index` of node `from`.
    pub async fn handle_demand_message(&self, index: u32, from: NodeId, mut msg: DemandMessage) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        msg.demander_index = index;
        self.supplier.handle_demand(from, msg).await
    }
}

#[async_trait]
impl MessageHandler for RebalanceCoordinator {
    async fn handle(&self, from: NodeId, message: Message) -> Result<()> {
        match message {
            Message::Demand(demand) => {
                self.handle_demand_message(demand.demander_index, from, demand)
                    .await
            }
            Message::Supply(supply) => {
                self.handle_supply_message(from, supply);
                Ok(())
            }
            Message::ForceKeysRequest(request) => self.supplier.handle_force_keys(from, request).await,
            Message::ForceKeysResponse(response) => {
                self.force_keys.on_response(response);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for RebalanceCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("RebalanceCoordinator")
            .field("group_id", &self.group_id)
            .field("local_node", &self.local_node)
            .field("active", &state.active)
            .field("demanders", &state.demanders.len())
            .field("started", &self.is_started())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::InMemoryNetwork;
    use crate::rebalancing::PartitionStatus;
    use crate::storage::{GridEntry, InMemoryPartitionStorage};
    use crate::partitioning::OwnershipMap;
    use crate::types::{ExchangeId, ExchangeKind};
    use std::time::Duration;
    use tokio::time::timeout;
    use PartitionState::*;

    const GROUP: GroupId = 1;
    const PARTITIONS: u32 = 4;
    const WAIT: Duration = Duration::from_secs(5);

    struct TestNode {
        coordinator: Arc<RebalanceCoordinator>,
        storage: Arc<InMemoryPartitionStorage>,
    }

    fn config() -> RebalanceConfig {
        RebalanceConfig::default()
            .with_timeout(Duration::from_millis(300))
            .with_batch_size(256)
    }

    fn node(network: &Arc<InMemoryNetwork>, id: NodeId) -> TestNode {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let transport = network.register(id, Arc::clone(&dispatcher));
        let storage = Arc::new(InMemoryPartitionStorage::new());
        let coordinator = Arc::new(RebalanceCoordinator::new(
            GROUP,
            config(),
            Affinity::new(PARTITIONS),
            storage.clone(),
            transport,
        ));
        coordinator.register_handlers(&dispatcher);
        coordinator.start().unwrap();
        TestNode {
            coordinator,
            storage,
        }
    }

    fn fill(storage: &InMemoryPartitionStorage, per_partition: usize) {
        for p in 0..PARTITIONS {
            for i in 0..per_partition {
                let key = format!("p{}-k{:03}", p, i);
                storage.put(p, GridEntry::new(key, vec![7u8; 32], 1)).unwrap();
            }
        }
    }

    /// Every partition is owned by `owner` while `mover` is moving in.
    fn exchange(version: TopologyVersion, owner: NodeId, mover: NodeId) -> TopologyExchange {
        let mut map = OwnershipMap::new();
        for p in 0..PARTITIONS {
            map = map.with_partition(p, &[(owner, Owning), (mover, Moving)]);
        }
        TopologyExchange::new(ExchangeId::new(version, mover, ExchangeKind::NodeJoined), map)
    }

    /// Let a supplying node see the exchange; it has nothing to fetch itself.
    fn observe(node: &TestNode, exchange: TopologyExchange) {
        let id = node.coordinator.next_rebalance_id();
        assert!(node
            .coordinator
            .prepare(Some(exchange), id, None, None, None)
            .unwrap()
            .is_none());
    }

    fn settled(version: TopologyVersion, nodes: &[NodeId]) -> TopologyExchange {
        let states: Vec<_> = nodes.iter().map(|n| (*n, Owning)).collect();
        let mut map = OwnershipMap::new();
        for p in 0..PARTITIONS {
            map = map.with_partition(p, &states);
        }
        TopologyExchange::new(ExchangeId::new(version, nodes[0], ExchangeKind::Forced), map)
    }

    #[test_log::test(tokio::test)]
    async fn test_campaign_moves_all_partitions() {
        let network = InMemoryNetwork::new();
        let supplier = node(&network, 1);
        let demander = node(&network, 2);
        fill(&supplier.storage, 20);

        let ver = TopologyVersion::new(2, 0);
        observe(&supplier, exchange(ver, 1, 2));

        let future = demander
            .coordinator
            .prepare(Some(exchange(ver, 1, 2)), 1, None, None, None)
            .unwrap()
            .expect("campaign expected");

        let result = timeout(WAIT, future.result()).await.unwrap();
        assert_eq!(result, Ok(true));
        for p in 0..PARTITIONS {
            assert_eq!(demander.storage.keys(p), supplier.storage.keys(p));
            assert_eq!(future.status(p), Some(PartitionStatus::Done));
        }

        assert!(demander.coordinator.need_force_keys());
        assert!(demander.coordinator.finish_preloading(ver, 1));
        assert_eq!(demander.coordinator.sync_future().get(), Some(true));

        let history = demander.coordinator.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, RebalanceResult::Success);
        assert_eq!(history[0].done, PARTITIONS as usize);
        assert_eq!(demander.coordinator.metrics().snapshot().campaigns_succeeded, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_stale_plan_rejected() {
        let network = InMemoryNetwork::new();
        let n = node(&network, 2);
        n.coordinator.pause();

        let ver = TopologyVersion::new(3, 0);
        n.coordinator
            .prepare(Some(exchange(ver, 1, 2)), 5, None, None, None)
            .unwrap();

        let err = n
            .coordinator
            .prepare(Some(exchange(ver, 1, 2)), 3, None, None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Rebalance(RebalanceError::StalePlan { offered_id: 3, active_id: 5, .. })
        ));

        let err = n
            .coordinator
            .prepare(Some(exchange(TopologyVersion::new(2, 0), 1, 2)), 9, None, None, None)
            .unwrap_err();
        assert!(matches!(err, Error::Rebalance(RebalanceError::StalePlan { .. })));
    }

    #[test_log::test(tokio::test)]
    async fn test_newer_plan_supersedes_and_chains() {
        let network = InMemoryNetwork::new();
        let supplier = node(&network, 1);
        let demander = node(&network, 2);
        fill(&supplier.storage, 5);
        observe(&supplier, exchange(TopologyVersion::new(2, 0), 1, 2));
        demander.coordinator.pause();

        let first = demander
            .coordinator
            .prepare(Some(exchange(TopologyVersion::new(2, 0), 1, 2)), 1, None, None, None)
            .unwrap()
            .unwrap();
        let second = demander
            .coordinator
            .prepare(None, 2, None, None, None)
            .unwrap()
            .unwrap();

        assert_eq!(first.outcome(), Some(RebalanceResult::Cancelled));
        assert!(first.successor().unwrap().same_campaign(&second));
        assert!(demander.coordinator.rebalance_future().unwrap().same_campaign(&second));

        demander.coordinator.resume();
        let result = timeout(WAIT, first.await_final()).await.unwrap();
        assert_eq!(result, Ok(true));
        assert_eq!(second.outcome(), Some(RebalanceResult::Success));
    }

    #[test_log::test(tokio::test)]
    async fn test_nothing_to_rebalance_cancels_active() {
        let network = InMemoryNetwork::new();
        let n = node(&network, 2);
        n.coordinator.pause();

        let active = n
            .coordinator
            .prepare(Some(exchange(TopologyVersion::new(2, 0), 1, 2)), 1, None, None, None)
            .unwrap()
            .unwrap();

        let none = n
            .coordinator
            .prepare(Some(settled(TopologyVersion::new(2, 1), &[1, 2])), 2, None, None, None)
            .unwrap();

        assert!(none.is_none());
        assert!(active.is_cancelled());
        assert!(n.coordinator.rebalance_future().is_none());
        assert_eq!(n.coordinator.sync_future().get(), Some(true));
    }

    #[test_log::test(tokio::test)]
    async fn test_lifecycle_guards() {
        let network = InMemoryNetwork::new();
        let dispatcher = Arc::new(MessageDispatcher::new());
        let transport = network.register(2, dispatcher);
        let coordinator = RebalanceCoordinator::new(
            GROUP,
            config(),
            Affinity::new(PARTITIONS),
            Arc::new(InMemoryPartitionStorage::new()),
            transport,
        );

        let ex = exchange(TopologyVersion::new(2, 0), 1, 2);
        assert_eq!(
            coordinator.prepare(Some(ex.clone()), 1, None, None, None).unwrap_err(),
            Error::NotStarted
        );

        coordinator.start().unwrap();
        coordinator.pause();
        let active = coordinator
            .prepare(Some(ex.clone()), 1, None, None, None)
            .unwrap()
            .unwrap();

        coordinator.stop();
        assert!(active.is_cancelled());
        assert_eq!(active.cancel_reason().as_deref(), Some("node stopping"));
        assert_eq!(
            coordinator.prepare(Some(ex), 2, None, None, None).unwrap_err(),
            Error::Stopped
        );
        assert_eq!(coordinator.start().unwrap_err(), Error::Stopped);
        assert_eq!(coordinator.start_future().get(), Some(Err(Error::Stopped)));
        assert_eq!(coordinator.sync_future().get(), Some(false));
    }

    #[test_log::test(tokio::test)]
    async fn test_topology_change_keeps_or_replans() {
        let network = InMemoryNetwork::new();
        let n = node(&network, 2);
        n.coordinator.pause();

        let active = n
            .coordinator
            .prepare(Some(exchange(TopologyVersion::new(2, 0), 1, 2)), 1, None, None, None)
            .unwrap()
            .unwrap();

        // Same suppliers for the same partitions: the campaign keeps running.
        let kept = n
            .coordinator
            .on_topology_changed(exchange(TopologyVersion::new(2, 1), 1, 2))
            .unwrap();
        assert!(kept.is_none());
        assert!(!active.is_done());

        // Supplier moved to node 3: the campaign is replaced.
        let replanned = n
            .coordinator
            .on_topology_changed(exchange(TopologyVersion::new(3, 0), 3, 2))
            .unwrap()
            .unwrap();
        assert!(active.is_cancelled());
        assert_eq!(replanned.topology_version(), TopologyVersion::new(3, 0));
        assert!(replanned.rebalance_id() > active.rebalance_id());
        assert!(replanned
            .assignment()
            .suppliers()
            .contains_key(&3));
    }

    #[test_log::test(tokio::test)]
    async fn test_force_rebalance() {
        let network = InMemoryNetwork::new();
        let supplier = node(&network, 1);
        let demander = node(&network, 2);
        fill(&supplier.storage, 3);

        assert_eq!(
            demander.coordinator.force_rebalance().unwrap_err(),
            Error::Rebalance(RebalanceError::NoTopology)
        );

        observe(&supplier, exchange(TopologyVersion::new(2, 0), 1, 2));
        demander.coordinator.pause();
        let first = demander
            .coordinator
            .prepare(Some(exchange(TopologyVersion::new(2, 0), 1, 2)), 1, None, None, None)
            .unwrap()
            .unwrap();

        let forced = demander.coordinator.force_rebalance().unwrap();
        assert!(first.is_cancelled());

        demander.coordinator.resume();
        let result = timeout(WAIT, forced.result()).await.unwrap();
        assert_eq!(result, Ok(true));
        assert_eq!(supplier.storage.keys(0), demander.storage.keys(0));
    }

    #[test_log::test(tokio::test)]
    async fn test_supply_for_inactive_campaign_dropped() {
        let network = InMemoryNetwork::new();
        let n = node(&network, 2);

        let demand = DemandMessage {
            group_id: GROUP,
            topology_version: TopologyVersion::new(1, 0),
            rebalance_id: 42,
            demander_index: 0,
            sequence: 0,
            partitions: Default::default(),
            timeout_ms: 100,
        };
        n.coordinator
            .handle_supply_message(1, SupplyMessage::batch(&demand, 0, Vec::new(), true));

        assert_eq!(n.coordinator.metrics().duplicates_dropped.get(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_request_keys_from_owner() {
        let network = InMemoryNetwork::new();
        let supplier = node(&network, 1);
        let demander = node(&network, 2);

        let affinity = Affinity::new(PARTITIONS);
        let key = Bytes::from_static(b"hot-key");
        supplier
            .storage
            .put(affinity.partition(&key), GridEntry::new(key.clone(), "v", 3))
            .unwrap();

        let ver = TopologyVersion::new(2, 0);
        observe(&supplier, exchange(ver, 1, 2));
        demander.coordinator.pause();
        demander
            .coordinator
            .prepare(Some(exchange(ver, 1, 2)), 1, None, None, None)
            .unwrap();
        assert!(!demander.coordinator.need_force_keys());

        let result = timeout(WAIT, demander.coordinator.request(vec![key.clone()], ver))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.fetched, 1);
        assert!(demander
            .storage
            .read(affinity.partition(&key), &key)
            .unwrap()
            .is_some());
    }

    #[test_log::test(tokio::test)]
    async fn test_dump_debug_info() {
        let network = InMemoryNetwork::new();
        let n = node(&network, 2);
        n.coordinator.pause();
        n.coordinator
            .prepare(Some(exchange(TopologyVersion::new(2, 0), 1, 2)), 1, None, None, None)
            .unwrap();

        let info = n.coordinator.dump_debug_info();
        assert!(info.paused);
        assert_eq!(info.demanders.len(), 1);
        assert_eq!(info.demanders[0].supplier, 1);
        assert_eq!(info.demanders[0].partitions.len(), PARTITIONS as usize);
        assert!(info.to_string().starts_with("Rebalance state [grp=1, node=2"));
    }

    #[test_log::test(tokio::test)]
    async fn test_listener_may_reenter_coordinator_when_superseded() {
        let network = InMemoryNetwork::new();
        let n = node(&network, 2);
        n.coordinator.pause();

        let first = n
            .coordinator
            .prepare(Some(exchange(TopologyVersion::new(2, 0), 1, 2)), 1, None, None, None)
            .unwrap()
            .unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(None));
        let coordinator = Arc::clone(&n.coordinator);
        let seen_by_listener = Arc::clone(&seen);
        first.listen(move |_| {
            let active = coordinator.rebalance_future().map(|f| f.rebalance_id());
            coordinator.need_force_keys();
            coordinator.dump_debug_info();
            *seen_by_listener.lock() = active;
        });

        // Plan on a separate thread so a lock cycle shows up as a timeout.
        let (tx, rx) = tokio::sync::oneshot::channel();
        let coordinator = Arc::clone(&n.coordinator);
        let runtime = tokio::runtime::Handle::current();
        std::thread::spawn(move || {
            let _guard = runtime.enter();
            let _ = tx.send(coordinator.prepare(
                Some(exchange(TopologyVersion::new(3, 0), 1, 2)),
                2,
                None,
                None,
                None,
            ));
        });

        let second = timeout(WAIT, rx)
            .await
            .expect("prepare blocked")
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(first.is_cancelled());
        assert_eq!(*seen.lock(), Some(second.rebalance_id()));
    }

    #[test_log::test(tokio::test)]
    async fn test_force_rebalance_orders_after_concurrent_replan() {
        let network = InMemoryNetwork::new();
        let n = node(&network, 2);
        n.coordinator.pause();
        n.coordinator
            .prepare(Some(exchange(TopologyVersion::new(2, 0), 1, 2)), 1, None, None, None)
            .unwrap();

        // An id minted before a replan installs a newer campaign is stale.
        let early = n.coordinator.next_rebalance_id();
        let replanned = n
            .coordinator
            .on_topology_changed(exchange(TopologyVersion::new(3, 0), 3, 2))
            .unwrap()
            .unwrap();
        assert!(replanned.rebalance_id() > early);
        assert!(matches!(
            n.coordinator.prepare(None, early, None, None, None),
            Err(Error::Rebalance(RebalanceError::StalePlan { .. }))
        ));

        let forced = n.coordinator.force_rebalance().unwrap();
        let active = n.coordinator.rebalance_future().unwrap();
        assert!(active.order_key() > replanned.order_key());
        assert!(replanned.is_cancelled());
        assert!(!forced.is_done());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_force_rebalance_races_topology_changes() {
        let network = InMemoryNetwork::new();
        let n = node(&network, 2);
        n.coordinator.pause();
        n.coordinator
            .prepare(Some(exchange(TopologyVersion::new(1, 0), 1, 2)), 1, None, None, None)
            .unwrap();

        for round in 0..100u64 {
            let forcing = Arc::clone(&n.coordinator);
            let changing = Arc::clone(&n.coordinator);
            let force = tokio::task::spawn_blocking(move || forcing.force_rebalance().map(|_| ()));
            let change = tokio::task::spawn_blocking(move || {
                let owner = if round % 2 == 0 { 3 } else { 1 };
                changing
                    .on_topology_changed(exchange(TopologyVersion::new(round + 2, 0), owner, 2))
                    .map(|_| ())
            });

            assert_eq!(force.await.unwrap(), Ok(()));
            assert_eq!(change.await.unwrap(), Ok(()));
        }

        let active = n.coordinator.rebalance_future().unwrap();
        assert_eq!(active.topology_version(), TopologyVersion::new(101, 0));
    }

    #[test_log::test(tokio::test)]
    async fn test_reconnect_discards_campaign_and_topology() {
        let network = InMemoryNetwork::new();
        let n = node(&network, 2);
        n.coordinator.pause();

        let ver = TopologyVersion::new(2, 0);
        let active = n
            .coordinator
            .prepare(Some(exchange(ver, 1, 2)), 1, None, None, None)
            .unwrap()
            .unwrap();

        n.coordinator.on_reconnected();

        assert!(active.is_cancelled());
        assert_eq!(active.cancel_reason().as_deref(), Some("client reconnected"));
        assert!(n.coordinator.rebalance_future().is_none());
        assert_eq!(
            n.coordinator.prepare(None, 2, None, None, None).unwrap_err(),
            Error::Rebalance(RebalanceError::NoTopology)
        );

        // The same exchange plans again from scratch.
        let replanned = n
            .coordinator
            .prepare(Some(exchange(ver, 1, 2)), 3, None, None, None)
            .unwrap()
            .unwrap();
        assert_eq!(replanned.remaining_partitions().len(), PARTITIONS as usize);
    }

    #[test_log::test(tokio::test)]
    async fn test_initial_exchange_resolves_start_future() {
        let network = InMemoryNetwork::new();
        let healthy = node(&network, 1);
        let failed = node(&network, 2);
        assert_eq!(healthy.coordinator.start_future().get(), None);

        healthy.coordinator.on_initial_exchange_complete(None);
        failed
            .coordinator
            .on_initial_exchange_complete(Some(Error::Timeout));

        assert_eq!(healthy.coordinator.start_future().get(), Some(Ok(())));
        let start = failed.coordinator.start_future();
        assert_eq!(timeout(WAIT, start.wait()).await.unwrap(), Err(Error::Timeout));

        // The first outcome sticks.
        healthy
            .coordinator
            .on_initial_exchange_complete(Some(Error::Timeout));
        assert_eq!(healthy.coordinator.start_future().get(), Some(Ok(())));
    }

    #[test_log::test(tokio::test)]
    async fn test_compatible_compound_tracks_member_campaigns() {
        let network = InMemoryNetwork::new();
        let supplier = node(&network, 1);
        let demander = node(&network, 2);
        fill(&supplier.storage, 5);
        observe(&supplier, exchange(TopologyVersion::new(2, 0), 1, 2));
        demander.coordinator.pause();

        let superseded = CompoundRebalanceFuture::new();
        demander
            .coordinator
            .prepare(
                Some(exchange(TopologyVersion::new(2, 0), 1, 2)),
                1,
                None,
                None,
                Some(&superseded),
            )
            .unwrap()
            .unwrap();
        superseded.mark_initialized();
        assert!(!superseded.is_done());

        let compatible = CompoundRebalanceFuture::new();
        let second = demander
            .coordinator
            .prepare(None, 2, None, None, Some(&compatible))
            .unwrap()
            .unwrap();
        compatible.mark_initialized();

        assert_eq!(timeout(WAIT, superseded.result()).await.unwrap(), Ok(false));

        demander.coordinator.resume();
        assert_eq!(timeout(WAIT, compatible.result()).await.unwrap(), Ok(true));
        assert_eq!(second.outcome(), Some(RebalanceResult::Success));
    }

    #[test_log::test(tokio::test)]
    async fn test_preload_predicate_filters_on_demander() {
        let network = InMemoryNetwork::new();
        let supplier = node(&network, 1);
        let demander = node(&network, 2);
        fill(&supplier.storage, 5);

        assert!(demander.coordinator.preload_predicate().is_none());
        let predicate: PreloadPredicate =
            Arc::new(|_: PartitionId, e: &GridEntry| !e.key.ends_with(b"-k000"));
        demander.coordinator.set_preload_predicate(Some(predicate));
        assert!(demander.coordinator.preload_predicate().is_some());

        let ver = TopologyVersion::new(2, 0);
        observe(&supplier, exchange(ver, 1, 2));
        let future = demander
            .coordinator
            .prepare(Some(exchange(ver, 1, 2)), 1, None, None, None)
            .unwrap()
            .unwrap();

        assert_eq!(timeout(WAIT, future.result()).await.unwrap(), Ok(true));
        for p in 0..PARTITIONS {
            assert_eq!(supplier.storage.partition_size(p), 5);
            assert_eq!(demander.storage.partition_size(p), 4);
            let skipped = format!("p{}-k000", p);
            assert!(demander.storage.read(p, skipped.as_bytes()).unwrap().is_none());
        }
    }
}
