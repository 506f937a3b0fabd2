//! Rebalance campaign futures.
//!
//! A [`RebalanceFuture`] tracks one campaign: the partitions of one
//! [`PartitionAssignment`] for one `(topology version, rebalance id)`. It is
//! resolved exactly once, with success when every partition is done or
//! missed, with cancellation when superseded or stopped, or with an error on
//! a fatal storage failure.
//!
//! Campaigns form a chain. When a newer campaign supersedes an older one the
//! older future records it as its successor before it is cancelled, so
//! [`RebalanceFuture::await_final`] follows the chain to the campaign that
//! actually finishes.

use super::completion::Completion;
use crate::error::{Error, RebalanceError, Result};
use crate::partitioning::PartitionAssignment;
use crate::types::{GroupId, PartitionId, TopologyVersion};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Progress of one partition within a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionStatus {
    /// Not demanded yet.
    Pending,
    /// Demanded, supply in progress.
    InProgress,
    /// All data received.
    Done,
    /// No supplier could provide the data.
    Missed,
}

/// Terminal outcome of a campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceResult {
    /// Every partition is done or missed.
    Success,
    /// Superseded or stopped before finishing.
    Cancelled,
    /// A fatal storage failure.
    Failed(Error),
}

impl RebalanceResult {
    /// Whether the campaign succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, RebalanceResult::Success)
    }

    /// The boolean/error form exposed to callers.
    pub fn into_result(self) -> Result<bool> {
        match self {
            RebalanceResult::Success => Ok(true),
            RebalanceResult::Cancelled => Ok(false),
            RebalanceResult::Failed(e) => Err(e),
        }
    }
}

impl fmt::Display for RebalanceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebalanceResult::Success => f.write_str("SUCCESS"),
            RebalanceResult::Cancelled => f.write_str("CANCELLED"),
            RebalanceResult::Failed(e) => write!(f, "FAILED({})", e),
        }
    }
}

struct FutureState {
    partitions: BTreeMap<PartitionId, PartitionStatus>,
    resolved: Option<RebalanceResult>,
    cancel_reason: Option<String>,
    finished_at: Option<Instant>,
}

struct Inner {
    group_id: GroupId,
    rebalance_id: u64,
    assignment: Arc<PartitionAssignment>,
    state: RwLock<FutureState>,
    completion: Completion<RebalanceResult>,
    successor: Mutex<Option<RebalanceFuture>>,
    cancel: CancellationToken,
    started_at: Instant,
}

/// Handle to one rebalance campaign. Cloning shares the campaign.
#[derive(Clone)]
pub struct RebalanceFuture {
    inner: Arc<Inner>,
}

impl RebalanceFuture {
    /// Create a campaign for `assignment`.
    ///
    /// Partitions to fetch start pending and partitions without a supplier
    /// start missed. A campaign with nothing pending resolves immediately.
    pub fn new(group_id: GroupId, rebalance_id: u64, assignment: Arc<PartitionAssignment>) -> Self {
        let mut partitions: BTreeMap<PartitionId, PartitionStatus> = assignment
            .partitions_to_fetch()
            .into_iter()
            .map(|p| (p, PartitionStatus::Pending))
            .collect();
        partitions.extend(
            assignment
                .missed()
                .into_iter()
                .map(|p| (p, PartitionStatus::Missed)),
        );

        let future = Self {
            inner: Arc::new(Inner {
                group_id,
                rebalance_id,
                assignment,
                state: RwLock::new(FutureState {
                    partitions,
                    resolved: None,
                    cancel_reason: None,
                    finished_at: None,
                }),
                completion: Completion::new(),
                successor: Mutex::new(None),
                cancel: CancellationToken::new(),
                started_at: Instant::now(),
            }),
        };

        let resolved = {
            let mut state = future.inner.state.write();
            Self::check_finished(&mut state)
        };
        if let Some(result) = resolved {
            future.inner.completion.complete(result);
        }

        future
    }

    /// Cache group of the campaign.
    pub fn group_id(&self) -> GroupId {
        self.inner.group_id
    }

    /// Topology version the campaign was planned for.
    pub fn topology_version(&self) -> TopologyVersion {
        self.inner.assignment.version()
    }

    /// Rebalance id minted for the campaign.
    pub fn rebalance_id(&self) -> u64 {
        self.inner.rebalance_id
    }

    /// The immutable plan of the campaign.
    pub fn assignment(&self) -> &Arc<PartitionAssignment> {
        &self.inner.assignment
    }

    /// Total order key of campaigns.
    pub fn order_key(&self) -> (TopologyVersion, u64) {
        (self.topology_version(), self.rebalance_id())
    }

    /// Token cancelled when the campaign resolves other than by success.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Mark a partition as demanded.
    pub fn on_partition_started(&self, partition: PartitionId) {
        let mut state = self.inner.state.write();
        if state.resolved.is_some() {
            return;
        }
        if let Some(status) = state.partitions.get_mut(&partition) {
            if *status == PartitionStatus::Pending {
                *status = PartitionStatus::InProgress;
            }
        }
    }

    /// Return a partition to pending so a later demand picks it up again.
    pub fn on_partition_reset(&self, partition: PartitionId) {
        let mut state = self.inner.state.write();
        if let Some(status) = state.partitions.get_mut(&partition) {
            if *status == PartitionStatus::InProgress {
                *status = PartitionStatus::Pending;
            }
        }
    }

    /// Mark a partition complete. Returns false if it was not awaited.
    pub fn on_partition_done(&self, partition: PartitionId) -> bool {
        self.finish_partition(partition, PartitionStatus::Done)
    }

    /// Mark a partition missed. Returns false if it was not awaited.
    pub fn on_partition_missed(&self, partition: PartitionId) -> bool {
        self.finish_partition(partition, PartitionStatus::Missed)
    }

    fn finish_partition(&self, partition: PartitionId, to: PartitionStatus) -> bool {
        let resolved = {
            let mut state = self.inner.state.write();
            if state.resolved.is_some() {
                return false;
            }
            match state.partitions.get_mut(&partition) {
                Some(status)
                    if matches!(*status, PartitionStatus::Pending | PartitionStatus::InProgress) =>
                {
                    *status = to;
                }
                _ => return false,
            }
            Self::check_finished(&mut state)
        };

        if let Some(result) = resolved {
            debug!(
                group_id = self.inner.group_id,
                topology_version = %self.topology_version(),
                rebalance_id = self.inner.rebalance_id,
                "Rebalance campaign finished"
            );
            self.inner.completion.complete(result);
        }
        true
    }

    fn check_finished(state: &mut FutureState) -> Option<RebalanceResult> {
        let finished = state
            .partitions
            .values()
            .all(|s| matches!(s, PartitionStatus::Done | PartitionStatus::Missed));
        if !finished {
            return None;
        }
        state.resolved = Some(RebalanceResult::Success);
        state.finished_at = Some(Instant::now());
        state.resolved.clone()
    }

    /// Cancel the campaign. Idempotent; returns true if this call resolved it.
    ///
    /// Outstanding partitions stay pending for the next plan. The cancellation
    /// token fires even if the campaign had already resolved.
    pub fn cancel(&self, reason: &str) -> bool {
        let cancelled = self.resolve(RebalanceResult::Cancelled, Some(reason));
        self.inner.cancel.cancel();
        cancelled
    }

    /// Fail the campaign with a fatal error. Returns true if this call resolved it.
    pub fn fail(&self, error: Error) -> bool {
        let failed = self.resolve(RebalanceResult::Failed(error), None);
        self.inner.cancel.cancel();
        failed
    }

    fn resolve(&self, result: RebalanceResult, reason: Option<&str>) -> bool {
        {
            let mut state = self.inner.state.write();
            if state.resolved.is_some() {
                return false;
            }
            if result == RebalanceResult::Cancelled {
                for status in state.partitions.values_mut() {
                    if *status == PartitionStatus::InProgress {
                        *status = PartitionStatus::Pending;
                    }
                }
            }
            state.resolved = Some(result.clone());
            state.cancel_reason = reason.map(str::to_string);
            state.finished_at = Some(Instant::now());
        }
        self.inner.completion.complete(result);
        true
    }

    /// Run `f` only if the campaign is still unresolved.
    ///
    /// The state read lock is held while `f` runs, so the campaign cannot be
    /// cancelled concurrently. `f` must not call back into this future's
    /// mutating methods.
    pub fn try_apply<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let state = self.inner.state.read();
        if state.resolved.is_some() {
            return None;
        }
        Some(f())
    }

    /// Record the campaign that supersedes this one.
    ///
    /// The successor must order strictly after this campaign, which rules out
    /// cycles.
    pub fn chain_next(&self, next: &RebalanceFuture) -> Result<()> {
        if next.order_key() <= self.order_key() {
            return Err(RebalanceError::InvalidSuccessor {
                version: self.topology_version(),
                id: self.rebalance_id(),
                successor_version: next.topology_version(),
                successor_id: next.rebalance_id(),
            }
            .into());
        }

        let mut successor = self.inner.successor.lock();
        if successor.is_some() {
            return Err(RebalanceError::AlreadyChained(self.rebalance_id()).into());
        }
        *successor = Some(next.clone());
        Ok(())
    }

    /// The campaign that superseded this one, if any.
    pub fn successor(&self) -> Option<RebalanceFuture> {
        self.inner.successor.lock().clone()
    }

    /// Register a listener for this campaign's outcome.
    pub fn listen(&self, f: impl FnOnce(RebalanceResult) + Send + 'static) {
        self.inner.completion.on_complete(f);
    }

    /// Wait for this campaign's own outcome.
    ///
    /// Resolves `Ok(true)` on success, `Ok(false)` on cancellation and `Err` on
    /// a fatal failure.
    pub async fn result(&self) -> Result<bool> {
        self.inner.completion.wait().await.into_result()
    }

    /// Wait for the outcome, following the successor chain past cancellations.
    pub async fn await_final(&self) -> Result<bool> {
        let mut current = self.clone();
        loop {
            match current.inner.completion.wait().await {
                RebalanceResult::Success => return Ok(true),
                RebalanceResult::Failed(e) => return Err(e),
                RebalanceResult::Cancelled => match current.successor() {
                    Some(next) => current = next,
                    None => return Ok(false),
                },
            }
        }
    }

    /// The outcome, if resolved.
    pub fn outcome(&self) -> Option<RebalanceResult> {
        self.inner.state.read().resolved.clone()
    }

    /// Whether the campaign has resolved.
    pub fn is_done(&self) -> bool {
        self.inner.state.read().resolved.is_some()
    }

    /// Whether the campaign was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome(), Some(RebalanceResult::Cancelled))
    }

    /// Why the campaign was cancelled.
    pub fn cancel_reason(&self) -> Option<String> {
        self.inner.state.read().cancel_reason.clone()
    }

    /// Status of a partition.
    pub fn status(&self, partition: PartitionId) -> Option<PartitionStatus> {
        self.inner.state.read().partitions.get(&partition).copied()
    }

    /// Partitions currently in the given status.
    pub fn partitions_with(&self, status: PartitionStatus) -> BTreeSet<PartitionId> {
        self.inner
            .state
            .read()
            .partitions
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Partitions reported as missed.
    pub fn missed_partitions(&self) -> BTreeSet<PartitionId> {
        self.partitions_with(PartitionStatus::Missed)
    }

    /// Partitions fully received.
    pub fn done_partitions(&self) -> BTreeSet<PartitionId> {
        self.partitions_with(PartitionStatus::Done)
    }

    /// Partitions not finished yet.
    pub fn remaining_partitions(&self) -> BTreeSet<PartitionId> {
        self.inner
            .state
            .read()
            .partitions
            .iter()
            .filter(|(_, s)| matches!(s, PartitionStatus::Pending | PartitionStatus::InProgress))
            .map(|(p, _)| *p)
            .collect()
    }

    /// Time from creation to resolution, or until now if unresolved.
    pub fn duration(&self) -> Duration {
        let finished_at = self.inner.state.read().finished_at;
        finished_at
            .unwrap_or_else(Instant::now)
            .duration_since(self.inner.started_at)
    }

    /// Whether two handles refer to the same campaign.
    pub fn same_campaign(&self, other: &RebalanceFuture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for RebalanceFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("RebalanceFuture")
            .field("group_id", &self.inner.group_id)
            .field("topology_version", &self.topology_version())
            .field("rebalance_id", &self.inner.rebalance_id)
            .field("partitions", &state.partitions.len())
            .field("resolved", &state.resolved)
            .finish()
    }
}

impl fmt::Display for RebalanceFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        let count = |s: PartitionStatus| state.partitions.values().filter(|v| **v == s).count();
        write!(
            f,
            "rebalance(grp={}, ver={}, id={}, pending={}, in_progress={}, done={}, missed={}, result={})",
            self.inner.group_id,
            self.topology_version(),
            self.inner.rebalance_id,
            count(PartitionStatus::Pending),
            count(PartitionStatus::InProgress),
            count(PartitionStatus::Done),
            count(PartitionStatus::Missed),
            state
                .resolved
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "PENDING".to_string()),
        )
    }
}

struct CompoundState {
    pending: usize,
    initialized: bool,
    all_succeeded: bool,
    error: Option<Error>,
}

/// Conjunction of several campaigns.
///
/// Resolves once initialized and every member has resolved: `Ok(true)` only
/// if all succeeded, `Err` if any failed, `Ok(false)` otherwise.
#[derive(Clone)]
pub struct CompoundRebalanceFuture {
    state: Arc<Mutex<CompoundState>>,
    completion: Arc<Completion<Result<bool>>>,
}

impl CompoundRebalanceFuture {
    /// Create an empty, uninitialized compound.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CompoundState {
                pending: 0,
                initialized: false,
                all_succeeded: true,
                error: None,
            })),
            completion: Arc::new(Completion::new()),
        }
    }

    /// Add a member campaign.
    pub fn add(&self, future: &RebalanceFuture) {
        self.state.lock().pending += 1;

        let compound = self.clone();
        future.listen(move |result| {
            let mut state = compound.state.lock();
            state.pending -= 1;
            match result {
                RebalanceResult::Success => {}
                RebalanceResult::Cancelled => state.all_succeeded = false,
                RebalanceResult::Failed(e) => {
                    state.all_succeeded = false;
                    state.error.get_or_insert(e);
                }
            }
            compound.try_complete(state);
        });
    }

    /// Declare that no more members will be added.
    pub fn mark_initialized(&self) {
        let mut state = self.state.lock();
        state.initialized = true;
        self.try_complete(state);
    }

    fn try_complete(&self, state: parking_lot::MutexGuard<'_, CompoundState>) {
        if !state.initialized || state.pending > 0 {
            return;
        }
        let result = match &state.error {
            Some(e) => Err(e.clone()),
            None => Ok(state.all_succeeded),
        };
        drop(state);
        self.completion.complete(result);
    }

    /// Whether the compound has resolved.
    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    /// Wait for the combined outcome.
    pub async fn result(&self) -> Result<bool> {
        self.completion.wait().await
    }
}

impl Default for CompoundRebalanceFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompoundRebalanceFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CompoundRebalanceFuture")
            .field("pending", &state.pending)
            .field("initialized", &state.initialized)
            .field("done", &self.completion.is_done())
            .finish()
    }
}
