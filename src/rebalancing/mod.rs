//! Rebalancing: moving partition data to nodes that became owners.
//!
//! After every topology exchange the [`RebalanceCoordinator`] of a cache
//! group computes a [`PartitionAssignment`](crate::partitioning::PartitionAssignment)
//! and starts one campaign, tracked by a [`RebalanceFuture`]. Data flows by
//! demand: the demanding node asks, the supplying node answers.
//!
//! # Architecture
//!
//! ```text
//!        demanding node                              supplying node
//! ┌───────────────────────────────┐          ┌───────────────────────────┐
//! │ RebalanceCoordinator          │          │ RebalanceCoordinator      │
//! │   prepare(exchange, id)       │          │                           │
//! │     │                         │          │                           │
//! │     ▼                         │  Demand  │                           │
//! │ RebalanceFuture ◄── Demander ─┼─────────►│ Supplier                  │
//! │   (per campaign)   (per       │          │   SupplyContext per       │
//! │                     supplier) │◄─────────┼   (node, demander index)  │
//! │                       │       │  Supply  │                           │
//! │                       ▼       │          │                           │
//! │               PartitionStorage│          │ PartitionStorage (read)   │
//! └───────────────────────────────┘          └───────────────────────────┘
//! ```
//!
//! # Campaign lifecycle
//!
//! 1. `prepare` rejects plans not strictly newer than the active one.
//! 2. The predecessor is chained to the new future, then cancelled.
//! 3. One [`Demander`] per supplier requests partitions with resume tokens,
//!    keeping `batches_prefetch_count` batches in flight and sleeping
//!    `throttle` between demands.
//! 4. Each supply batch is applied under the future's read lock, so a
//!    cancelled campaign never writes again.
//! 5. The future resolves once every partition is done or missed.
//!
//! Timed-out demands are retried from the last resume token; duplicates and
//! stale supply messages are dropped.

mod completion;
mod coordinator;
mod demander;
mod force_keys;
mod future;
mod pause;
mod predicate;
mod supplier;

pub use completion::Completion;
pub use coordinator::{CampaignSummary, DemanderDebugInfo, RebalanceCoordinator, RebalanceDebugInfo};
pub use demander::{
    Demander, DemanderContext, DemanderHandle, DemanderState, DemanderStats, DemanderStatsSnapshot,
};
pub use force_keys::{ForceKeysFetcher, ForceKeysResult};
pub use future::{CompoundRebalanceFuture, PartitionStatus, RebalanceFuture, RebalanceResult};
pub use pause::PauseGate;
pub use predicate::{skip_expired, PreloadPredicate};
pub use supplier::{Supplier, SupplyContext};
