//! Demand-driven partition rebalancing for a partitioned, replicated data grid.
//!
//! When cluster membership or partition ownership changes, nodes that became
//! owners of a partition must receive its data before serving it. This crate
//! runs that transfer per cache group:
//!
//! - a [`PartitionAssignment`] decides, for every partition the local node
//!   owns, whether it is already local, which node supplies it, or that it is
//!   missed;
//! - a [`RebalanceFuture`] tracks one campaign and resolves `true` on success,
//!   `false` when superseded or stopped, or with a storage error;
//! - demanders pull batches from suppliers with resume tokens, bounded
//!   prefetch, throttling, pause/resume and cancellation;
//! - the [`RebalanceCoordinator`] orders campaigns by
//!   `(topology_version, rebalance_id)` and keeps at most one active.
//!
//! # Example
//!
//! ```rust,ignore
//! use grid_rebalance::{RebalanceConfig, RebalanceCoordinator, Affinity};
//! use std::sync::Arc;
//!
//! let coordinator = Arc::new(RebalanceCoordinator::new(
//!     group_id,
//!     RebalanceConfig::default(),
//!     Affinity::new(1024),
//!     storage,
//!     transport,
//! ));
//! coordinator.register_handlers(&dispatcher);
//! coordinator.start()?;
//!
//! // After every completed exchange:
//! if let Some(campaign) = coordinator.on_topology_changed(exchange)? {
//!     let completed = campaign.await_final().await?;
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 topology exchange (external)             │
//! └──────────────────────────────────────────────────────────┘
//!                             │ TopologyExchange
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ RebalanceCoordinator (one per cache group)               │
//! │   PartitionAssignment → RebalanceFuture → Demanders      │
//! │   Supplier · ForceKeysFetcher · PauseGate · history      │
//! └──────────────────────────────────────────────────────────┘
//!        │ Transport / MessageDispatcher        │ PartitionStorage
//!        ▼                                      ▼
//! ┌───────────────────────┐          ┌───────────────────────┐
//! │ Demand / Supply /     │          │ ordered per-partition │
//! │ ForceKeys messages    │          │ entries, put-if-newer │
//! └───────────────────────┘          └───────────────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod partitioning;
pub mod rebalancing;
pub mod storage;
pub mod testing;
pub mod types;

pub use clock::{Clock, SystemClock};
pub use config::{GlobalRebalanceConfig, GroupRebalanceConfig, RebalanceConfig};
pub use error::{Error, NetworkError, RebalanceError, Result, StorageError};
pub use types::{ExchangeId, ExchangeKind, GroupId, NodeId, PartitionId, TopologyVersion};

// Re-export partitioning types
pub use partitioning::{
    Affinity, OwnershipMap, PartitionAssignment, PartitionSource, PartitionState,
    TopologyExchange,
};

// Re-export storage types
pub use storage::{GridEntry, InMemoryPartitionStorage, PartitionStorage, ResumeToken};

// Re-export network types
pub use network::{
    InMemoryNetwork, Message, MessageDispatcher, MessageHandler, MessageKind, Transport,
};

// Re-export rebalancing types
pub use rebalancing::{
    CompoundRebalanceFuture, PartitionStatus, PreloadPredicate, RebalanceCoordinator,
    RebalanceDebugInfo, RebalanceFuture, RebalanceResult,
};

// Re-export metrics types
pub use metrics::{Counter, Gauge, RebalanceMetrics, RebalanceMetricsSnapshot};
