//! Partitioning module: key affinity, ownership and rebalance planning.
//!
//! Ownership arrives with every completed topology exchange. From it each node
//! computes its own [`PartitionAssignment`]: for every partition it should own,
//! where the data comes from.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      TopologyExchange                         │
//! │   version [5, 0]      lost: {7}                               │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                   OwnershipMap                          │  │
//! │  │  P0: [N1 Owning, N2 Owning]                             │  │
//! │  │  P1: [N2 Owning, N3 Moving]                             │  │
//! │  │  P7: [N3 Moving]                                        │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!                           │ for_exchange(N3)
//!                           ▼
//!              P1 → Supplier(N2)     P7 → Missed
//! ```
//!
//! Keys are mapped to partitions by [`Affinity`].

mod affinity;
mod assignment;
mod topology;

pub use affinity::{Affinity, DEFAULT_PARTITIONS};
pub use assignment::{PartitionAssignment, PartitionSource};
pub use topology::{OwnershipMap, PartitionOwners, PartitionState, TopologyExchange};
