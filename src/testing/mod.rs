//! Testing utilities for rebalancing.
//!
//! - [`ChaosController`] injects message drops, duplicates, isolation and
//!   crashes into the [`InMemoryNetwork`](crate::network::InMemoryNetwork).
//! - [`TestGrid`] runs several nodes of one cache group in-process.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          TestGrid                            │
//! │                                                              │
//! │   GridNode 1          GridNode 2          GridNode N         │
//! │  ┌────────────┐      ┌────────────┐      ┌────────────┐      │
//! │  │Coordinator │      │Coordinator │      │Coordinator │      │
//! │  │Dispatcher  │      │Dispatcher  │      │Dispatcher  │      │
//! │  │Storage     │      │Storage     │      │Storage     │      │
//! │  └─────┬──────┘      └─────┬──────┘      └─────┬──────┘      │
//! │        └──────────┬────────┴──────────┬────────┘             │
//! │                   ▼                   ▼                      │
//! │            InMemoryNetwork ◄──── ChaosController             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use grid_rebalance::config::RebalanceConfig;
//! use grid_rebalance::testing::TestGrid;
//!
//! let mut grid = TestGrid::new(&[1, 2], 16, RebalanceConfig::default())?;
//! grid.load(1, 100, 64)?;
//!
//! let exchange = grid.join_exchange(&[1], 2);
//! let campaigns = grid.apply(&exchange)?;
//! assert_eq!(campaigns[&2].result().await?, true);
//! ```

mod chaos;
mod cluster;


pub use chaos::{ChaosConfig, ChaosController, ChaosStats, NetworkPartition};
pub use cluster::{GridNode, TestGrid};
