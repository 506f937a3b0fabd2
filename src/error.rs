//! Error types for the rebalancing subsystem.

use crate::types::{NodeId, PartitionId, TopologyVersion};
use thiserror::Error;

/// Result type alias for rebalancing operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the rebalancing subsystem.
///
/// Errors are `Clone` so that a single terminal failure can be delivered to
/// every waiter of a rebalance future.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Local partition storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Message transport errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Rebalance protocol errors.
    #[error("rebalance error: {0}")]
    Rebalance(#[from] RebalanceError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The preloader has not been started.
    #[error("preloader not started")]
    NotStarted,

    /// The preloader has been stopped.
    #[error("preloader stopped")]
    Stopped,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Local storage errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Writing a batch into a partition failed.
    #[error("write to partition {partition} failed: {reason}")]
    WriteFailed {
        partition: PartitionId,
        reason: String,
    },

    /// Reading or iterating a partition failed.
    #[error("read from partition {partition} failed: {reason}")]
    ReadFailed {
        partition: PartitionId,
        reason: String,
    },

    /// The partition does not exist locally.
    #[error("partition not found: {0}")]
    PartitionNotFound(PartitionId),
}

/// Message transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// The destination node is not reachable.
    #[error("node unreachable: {0}")]
    NodeUnreachable(NodeId),

    /// Failed to send a message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// No handler is registered for a message kind.
    #[error("no handler for message kind {0}")]
    NoHandler(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// Rebalance protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RebalanceError {
    /// A plan older than (or equal to) the active one was offered.
    #[error("stale rebalance plan {offered_version}/{offered_id}, active is {active_version}/{active_id}")]
    StalePlan {
        offered_version: TopologyVersion,
        offered_id: u64,
        active_version: TopologyVersion,
        active_id: u64,
    },

    /// A successor future must order strictly after its predecessor.
    #[error("invalid successor: {successor_version}/{successor_id} does not follow {version}/{id}")]
    InvalidSuccessor {
        version: TopologyVersion,
        id: u64,
        successor_version: TopologyVersion,
        successor_id: u64,
    },

    /// The future already has a successor.
    #[error("rebalance future {0} already chained")]
    AlreadyChained(u64),

    /// No topology exchange has been observed yet.
    #[error("no topology exchange observed")]
    NoTopology,

    /// A key could not be fetched from any owner.
    #[error("no owner available for partition {0}")]
    NoOwner(PartitionId),

    /// A remote node reported an error.
    #[error("remote error from node {node}: {reason}")]
    Remote { node: NodeId, reason: String },
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

impl Error {
    /// Whether this error is a storage failure (fatal for the partition attempt).
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}
