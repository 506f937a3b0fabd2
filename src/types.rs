//! Core types used throughout the rebalancing subsystem.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Partition identifier within a cache group.
pub type PartitionId = u32;

/// Cache group identifier.
pub type GroupId = u32;

/// Monotonic identifier of a cluster membership/ownership snapshot.
///
/// Versions are totally ordered: first by `major` (membership changes), then
/// by `minor` (ownership changes at the same membership, e.g. cache start or
/// baseline change).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TopologyVersion {
    /// Membership version.
    pub major: u64,
    /// Ownership version within the same membership.
    pub minor: u32,
}

impl TopologyVersion {
    /// The version before any exchange has completed.
    pub const NONE: TopologyVersion = TopologyVersion { major: 0, minor: 0 };

    /// Create a new topology version.
    pub const fn new(major: u64, minor: u32) -> Self {
        Self { major, minor }
    }

    /// The next membership version.
    pub fn next_major(&self) -> Self {
        Self::new(self.major + 1, 0)
    }

    /// The next ownership version at the same membership.
    pub fn next_minor(&self) -> Self {
        Self::new(self.major, self.minor + 1)
    }

    /// Whether this is the initial, unset version.
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.major, self.minor)
    }
}

/// The event that triggered a topology exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeKind {
    /// A node joined the cluster.
    NodeJoined,
    /// A node left the cluster gracefully.
    NodeLeft,
    /// A node failed.
    NodeFailed,
    /// Baseline topology changed.
    BaselineChanged,
    /// A cache was started or stopped.
    CacheChange,
    /// Rebalance was forced or reassigned without a new exchange.
    Forced,
}

/// Identifies one topology exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeId {
    /// Topology version the exchange produces.
    pub version: TopologyVersion,
    /// The node whose event triggered the exchange.
    pub event_node: NodeId,
    /// What kind of event triggered the exchange.
    pub kind: ExchangeKind,
}

impl ExchangeId {
    /// Create a new exchange ID.
    pub fn new(version: TopologyVersion, event_node: NodeId, kind: ExchangeKind) -> Self {
        Self {
            version,
            event_node,
            kind,
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exchange(ver={}, node={}, kind={:?})",
            self.version, self.event_node, self.kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_version_ordering() {
        let v1 = TopologyVersion::new(1, 5);
        let v2 = TopologyVersion::new(2, 0);
        let v3 = v2.next_minor();

        assert!(v1 < v2);
        assert!(v2 < v3);
        assert_eq!(v1.next_major(), TopologyVersion::new(2, 0));
        assert!(TopologyVersion::NONE.is_none());
    }

    #[test]
    fn test_topology_version_display() {
        assert_eq!(TopologyVersion::new(4, 2).to_string(), "[4, 2]");
    }
}
