//! Rebalance protocol messages.
//!
//! Every message is a variant of the closed [`Message`] set and is routed by its
//! [`MessageKind`] and cache group.

use crate::error::{NetworkError, Result};
use crate::storage::{GridEntry, ResumeToken};
use crate::types::{GroupId, PartitionId, TopologyVersion};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// All messages exchanged by the rebalancing subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Demander asks a supplier for partition data.
    Demand(DemandMessage),

    /// Supplier streams partition data back.
    Supply(SupplyMessage),

    /// On-demand fetch of specific keys.
    ForceKeysRequest(ForceKeysRequest),

    /// Response to an on-demand key fetch.
    ForceKeysResponse(ForceKeysResponse),
}

/// Kind of a [`Message`], used as the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Demand,
    Supply,
    ForceKeysRequest,
    ForceKeysResponse,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Message {
    /// The kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Demand(_) => MessageKind::Demand,
            Message::Supply(_) => MessageKind::Supply,
            Message::ForceKeysRequest(_) => MessageKind::ForceKeysRequest,
            Message::ForceKeysResponse(_) => MessageKind::ForceKeysResponse,
        }
    }

    /// The cache group this message belongs to.
    pub fn group_id(&self) -> GroupId {
        match self {
            Message::Demand(m) => m.group_id,
            Message::Supply(m) => m.group_id,
            Message::ForceKeysRequest(m) => m.group_id,
            Message::ForceKeysResponse(m) => m.group_id,
        }
    }

    /// Encode to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| NetworkError::Serialization(e.to_string()).into())
    }

    /// Decode from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| NetworkError::Deserialization(e.to_string()).into())
    }
}

/// Request for a batch of entries of a set of partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemandMessage {
    /// Cache group.
    pub group_id: GroupId,

    /// Topology version of the demanding campaign.
    pub topology_version: TopologyVersion,

    /// Rebalance id of the demanding campaign.
    pub rebalance_id: u64,

    /// Index of the demander stream on the demanding node.
    pub demander_index: u32,

    /// Per-demander sequence number.
    pub sequence: u64,

    /// Requested partitions and where to resume each. None starts from the beginning.
    pub partitions: BTreeMap<PartitionId, Option<ResumeToken>>,

    /// How long the demander waits for each supply message, in milliseconds.
    pub timeout_ms: u64,
}

/// Per-partition error reported by a supplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SupplyError {
    /// The supplier no longer owns the partition under its current assignment.
    Reassigned,
    /// The supplier has no data for the partition.
    PartitionMissing,
    /// The supplier has moved to a newer topology for the partition.
    ExpiredTopology,
}

impl fmt::Display for SupplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupplyError::Reassigned => "REASSIGNED",
            SupplyError::PartitionMissing => "PARTITION_MISSING",
            SupplyError::ExpiredTopology => "EXPIRED_TOPOLOGY",
        };
        f.write_str(s)
    }
}

/// A batch of entries of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyMessage {
    /// Cache group.
    pub group_id: GroupId,

    /// Topology version copied from the demand.
    pub topology_version: TopologyVersion,

    /// Rebalance id copied from the demand.
    pub rebalance_id: u64,

    /// Sequence of the demand this answers.
    pub sequence: u64,

    /// Partition the entries belong to.
    pub partition: PartitionId,

    /// Token the batch was read from, as requested by the demand.
    pub resume_from: Option<ResumeToken>,

    /// Entries in key order.
    pub entries: Vec<GridEntry>,

    /// Token to resume from after this batch.
    pub next_token: Option<ResumeToken>,

    /// Whether this is the last batch of the partition.
    pub last: bool,

    /// Per-partition error, if the partition cannot be supplied.
    pub error: Option<SupplyError>,

    /// Encoded size of the entries.
    pub estimated_bytes: u64,
}

impl SupplyMessage {
    /// A supply message answering `demand` for `partition` with an error.
    pub fn error(demand: &DemandMessage, partition: PartitionId, error: SupplyError) -> Self {
        Self {
            group_id: demand.group_id,
            topology_version: demand.topology_version,
            rebalance_id: demand.rebalance_id,
            sequence: demand.sequence,
            partition,
            resume_from: demand.partitions.get(&partition).cloned().flatten(),
            entries: Vec::new(),
            next_token: None,
            last: true,
            error: Some(error),
            estimated_bytes: 0,
        }
    }

    /// A supply message answering `demand` for `partition` with entries.
    pub fn batch(
        demand: &DemandMessage,
        partition: PartitionId,
        entries: Vec<GridEntry>,
        last: bool,
    ) -> Self {
        let resume_from = demand.partitions.get(&partition).cloned().flatten();
        let next_token = entries
            .last()
            .map(|e| ResumeToken::after(e.key.clone()))
            .or_else(|| resume_from.clone());
        let estimated_bytes = entries.iter().map(|e| e.size() as u64).sum();

        Self {
            group_id: demand.group_id,
            topology_version: demand.topology_version,
            rebalance_id: demand.rebalance_id,
            sequence: demand.sequence,
            partition,
            resume_from,
            entries,
            next_token,
            last,
            error: None,
            estimated_bytes,
        }
    }
}

/// Request for specific keys, sent to an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceKeysRequest {
    /// Correlation id.
    pub request_id: u64,

    /// Cache group.
    pub group_id: GroupId,

    /// Topology version the requester maps keys with.
    pub topology_version: TopologyVersion,

    /// Requested keys with their partitions.
    pub keys: Vec<(PartitionId, Bytes)>,
}

/// Response to a [`ForceKeysRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceKeysResponse {
    /// Correlation id of the request.
    pub request_id: u64,

    /// Cache group.
    pub group_id: GroupId,

    /// Entries found, with their partitions.
    pub entries: Vec<(PartitionId, GridEntry)>,

    /// Keys the owner does not hold.
    pub missed_keys: Vec<Bytes>,

    /// Error reported by the owner.
    pub error: Option<String>,
}

impl ForceKeysResponse {
    /// An error response.
    pub fn error(request: &ForceKeysRequest, error: impl Into<String>) -> Self {
        Self {
            request_id: request.request_id,
            group_id: request.group_id,
            entries: Vec::new(),
            missed_keys: Vec::new(),
            error: Some(error.into()),
        }
    }
}
