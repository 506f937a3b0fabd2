//! Local partitioned storage consumed by the rebalancing subsystem.
//!
//! The supplier side only reads through point-in-time iterators and the
//! demander side only writes batches. Per-key atomicity is the storage's
//! responsibility; rebalancing adds no locking of its own.

mod memory;

pub use memory::InMemoryPartitionStorage;

use crate::error::Result;
use crate::types::PartitionId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single versioned entry of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridEntry {
    /// Entry key.
    pub key: Bytes,

    /// Entry value.
    pub value: Bytes,

    /// Entry version. Higher versions replace lower ones.
    pub version: u64,

    /// Absolute expiration time in milliseconds since UNIX epoch.
    /// None means no expiration.
    pub expires_at_ms: Option<u64>,
}

impl GridEntry {
    /// Create a non-expiring entry.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>, version: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            version,
            expires_at_ms: None,
        }
    }

    /// Set the absolute expiration time.
    pub fn with_expiration(mut self, expires_at_ms: u64) -> Self {
        self.expires_at_ms = Some(expires_at_ms);
        self
    }

    /// Whether the entry has expired at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }

    /// Approximate encoded size in bytes.
    pub fn size(&self) -> usize {
        // version + expiration
        self.key.len() + self.value.len() + 16
    }
}

/// Cursor marking how far a partition has been transferred.
///
/// Holds the last key delivered; iteration resumes strictly after it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResumeToken(Bytes);

impl ResumeToken {
    /// Token positioned right after `key`.
    pub fn after(key: impl Into<Bytes>) -> Self {
        Self(key.into())
    }

    /// The last key delivered.
    pub fn last_key(&self) -> &Bytes {
        &self.0
    }
}

/// Lazy point-in-time sequence of partition entries in key order.
pub type PartitionIter = Box<dyn Iterator<Item = GridEntry> + Send>;

/// Key-value interface into local partitioned storage.
pub trait PartitionStorage: Send + Sync {
    /// Read a single entry.
    fn read(&self, partition: PartitionId, key: &[u8]) -> Result<Option<GridEntry>>;

    /// Write a batch of entries, keeping the newer version of each key.
    ///
    /// Returns the number of entries that were applied.
    fn write_batch(&self, partition: PartitionId, entries: Vec<GridEntry>) -> Result<usize>;

    /// Iterate a partition in key order, starting strictly after `from`.
    ///
    /// The iterator must not hold partition-wide locks between items.
    fn iterate(&self, partition: PartitionId, from: Option<&ResumeToken>) -> Result<PartitionIter>;

    /// Number of entries in a partition.
    fn partition_size(&self, partition: PartitionId) -> usize;

    /// Drop all entries of a partition.
    fn clear_partition(&self, partition: PartitionId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiration() {
        let entry = GridEntry::new("k", "v", 1).with_expiration(1_000);

        assert!(!entry.is_expired(999));
        assert!(entry.is_expired(1_000));
        assert!(!GridEntry::new("k", "v", 1).is_expired(u64::MAX));
    }

    #[test]
    fn test_resume_token_order_follows_keys() {
        assert!(ResumeToken::after("a") < ResumeToken::after("b"));
        assert_eq!(ResumeToken::after("k").last_key().as_ref(), b"k");
    }
}
