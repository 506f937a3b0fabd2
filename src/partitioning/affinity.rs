//! Key to partition mapping.

use crate::types::PartitionId;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Default number of partitions in a cache group.
pub const DEFAULT_PARTITIONS: u32 = 1024;

/// Maps keys onto a fixed number of partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Affinity {
    partitions: u32,
}

impl Affinity {
    /// Create an affinity function with the given partition count.
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }

    /// Number of partitions.
    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Partition that owns `key`.
    pub fn partition(&self, key: &[u8]) -> PartitionId {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key);
        (hasher.finish() % self.partitions as u64) as PartitionId
    }
}

impl Default for Affinity {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_stable_and_bounded() {
        let affinity = Affinity::new(16);
        let p = affinity.partition(b"user:123");

        assert!(p < 16);
        assert_eq!(p, affinity.partition(b"user:123"));
    }

    #[test]
    fn test_zero_partitions_clamped() {
        let affinity = Affinity::new(0);
        assert_eq!(affinity.partitions(), 1);
        assert_eq!(affinity.partition(b"anything"), 0);
    }
}
