//! In-memory partition storage.

use super::{GridEntry, PartitionIter, PartitionStorage, ResumeToken};
use crate::error::{Result, StorageError};
use crate::types::PartitionId;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;

/// Entries fetched per lock acquisition while iterating.
const ITER_CHUNK: usize = 64;

type PartitionData = Arc<RwLock<BTreeMap<Bytes, GridEntry>>>;

/// Partition storage backed by ordered in-memory maps.
#[derive(Debug, Default)]
pub struct InMemoryPartitionStorage {
    partitions: DashMap<PartitionId, PartitionData>,

    /// Partitions whose writes fail, for exercising storage failures.
    failing: DashSet<PartitionId>,
}

impl InMemoryPartitionStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write into `partition` fail (or succeed again).
    pub fn set_write_failure(&self, partition: PartitionId, fail: bool) {
        if fail {
            self.failing.insert(partition);
        } else {
            self.failing.remove(&partition);
        }
    }

    /// Write a single entry, as regular user traffic would.
    pub fn put(&self, partition: PartitionId, entry: GridEntry) -> Result<bool> {
        Ok(self.write_batch(partition, vec![entry])? == 1)
    }

    /// All keys of a partition in order.
    pub fn keys(&self, partition: PartitionId) -> Vec<Bytes> {
        self.data(partition)
            .map(|data| data.read().keys().cloned().collect())
            .unwrap_or_default()
    }

    fn data(&self, partition: PartitionId) -> Option<PartitionData> {
        self.partitions.get(&partition).map(|d| Arc::clone(d.value()))
    }
}

impl PartitionStorage for InMemoryPartitionStorage {
    fn read(&self, partition: PartitionId, key: &[u8]) -> Result<Option<GridEntry>> {
        Ok(self
            .data(partition)
            .and_then(|data| data.read().get(key).cloned()))
    }

    fn write_batch(&self, partition: PartitionId, entries: Vec<GridEntry>) -> Result<usize> {
        if self.failing.contains(&partition) {
            return Err(StorageError::WriteFailed {
                partition,
                reason: "write failure injected".to_string(),
            }
            .into());
        }

        let data = Arc::clone(self.partitions.entry(partition).or_default().value());
        let mut data = data.write();
        let mut applied = 0;

        for entry in entries {
            let newer = data
                .get(&entry.key)
                .map_or(true, |existing| existing.version <= entry.version);
            if newer {
                data.insert(entry.key.clone(), entry);
                applied += 1;
            }
        }

        Ok(applied)
    }

    fn iterate(&self, partition: PartitionId, from: Option<&ResumeToken>) -> Result<PartitionIter> {
        let Some(data) = self.data(partition) else {
            return Ok(Box::new(std::iter::empty()));
        };

        Ok(Box::new(ChunkedIter {
            data,
            cursor: from.map(|t| t.last_key().clone()),
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }

    fn partition_size(&self, partition: PartitionId) -> usize {
        self.data(partition).map(|d| d.read().len()).unwrap_or(0)
    }

    fn clear_partition(&self, partition: PartitionId) -> Result<()> {
        self.partitions.remove(&partition);
        Ok(())
    }
}

/// Iterator that takes the partition read lock only while refilling a chunk.
struct ChunkedIter {
    data: PartitionData,
    cursor: Option<Bytes>,
    buffer: VecDeque<GridEntry>,
    exhausted: bool,
}

impl ChunkedIter {
    fn refill(&mut self) {
        let lower = match &self.cursor {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };

        let data = self.data.read();
        self.buffer.extend(
            data.range((lower, Bound::Unbounded))
                .take(ITER_CHUNK)
                .map(|(_, e)| e.clone()),
        );

        match self.buffer.back() {
            Some(last) => self.cursor = Some(last.key.clone()),
            None => self.exhausted = true,
        }
    }
}

impl Iterator for ChunkedIter {
    type Item = GridEntry;

    fn next(&mut self) -> Option<GridEntry> {
        if self.buffer.is_empty() && !self.exhausted {
            self.refill();
        }
        self.buffer.pop_front()
    }
}
