//! In-process metrics for rebalancing.
//!
//! Counters and gauges are plain atomics; a [`RebalanceMetricsSnapshot`] is
//! taken for diagnostics dumps. Exporting metrics is left to the embedding
//! application.

mod counters;

pub use counters::{Counter, Gauge};

/// Metrics for one rebalance coordinator.
#[derive(Debug, Default)]
pub struct RebalanceMetrics {
    /// Campaigns created.
    pub campaigns_started: Counter,
    /// Campaigns resolved successfully.
    pub campaigns_succeeded: Counter,
    /// Campaigns cancelled or superseded.
    pub campaigns_cancelled: Counter,
    /// Campaigns failed with a storage error.
    pub campaigns_failed: Counter,
    /// Partitions fully received.
    pub partitions_done: Counter,
    /// Partitions declared missed.
    pub partitions_missed: Counter,
    /// Entries written into local storage.
    pub entries_applied: Counter,
    /// Bytes received in supply messages.
    pub bytes_received: Counter,
    /// Supply messages sent by the supplier side.
    pub supply_messages_sent: Counter,
    /// Demand messages sent by demanders.
    pub demand_messages_sent: Counter,
    /// Demands re-sent after a timeout.
    pub demand_retries: Counter,
    /// Supply messages dropped as duplicates or stale.
    pub duplicates_dropped: Counter,
    /// On-demand key fetch requests.
    pub force_key_requests: Counter,
    /// Demanders currently running.
    pub active_demanders: Gauge,
}

impl RebalanceMetrics {
    /// Create a zeroed metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a point-in-time snapshot.
    pub fn snapshot(&self) -> RebalanceMetricsSnapshot {
        RebalanceMetricsSnapshot {
            campaigns_started: self.campaigns_started.get(),
            campaigns_succeeded: self.campaigns_succeeded.get(),
            campaigns_cancelled: self.campaigns_cancelled.get(),
            campaigns_failed: self.campaigns_failed.get(),
            partitions_done: self.partitions_done.get(),
            partitions_missed: self.partitions_missed.get(),
            entries_applied: self.entries_applied.get(),
            bytes_received: self.bytes_received.get(),
            supply_messages_sent: self.supply_messages_sent.get(),
            demand_messages_sent: self.demand_messages_sent.get(),
            demand_retries: self.demand_retries.get(),
            duplicates_dropped: self.duplicates_dropped.get(),
            force_key_requests: self.force_key_requests.get(),
            active_demanders: self.active_demanders.get(),
        }
    }
}

/// Point-in-time copy of [`RebalanceMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceMetricsSnapshot {
    pub campaigns_started: u64,
    pub campaigns_succeeded: u64,
    pub campaigns_cancelled: u64,
    pub campaigns_failed: u64,
    pub partitions_done: u64,
    pub partitions_missed: u64,
    pub entries_applied: u64,
    pub bytes_received: u64,
    pub supply_messages_sent: u64,
    pub demand_messages_sent: u64,
    pub demand_retries: u64,
    pub duplicates_dropped: u64,
    pub force_key_requests: u64,
    pub active_demanders: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = RebalanceMetrics::new();
        metrics.campaigns_started.inc();
        metrics.entries_applied.inc_by(42);
        metrics.active_demanders.inc();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.campaigns_started, 1);
        assert_eq!(snapshot.entries_applied, 42);
        assert_eq!(snapshot.active_demanders, 1);
        assert_eq!(snapshot.partitions_missed, 0);
    }
}
