//! Fault injection for the in-memory network.
//!
//! Rebalancing must tolerate lost, duplicated and undeliverable messages.
//! A [`ChaosController`] attached to an
//! [`InMemoryNetwork`](crate::network::InMemoryNetwork) decides the
//! [`Delivery`] of every message.

use crate::network::{Delivery, FaultInjector};
use crate::types::NodeId;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Probabilities of random message faults.
#[derive(Debug, Clone, Default)]
pub struct ChaosConfig {
    /// Probability of dropping a message (0.0 - 1.0).
    pub message_drop_probability: f64,

    /// Probability of delivering a message twice (0.0 - 1.0).
    pub message_duplicate_probability: f64,
}

impl ChaosConfig {
    /// Occasional drops, more frequent duplicates.
    pub fn light() -> Self {
        Self::default()
            .with_drop_probability(0.01)
            .with_duplicate_probability(0.05)
    }

    pub fn with_drop_probability(mut self, p: f64) -> Self {
        self.message_drop_probability = p.clamp(0.0, 1.0);
        self
    }

    pub fn with_duplicate_probability(mut self, p: f64) -> Self {
        self.message_duplicate_probability = p.clamp(0.0, 1.0);
        self
    }
}

/// Nodes cut off from everyone else until `heals_at`.
#[derive(Debug, Clone)]
pub struct NetworkPartition {
    pub isolated: HashSet<NodeId>,
    pub heals_at: Instant,
}

impl NetworkPartition {
    /// Whether exactly one of the two nodes is on the isolated side.
    pub fn separates(&self, from: NodeId, to: NodeId) -> bool {
        self.isolated.contains(&from) != self.isolated.contains(&to)
    }

    pub fn is_healed(&self, now: Instant) -> bool {
        now >= self.heals_at
    }
}

#[derive(Debug, Default)]
struct Faults {
    partitions: Vec<NetworkPartition>,
    /// Crashed nodes and when they come back.
    crashes: HashMap<NodeId, Instant>,
}

impl Faults {
    fn expire(&mut self, now: Instant) {
        self.partitions.retain(|p| !p.is_healed(now));
        self.crashes.retain(|_, back_at| *back_at > now);
    }
}

/// Decides the fate of every delivery. Injects nothing until enabled.
#[derive(Debug, Default)]
pub struct ChaosController {
    config: ChaosConfig,
    enabled: AtomicBool,
    faults: Mutex<Faults>,
    dropped: AtomicU64,
    duplicated: AtomicU64,
    partitions_created: AtomicU64,
    crashes_triggered: AtomicU64,
}

impl ChaosController {
    /// Create a disabled controller.
    pub fn new(config: ChaosConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// A controller with no random faults; only manual isolation and crashes.
    pub fn with_defaults() -> Self {
        Self::default()
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Fate of a message from `from` to `to`.
    pub fn delivery(&self, from: NodeId, to: NodeId) -> Delivery {
        if self.is_crashed(to) {
            return Delivery::Unreachable;
        }
        if self.is_partitioned(from, to) || self.should_drop_message(from, to) {
            return Delivery::Dropped;
        }
        if self.should_duplicate_message(from, to) {
            return Delivery::Deliver(2);
        }
        Delivery::Deliver(1)
    }

    fn roll(&self, probability: f64, counter: &AtomicU64) -> bool {
        if !self.is_enabled() || probability <= 0.0 {
            return false;
        }
        let hit = rand::rng().random::<f64>() < probability;
        if hit {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Whether a message should be dropped at random.
    pub fn should_drop_message(&self, _from: NodeId, _to: NodeId) -> bool {
        self.roll(self.config.message_drop_probability, &self.dropped)
    }

    /// Whether a message should be delivered twice.
    pub fn should_duplicate_message(&self, _from: NodeId, _to: NodeId) -> bool {
        self.roll(self.config.message_duplicate_probability, &self.duplicated)
    }

    /// Whether an isolation separates the two nodes. Counts as a drop.
    pub fn is_partitioned(&self, from: NodeId, to: NodeId) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let mut faults = self.faults.lock();
        faults.expire(Instant::now());
        let blocked = faults.partitions.iter().any(|p| p.separates(from, to));
        if blocked {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        blocked
    }

    pub fn is_crashed(&self, node_id: NodeId) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let mut faults = self.faults.lock();
        faults.expire(Instant::now());
        faults.crashes.contains_key(&node_id)
    }

    /// Cut `node_id` off from every other node for `duration`.
    pub fn isolate_node(&self, node_id: NodeId, duration: Duration) {
        self.faults.lock().partitions.push(NetworkPartition {
            isolated: HashSet::from([node_id]),
            heals_at: Instant::now() + duration,
        });
        self.partitions_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Take `node_id` down for `duration`; sends to it fail as unreachable.
    pub fn crash_node(&self, node_id: NodeId, duration: Duration) {
        self.faults
            .lock()
            .crashes
            .insert(node_id, Instant::now() + duration);
        self.crashes_triggered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heal_all_partitions(&self) {
        self.faults.lock().partitions.clear();
    }

    pub fn recover_all_nodes(&self) {
        self.faults.lock().crashes.clear();
    }

    pub fn stats(&self) -> ChaosStats {
        let mut faults = self.faults.lock();
        faults.expire(Instant::now());
        ChaosStats {
            enabled: self.is_enabled(),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            messages_duplicated: self.duplicated.load(Ordering::Relaxed),
            partitions_created: self.partitions_created.load(Ordering::Relaxed),
            active_partitions: faults.partitions.len(),
            crashes_triggered: self.crashes_triggered.load(Ordering::Relaxed),
            active_crashes: faults.crashes.len(),
        }
    }
}

/// Fault injection statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaosStats {
    pub enabled: bool,
    /// Random drops plus messages blocked by an isolation.
    pub messages_dropped: u64,
    pub messages_duplicated: u64,
    pub partitions_created: u64,
    pub active_partitions: usize,
    pub crashes_triggered: u64,
    pub active_crashes: usize,
}

impl FaultInjector for ChaosController {
    fn delivery(&self, from: NodeId, to: NodeId) -> Delivery {
        ChaosController::delivery(self, from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_controller_delivers_everything() {
        let controller = ChaosController::new(
            ChaosConfig::default()
                .with_drop_probability(1.0)
                .with_duplicate_probability(1.0),
        );
        controller.isolate_node(1, Duration::from_secs(60));
        controller.crash_node(2, Duration::from_secs(60));

        assert_eq!(controller.delivery(1, 2), Delivery::Deliver(1));
        assert_eq!(controller.stats().messages_dropped, 0);
    }

    #[test]
    fn test_isolation_drops_both_directions() {
        let controller = ChaosController::with_defaults();
        controller.enable();
        controller.isolate_node(1, Duration::from_secs(60));

        assert_eq!(controller.delivery(1, 2), Delivery::Dropped);
        assert_eq!(controller.delivery(3, 1), Delivery::Dropped);
        assert_eq!(controller.delivery(2, 3), Delivery::Deliver(1));

        controller.heal_all_partitions();
        assert_eq!(controller.delivery(1, 2), Delivery::Deliver(1));
        assert_eq!(controller.stats().messages_dropped, 2);
    }

    #[test]
    fn test_isolation_heals_after_duration() {
        let controller = ChaosController::with_defaults();
        controller.enable();
        controller.isolate_node(1, Duration::ZERO);

        assert!(!controller.is_partitioned(1, 2));
        assert_eq!(controller.stats().active_partitions, 0);
        assert_eq!(controller.stats().partitions_created, 1);
    }

    #[test]
    fn test_crashed_node_unreachable() {
        let controller = ChaosController::with_defaults();
        controller.enable();
        controller.crash_node(1, Duration::from_secs(60));

        assert_eq!(controller.delivery(2, 1), Delivery::Unreachable);
        assert_eq!(controller.delivery(1, 2), Delivery::Deliver(1));

        controller.recover_all_nodes();
        assert!(!controller.is_crashed(1));
        assert_eq!(controller.stats().crashes_triggered, 1);
    }

    #[test]
    fn test_certain_duplicate() {
        let controller =
            ChaosController::new(ChaosConfig::default().with_duplicate_probability(1.0));
        controller.enable();

        assert_eq!(controller.delivery(1, 2), Delivery::Deliver(2));
        assert_eq!(controller.stats().messages_duplicated, 1);
    }

    #[test]
    fn test_light_preset() {
        let config = ChaosConfig::light();
        assert!(config.message_drop_probability < config.message_duplicate_probability);
        assert_eq!(ChaosConfig::default().with_drop_probability(3.0).message_drop_probability, 1.0);
    }
}
