//! Configuration types for rebalancing.
//!
//! Every option is resolved independently: a per-group override wins over the
//! node-wide value, which wins over the built-in default.

use crate::error::{Error, Result};
use std::time::Duration;

/// Default wait budget for a single supply message.
pub const DEFAULT_REBALANCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of batches in flight per supplier.
pub const DEFAULT_BATCHES_PREFETCH_COUNT: usize = 3;

/// Default supply message size in bytes.
pub const DEFAULT_BATCH_SIZE: usize = 512 * 1024;

/// Default number of demand retries before a partition is declared missed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Resolved rebalance configuration for one cache group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceConfig {
    /// Wait budget for each supply message.
    pub timeout: Duration,

    /// Number of batches the demander keeps in flight per supplier.
    pub batches_prefetch_count: usize,

    /// Delay between successive demand messages. Zero disables throttling.
    pub throttle: Duration,

    /// Byte budget of a single supply message.
    pub batch_size: usize,

    /// How many times a timed-out demand is retried.
    pub max_retries: u32,

    /// Wait budget for an on-demand key fetch.
    pub force_keys_timeout: Duration,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REBALANCE_TIMEOUT,
            batches_prefetch_count: DEFAULT_BATCHES_PREFETCH_COUNT,
            throttle: Duration::ZERO,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            force_keys_timeout: DEFAULT_REBALANCE_TIMEOUT,
        }
    }
}

impl RebalanceConfig {
    /// Resolve the effective configuration from node-wide and group settings.
    pub fn resolve(global: &GlobalRebalanceConfig, group: &GroupRebalanceConfig) -> Self {
        let defaults = Self::default();

        Self {
            timeout: group.timeout.or(global.timeout).unwrap_or(defaults.timeout),
            batches_prefetch_count: group
                .batches_prefetch_count
                .or(global.batches_prefetch_count)
                .unwrap_or(defaults.batches_prefetch_count),
            throttle: group
                .throttle
                .or(global.throttle)
                .unwrap_or(defaults.throttle),
            batch_size: group
                .batch_size
                .or(global.batch_size)
                .unwrap_or(defaults.batch_size),
            max_retries: group
                .max_retries
                .or(global.max_retries)
                .unwrap_or(defaults.max_retries),
            force_keys_timeout: group
                .force_keys_timeout
                .or(global.force_keys_timeout)
                .unwrap_or(defaults.force_keys_timeout),
        }
    }

    /// Set the supply message timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of batches in flight.
    pub fn with_batches_prefetch_count(mut self, count: usize) -> Self {
        self.batches_prefetch_count = count;
        self
    }

    /// Set the delay between demand messages.
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Set the supply message size in bytes.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the number of retries for a timed-out demand.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the wait budget for on-demand key fetches.
    pub fn with_force_keys_timeout(mut self, timeout: Duration) -> Self {
        self.force_keys_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::Config("rebalance timeout must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("rebalance batch size must be positive".to_string()));
        }
        if self.batches_prefetch_count == 0 {
            return Err(Error::Config(
                "rebalance batches prefetch count must be at least 1".to_string(),
            ));
        }
        if self.force_keys_timeout.is_zero() {
            return Err(Error::Config("force keys timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Node-wide rebalance settings. Unset fields fall back to built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalRebalanceConfig {
    /// Supply message timeout.
    pub timeout: Option<Duration>,
    /// Batches in flight per supplier.
    pub batches_prefetch_count: Option<usize>,
    /// Delay between demand messages.
    pub throttle: Option<Duration>,
    /// Supply message size in bytes.
    pub batch_size: Option<usize>,
    /// Demand retries before declaring a partition missed.
    pub max_retries: Option<u32>,
    /// On-demand key fetch timeout.
    pub force_keys_timeout: Option<Duration>,
}

impl GlobalRebalanceConfig {
    /// Set the supply message timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the number of batches in flight.
    pub fn with_batches_prefetch_count(mut self, count: usize) -> Self {
        self.batches_prefetch_count = Some(count);
        self
    }

    /// Set the delay between demand messages.
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Set the supply message size in bytes.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// Per cache group overrides of the node-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupRebalanceConfig {
    /// Supply message timeout.
    pub timeout: Option<Duration>,
    /// Batches in flight per supplier.
    pub batches_prefetch_count: Option<usize>,
    /// Delay between demand messages.
    pub throttle: Option<Duration>,
    /// Supply message size in bytes.
    pub batch_size: Option<usize>,
    /// Demand retries before declaring a partition missed.
    pub max_retries: Option<u32>,
    /// On-demand key fetch timeout.
    pub force_keys_timeout: Option<Duration>,
}

impl GroupRebalanceConfig {
    /// Override the supply message timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the number of batches in flight.
    pub fn with_batches_prefetch_count(mut self, count: usize) -> Self {
        self.batches_prefetch_count = Some(count);
        self
    }

    /// Override the delay between demand messages.
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Override the supply message size in bytes.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Override the number of demand retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}
