//! Worker configuration
//!
//! This module provides `WorkerConfig` for configuring a worker process and
//! `BroadcastConfig` for the fan-out subsystem. Defaults match the documented
//! deployment envelope; everything can also be loaded from `BACKSTAGE_*`
//! environment variables.

use crate::keys::{DEFAULT_PREFIX, Keys, Priority};
use core_config::{ConfigError, FromEnv, env_or_default, env_parsed};
use std::time::Duration;

/// Default consumer group shared by all workers of a deployment.
pub const DEFAULT_CONSUMER_GROUP: &str = "backstage-workers";

/// A named custom queue served by this worker.
///
/// Custom queues are dispatched after the built-in tiers, ordered by their
/// numeric priority ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomQueue {
    pub name: String,
    pub priority: i64,
}

impl CustomQueue {
    pub fn new(name: impl Into<String>, priority: i64) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }
}

/// Configuration for the broadcast fan-out subsystem.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Consumers idle at least this long mark their group as stale.
    pub consumer_idle_threshold: Duration,

    /// Blocking read timeout for the broadcast group-read.
    pub block_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            consumer_idle_threshold: Duration::from_secs(60 * 60),
            block_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Key prefix shared by every participant of the deployment.
    pub prefix: String,

    /// Shared consumer group over the priority streams.
    pub consumer_group: String,

    /// This worker's consumer identity within the group.
    pub worker_id: String,

    /// Blocking read timeout for the group-read.
    pub block_timeout: Duration,

    /// How often the reclaimer scans for idle pending entries.
    pub reclaimer_interval: Duration,

    /// Pending idle age after which an entry is claimable.
    ///
    /// Must exceed the longest expected handler duration plus a safety
    /// margin, or healthy in-progress tasks get stolen.
    pub idle_timeout: Duration,

    /// Delivery count above which a reclaimed message is dead-lettered.
    pub max_deliveries: u64,

    /// How long shutdown waits for in-flight handlers.
    pub grace_period: Duration,

    /// Maximum messages fetched per group-read.
    pub prefetch: usize,

    /// Maximum concurrent handler invocations.
    pub concurrency: usize,

    /// Custom queues served in addition to the priority tiers.
    pub custom_queues: Vec<CustomQueue>,

    pub broadcast: BroadcastConfig,
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            worker_id: default_worker_id(),
            block_timeout: Duration::from_secs(5),
            reclaimer_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_deliveries: 5,
            grace_period: Duration::from_secs(30),
            prefetch: 10,
            concurrency: 50,
            custom_queues: Vec::new(),
            broadcast: BroadcastConfig::default(),
        }
    }

    /// Set the key prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the shared consumer group name
    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    /// Set the worker identity
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the blocking read timeout
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Set the reclaimer scan interval
    pub fn with_reclaimer_interval(mut self, interval: Duration) -> Self {
        self.reclaimer_interval = interval;
        self
    }

    /// Set the pending idle threshold
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the delivery bound before dead-lettering
    pub fn with_max_deliveries(mut self, max: u64) -> Self {
        self.max_deliveries = max;
        self
    }

    /// Set the shutdown grace period
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Set the read prefetch cap
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Set the concurrent handler cap
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Serve an additional custom queue
    pub fn with_custom_queue(mut self, name: impl Into<String>, priority: i64) -> Self {
        self.custom_queues.push(CustomQueue::new(name, priority));
        self
    }

    /// Set the broadcast configuration
    pub fn with_broadcast(mut self, broadcast: BroadcastConfig) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Key builder for this deployment prefix.
    pub fn keys(&self) -> Keys {
        Keys::new(self.prefix.clone())
    }

    /// The streams this worker reads, in strict dispatch order:
    /// urgent, default, low, then custom queues ascending by priority.
    pub fn stream_keys(&self) -> Vec<String> {
        let keys = self.keys();
        let mut streams: Vec<String> = Priority::ALL
            .iter()
            .map(|priority| keys.priority_stream(*priority))
            .collect();

        let mut queues = self.custom_queues.clone();
        queues.sort_by_key(|queue| queue.priority);
        streams.extend(queues.iter().map(|queue| keys.queue_stream(&queue.name)));

        streams
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Load the worker configuration from `BACKSTAGE_*` environment variables,
/// falling back to the documented defaults.
impl FromEnv for WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::new();

        Ok(Self {
            prefix: env_or_default("BACKSTAGE_PREFIX", &defaults.prefix),
            consumer_group: env_or_default("BACKSTAGE_CONSUMER_GROUP", &defaults.consumer_group),
            worker_id: env_or_default("BACKSTAGE_WORKER_ID", &defaults.worker_id),
            block_timeout: Duration::from_millis(env_parsed(
                "BACKSTAGE_BLOCK_TIMEOUT_MS",
                defaults.block_timeout.as_millis() as u64,
            )?),
            reclaimer_interval: Duration::from_millis(env_parsed(
                "BACKSTAGE_RECLAIMER_INTERVAL_MS",
                defaults.reclaimer_interval.as_millis() as u64,
            )?),
            idle_timeout: Duration::from_millis(env_parsed(
                "BACKSTAGE_IDLE_TIMEOUT_MS",
                defaults.idle_timeout.as_millis() as u64,
            )?),
            max_deliveries: env_parsed("BACKSTAGE_MAX_DELIVERIES", defaults.max_deliveries)?,
            grace_period: Duration::from_millis(env_parsed(
                "BACKSTAGE_GRACE_PERIOD_MS",
                defaults.grace_period.as_millis() as u64,
            )?),
            prefetch: env_parsed("BACKSTAGE_PREFETCH", defaults.prefetch)?.max(1),
            concurrency: env_parsed("BACKSTAGE_CONCURRENCY", defaults.concurrency)?.max(1),
            custom_queues: Vec::new(),
            broadcast: BroadcastConfig {
                consumer_idle_threshold: Duration::from_millis(env_parsed(
                    "BACKSTAGE_BROADCAST_IDLE_THRESHOLD_MS",
                    defaults.broadcast.consumer_idle_threshold.as_millis() as u64,
                )?),
                block_timeout: Duration::from_millis(env_parsed(
                    "BACKSTAGE_BROADCAST_BLOCK_MS",
                    defaults.broadcast.block_timeout.as_millis() as u64,
                )?),
            },
        })
    }
}

/// Default worker identity: `<hostname>-<pid>`.
///
/// HOSTNAME is set by most container runtimes; `worker` is the bare-metal
/// fallback.
fn default_worker_id() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{}-{}", hostname, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();

        assert_eq!(config.prefix, "backstage");
        assert_eq!(config.consumer_group, "backstage-workers");
        assert_eq!(config.block_timeout, Duration::from_secs(5));
        assert_eq!(config.reclaimer_interval, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.max_deliveries, 5);
        assert_eq!(config.grace_period, Duration::from_secs(30));
        assert_eq!(config.prefetch, 10);
        assert_eq!(config.concurrency, 50);
        assert_eq!(
            config.broadcast.consumer_idle_threshold,
            Duration::from_secs(3600)
        );
        assert!(config.worker_id.contains('-'));
    }

    #[test]
    fn test_builder_pattern() {
        let config = WorkerConfig::new()
            .with_prefix("jobs")
            .with_worker_id("worker-1")
            .with_prefetch(25)
            .with_concurrency(4)
            .with_idle_timeout(Duration::from_secs(120));

        assert_eq!(config.prefix, "jobs");
        assert_eq!(config.worker_id, "worker-1");
        assert_eq!(config.prefetch, 25);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_caps_never_zero() {
        let config = WorkerConfig::new().with_prefetch(0).with_concurrency(0);
        assert_eq!(config.prefetch, 1);
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn test_stream_keys_ordering() {
        let config = WorkerConfig::new()
            .with_custom_queue("reports", 20)
            .with_custom_queue("imports", 10);

        assert_eq!(
            config.stream_keys(),
            vec![
                "backstage:urgent",
                "backstage:default",
                "backstage:low",
                "backstage:imports",
                "backstage:reports",
            ]
        );
    }

    #[test]
    fn test_from_env_overrides() {
        temp_env::with_vars(
            [
                ("BACKSTAGE_PREFIX", Some("jobs")),
                ("BACKSTAGE_CONSUMER_GROUP", Some("jobs-workers")),
                ("BACKSTAGE_BLOCK_TIMEOUT_MS", Some("1000")),
                ("BACKSTAGE_MAX_DELIVERIES", Some("2")),
                ("BACKSTAGE_CONCURRENCY", Some("8")),
            ],
            || {
                let config = WorkerConfig::from_env().unwrap();
                assert_eq!(config.prefix, "jobs");
                assert_eq!(config.consumer_group, "jobs-workers");
                assert_eq!(config.block_timeout, Duration::from_millis(1000));
                assert_eq!(config.max_deliveries, 2);
                assert_eq!(config.concurrency, 8);
                // Unset vars keep defaults
                assert_eq!(config.prefetch, 10);
            },
        );
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        temp_env::with_var("BACKSTAGE_PREFETCH", Some("lots"), || {
            let result = WorkerConfig::from_env();
            assert!(result.is_err());
        });
    }
}
