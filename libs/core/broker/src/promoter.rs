//! Delayed-task promoter.
//!
//! Moves due entries from the delayed sorted set into their target streams
//! with a single server-side script, so an entry is never observable in both
//! places and two workers racing the same tick never double-promote.
//! `redis::Script` invokes by content hash and reloads transparently when the
//! server reports the script is not cached.

use crate::error::BrokerError;
use crate::keys::{Keys, Priority};
use crate::metrics;
use crate::task::now_ms;
use redis::Script;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Promotion cadence per worker.
const PROMOTE_INTERVAL: Duration = Duration::from_secs(1);

pub struct Promoter {
    redis: ConnectionManager,
    keys: Keys,
    script: Script,
}

impl Promoter {
    pub fn new(redis: ConnectionManager, keys: Keys) -> Self {
        Self {
            redis,
            keys,
            script: Script::new(include_str!("lua/promote_scheduled.lua")),
        }
    }

    /// Promote every entry due as of now. Returns the promoted count.
    pub async fn promote_due(&self) -> Result<usize, BrokerError> {
        self.promote_due_at(now_ms()).await
    }

    /// Promote every entry with an execute-at at or below `cutoff_ms`.
    pub async fn promote_due_at(&self, cutoff_ms: i64) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();

        let promoted: usize = self
            .script
            .key(self.keys.scheduled())
            .arg(cutoff_ms)
            .arg(self.keys.prefix())
            .arg(Priority::Default.as_str())
            .invoke_async(&mut conn)
            .await?;

        if promoted > 0 {
            debug!(count = promoted, "Promoted delayed tasks");
            metrics::record_promoted(promoted as u64);
        }

        Ok(promoted)
    }

    /// Run the promotion timer until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(PROMOTE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.promote_due().await {
                        warn!(error = %e, "Promotion tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Promoter stopped");
    }
}
