//! Pending-entry reclaimer.
//!
//! Periodically re-owns deliveries whose idle age exceeds the configured
//! threshold (a worker died or stalled mid-task) and either re-executes them
//! or moves them to the dead-letter stream once the delivery counter passes
//! the bound. The claim uses the same idle threshold as the scan, so two
//! racing reclaimers cannot both win the same entry: a successful claim
//! resets its idle time.

use crate::config::WorkerConfig;
use crate::error::BrokerError;
use crate::executor::Executor;
use crate::keys::Keys;
use crate::metrics;
use crate::task::{TaskRecord, now_ms, value_to_string};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply};
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

/// Bounded batch of pending entries examined per stream per pass.
const CLAIM_BATCH_SIZE: usize = 10;

pub struct Reclaimer {
    redis: ConnectionManager,
    config: Arc<WorkerConfig>,
    executor: Arc<Executor>,
    in_flight: Arc<Semaphore>,
    keys: Keys,
    streams: Vec<String>,
}

impl Reclaimer {
    pub fn new(
        redis: ConnectionManager,
        config: Arc<WorkerConfig>,
        executor: Arc<Executor>,
        in_flight: Arc<Semaphore>,
    ) -> Self {
        let keys = config.keys();
        let streams = config.stream_keys();
        Self {
            redis,
            config,
            executor,
            in_flight,
            keys,
            streams,
        }
    }

    /// Run the periodic reclaim loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.reclaimer_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would race handlers that just started.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reclaim_once().await {
                        warn!(error = %e, "Reclaim pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Reclaimer stopped");
    }

    /// One reclaim pass over every stream. Returns how many entries were
    /// claimed by this worker.
    pub async fn reclaim_once(&self) -> Result<usize, BrokerError> {
        let mut total = 0;

        for stream in &self.streams {
            match self.reclaim_stream(stream).await {
                Ok(claimed) => total += claimed,
                Err(e) => {
                    // Keep going: one stream failing must not starve the rest.
                    warn!(stream = %stream, error = %e, "Failed to reclaim stream");
                }
            }
        }

        Ok(total)
    }

    async fn reclaim_stream(&self, stream: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let idle_ms = self.config.idle_timeout.as_millis() as u64;

        // Oldest-first bounded batch of entries idle at least the threshold.
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(CLAIM_BATCH_SIZE)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(0);
        }

        let mut claimed_count = 0;

        for entry in pending.ids {
            // The min-idle gate makes the claim race-safe: whichever
            // reclaimer wins resets the idle clock, and the loser's claim
            // returns nothing.
            let claim: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(stream)
                .arg(&self.config.consumer_group)
                .arg(&self.config.worker_id)
                .arg(idle_ms)
                .arg(&entry.id)
                .query_async(&mut conn)
                .await?;

            for message in claim.ids {
                claimed_count += 1;

                // The PEL count reported by XPENDING, plus the claim we just
                // issued.
                let delivery_count = entry.times_delivered as u64 + 1;

                if delivery_count > self.config.max_deliveries {
                    self.dead_letter(stream, &message, delivery_count).await?;
                } else {
                    info!(
                        message_id = %message.id,
                        stream = %stream,
                        delivery_count = %delivery_count,
                        "Reclaimed idle message, re-executing"
                    );
                    self.re_execute(stream, message).await;
                }
            }
        }

        if claimed_count > 0 {
            metrics::record_reclaimed(stream, claimed_count as u64);
        }

        Ok(claimed_count)
    }

    /// Hand a reclaimed message to the executor exactly as a fresh delivery,
    /// honoring the shared concurrency cap.
    async fn re_execute(&self, stream: &str, message: StreamId) {
        let permit = match Arc::clone(&self.in_flight).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        match TaskRecord::from_stream_entry(&message) {
            Ok(record) => {
                let executor = Arc::clone(&self.executor);
                let stream = stream.to_string();
                let group = self.config.consumer_group.clone();

                tokio::spawn(async move {
                    executor.execute(&stream, &group, &message.id, record).await;
                    drop(permit);
                });
            }
            Err(e) => {
                // Undecodable and not yet over the bound: leave it pending so
                // the delivery counter keeps climbing toward dead-letter.
                warn!(
                    message_id = %message.id,
                    stream = %stream,
                    error = %e,
                    "Reclaimed message does not decode, leaving pending"
                );
            }
        }
    }

    /// Move an exhausted message to its stream's dead-letter and acknowledge
    /// the original. The entry itself is never deleted from the source
    /// stream.
    async fn dead_letter(
        &self,
        stream: &str,
        message: &StreamId,
        delivery_count: u64,
    ) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let dead_letter_key = self.keys.dead_letter_for(stream);

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&dead_letter_key).arg("*");

        match TaskRecord::from_stream_entry(message) {
            Ok(record) => {
                for (field, value) in record.to_fields()? {
                    cmd.arg(field).arg(value);
                }
            }
            Err(_) => {
                // Copy whatever fields are present so nothing is lost.
                for (field, value) in &message.map {
                    if let Some(value) = value_to_string(value) {
                        cmd.arg(field).arg(value);
                    }
                }
            }
        }

        cmd.arg("originalId").arg(&message.id);
        cmd.arg("deliveryCount").arg(delivery_count);
        cmd.arg("deadLetteredAt").arg(now_ms());

        let dead_letter_id: String = cmd.query_async(&mut conn).await?;

        let _: () = conn
            .xack(stream, &self.config.consumer_group, &[&message.id])
            .await?;

        warn!(
            message_id = %message.id,
            stream = %stream,
            dead_letter_id = %dead_letter_id,
            delivery_count = %delivery_count,
            "Moved message to dead-letter"
        );
        metrics::record_dead_lettered(stream);

        Ok(())
    }
}
