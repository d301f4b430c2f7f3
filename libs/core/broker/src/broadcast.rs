//! Broadcast fan-out.
//!
//! One shared stream, one consumer group per worker (`broadcast-<workerId>`),
//! so every worker receives every message and acks independently. Groups are
//! created at offset `0`: a newly started worker sees everything appended
//! after the stream existed, and a group recreated after a reap loses nothing
//! produced since. The reaper destroys groups left behind by dead workers.

use crate::config::BroadcastConfig;
use crate::error::BrokerError;
use crate::executor::Executor;
use crate::keys::Keys;
use crate::metrics;
use crate::task::TaskRecord;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamInfoConsumersReply, StreamInfoGroupsReply, StreamReadOptions, StreamReadReply,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Messages fetched per broadcast group-read.
const READ_BATCH_SIZE: usize = 10;

/// How often the stale-group reaper runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct Broadcast {
    redis: ConnectionManager,
    keys: Keys,
    worker_id: String,
    group: String,
    block_timeout: Duration,
    consumer_idle_threshold: Duration,
}

impl Broadcast {
    pub fn new(
        redis: ConnectionManager,
        keys: Keys,
        worker_id: impl Into<String>,
        config: &BroadcastConfig,
    ) -> Self {
        let worker_id = worker_id.into();
        let group = keys.broadcast_group(&worker_id);
        Self {
            redis,
            keys,
            worker_id,
            group,
            block_timeout: config.block_timeout,
            consumer_idle_threshold: config.consumer_idle_threshold,
        }
    }

    /// This worker's own consumer group name.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Create this worker's consumer group at offset `0`, tolerating
    /// "already exists".
    pub async fn initialize(&self) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.keys.broadcast())
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                info!(group = %self.group, "Created broadcast consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(group = %self.group, "Broadcast consumer group already exists");
                Ok(())
            }
            Err(e) => Err(BrokerError::ConsumerGroup(e.to_string())),
        }
    }

    /// Append a broadcast message.
    pub async fn send<P: Serialize + ?Sized>(
        &self,
        task_name: &str,
        payload: &P,
    ) -> Result<String, BrokerError> {
        let mut conn = self.redis.clone();
        let record = TaskRecord::new(task_name, serde_json::to_string(payload)?);

        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.keys.broadcast()).arg("*");
        for (field, value) in record.to_fields()? {
            cmd.arg(field).arg(value);
        }

        let message_id: String = cmd.query_async(&mut conn).await?;
        metrics::record_broadcast();
        Ok(message_id)
    }

    /// Read new broadcast messages for this worker's group, blocking up to
    /// the configured timeout.
    pub async fn read(&self) -> Result<Vec<(String, TaskRecord)>, BrokerError> {
        let mut conn = self.redis.clone();

        let opts = StreamReadOptions::default()
            .group(&self.group, &self.worker_id)
            .count(READ_BATCH_SIZE)
            .block(self.block_timeout.as_millis() as usize);

        let key = self.keys.broadcast();
        let result: Result<StreamReadReply, _> =
            conn.xread_options(&[key.as_str()], &[">"], &opts).await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                let err_str = e.to_string().to_lowercase();
                if err_str.contains("timed out")
                    || err_str.contains("nil")
                    || (err_str.contains("response") && err_str.contains("type"))
                {
                    return Ok(vec![]);
                }
                return Err(BrokerError::Redis(e));
            }
        };

        let mut messages = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                match TaskRecord::from_stream_entry(&entry) {
                    Ok(record) => messages.push((entry.id, record)),
                    Err(e) => {
                        // Broadcast messages have no reclaimer; drop bad ones.
                        warn!(
                            message_id = %entry.id,
                            error = %e,
                            "Failed to decode broadcast message, acknowledging"
                        );
                        self.acknowledge(&entry.id).await?;
                    }
                }
            }
        }

        Ok(messages)
    }

    /// Acknowledge a broadcast delivery within this worker's group.
    pub async fn acknowledge(&self, message_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .xack(self.keys.broadcast(), &self.group, &[message_id])
            .await?;
        Ok(())
    }

    /// Destroy broadcast groups abandoned by dead workers.
    ///
    /// A group is stale when it has no consumers, or when every consumer has
    /// been idle at least the configured threshold. This worker's own group
    /// is never destroyed, whatever its idle numbers say.
    pub async fn cleanup(&self) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let stream = self.keys.broadcast();

        let groups: StreamInfoGroupsReply = match redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(&stream)
            .query_async(&mut conn)
            .await
        {
            Ok(groups) => groups,
            Err(e) if e.to_string().contains("no such key") => return Ok(0),
            Err(e) => return Err(BrokerError::Redis(e)),
        };

        let threshold_ms = self.consumer_idle_threshold.as_millis() as usize;
        let mut destroyed = 0;

        for group in groups.groups {
            if group.name == self.group {
                continue;
            }
            // Other keyspace users may attach their own groups; only reap
            // the ones this broker created.
            if !group.name.starts_with("broadcast-") {
                continue;
            }

            let consumers: StreamInfoConsumersReply = redis::cmd("XINFO")
                .arg("CONSUMERS")
                .arg(&stream)
                .arg(&group.name)
                .query_async(&mut conn)
                .await?;

            let stale = consumers.consumers.is_empty()
                || consumers
                    .consumers
                    .iter()
                    .all(|consumer| consumer.idle >= threshold_ms);

            if stale {
                let _: () = redis::cmd("XGROUP")
                    .arg("DESTROY")
                    .arg(&stream)
                    .arg(&group.name)
                    .query_async(&mut conn)
                    .await?;

                info!(group = %group.name, "Destroyed stale broadcast group");
                destroyed += 1;
            }
        }

        Ok(destroyed)
    }

    /// Run the broadcast consume loop until shutdown.
    ///
    /// Messages are handled sequentially within this worker; the stale-group
    /// reaper runs piggybacked on the loop every few minutes.
    pub async fn run(&self, executor: Arc<Executor>, shutdown: watch::Receiver<bool>) {
        let stream = self.keys.broadcast();
        let mut last_cleanup = std::time::Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.read().await {
                Ok(messages) => {
                    for (message_id, record) in messages {
                        executor
                            .execute(&stream, &self.group, &message_id, record)
                            .await;
                    }
                }
                Err(e) => {
                    if !e.is_block_timeout() {
                        warn!(error = %e, "Broadcast read failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }

            if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                if let Err(e) = self.cleanup().await {
                    debug!(error = %e, "Broadcast group cleanup failed");
                }
                last_cleanup = std::time::Instant::now();
            }
        }

        debug!("Broadcast loop stopped");
    }
}
