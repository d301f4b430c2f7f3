//! Stream dispatcher.
//!
//! Per-worker read loop over the priority-ordered stream list under the
//! shared consumer group. The server returns messages from the first stream
//! that has any, which is what makes cross-priority ordering strict. A
//! semaphore bounds in-flight handler invocations (shared with the
//! reclaimer), and the prefetch cap bounds each group-read.

use crate::config::WorkerConfig;
use crate::error::BrokerError;
use crate::executor::Executor;
use crate::metrics;
use crate::task::TaskRecord;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};

pub struct Dispatcher {
    redis: ConnectionManager,
    config: Arc<WorkerConfig>,
    executor: Arc<Executor>,
    in_flight: Arc<Semaphore>,
    streams: Vec<String>,
}

impl Dispatcher {
    pub fn new(
        redis: ConnectionManager,
        config: Arc<WorkerConfig>,
        executor: Arc<Executor>,
        in_flight: Arc<Semaphore>,
    ) -> Self {
        let streams = config.stream_keys();
        Self {
            redis,
            config,
            executor,
            in_flight,
            streams,
        }
    }

    /// The streams this dispatcher reads, in dispatch order.
    pub fn streams(&self) -> &[String] {
        &self.streams
    }

    /// Ensure the shared consumer group exists on every stream.
    ///
    /// Groups are created at offset `0` (with MKSTREAM) so tasks enqueued
    /// before the first worker boots are still delivered.
    pub async fn ensure_groups(&self) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();

        for stream in &self.streams {
            let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(stream)
                .arg(&self.config.consumer_group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match result {
                Ok(_) => {
                    info!(
                        stream = %stream,
                        group = %self.config.consumer_group,
                        "Created consumer group"
                    );
                }
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!(stream = %stream, "Consumer group already exists");
                }
                Err(e) => return Err(BrokerError::ConsumerGroup(e.to_string())),
            }
        }

        Ok(())
    }

    /// Run the dispatch loop until shutdown.
    ///
    /// Transient read errors back off and retry; only shutdown ends the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        self.ensure_groups().await?;

        info!(
            worker_id = %self.config.worker_id,
            group = %self.config.consumer_group,
            streams = ?self.streams,
            prefetch = %self.config.prefetch,
            concurrency = %self.config.concurrency,
            "Starting dispatcher"
        );

        loop {
            if *shutdown.borrow() {
                info!("Received shutdown signal, stopping dispatcher");
                break;
            }

            let available = self.in_flight.available_permits();
            if available == 0 {
                // Backpressure: wait until a handler finishes before reading
                // more, or until shutdown flips.
                tokio::select! {
                    permit = self.in_flight.acquire() => drop(permit),
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let count = self.config.prefetch.min(available);
            match self.read_batch(count).await {
                Ok(messages) => {
                    for (stream_key, message_id, record) in messages {
                        self.dispatch(stream_key, message_id, record).await;
                    }
                }
                Err(e) if e.is_block_timeout() => {
                    debug!("BLOCK timeout - no messages, continuing...");
                }
                Err(e) => {
                    if e.is_nogroup_error() {
                        warn!("Consumer group missing, recreating...");
                        if let Err(create_err) = self.ensure_groups().await {
                            error!(error = %create_err, "Failed to recreate consumer groups");
                        }
                    } else if e.is_connection_error() {
                        warn!(error = %e, "Redis connection error, backing off");
                    } else {
                        error!(error = %e, "Error reading from streams");
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!("Dispatcher stopped");
        Ok(())
    }

    /// Issue one group-read across all streams.
    ///
    /// Undecodable messages are logged and left pending; the reclaimer
    /// eventually dead-letters them.
    async fn read_batch(
        &self,
        count: usize,
    ) -> Result<Vec<(String, String, TaskRecord)>, BrokerError> {
        let mut conn = self.redis.clone();

        let opts = StreamReadOptions::default()
            .group(&self.config.consumer_group, &self.config.worker_id)
            .count(count)
            .block(self.config.block_timeout.as_millis() as usize);

        let keys: Vec<&str> = self.streams.iter().map(String::as_str).collect();
        let ids: Vec<&str> = vec![">"; keys.len()];

        let result: Result<StreamReadReply, _> = conn.xread_options(&keys, &ids, &opts).await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                // A BLOCK timeout surfaces as nil from some connection layers.
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
                    Ok(record) => messages.push((stream.key.clone(), entry.id, record)),
                    Err(e) => {
                        warn!(
                            message_id = %entry.id,
                            stream = %stream.key,
                            error = %e,
                            "Failed to decode task record, leaving pending for reclaim"
                        );
                    }
                }
            }
        }

        if !messages.is_empty() {
            debug!(count = messages.len(), "Received messages");
        }

        Ok(messages)
    }

    /// Hand a message to the executor without awaiting completion.
    async fn dispatch(&self, stream_key: String, message_id: String, record: TaskRecord) {
        // The batch never exceeds the free permits seen at read time, but the
        // reclaimer shares this semaphore, so the acquire can still wait.
        let permit = match Arc::clone(&self.in_flight).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return, // semaphore closed, shutting down
        };

        let executor = Arc::clone(&self.executor);
        let group = self.config.consumer_group.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let concurrency = self.config.concurrency;

        tokio::spawn(async move {
            metrics::set_in_flight_tasks((concurrency - in_flight.available_permits()) as f64);

            executor
                .execute(&stream_key, &group, &message_id, record)
                .await;

            drop(permit);
            metrics::set_in_flight_tasks((concurrency - in_flight.available_permits()) as f64);
        });
    }
}
