//! Handler executor.
//!
//! Takes one delivered message, invokes the registered handler, and settles
//! the delivery: acknowledge on success (after enqueueing any continuation),
//! leave pending on failure so the reclaimer retries or dead-letters it.

use crate::error::BrokerError;
use crate::metrics::{self, TaskStatus};
use crate::producer::{EnqueueOptions, EnqueueOutcome, Producer};
use crate::registry::{Continuation, HandlerOutcome, HandlerRegistry, Payload};
use crate::task::TaskRecord;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

pub struct Executor {
    redis: ConnectionManager,
    registry: Arc<HandlerRegistry>,
    producer: Producer,
}

impl Executor {
    pub fn new(
        redis: ConnectionManager,
        registry: Arc<HandlerRegistry>,
        producer: Producer,
    ) -> Self {
        Self {
            redis,
            registry,
            producer,
        }
    }

    /// Execute one delivery.
    ///
    /// Never returns an error: every outcome is settled against the backing
    /// store here, and a handler failure must not disturb the calling loop.
    pub async fn execute(&self, stream_key: &str, group: &str, message_id: &str, record: TaskRecord) {
        debug!(
            message_id = %message_id,
            task = %record.task_name,
            stream = %stream_key,
            "Processing task"
        );

        let Some(handler) = self.registry.get(&record.task_name) else {
            // Discard rather than letting unroutable messages pile up in the
            // pending list forever.
            warn!(
                message_id = %message_id,
                task = %record.task_name,
                "No handler registered for task, discarding"
            );
            metrics::record_task_processed(stream_key, TaskStatus::Discarded);
            self.ack_or_log(stream_key, group, message_id).await;
            return;
        };

        let start = Instant::now();

        match handler.handle(Payload::new(record.payload.clone())).await {
            Ok(HandlerOutcome::Complete) => {
                metrics::record_task_processed(stream_key, TaskStatus::Completed);
                metrics::record_task_duration(stream_key, start.elapsed());
                self.ack_or_log(stream_key, group, message_id).await;
            }
            Ok(HandlerOutcome::Chain(continuation)) => {
                match self.enqueue_continuation(&record.task_name, continuation).await {
                    Ok(_) => {
                        metrics::record_task_processed(stream_key, TaskStatus::Completed);
                        metrics::record_task_duration(stream_key, start.elapsed());
                        self.ack_or_log(stream_key, group, message_id).await;
                    }
                    Err(e) => {
                        // Not acked: the whole delivery reruns, and the chain
                        // enqueue is retried with it.
                        error!(
                            message_id = %message_id,
                            task = %record.task_name,
                            error = %e,
                            "Failed to enqueue continuation, leaving message pending"
                        );
                        metrics::record_task_processed(stream_key, TaskStatus::Failed);
                    }
                }
            }
            Err(e) => {
                warn!(
                    message_id = %message_id,
                    task = %record.task_name,
                    error = %e,
                    "Task handler failed, leaving message pending for reclaim"
                );
                metrics::record_task_processed(stream_key, TaskStatus::Failed);
            }
        }
    }

    /// Enqueue a workflow continuation through the producer path.
    ///
    /// A positive delay routes through the delayed set; otherwise the next
    /// task lands on the default-priority stream immediately.
    async fn enqueue_continuation(
        &self,
        current_task: &str,
        continuation: Continuation,
    ) -> Result<EnqueueOutcome, BrokerError> {
        let payload = continuation.payload.unwrap_or(serde_json::Value::Null);

        let mut options = EnqueueOptions::new();
        if let Some(delay) = continuation.delay.filter(|d| !d.is_zero()) {
            options = options.with_delay(delay);
        }

        let outcome = self
            .producer
            .enqueue(&continuation.next, &payload, options)
            .await?;

        debug!(
            task = %current_task,
            next = %continuation.next,
            id = ?outcome.id(),
            "Enqueued workflow continuation"
        );

        Ok(outcome)
    }

    /// Remove a delivery from the pending list.
    ///
    /// Idempotent from the broker's perspective: re-acking an already acked
    /// id is a no-op on the server.
    pub async fn acknowledge(
        &self,
        stream_key: &str,
        group: &str,
        message_id: &str,
    ) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();

        let _: () = conn.xack(stream_key, group, &[message_id]).await?;

        debug!(message_id = %message_id, stream = %stream_key, "Acknowledged message");
        Ok(())
    }

    async fn ack_or_log(&self, stream_key: &str, group: &str, message_id: &str) {
        if let Err(e) = self.acknowledge(stream_key, group, message_id).await {
            error!(message_id = %message_id, error = %e, "Failed to ACK message");
        }
    }
}
