//! Task producer.
//!
//! Producers append task records to the priority streams, route delayed tasks
//! through the scheduled sorted set, publish broadcast messages, and enforce
//! the deduplication guard. Producers are standalone: they share nothing with
//! workers except the backing store.

use crate::error::BrokerError;
use crate::keys::{Keys, Priority};
use crate::metrics;
use crate::task::{ScheduledTask, TaskRecord, now_ms};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Deduplication options for an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupeOptions {
    /// Caller-supplied guard key.
    pub key: String,

    /// How long the guard holds. Default: 1 hour.
    pub ttl: Duration,
}

impl DedupeOptions {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl: Duration::from_secs(60 * 60),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Options recognized by [`Producer::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Priority tier (ignored when `queue` is set).
    pub priority: Priority,

    /// Named custom queue, overriding the priority tier.
    pub queue: Option<String>,

    /// Positive delay routes the record through the delayed set.
    pub delay: Option<Duration>,

    pub dedupe: Option<DedupeOptions>,

    pub attempts: Option<u32>,
    pub backoff: Option<crate::task::BackoffPolicy>,
    pub timeout: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_dedupe(mut self, dedupe: DedupeOptions) -> Self {
        self.dedupe = Some(dedupe);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: crate::task::BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended to a stream; carries the server-assigned message id.
    Enqueued(String),

    /// Routed to the delayed set; carries the synthetic `scheduled:<ms>` id.
    Scheduled(String),

    /// Skipped by the deduplication guard. Expected behavior, not an error.
    Deduplicated,
}

impl EnqueueOutcome {
    /// The id of the produced record, if one was produced.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Enqueued(id) | Self::Scheduled(id) => Some(id),
            Self::Deduplicated => None,
        }
    }

    pub fn is_deduplicated(&self) -> bool {
        matches!(self, Self::Deduplicated)
    }
}

/// Task producer over a shared Redis handle.
///
/// # Example
///
/// ```rust,ignore
/// let producer = Producer::new(redis, "backstage");
///
/// let outcome = producer
///     .enqueue("email.send", &json!({"to": "a@b"}), EnqueueOptions::new())
///     .await?;
/// ```
pub struct Producer {
    redis: ConnectionManager,
    keys: Keys,
}

impl Producer {
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            keys: Keys::new(prefix),
        }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Enqueue a task.
    ///
    /// Resolution order: the dedupe guard gates everything; an explicit
    /// `queue` beats `priority`; a positive `delay` routes through the
    /// delayed set instead of appending to the stream.
    pub async fn enqueue<P: Serialize + ?Sized>(
        &self,
        task_name: &str,
        payload: &P,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, BrokerError> {
        if task_name.is_empty() {
            return Err(BrokerError::InvalidRecord("empty task name".to_string()));
        }

        if let Some(dedupe) = &options.dedupe {
            if !self.acquire_dedupe_guard(dedupe).await? {
                debug!(task = %task_name, key = %dedupe.key, "Enqueue skipped by dedupe guard");
                metrics::record_deduplicated();
                return Ok(EnqueueOutcome::Deduplicated);
            }
        }

        let stream_key = match &options.queue {
            Some(queue) => self.keys.queue_stream(queue),
            None => self.keys.priority_stream(options.priority),
        };

        let record = TaskRecord {
            task_name: task_name.to_string(),
            payload: serde_json::to_string(payload)?,
            enqueued_at: now_ms(),
            attempts: options.attempts,
            backoff: options.backoff.clone(),
            timeout: options.timeout.map(|t| t.as_millis() as u64),
        };

        if let Some(delay) = options.delay.filter(|d| !d.is_zero()) {
            return self.schedule(record, stream_key, &options, delay).await;
        }

        let message_id = self.xadd(&stream_key, &record).await?;

        debug!(
            task = %task_name,
            stream = %stream_key,
            message_id = %message_id,
            "Enqueued task"
        );

        Ok(EnqueueOutcome::Enqueued(message_id))
    }

    /// Publish a broadcast message to every worker.
    ///
    /// Broadcasts carry only the canonical fields: never deduplicated, never
    /// delayed.
    pub async fn broadcast<P: Serialize + ?Sized>(
        &self,
        task_name: &str,
        payload: &P,
    ) -> Result<String, BrokerError> {
        if task_name.is_empty() {
            return Err(BrokerError::InvalidRecord("empty task name".to_string()));
        }

        let record = TaskRecord::new(task_name, serde_json::to_string(payload)?);
        let message_id = self.xadd(&self.keys.broadcast(), &record).await?;

        debug!(task = %task_name, message_id = %message_id, "Published broadcast");
        metrics::record_broadcast();

        Ok(message_id)
    }

    /// Atomically claim the dedupe guard. Returns false when it already exists.
    async fn acquire_dedupe_guard(&self, dedupe: &DedupeOptions) -> Result<bool, BrokerError> {
        let mut conn = self.redis.clone();
        let guard_key = self.keys.dedupe(&dedupe.key);

        let created: Option<String> = redis::cmd("SET")
            .arg(&guard_key)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(dedupe.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(created.is_some())
    }

    /// Route a record into the delayed set for later promotion.
    async fn schedule(
        &self,
        record: TaskRecord,
        stream_key: String,
        options: &EnqueueOptions,
        delay: Duration,
    ) -> Result<EnqueueOutcome, BrokerError> {
        let execute_at = record.enqueued_at + delay.as_millis() as i64;

        // The priority name rides along as a fallback for promoters that
        // predate the streamKey field.
        let priority_hint = match options.queue {
            Some(_) => None,
            None => Some(options.priority.as_str().to_string()),
        };

        let member = serde_json::to_string(&ScheduledTask::from_record(
            &record,
            stream_key,
            priority_hint,
        )?)?;

        let mut conn = self.redis.clone();
        let _: () = conn.zadd(self.keys.scheduled(), member, execute_at).await?;

        debug!(
            task = %record.task_name,
            execute_at = %execute_at,
            "Scheduled delayed task"
        );

        Ok(EnqueueOutcome::Scheduled(format!("scheduled:{}", execute_at)))
    }

    async fn xadd(&self, stream_key: &str, record: &TaskRecord) -> Result<String, BrokerError> {
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream_key).arg("*");
        for (field, value) in record.to_fields()? {
            cmd.arg(field).arg(value);
        }

        let message_id: String = cmd.query_async(&mut conn).await?;
        Ok(message_id)
    }
}

impl Clone for Producer {
    fn clone(&self) -> Self {
        Self {
            redis: self.redis.clone(),
            keys: self.keys.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_ttl_default() {
        let dedupe = DedupeOptions::new("order-7");
        assert_eq!(dedupe.ttl, Duration::from_secs(3600));

        let dedupe = dedupe.with_ttl(Duration::from_millis(60_000));
        assert_eq!(dedupe.ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_enqueue_options_builder() {
        let options = EnqueueOptions::new()
            .with_priority(Priority::Urgent)
            .with_delay(Duration::from_secs(10))
            .with_attempts(3)
            .with_timeout(Duration::from_secs(30));

        assert_eq!(options.priority, Priority::Urgent);
        assert_eq!(options.delay, Some(Duration::from_secs(10)));
        assert_eq!(options.attempts, Some(3));
        assert_eq!(options.timeout, Some(Duration::from_secs(30)));
        assert!(options.queue.is_none());
    }

    #[test]
    fn test_outcome_accessors() {
        let enqueued = EnqueueOutcome::Enqueued("1-0".to_string());
        assert_eq!(enqueued.id(), Some("1-0"));
        assert!(!enqueued.is_deduplicated());

        let scheduled = EnqueueOutcome::Scheduled("scheduled:1700000000000".to_string());
        assert_eq!(scheduled.id(), Some("scheduled:1700000000000"));

        let skipped = EnqueueOutcome::Deduplicated;
        assert_eq!(skipped.id(), None);
        assert!(skipped.is_deduplicated());
    }
}
