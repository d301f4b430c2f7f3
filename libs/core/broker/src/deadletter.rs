//! Dead-letter stream inspection.
//!
//! Dead-letter is terminal: the broker never moves entries back onto a task
//! stream. This manager exists for operators, to see what died and to clear
//! it out.

use crate::error::BrokerError;
use crate::keys::{Keys, Priority};
use crate::task::now_ms;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

// Type alias for Redis stream entries
type StreamEntries = Vec<(String, Vec<(String, String)>)>;

/// Inspection handle for one dead-letter stream.
pub struct DeadLetterManager {
    redis: Arc<ConnectionManager>,
    stream: String,
}

impl DeadLetterManager {
    /// Manager for a priority tier's dead-letter stream.
    pub fn new(redis: ConnectionManager, keys: &Keys, priority: Priority) -> Self {
        Self {
            redis: Arc::new(redis),
            stream: keys.dead_letter(priority),
        }
    }

    /// Manager for the dead-letter stream paired with any task stream.
    pub fn for_stream(redis: ConnectionManager, keys: &Keys, stream_key: &str) -> Self {
        Self {
            redis: Arc::new(redis),
            stream: keys.dead_letter_for(stream_key),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Get dead-letter statistics.
    pub async fn stats(&self) -> Result<DeadLetterStats, BrokerError> {
        let mut conn = (*self.redis).clone();

        let length: i64 = conn.xlen(&self.stream).await.unwrap_or(0);

        let oldest: Option<StreamEntries> = redis::cmd("XRANGE")
            .arg(&self.stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .ok();

        let newest: Option<StreamEntries> = redis::cmd("XREVRANGE")
            .arg(&self.stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .ok();

        let oldest_entry_id = oldest.and_then(|v| v.first().map(|(id, _)| id.clone()));
        let newest_entry_id = newest.and_then(|v| v.first().map(|(id, _)| id.clone()));

        Ok(DeadLetterStats {
            stream_name: self.stream.clone(),
            length,
            oldest_entry_id,
            newest_entry_id,
        })
    }

    /// List entries oldest-first, starting after an optional offset id.
    pub async fn list(
        &self,
        count: usize,
        offset: Option<&str>,
    ) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        let mut conn = (*self.redis).clone();

        let start = offset.unwrap_or("-");

        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(&self.stream)
            .arg(start)
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(entries
            .iter()
            .filter_map(|(id, fields)| DeadLetterEntry::from_fields(id, fields))
            .collect())
    }

    /// Get a specific entry by its dead-letter stream id.
    pub async fn get(&self, entry_id: &str) -> Result<Option<DeadLetterEntry>, BrokerError> {
        let mut conn = (*self.redis).clone();

        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(&self.stream)
            .arg(entry_id)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;

        Ok(entries
            .first()
            .and_then(|(id, fields)| DeadLetterEntry::from_fields(id, fields)))
    }

    /// Delete an entry.
    pub async fn delete(&self, entry_id: &str) -> Result<bool, BrokerError> {
        let mut conn = (*self.redis).clone();

        let deleted: i64 = conn.xdel(&self.stream, &[entry_id]).await?;

        debug!(entry_id = %entry_id, "Deleted dead-letter entry");

        Ok(deleted > 0)
    }

    /// Purge all entries. Returns how many were removed.
    pub async fn purge(&self) -> Result<i64, BrokerError> {
        let mut conn = (*self.redis).clone();

        let length: i64 = conn.xlen(&self.stream).await?;

        if length > 0 {
            let _: () = redis::cmd("XTRIM")
                .arg(&self.stream)
                .arg("MAXLEN")
                .arg(0)
                .query_async(&mut conn)
                .await?;

            info!(count = length, stream = %self.stream, "Purged dead-letter stream");
        }

        Ok(length)
    }
}

impl Clone for DeadLetterManager {
    fn clone(&self) -> Self {
        Self {
            redis: self.redis.clone(),
            stream: self.stream.clone(),
        }
    }
}

/// One dead-lettered task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Id within the dead-letter stream.
    pub id: String,

    pub task_name: String,
    pub payload: String,
    pub enqueued_at: i64,

    /// Stream id the task carried on its original stream.
    pub original_id: String,

    /// Deliveries attempted before giving up.
    pub delivery_count: u64,

    /// Milliseconds since epoch when the task was dead-lettered.
    pub dead_lettered_at: i64,
}

impl DeadLetterEntry {
    fn from_fields(id: &str, fields: &[(String, String)]) -> Option<Self> {
        let get = |name: &str| {
            fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        };

        Some(Self {
            id: id.to_string(),
            task_name: get("taskName")?,
            payload: get("payload")?,
            enqueued_at: get("enqueuedAt")?.parse().ok()?,
            original_id: get("originalId")?,
            delivery_count: get("deliveryCount")?.parse().ok()?,
            dead_lettered_at: get("deadLetteredAt")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or_else(now_ms),
        })
    }
}

/// Dead-letter statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub stream_name: String,
    pub length: i64,
    pub oldest_entry_id: Option<String>,
    pub newest_entry_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_entry_from_fields() {
        let entry = DeadLetterEntry::from_fields(
            "1700000000000-0",
            &fields(&[
                ("taskName", "email.send"),
                ("payload", r#"{"to":"a@b"}"#),
                ("enqueuedAt", "1699999990000"),
                ("originalId", "1699999990001-0"),
                ("deliveryCount", "6"),
                ("deadLetteredAt", "1700000000000"),
            ]),
        )
        .unwrap();

        assert_eq!(entry.task_name, "email.send");
        assert_eq!(entry.original_id, "1699999990001-0");
        assert_eq!(entry.delivery_count, 6);
        assert_eq!(entry.dead_lettered_at, 1_700_000_000_000);
    }

    #[test]
    fn test_entry_requires_task_fields() {
        let result = DeadLetterEntry::from_fields(
            "1-0",
            &fields(&[("originalId", "0-1"), ("deliveryCount", "6")]),
        );
        assert!(result.is_none());
    }
}
