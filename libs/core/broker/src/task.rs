//! Task records and their wire encoding.
//!
//! Stream messages carry a flat field map. The first three fields are always
//! `taskName`, `payload`, `enqueuedAt` in that order so that implementations
//! in other languages can consume the same streams. Optional metadata
//! (`attempts`, `backoff`, `timeout`) follows when present, and every value is
//! a string. An empty payload is the four-character string `null`.

use crate::error::BrokerError;
use chrono::Utc;
use redis::streams::StreamId;
use serde::{Deserialize, Serialize};

/// Wire form of an empty payload.
pub const NULL_PAYLOAD: &str = "null";

/// Current time in milliseconds since epoch.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Best-effort string view of a Redis stream field value.
pub(crate) fn value_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        redis::Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Retry backoff policy carried as task metadata.
///
/// The broker itself retries on the pending-entry idle clock; this policy is
/// opaque metadata that travels with the record for handlers and external
/// tooling, so it round-trips through the delayed set and the dead-letter
/// stream untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    #[serde(rename = "type")]
    pub kind: BackoffKind,

    /// Base delay in milliseconds.
    pub delay: u64,

    /// Upper bound in milliseconds (exponential only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<u64>,
}

impl BackoffPolicy {
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay: delay_ms,
            max_delay: None,
        }
    }

    pub fn exponential(delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay: delay_ms,
            max_delay: Some(max_delay_ms),
        }
    }
}

/// A task record as carried on every stream message.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    /// Registered handler name, never empty.
    pub task_name: String,

    /// Serialized payload (JSON by convention); `"null"` when empty.
    pub payload: String,

    /// Milliseconds since epoch at enqueue time.
    pub enqueued_at: i64,

    pub attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,

    /// Handler timeout in milliseconds.
    pub timeout: Option<u64>,
}

impl TaskRecord {
    pub fn new(task_name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            payload: payload.into(),
            enqueued_at: now_ms(),
            attempts: None,
            backoff: None,
            timeout: None,
        }
    }

    pub fn payload_is_empty(&self) -> bool {
        self.payload == NULL_PAYLOAD
    }

    /// Encode as ordered stream fields.
    ///
    /// The canonical three fields always come first, in order; optional
    /// metadata is appended only when present.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, BrokerError> {
        let mut fields = vec![
            ("taskName", self.task_name.clone()),
            ("payload", self.payload.clone()),
            ("enqueuedAt", self.enqueued_at.to_string()),
        ];

        if let Some(attempts) = self.attempts {
            fields.push(("attempts", attempts.to_string()));
        }
        if let Some(backoff) = &self.backoff {
            fields.push(("backoff", serde_json::to_string(backoff)?));
        }
        if let Some(timeout) = self.timeout {
            fields.push(("timeout", timeout.to_string()));
        }

        Ok(fields)
    }

    /// Decode a record from a stream entry's field map.
    pub fn from_stream_entry(entry: &StreamId) -> Result<Self, BrokerError> {
        let task_name: String = entry
            .get("taskName")
            .ok_or_else(|| BrokerError::InvalidRecord("missing 'taskName' field".to_string()))?;
        if task_name.is_empty() {
            return Err(BrokerError::InvalidRecord("empty 'taskName' field".to_string()));
        }

        let payload: String = entry
            .get("payload")
            .ok_or_else(|| BrokerError::InvalidRecord("missing 'payload' field".to_string()))?;

        let enqueued_at = entry
            .get::<String>("enqueuedAt")
            .ok_or_else(|| BrokerError::InvalidRecord("missing 'enqueuedAt' field".to_string()))?
            .parse::<i64>()
            .map_err(|e| BrokerError::InvalidRecord(format!("bad 'enqueuedAt': {}", e)))?;

        let attempts = match entry.get::<String>("attempts") {
            Some(raw) => Some(
                raw.parse::<u32>()
                    .map_err(|e| BrokerError::InvalidRecord(format!("bad 'attempts': {}", e)))?,
            ),
            None => None,
        };

        let backoff = match entry.get::<String>("backoff") {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };

        let timeout = match entry.get::<String>("timeout") {
            Some(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|e| BrokerError::InvalidRecord(format!("bad 'timeout': {}", e)))?,
            ),
            None => None,
        };

        Ok(Self {
            task_name,
            payload,
            enqueued_at,
            attempts,
            backoff,
            timeout,
        })
    }
}

/// A delayed-set member.
///
/// Carries the full record plus the resolved target `streamKey` (preferred)
/// and the `priority` name as a fallback hint, so the promotion script can
/// always reconstruct a valid stream message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub task_name: String,
    pub payload: String,
    pub enqueued_at: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Serialized backoff policy, copied to the stream field verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl ScheduledTask {
    pub fn from_record(
        record: &TaskRecord,
        stream_key: String,
        priority: Option<String>,
    ) -> Result<Self, BrokerError> {
        let backoff = match &record.backoff {
            Some(policy) => Some(serde_json::to_string(policy)?),
            None => None,
        };

        Ok(Self {
            task_name: record.task_name.clone(),
            payload: record.payload.clone(),
            enqueued_at: record.enqueued_at,
            stream_key: Some(stream_key),
            priority,
            attempts: record.attempts,
            backoff,
            timeout: record.timeout,
        })
    }
}
