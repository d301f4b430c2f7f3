//! Error types for broker operations.

use thiserror::Error;

/// Errors that can occur during broker operations.
///
/// Producer-facing operations bubble these to the caller. Worker loops log
/// them and keep running; only an explicit shutdown stops a worker.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Backing store unreachable or a command errored (transport).
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Payload or metadata encode/decode failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Consumer group management error.
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// A stream message that does not carry a valid task record.
    #[error("Invalid task record: {0}")]
    InvalidRecord(String),

    /// A task handler reported failure.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Build a handler failure from any displayable error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Check if this is a BLOCK timeout (normal behavior, not an error).
    ///
    /// When a group-read with BLOCK times out, no messages arrived within the
    /// block period. That is expected and the read loop just continues.
    pub fn is_block_timeout(&self) -> bool {
        match self {
            Self::Redis(e) => {
                let err_str = e.to_string().to_lowercase();
                err_str.contains("timed out") && !err_str.contains("connection")
            }
            _ => false,
        }
    }

    /// Check if this is a connection-related error that might be recoverable.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis(e) => {
                if self.is_block_timeout() {
                    return false;
                }
                let err_str = e.to_string().to_lowercase();
                err_str.contains("connection")
                    || err_str.contains("disconnected")
                    || err_str.contains("broken pipe")
                    || err_str.contains("reset by peer")
                    || err_str.contains("refused")
                    || err_str.contains("eof")
                    || err_str.contains("io error")
            }
            _ => false,
        }
    }

    /// Check if this is a consumer group missing error (NOGROUP).
    pub fn is_nogroup_error(&self) -> bool {
        match self {
            Self::Redis(e) => e.to_string().contains("NOGROUP"),
            Self::ConsumerGroup(s) => s.contains("NOGROUP"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BrokerError::Handler("failed to send email".to_string());
        assert_eq!(err.to_string(), "Handler error: failed to send email");

        let err = BrokerError::InvalidRecord("missing 'taskName' field".to_string());
        assert!(err.to_string().contains("taskName"));
    }

    #[test]
    fn test_handler_constructor() {
        let err = BrokerError::handler("boom");
        assert!(matches!(err, BrokerError::Handler(_)));
    }

    #[test]
    fn test_serialization_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{broken").unwrap_err();
        let err: BrokerError = parse_err.into();
        assert!(matches!(err, BrokerError::Serialization(_)));
        assert!(!err.is_connection_error());
        assert!(!err.is_block_timeout());
    }

    #[test]
    fn test_nogroup_detection() {
        let err = BrokerError::ConsumerGroup(
            "NOGROUP No such consumer group 'backstage-workers'".to_string(),
        );
        assert!(err.is_nogroup_error());

        let err = BrokerError::ConsumerGroup("BUSYGROUP already exists".to_string());
        assert!(!err.is_nogroup_error());
    }
}
