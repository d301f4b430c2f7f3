//! Redis key schema
//!
//! Every key the broker touches is derived here from a single configurable
//! prefix, so heterogeneous producers and workers interoperate as long as
//! they agree on the prefix.

use std::fmt;
use std::str::FromStr;

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "backstage";

/// Priority tiers, in dispatch order.
///
/// Streams for earlier tiers are always read before later ones, which is what
/// gives the broker its strict cross-priority ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Urgent,
    Default,
    Low,
}

impl Priority {
    /// All tiers in dispatch order (urgent first).
    pub const ALL: [Priority; 3] = [Priority::Urgent, Priority::Default, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::Default => "default",
            Self::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Default
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urgent" => Ok(Self::Urgent),
            "default" => Ok(Self::Default),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Key builder for a deployment prefix.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Stream for a priority tier: `<prefix>:<priority>`.
    pub fn priority_stream(&self, priority: Priority) -> String {
        format!("{}:{}", self.prefix, priority.as_str())
    }

    /// Stream for a named custom queue: `<prefix>:<queue>`.
    pub fn queue_stream(&self, queue: &str) -> String {
        format!("{}:{}", self.prefix, queue)
    }

    /// Delayed-task sorted set: `<prefix>:scheduled`.
    pub fn scheduled(&self) -> String {
        format!("{}:scheduled", self.prefix)
    }

    /// Dead-letter stream for a priority tier: `<prefix>:<priority>:dead-letter`.
    pub fn dead_letter(&self, priority: Priority) -> String {
        self.dead_letter_for(&self.priority_stream(priority))
    }

    /// Dead-letter stream paired with any task stream.
    pub fn dead_letter_for(&self, stream_key: &str) -> String {
        format!("{}:dead-letter", stream_key)
    }

    /// Broadcast stream shared by all workers: `<prefix>:broadcast`.
    pub fn broadcast(&self) -> String {
        format!("{}:broadcast", self.prefix)
    }

    /// Per-worker broadcast consumer group name.
    pub fn broadcast_group(&self, worker_id: &str) -> String {
        format!("broadcast-{}", worker_id)
    }

    /// Deduplication guard key: `<prefix>:dedupe:<key>`.
    pub fn dedupe(&self, key: &str) -> String {
        format!("{}:dedupe:{}", self.prefix, key)
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_round_trip() {
        for priority in Priority::ALL {
            let parsed: Priority = priority.as_str().parse().unwrap();
            assert_eq!(parsed, priority);
        }
        assert!("critical".parse::<Priority>().is_err());
    }

    #[test]
    fn test_priority_dispatch_order() {
        assert_eq!(
            Priority::ALL,
            [Priority::Urgent, Priority::Default, Priority::Low]
        );
        assert_eq!(Priority::default(), Priority::Default);
    }

    #[test]
    fn test_key_schema() {
        let keys = Keys::default();

        assert_eq!(keys.priority_stream(Priority::Urgent), "backstage:urgent");
        assert_eq!(keys.priority_stream(Priority::Default), "backstage:default");
        assert_eq!(keys.queue_stream("reports"), "backstage:reports");
        assert_eq!(keys.scheduled(), "backstage:scheduled");
        assert_eq!(
            keys.dead_letter(Priority::Low),
            "backstage:low:dead-letter"
        );
        assert_eq!(
            keys.dead_letter_for("backstage:reports"),
            "backstage:reports:dead-letter"
        );
        assert_eq!(keys.broadcast(), "backstage:broadcast");
        assert_eq!(keys.broadcast_group("host-42"), "broadcast-host-42");
        assert_eq!(keys.dedupe("order-7"), "backstage:dedupe:order-7");
    }

    #[test]
    fn test_custom_prefix() {
        let keys = Keys::new("jobs");
        assert_eq!(keys.priority_stream(Priority::Default), "jobs:default");
        assert_eq!(keys.dedupe("x"), "jobs:dedupe:x");
    }
}
