//! Metrics module for broker observability.
//!
//! Prometheus-compatible metrics for monitoring dispatch throughput and the
//! periodic subsystems.
//!
//! ## Available Metrics
//!
//! - `broker_tasks_processed_total` - Counter of tasks processed by status
//! - `broker_task_duration_seconds` - Histogram of handler execution time
//! - `broker_in_flight_tasks` - Gauge of currently running handlers
//! - `broker_dead_lettered_total` - Counter of tasks moved to dead-letter
//! - `broker_promoted_total` - Counter of delayed tasks promoted
//! - `broker_reclaimed_total` - Counter of pending entries reclaimed
//! - `broker_broadcasts_total` - Counter of broadcast messages published
//! - `broker_deduplicated_total` - Counter of enqueues skipped by the guard

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for metrics export
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency
pub mod names {
    pub const TASKS_PROCESSED: &str = "broker_tasks_processed_total";
    pub const TASK_DURATION: &str = "broker_task_duration_seconds";
    pub const IN_FLIGHT_TASKS: &str = "broker_in_flight_tasks";
    pub const DEAD_LETTERED: &str = "broker_dead_lettered_total";
    pub const PROMOTED: &str = "broker_promoted_total";
    pub const RECLAIMED: &str = "broker_reclaimed_total";
    pub const BROADCASTS: &str = "broker_broadcasts_total";
    pub const DEDUPLICATED: &str = "broker_deduplicated_total";
}

/// Task completion status for metrics labeling
#[derive(Debug, Clone, Copy)]
pub enum TaskStatus {
    Completed,
    Failed,
    /// No handler registered; the message was discarded.
    Discarded,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Discarded => "discarded",
        }
    }
}

/// Initialize the Prometheus metrics exporter.
///
/// This should be called once at worker startup. Returns the handle whose
/// `render()` produces the Prometheus text format.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Get the global Prometheus handle.
///
/// Returns None if metrics haven't been initialized.
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Record a task as processed with the given status.
pub fn record_task_processed(stream: &str, status: TaskStatus) {
    counter!(
        names::TASKS_PROCESSED,
        "stream" => stream.to_string(),
        "status" => status.as_str().to_string()
    )
    .increment(1);
}

/// Record handler execution duration.
pub fn record_task_duration(stream: &str, duration: Duration) {
    histogram!(names::TASK_DURATION, "stream" => stream.to_string())
        .record(duration.as_secs_f64());
}

/// Set the current number of in-flight handler invocations.
pub fn set_in_flight_tasks(count: f64) {
    gauge!(names::IN_FLIGHT_TASKS).set(count);
}

/// Record a message moved to a dead-letter stream.
pub fn record_dead_lettered(stream: &str) {
    counter!(names::DEAD_LETTERED, "stream" => stream.to_string()).increment(1);
}

/// Record delayed tasks promoted into their target streams.
pub fn record_promoted(count: u64) {
    counter!(names::PROMOTED).increment(count);
}

/// Record pending entries reclaimed from dead consumers.
pub fn record_reclaimed(stream: &str, count: u64) {
    counter!(names::RECLAIMED, "stream" => stream.to_string()).increment(count);
}

/// Record a broadcast message published.
pub fn record_broadcast() {
    counter!(names::BROADCASTS).increment(1);
}

/// Record an enqueue skipped by the deduplication guard.
pub fn record_deduplicated() {
    counter!(names::DEDUPLICATED).increment(1);
}
