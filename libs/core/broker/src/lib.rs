//! Backstage Broker - Distributed Background-Job Broker on Redis Streams
//!
//! A broker providing at-least-once task delivery between producers and
//! workers, with:
//! - Per-priority streams under one shared consumer group (strict
//!   cross-priority ordering, horizontal scaling)
//! - Prefetch and concurrency caps (backpressure)
//! - Pending-entry reclaim for crashed workers, with per-priority
//!   dead-letter streams
//! - Delayed tasks promoted atomically by a server-side script
//! - Deduplicated enqueues via TTL guard keys
//! - Broadcast fan-out through per-worker consumer groups, with a stale-group
//!   reaper
//! - Workflow chains: a handler can enqueue its successor before acking
//! - Graceful shutdown handling
//! - Health check endpoints and Prometheus metrics
//!
//! # Architecture
//!
//! ```text
//! Producer ──► backstage:urgent / backstage:default / backstage:low
//!          ──► backstage:scheduled ──(promoter script)──► streams
//!          ──► backstage:broadcast
//!                 ↓ (shared consumer group / per-worker groups)
//! Worker { Dispatcher ─► Executor ─► ack | chain }
//!        { Reclaimer  ─► Executor | backstage:<priority>:dead-letter }
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use backstage_broker::{
//!     EnqueueOptions, HandlerOutcome, HandlerRegistry, Payload, Producer, Worker, WorkerConfig,
//! };
//!
//! // Producer side
//! let redis = backstage_broker::connect("redis://127.0.0.1:6379").await?;
//! let producer = Producer::new(redis.clone(), "backstage");
//! producer
//!     .enqueue("email.send", &serde_json::json!({"to": "a@b"}), EnqueueOptions::new())
//!     .await?;
//!
//! // Worker side
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("email.send", |payload: Payload| async move {
//!     let email: EmailPayload = payload.decode()?;
//!     // ... send it ...
//!     Ok(HandlerOutcome::Complete)
//! });
//!
//! let worker = Worker::new(redis, WorkerConfig::from_env()?, registry);
//! worker.run(shutdown_rx).await?;
//! ```

mod broadcast;
mod config;
mod connection;
pub mod deadletter;
mod dispatcher;
mod error;
mod executor;
pub mod health;
mod keys;
pub mod metrics;
mod producer;
mod promoter;
mod reclaimer;
mod registry;
mod task;
mod worker;

// Re-export all public types
pub use broadcast::Broadcast;
pub use config::{BroadcastConfig, CustomQueue, DEFAULT_CONSUMER_GROUP, WorkerConfig};
pub use connection::{connect, connect_with_retry};
pub use deadletter::{DeadLetterEntry, DeadLetterManager, DeadLetterStats};
pub use dispatcher::Dispatcher;
pub use error::BrokerError;
pub use executor::Executor;
pub use health::{HealthState, health_handler, health_router, metrics_handler, ready_handler};
pub use keys::{DEFAULT_PREFIX, Keys, Priority};
pub use producer::{DedupeOptions, EnqueueOptions, EnqueueOutcome, Producer};
pub use promoter::Promoter;
pub use reclaimer::Reclaimer;
pub use registry::{
    Continuation, HandlerOutcome, HandlerRegistry, HandlerResult, Payload, TaskHandler,
};
pub use task::{BackoffKind, BackoffPolicy, NULL_PAYLOAD, ScheduledTask, TaskRecord};
pub use worker::{Worker, shutdown_signal};

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
