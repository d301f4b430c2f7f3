//! Worker composition.
//!
//! A worker owns one Redis handle and composes the dispatcher, the reclaimer,
//! the promoter, and the broadcast loop around a shared handler registry. The
//! only state shared between subsystems is the backing store and the
//! in-flight semaphore.

use crate::broadcast::Broadcast;
use crate::config::WorkerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::BrokerError;
use crate::executor::Executor;
use crate::producer::Producer;
use crate::promoter::Promoter;
use crate::reclaimer::Reclaimer;
use crate::registry::HandlerRegistry;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// A worker process instance.
///
/// # Example
///
/// ```rust,ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register_fn("email.send", |payload: Payload| async move {
///     // ...
///     Ok(HandlerOutcome::Complete)
/// });
///
/// let worker = Worker::new(redis, WorkerConfig::from_env()?, registry);
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
///
/// tokio::spawn(async move {
///     let _ = shutdown_signal().await;
///     let _ = shutdown_tx.send(true);
/// });
///
/// worker.run(shutdown_rx).await?;
/// ```
pub struct Worker {
    redis: ConnectionManager,
    config: Arc<WorkerConfig>,
    registry: Arc<HandlerRegistry>,
}

impl Worker {
    pub fn new(redis: ConnectionManager, config: WorkerConfig, registry: HandlerRegistry) -> Self {
        Self {
            redis,
            config: Arc::new(config),
            registry: Arc::new(registry),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// A producer sharing this worker's connection and prefix, for enqueueing
    /// from inside the process.
    pub fn producer(&self) -> Producer {
        Producer::new(self.redis.clone(), self.config.prefix.clone())
    }

    /// Run the worker until the shutdown signal flips.
    ///
    /// The dispatcher runs in the foreground; the reclaimer, promoter, and
    /// broadcast loops run as background tasks. On shutdown the worker waits
    /// up to the grace period for in-flight handlers, then exits leaving any
    /// residual pending entries for other workers' reclaimers.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        info!(
            worker_id = %self.config.worker_id,
            group = %self.config.consumer_group,
            handlers = ?self.registry.task_names(),
            "Starting worker"
        );

        let keys = self.config.keys();
        let in_flight = Arc::new(Semaphore::new(self.config.concurrency));

        let producer = self.producer();
        let executor = Arc::new(Executor::new(
            self.redis.clone(),
            Arc::clone(&self.registry),
            producer,
        ));

        let broadcast = Broadcast::new(
            self.redis.clone(),
            keys.clone(),
            self.config.worker_id.clone(),
            &self.config.broadcast,
        );
        broadcast.initialize().await?;

        let mut background = JoinSet::new();

        {
            let reclaimer = Reclaimer::new(
                self.redis.clone(),
                Arc::clone(&self.config),
                Arc::clone(&executor),
                Arc::clone(&in_flight),
            );
            let shutdown = shutdown.clone();
            background.spawn(async move { reclaimer.run(shutdown).await });
        }

        {
            let promoter = Promoter::new(self.redis.clone(), keys.clone());
            let shutdown = shutdown.clone();
            background.spawn(async move { promoter.run(shutdown).await });
        }

        {
            let executor = Arc::clone(&executor);
            let shutdown = shutdown.clone();
            background.spawn(async move { broadcast.run(executor, shutdown).await });
        }

        let dispatcher = Dispatcher::new(
            self.redis.clone(),
            Arc::clone(&self.config),
            Arc::clone(&executor),
            Arc::clone(&in_flight),
        );
        let result = dispatcher.run(shutdown).await;

        // Grace period: wait for in-flight handlers by draining every permit.
        info!(
            grace_period_secs = %self.config.grace_period.as_secs(),
            "Waiting for in-flight tasks"
        );
        match tokio::time::timeout(
            self.config.grace_period,
            in_flight.acquire_many(self.config.concurrency as u32),
        )
        .await
        {
            Ok(Ok(_permits)) => info!("All in-flight tasks completed"),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                "Grace period elapsed with tasks still in flight, leaving them pending for reclaim"
            ),
        }

        background.abort_all();
        while background.join_next().await.is_some() {}

        info!("Worker stopped");
        result
    }
}

/// Wait for a shutdown signal (SIGINT, SIGTERM, or SIGQUIT).
pub async fn shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(unix)]
    let quit = async {
        match signal::unix::signal(signal::unix::SignalKind::quit()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGQUIT handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(not(unix))]
    let quit = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
        _ = quit => {
            info!("Received SIGQUIT, initiating shutdown...");
        }
    }

    Ok(())
}
