//! Handler registration and dispatch.
//!
//! Workers register one handler per task name. Payloads are opaque strings on
//! the wire; each handler declares its expected shape by decoding through
//! [`Payload::decode`], and a decode failure is a handler failure (the
//! message stays pending and is eventually retried or dead-lettered).

use crate::error::BrokerError;
use crate::task::NULL_PAYLOAD;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// The raw payload delivered to a handler.
#[derive(Debug, Clone)]
pub struct Payload {
    raw: String,
}

impl Payload {
    pub(crate) fn new(raw: String) -> Self {
        Self { raw }
    }

    /// Decode the payload into the handler's expected type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        Ok(serde_json::from_str(&self.raw)?)
    }

    /// The serialized payload as carried on the wire.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether the producer enqueued an empty payload.
    pub fn is_empty(&self) -> bool {
        self.raw == NULL_PAYLOAD
    }
}

/// What a handler did with its task.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Terminal success: acknowledge and stop.
    Complete,

    /// Success with a workflow continuation: enqueue the next task, then
    /// acknowledge the current one.
    Chain(Continuation),
}

/// The next link of a workflow chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Continuation {
    /// Task name to enqueue next.
    pub next: String,

    /// Payload for the next task; empty when `None`.
    pub payload: Option<serde_json::Value>,

    /// Positive delay routes the next task through the delayed set.
    pub delay: Option<Duration>,
}

impl Continuation {
    pub fn new(next: impl Into<String>) -> Self {
        Self {
            next: next.into(),
            payload: None,
            delay: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Result type returned by every task handler.
pub type HandlerResult = Result<HandlerOutcome, BrokerError>;

/// A task handler.
///
/// # Example
///
/// ```rust,ignore
/// struct SendEmail {
///     mailer: Arc<Mailer>,
/// }
///
/// #[async_trait]
/// impl TaskHandler for SendEmail {
///     fn task_name(&self) -> &str {
///         "email.send"
///     }
///
///     async fn handle(&self, payload: Payload) -> HandlerResult {
///         let email: EmailPayload = payload.decode()?;
///         self.mailer.send(&email).await.map_err(BrokerError::handler)?;
///         Ok(HandlerOutcome::Complete)
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// The task name this handler serves.
    fn task_name(&self) -> &str;

    /// Process one delivery.
    ///
    /// `Ok(Complete)` acknowledges, `Ok(Chain(..))` enqueues the continuation
    /// and then acknowledges, `Err` leaves the message pending for the
    /// reclaimer.
    async fn handle(&self, payload: Payload) -> HandlerResult;
}

/// Registry mapping task names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own task name.
    ///
    /// A later registration for the same name replaces the earlier one.
    pub fn register<H: TaskHandler>(&mut self, handler: H) -> &mut Self {
        self.handlers
            .insert(handler.task_name().to_string(), Arc::new(handler));
        self
    }

    /// Register a closure as the handler for `task_name`.
    pub fn register_fn<F, Fut>(&mut self, task_name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let task_name = task_name.into();
        self.handlers.insert(
            task_name.clone(),
            Arc::new(FnHandler { task_name, handler }),
        );
        self
    }

    pub fn get(&self, task_name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_name).cloned()
    }

    pub fn contains(&self, task_name: &str) -> bool {
        self.handlers.contains_key(task_name)
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

struct FnHandler<F> {
    task_name: String,
    handler: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn task_name(&self) -> &str {
        &self.task_name
    }

    async fn handle(&self, payload: Payload) -> HandlerResult {
        (self.handler)(payload).await
    }
}
