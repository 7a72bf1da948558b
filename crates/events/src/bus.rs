use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::join_all;
use thiserror::Error;

use crate::{DomainEvent, EventId};

/// Failure returned by an [`EventHandler`].
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// A subscriber that reacts to delivered events.
///
/// Delivery is at-least-once: the same event may arrive more than once, so
/// handlers with external effects should be wrapped in an idempotency guard.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs, failure reports and idempotency keys.
    fn name(&self) -> &str;

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        (self.f)(event.clone()).await
    }
}

/// Which events a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Every event ("*").
    All,
    /// Events whose type tag matches exactly.
    Type(String),
}

impl EventFilter {
    pub fn exact(event_type: impl Into<String>) -> Self {
        EventFilter::Type(event_type.into())
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Type(t) => t == event_type,
        }
    }
}

impl From<&str> for EventFilter {
    fn from(s: &str) -> Self {
        if s == "*" {
            EventFilter::All
        } else {
            EventFilter::exact(s)
        }
    }
}

/// Handle returned by [`InProcessEventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// One handler that failed while an event was being published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler: String,
    pub error: String,
    /// The handler panicked rather than returning an error.
    pub panicked: bool,
}

/// Outcome of a publish call.
///
/// Handler failures do not fail the publish; they are collected here so the
/// caller can inspect them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: EventId,
    pub event_type: String,
    /// Number of subscribers the event was delivered to.
    pub handlers_invoked: usize,
    pub failures: Vec<HandlerFailure>,
}

impl PublishReport {
    pub fn empty(event: &DomainEvent) -> Self {
        Self {
            event_id: event.id(),
            event_type: event.event_type().to_string(),
            handlers_invoked: 0,
            failures: Vec::new(),
        }
    }

    /// Returns true if every matched handler succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.handlers_invoked - self.failures.len()
    }
}

/// The publisher itself could not deliver the event.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Event publisher is closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Seam between the outbox dispatcher and whatever delivers events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<PublishReport, PublishError>;
}

#[async_trait]
impl<T: EventPublisher + ?Sized> EventPublisher for Arc<T> {
    async fn publish(&self, event: &DomainEvent) -> Result<PublishReport, PublishError> {
        (**self).publish(event).await
    }
}

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
}

/// In-process publish/subscribe fan-out.
///
/// `publish` runs every matching handler concurrently and resolves once all of
/// them have settled. A failing or panicking handler never affects its
/// siblings or the publisher. The bus does not retry.
#[derive(Clone, Default)]
pub struct InProcessEventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

impl InProcessEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for an exact type or for all events.
    pub fn subscribe(
        &self,
        filter: impl Into<EventFilter>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let filter = filter.into();
        tracing::debug!(handler = handler.name(), ?filter, "subscriber registered");
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                id,
                filter,
                handler,
            });
        id
    }

    /// Removes a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn matching(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.filter.matches(event_type))
            .map(|s| Arc::clone(&s.handler))
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InProcessEventBus {
    #[tracing::instrument(skip(self, event), fields(event_id = %event.id(), event_type = %event.event_type()))]
    async fn publish(&self, event: &DomainEvent) -> Result<PublishReport, PublishError> {
        let handlers = self.matching(event.event_type());
        let mut report = PublishReport::empty(event);
        report.handlers_invoked = handlers.len();

        let outcomes = join_all(handlers.iter().map(|handler| async move {
            let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
            (handler.name().to_string(), outcome)
        }))
        .await;

        for (handler, outcome) in outcomes {
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => {
                    tracing::warn!(%handler, error = %e, "event handler failed");
                    HandlerFailure {
                        handler,
                        error: e.to_string(),
                        panicked: false,
                    }
                }
                Err(panic) => {
                    let error = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(%handler, %error, "event handler panicked");
                    HandlerFailure {
                        handler,
                        error,
                        panicked: true,
                    }
                }
            };
            metrics::counter!("event_bus_handler_failures_total", "event_type" => report.event_type.clone())
                .increment(1);
            report.failures.push(failure);
        }

        Ok(report)
    }
}

/// Wildcard subscriber that logs every delivered event.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventLogger;

#[async_trait]
impl EventHandler for EventLogger {
    fn name(&self) -> &str {
        "event_logger"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        tracing::info!(
            event_id = %event.id(),
            event_type = %event.event_type(),
            aggregate_id = ?event.aggregate_id(),
            occurred_at = %event.occurred_at(),
            "event delivered"
        );
        Ok(())
    }
}
