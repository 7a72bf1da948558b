use async_trait::async_trait;
use events::{DomainEvent, EventHandler, HandlerError};

use crate::{EventId, Result};

/// Ledger key: `"<handler>:<event id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey(String);

impl HandlerKey {
    pub fn new(handler: &str, event_id: EventId) -> Self {
        Self(format!("{handler}:{event_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of recording a handled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The key was new.
    Recorded,
    /// Another delivery recorded the key first.
    AlreadyRecorded,
}

/// Durable set of (handler, event) pairs whose side effects were applied.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn has_handled(&self, key: &HandlerKey) -> Result<bool>;

    /// Inserts the key if absent. Never fails on an existing key.
    async fn mark_handled(&self, key: &HandlerKey) -> Result<MarkOutcome>;
}

#[async_trait]
impl<T: IdempotencyLedger + ?Sized> IdempotencyLedger for std::sync::Arc<T> {
    async fn has_handled(&self, key: &HandlerKey) -> Result<bool> {
        (**self).has_handled(key).await
    }

    async fn mark_handled(&self, key: &HandlerKey) -> Result<MarkOutcome> {
        (**self).mark_handled(key).await
    }
}

/// Wraps a handler so each event applies its side effects at most once per
/// ledger entry.
///
/// The check-apply-record sequence is not atomic. Two concurrent deliveries of
/// the same event can both apply; the second `mark_handled` then reports
/// [`MarkOutcome::AlreadyRecorded`] and the duplicate is logged and counted.
/// When the ledger itself is unreachable the handler still runs, without
/// deduplication.
pub struct Idempotent<H, L> {
    inner: H,
    ledger: L,
}

impl<H, L> Idempotent<H, L>
where
    H: EventHandler,
    L: IdempotencyLedger,
{
    pub fn new(inner: H, ledger: L) -> Self {
        Self { inner, ledger }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<H, L> EventHandler for Idempotent<H, L>
where
    H: EventHandler,
    L: IdempotencyLedger,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    #[tracing::instrument(skip(self, event), fields(handler = self.inner.name(), event_id = %event.id()))]
    async fn handle(&self, event: &DomainEvent) -> std::result::Result<(), HandlerError> {
        let key = HandlerKey::new(self.inner.name(), event.id());

        match self.ledger.has_handled(&key).await {
            Ok(true) => {
                tracing::debug!(key = %key, "Event already handled, skipping");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "Idempotency ledger unavailable, handling without deduplication"
                );
                metrics::counter!("idempotency_ledger_unavailable_total").increment(1);
            }
        }

        self.inner.handle(event).await?;

        match self.ledger.mark_handled(&key).await {
            Ok(MarkOutcome::Recorded) => {}
            Ok(MarkOutcome::AlreadyRecorded) => {
                tracing::warn!(
                    key = %key,
                    "Concurrent delivery already recorded this event; side effects ran twice"
                );
                metrics::counter!(
                    "idempotency_duplicate_effects_total",
                    "handler" => self.inner.name().to_string()
                )
                .increment(1);
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to record handled event");
                metrics::counter!("idempotency_ledger_unavailable_total").increment(1);
            }
        }

        Ok(())
    }
}
