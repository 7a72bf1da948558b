use events::{DomainEvent, EventPublisher, PublishReport};

use crate::{OutboxError, Result, store::OutboxStore};

/// What happened to an enqueued event.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// Persisted; the dispatcher will deliver it.
    Stored,
    /// The outbox table is missing, so the event went straight to the bus.
    /// No durability or retry applies.
    PublishedInProcess(PublishReport),
}

impl EnqueueOutcome {
    pub fn is_durable(&self) -> bool {
        matches!(self, EnqueueOutcome::Stored)
    }
}

/// Publishes an event directly on the bus, bypassing the outbox.
///
/// Used when the outbox is unavailable. Handler failures are only logged.
pub async fn publish_in_process<P>(publisher: &P, event: &DomainEvent) -> Result<PublishReport>
where
    P: EventPublisher + ?Sized,
{
    tracing::warn!(
        event_id = %event.id(),
        event_type = event.event_type(),
        "Outbox unavailable, publishing in-process without durability"
    );
    metrics::counter!(
        "outbox_fallback_publish_total",
        "event_type" => event.event_type().to_string()
    )
    .increment(1);

    let report = publisher.publish(event).await?;
    Ok(report)
}

/// Standalone enqueue with in-process fallback.
///
/// For writes tied to a business transaction use the transactional insert of
/// the backend instead, so the event shares the transaction's fate.
pub struct Outbox<S, P> {
    store: S,
    publisher: P,
}

impl<S, P> Outbox<S, P>
where
    S: OutboxStore,
    P: EventPublisher,
{
    pub fn new(store: S, publisher: P) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    #[tracing::instrument(skip(self, event), fields(event_id = %event.id(), event_type = event.event_type()))]
    pub async fn add_event(&self, event: &DomainEvent) -> Result<EnqueueOutcome> {
        match self.store.add_event(event).await {
            Ok(()) => {
                metrics::counter!(
                    "outbox_events_enqueued_total",
                    "event_type" => event.event_type().to_string()
                )
                .increment(1);
                Ok(EnqueueOutcome::Stored)
            }
            Err(OutboxError::Unavailable(reason)) => {
                tracing::debug!(reason = %reason, "Outbox store reported unavailable");
                let report = publish_in_process(&self.publisher, event).await?;
                Ok(EnqueueOutcome::PublishedInProcess(report))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::InMemoryOutboxStore;
    use common::{AggregateId, UserId};
    use events::{EventFilter, FnHandler, HandlerError, InProcessEventBus, OrderCreatedData};

    fn order_created() -> DomainEvent {
        DomainEvent::order_created(OrderCreatedData {
            order_id: AggregateId::new(),
            user_id: UserId::new(),
            total_amount: 500,
            currency: "EUR".to_string(),
        })
    }

    fn counting_bus() -> (InProcessEventBus, Arc<AtomicUsize>) {
        let bus = InProcessEventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        bus.subscribe(
            EventFilter::All,
            Arc::new(FnHandler::new("counter", move |_event: DomainEvent| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            })),
        );
        (bus, seen)
    }

    #[tokio::test]
    async fn test_add_event_stores_without_publishing() {
        let store = InMemoryOutboxStore::new();
        let (bus, seen) = counting_bus();
        let outbox = Outbox::new(store.clone(), bus);

        let outcome = outbox.add_event(&order_created()).await.unwrap();

        assert!(outcome.is_durable());
        assert_eq!(store.len().await, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_table_falls_back_to_bus() {
        let store = InMemoryOutboxStore::new();
        store.set_unavailable(true);
        let (bus, seen) = counting_bus();
        let outbox = Outbox::new(store.clone(), bus);

        let outcome = outbox.add_event(&order_created()).await.unwrap();

        match outcome {
            EnqueueOutcome::PublishedInProcess(report) => {
                assert_eq!(report.handlers_invoked, 1);
                assert!(report.is_clean());
            }
            EnqueueOutcome::Stored => panic!("expected in-process publish"),
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        store.set_unavailable(false);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_other_store_errors_propagate() {
        let store = InMemoryOutboxStore::new();
        let (bus, seen) = counting_bus();
        let outbox = Outbox::new(store, bus);
        let event = order_created();

        outbox.add_event(&event).await.unwrap();
        let result = outbox.add_event(&event).await;

        assert!(matches!(result, Err(OutboxError::Duplicate(_))));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
