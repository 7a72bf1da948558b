//! Dispatcher behaviour against the in-memory outbox and the in-process bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{AggregateId, UserId};
use events::{
    DomainEvent, EventFilter, EventPublisher, FnHandler, HandlerError, InProcessEventBus,
    OrderCreatedData, PublishError, PublishReport,
};
use outbox::{
    ClaimSettings, DispatcherConfig, EventId, HandlerFailurePolicy, Idempotent,
    InMemoryIdempotencyLedger, InMemoryOutboxStore, OutboxDispatcher, OutboxError, OutboxRecord,
    OutboxStore, Result,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

fn order_created(total: i64) -> DomainEvent {
    DomainEvent::order_created(OrderCreatedData {
        order_id: AggregateId::new(),
        user_id: UserId::new(),
        total_amount: total,
        currency: "USD".to_string(),
    })
}

fn config(max_attempts: u32) -> DispatcherConfig {
    DispatcherConfig {
        poll_interval: Duration::from_millis(10),
        max_attempts,
        ..DispatcherConfig::default()
    }
}

/// Records published event ids in order.
#[derive(Clone, Default)]
struct RecordingPublisher {
    seen: Arc<Mutex<Vec<EventId>>>,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        event: &DomainEvent,
    ) -> std::result::Result<PublishReport, PublishError> {
        self.seen.lock().await.push(event.id());
        Ok(PublishReport {
            handlers_invoked: 1,
            ..PublishReport::empty(event)
        })
    }
}

/// Fails every publish.
struct BrokenPublisher;

#[async_trait]
impl EventPublisher for BrokenPublisher {
    async fn publish(
        &self,
        _event: &DomainEvent,
    ) -> std::result::Result<PublishReport, PublishError> {
        Err(PublishError::Transport("broker unreachable".to_string()))
    }
}

/// Delegates to the in-memory store but fails `mark_processed` while armed.
#[derive(Clone)]
struct FlakyMarkStore {
    inner: InMemoryOutboxStore,
    fail_mark: Arc<AtomicBool>,
}

#[async_trait]
impl OutboxStore for FlakyMarkStore {
    async fn add_event(&self, event: &DomainEvent) -> Result<()> {
        self.inner.add_event(event).await
    }

    async fn mark_processed(&self, id: EventId) -> Result<()> {
        if self.fail_mark.swap(false, Ordering::SeqCst) {
            return Err(OutboxError::Unavailable("connection reset".to_string()));
        }
        self.inner.mark_processed(id).await
    }

    async fn increment_attempt(&self, id: EventId, error: Option<&str>) -> Result<u32> {
        self.inner.increment_attempt(id, error).await
    }

    async fn fetch_pending(&self, limit: usize, max_attempts: u32) -> Result<Vec<OutboxRecord>> {
        self.inner.fetch_pending(limit, max_attempts).await
    }

    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: usize,
        max_attempts: u32,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>> {
        self.inner
            .claim_pending(worker_id, limit, max_attempts, lease)
            .await
    }

    async fn dead_letters(&self, max_attempts: u32, limit: usize) -> Result<Vec<OutboxRecord>> {
        self.inner.dead_letters(max_attempts, limit).await
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>> {
        self.inner.get(id).await
    }
}

#[tokio::test]
async fn test_tick_delivers_in_order_and_marks_processed() {
    let store = InMemoryOutboxStore::new();
    let events: Vec<_> = (0..3).map(|i| order_created(i * 100)).collect();
    for event in &events {
        store.add_event(event).await.unwrap();
    }

    let publisher = RecordingPublisher::default();
    let dispatcher = OutboxDispatcher::new(store.clone(), publisher.clone(), config(10));

    let report = dispatcher.tick().await.unwrap();
    assert_eq!(report.fetched, 3);
    assert_eq!(report.delivered, 3);
    assert_eq!(report.failed, 0);

    let seen = publisher.seen.lock().await.clone();
    assert_eq!(seen, events.iter().map(|e| e.id()).collect::<Vec<_>>());
    assert_eq!(store.unprocessed_count().await, 0);

    // Nothing left for the next tick.
    assert_eq!(dispatcher.tick().await.unwrap().fetched, 0);
}

#[tokio::test]
async fn test_republished_event_keeps_identity() {
    let store = InMemoryOutboxStore::new();
    let event = order_created(4200);
    store.add_event(&event).await.unwrap();

    let bus = InProcessEventBus::new();
    let received = Arc::new(Mutex::new(None));
    let slot = received.clone();
    bus.subscribe(
        "order.created",
        Arc::new(FnHandler::new("capture", move |e: DomainEvent| {
            let slot = slot.clone();
            async move {
                *slot.lock().await = Some(e);
                Ok::<(), HandlerError>(())
            }
        })),
    );

    let dispatcher = OutboxDispatcher::new(store, bus, config(10));
    dispatcher.tick().await.unwrap();

    let delivered = received.lock().await.clone().unwrap();
    assert_eq!(delivered.id(), event.id());
    assert_eq!(delivered.occurred_at(), event.occurred_at());
    assert_eq!(delivered.payload(), event.payload());
}

#[tokio::test]
async fn test_failures_are_bounded_and_dead_lettered() {
    let store = InMemoryOutboxStore::new();
    let event = order_created(100);
    store.add_event(&event).await.unwrap();

    let dispatcher = OutboxDispatcher::new(store.clone(), BrokenPublisher, config(3));

    let mut dead_lettered = 0;
    for _ in 0..5 {
        dead_lettered += dispatcher.tick().await.unwrap().dead_lettered;
    }

    let record = store.get(event.id()).await.unwrap().unwrap();
    assert_eq!(record.attempt, 3);
    assert!(record.processed_at.is_none());
    assert_eq!(
        record.error.as_deref(),
        Some("Transport error: broker unreachable")
    );
    assert_eq!(dead_lettered, 1);

    let dead = store.dead_letters(3, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, event.id());
}

#[tokio::test]
async fn test_one_failure_does_not_block_the_batch() {
    let store = InMemoryOutboxStore::new();
    let good = order_created(1);
    store.add_event(&good).await.unwrap();

    // A stored row whose payload no longer matches its type.
    let mut broken = OutboxRecord::from_event(&order_created(2)).unwrap();
    broken.id = EventId::new();
    broken.payload = serde_json::json!({ "unexpected": true });
    store.insert_committed(vec![broken.clone()]).await.unwrap();

    let later = order_created(3);
    store.add_event(&later).await.unwrap();

    let publisher = RecordingPublisher::default();
    let dispatcher = OutboxDispatcher::new(store.clone(), publisher.clone(), config(10));
    let report = dispatcher.tick().await.unwrap();

    assert_eq!(report.fetched, 3);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);

    let record = store.get(broken.id).await.unwrap().unwrap();
    assert_eq!(record.attempt, 1);
    assert!(record.error.unwrap().starts_with("undecodable payload"));
    assert_eq!(publisher.seen.lock().await.len(), 2);
}

#[tokio::test]
async fn test_handler_failure_policy() {
    let failing_bus = || {
        let bus = InProcessEventBus::new();
        bus.subscribe(
            EventFilter::All,
            Arc::new(FnHandler::new("flaky", |_e: DomainEvent| async {
                Err::<(), _>(HandlerError::new("downstream 503"))
            })),
        );
        bus
    };

    let store = InMemoryOutboxStore::new();
    let event = order_created(10);
    store.add_event(&event).await.unwrap();
    let acknowledging = OutboxDispatcher::new(store.clone(), failing_bus(), config(10));
    let report = acknowledging.tick().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert!(store.get(event.id()).await.unwrap().unwrap().is_processed());

    let store = InMemoryOutboxStore::new();
    let event = order_created(10);
    store.add_event(&event).await.unwrap();
    let retrying = OutboxDispatcher::new(
        store.clone(),
        failing_bus(),
        DispatcherConfig {
            handler_failures: HandlerFailurePolicy::Retry,
            ..config(10)
        },
    );
    let report = retrying.tick().await.unwrap();
    assert_eq!(report.failed, 1);

    let record = store.get(event.id()).await.unwrap().unwrap();
    assert!(!record.is_processed());
    assert_eq!(record.attempt, 1);
    assert_eq!(record.error.as_deref(), Some("flaky: downstream 503"));
}

#[tokio::test]
async fn test_unreadable_outbox_aborts_tick() {
    let store = InMemoryOutboxStore::new();
    store.set_unavailable(true);
    let dispatcher = OutboxDispatcher::new(store, RecordingPublisher::default(), config(10));

    assert!(dispatcher.tick().await.unwrap_err().is_unavailable());
}

#[tokio::test]
async fn test_redelivery_after_lost_ack_is_deduplicated() {
    let inner = InMemoryOutboxStore::new();
    let store = FlakyMarkStore {
        inner: inner.clone(),
        fail_mark: Arc::new(AtomicBool::new(true)),
    };
    let event = order_created(999);
    store.add_event(&event).await.unwrap();

    let applied = Arc::new(AtomicUsize::new(0));
    let counter = applied.clone();
    let bus = InProcessEventBus::new();
    bus.subscribe(
        "order.created",
        Arc::new(Idempotent::new(
            FnHandler::new("send_receipt", move |_e: DomainEvent| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            }),
            InMemoryIdempotencyLedger::new(),
        )),
    );

    let dispatcher = OutboxDispatcher::new(store, bus, config(10));

    let first = dispatcher.tick().await.unwrap();
    assert_eq!(first.delivered, 0);
    assert_eq!(first.failed, 1);

    let second = dispatcher.tick().await.unwrap();
    assert_eq!(second.delivered, 1);

    assert_eq!(applied.load(Ordering::SeqCst), 1);
    assert_eq!(inner.unprocessed_count().await, 0);
}

#[tokio::test]
async fn test_claiming_dispatchers_do_not_share_rows() {
    let store = InMemoryOutboxStore::new();
    for i in 0..20 {
        store.add_event(&order_created(i)).await.unwrap();
    }

    let publisher = RecordingPublisher::default();
    let claiming = |worker: &str| DispatcherConfig {
        batch_size: 7,
        claim: Some(ClaimSettings {
            worker_id: worker.to_string(),
            lease: Duration::from_secs(30),
        }),
        ..config(10)
    };
    let a = OutboxDispatcher::new(store.clone(), publisher.clone(), claiming("a"));
    let b = OutboxDispatcher::new(store.clone(), publisher.clone(), claiming("b"));

    for _ in 0..3 {
        let (ra, rb) = tokio::join!(a.tick(), b.tick());
        ra.unwrap();
        rb.unwrap();
    }

    let mut seen = publisher.seen.lock().await.clone();
    assert_eq!(seen.len(), 20);
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 20);
    assert_eq!(store.unprocessed_count().await, 0);
}

#[tokio::test]
async fn test_run_delivers_and_stops_on_cancel() {
    let store = InMemoryOutboxStore::new();
    let publisher = RecordingPublisher::default();
    let shutdown = CancellationToken::new();

    let handle = OutboxDispatcher::new(store.clone(), publisher.clone(), config(10))
        .spawn(shutdown.clone());

    store.add_event(&order_created(5)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while store.unprocessed_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dispatcher should deliver the event");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("dispatcher should stop after cancellation")
        .unwrap();

    assert_eq!(publisher.seen.lock().await.len(), 1);
}

#[tokio::test]
async fn test_run_survives_unreadable_outbox() {
    let store = InMemoryOutboxStore::new();
    store.set_unavailable(true);
    let publisher = RecordingPublisher::default();
    let shutdown = CancellationToken::new();

    let handle = OutboxDispatcher::new(store.clone(), publisher.clone(), config(10))
        .spawn(shutdown.clone());

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!handle.is_finished());

    store.set_unavailable(false);
    store.add_event(&order_created(5)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while store.unprocessed_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dispatcher should recover once the outbox is readable");

    shutdown.cancel();
    handle.await.unwrap();
}
