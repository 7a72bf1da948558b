//! Process host for the order saga.
//!
//! Wires the saga, the outbox dispatcher and the in-process bus together,
//! and serves a thin JSON API with structured logging (tracing) and
//! Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use events::{EventFilter, EventLogger, InProcessEventBus, event_types};
use metrics_exporter_prometheus::PrometheusHandle;
use outbox::{
    DispatcherConfig, IdempotencyLedger, Idempotent, InMemoryIdempotencyLedger,
    InMemoryOutboxStore, OutboxDispatcher, OutboxStore,
};
use saga::{
    FinalizeOnPaymentSucceeded, InMemoryOrderStore, InMemoryPaymentGateway, OrderCreationSaga,
    PaymentGateway, TransactionProvider,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::orders::AppState;

/// Everything the process runs: shared handler state, the bus and the
/// dispatcher that feeds it.
pub struct Services<T, O> {
    pub state: Arc<AppState<T, O>>,
    pub bus: InProcessEventBus,
    pub dispatcher: OutboxDispatcher<O, InProcessEventBus>,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<T, O>(state: Arc<AppState<T, O>>, metrics_handle: PrometheusHandle) -> Router
where
    T: TransactionProvider + 'static,
    O: OutboxStore + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::ops::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::ops::health::<T, O>))
        .route("/orders", post(routes::orders::create::<T, O>))
        .route("/orders/legacy", post(routes::orders::create_legacy::<T, O>))
        .route("/orders/{id}", get(routes::orders::get::<T, O>))
        .route("/orders/{id}/finalize", post(routes::orders::finalize::<T, O>))
        .route(
            "/orders/{id}/payment/confirm",
            post(routes::orders::confirm_payment::<T, O>),
        )
        .route(
            "/orders/{id}/payment/fail",
            post(routes::orders::fail_payment::<T, O>),
        )
        .route(
            "/outbox/dead-letters",
            get(routes::outbox::dead_letters::<T, O>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds the saga, subscribes the post-commit handlers and prepares the
/// dispatcher over `outbox`.
///
/// Subscribers:
/// - [`EventLogger`] on every event
/// - [`FinalizeOnPaymentSucceeded`] on `payment.succeeded`, deduplicated
///   through `ledger`
pub fn create_services<T, O, L>(
    store: T,
    outbox: O,
    ledger: L,
    gateway: Arc<dyn PaymentGateway>,
    dispatcher_config: DispatcherConfig,
) -> Services<T, O>
where
    T: TransactionProvider + 'static,
    O: OutboxStore + Clone + 'static,
    L: IdempotencyLedger + 'static,
{
    let bus = InProcessEventBus::new();
    let saga = Arc::new(OrderCreationSaga::new(store, gateway, bus.clone()));

    bus.subscribe(EventFilter::All, Arc::new(EventLogger));
    bus.subscribe(
        event_types::PAYMENT_SUCCEEDED,
        Arc::new(Idempotent::new(
            FinalizeOnPaymentSucceeded::new(saga.clone()),
            ledger,
        )),
    );

    let max_attempts = dispatcher_config.max_attempts;
    let dispatcher = OutboxDispatcher::new(outbox.clone(), bus.clone(), dispatcher_config);

    Services {
        state: Arc::new(AppState {
            saga,
            outbox,
            max_attempts,
        }),
        bus,
        dispatcher,
    }
}

/// Database-less wiring with the sandbox payment gateway.
///
/// Returns the order store too so callers can seed users and carts.
pub fn create_in_memory_services(
    dispatcher_config: DispatcherConfig,
) -> (
    Services<InMemoryOrderStore, InMemoryOutboxStore>,
    InMemoryOrderStore,
) {
    let store = InMemoryOrderStore::new();
    let services = create_services(
        store.clone(),
        store.outbox().clone(),
        InMemoryIdempotencyLedger::new(),
        Arc::new(InMemoryPaymentGateway::new()),
        dispatcher_config,
    );
    (services, store)
}
