//! API server entry point.

use std::sync::Arc;

use api::Services;
use api::config::{Config, LogFormat};
use metrics_exporter_prometheus::PrometheusHandle;
use outbox::{OutboxStore, PostgresIdempotencyLedger, PostgresOutboxStore};
use saga::{InMemoryPaymentGateway, PgOrderStore, TransactionProvider};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Runs the dispatcher and the HTTP server until a shutdown signal arrives.
async fn serve<T, O>(config: &Config, services: Services<T, O>, metrics_handle: PrometheusHandle)
where
    T: TransactionProvider + 'static,
    O: OutboxStore + 'static,
{
    let shutdown = CancellationToken::new();
    let dispatcher = services.dispatcher.spawn(shutdown.clone());

    let app = api::create_app(services.state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Let the in-flight tick finish; undelivered rows stay pending.
    shutdown.cancel();
    if let Err(e) = dispatcher.await {
        tracing::error!(error = %e, "outbox dispatcher task failed");
    }
}

#[tokio::main]
async fn main() {
    // 1. Configuration and tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the stores and run
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .expect("failed to connect to PostgreSQL");

            let outbox = PostgresOutboxStore::new(pool.clone());
            outbox
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL stores");

            let services = api::create_services(
                PgOrderStore::new(pool.clone()),
                outbox,
                PostgresIdempotencyLedger::new(pool),
                Arc::new(InMemoryPaymentGateway::new()),
                config.dispatcher.clone(),
            );
            serve(&config, services, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory stores");
            let (services, _store) = api::create_in_memory_services(config.dispatcher.clone());
            serve(&config, services, metrics_handle).await;
        }
    }

    tracing::info!("server shut down gracefully");
}
