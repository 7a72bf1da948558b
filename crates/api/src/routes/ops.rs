//! Liveness and Prometheus endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use outbox::OutboxStore;
use saga::TransactionProvider;
use serde::Serialize;

use super::orders::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` while the outbox cannot be read.
    pub status: &'static str,
    pub outbox: &'static str,
}

/// GET /health
///
/// Always answers 200; a missing outbox only degrades delivery, writes still
/// go through.
pub async fn health<T, O>(State(state): State<Arc<AppState<T, O>>>) -> Json<HealthResponse>
where
    T: TransactionProvider + 'static,
    O: OutboxStore + 'static,
{
    let outbox = match state.outbox.fetch_pending(1, state.max_attempts).await {
        Ok(_) => "available",
        Err(e) if e.is_unavailable() => "unavailable",
        Err(e) => {
            tracing::warn!(error = %e, "outbox health probe failed");
            "error"
        }
    };

    Json(HealthResponse {
        status: if outbox == "available" { "ok" } else { "degraded" },
        outbox,
    })
}

/// GET /metrics
pub async fn metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
}
