//! Outbox inspection endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use outbox::{OutboxRecord, OutboxStore};
use saga::TransactionProvider;
use serde::{Deserialize, Serialize};

use super::orders::AppState;
use crate::error::ApiError;

const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLettersResponse {
    pub success: bool,
    pub max_attempts: u32,
    pub count: usize,
    pub events: Vec<OutboxRecord>,
}

/// GET /outbox/dead-letters
///
/// Records that used up every delivery attempt.
#[tracing::instrument(skip(state))]
pub async fn dead_letters<T, O>(
    State(state): State<Arc<AppState<T, O>>>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<DeadLettersResponse>, ApiError>
where
    T: TransactionProvider + 'static,
    O: OutboxStore + 'static,
{
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let events = state.outbox.dead_letters(state.max_attempts, limit).await?;

    Ok(Json(DeadLettersResponse {
        success: true,
        max_attempts: state.max_attempts,
        count: events.len(),
        events,
    }))
}
