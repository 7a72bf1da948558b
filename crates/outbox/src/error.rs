use events::{EventError, PublishError};
use thiserror::Error;

use crate::EventId;

/// Errors that can occur when interacting with the outbox or the ledger.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The backing table is missing or the store is switched off.
    ///
    /// Writers treat this as a degraded mode rather than a hard failure.
    #[error("Outbox storage unavailable: {0}")]
    Unavailable(String),

    /// No record exists with this id.
    #[error("Outbox record not found: {0}")]
    NotFound(EventId),

    /// A record with this id already exists.
    #[error("Outbox record already exists: {0}")]
    Duplicate(EventId),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored payload could not be turned back into an event.
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    /// The fallback publish failed.
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OutboxError {
    /// Returns true for the degraded-mode condition.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, OutboxError::Unavailable(_))
    }
}

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;
