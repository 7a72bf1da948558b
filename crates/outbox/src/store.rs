use std::time::Duration;

use async_trait::async_trait;
use events::DomainEvent;

use crate::{EventId, OutboxRecord, Result};

/// Durable queue of domain events awaiting delivery.
///
/// Writes made inside a business transaction go through the backend's own
/// transactional insert (see [`crate::postgres::insert_outbox_record`]); this
/// trait covers standalone enqueue and everything the dispatcher needs.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persists an event as unprocessed with zero attempts.
    ///
    /// Returns [`crate::OutboxError::Unavailable`] when the outbox table does
    /// not exist.
    async fn add_event(&self, event: &DomainEvent) -> Result<()>;

    /// Marks a record as delivered. Marking twice is a no-op.
    async fn mark_processed(&self, id: EventId) -> Result<()>;

    /// Counts one failed delivery, stores the error text and releases any lease.
    ///
    /// Returns the attempt count after the increment.
    async fn increment_attempt(&self, id: EventId, error: Option<&str>) -> Result<u32>;

    /// Returns up to `limit` unprocessed records below `max_attempts`,
    /// oldest `occurred_at` first, insertion order on ties.
    async fn fetch_pending(&self, limit: usize, max_attempts: u32) -> Result<Vec<OutboxRecord>>;

    /// Like [`OutboxStore::fetch_pending`], but leases the returned rows to
    /// `worker_id` for `lease` so concurrent dispatchers skip them.
    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: usize,
        max_attempts: u32,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>>;

    /// Unprocessed records that have used up `max_attempts`.
    async fn dead_letters(&self, max_attempts: u32, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Looks up a single record.
    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>>;
}

#[async_trait]
impl<T: OutboxStore + ?Sized> OutboxStore for std::sync::Arc<T> {
    async fn add_event(&self, event: &DomainEvent) -> Result<()> {
        (**self).add_event(event).await
    }

    async fn mark_processed(&self, id: EventId) -> Result<()> {
        (**self).mark_processed(id).await
    }

    async fn increment_attempt(&self, id: EventId, error: Option<&str>) -> Result<u32> {
        (**self).increment_attempt(id, error).await
    }

    async fn fetch_pending(&self, limit: usize, max_attempts: u32) -> Result<Vec<OutboxRecord>> {
        (**self).fetch_pending(limit, max_attempts).await
    }

    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: usize,
        max_attempts: u32,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>> {
        (**self)
            .claim_pending(worker_id, limit, max_attempts, lease)
            .await
    }

    async fn dead_letters(&self, max_attempts: u32, limit: usize) -> Result<Vec<OutboxRecord>> {
        (**self).dead_letters(max_attempts, limit).await
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>> {
        (**self).get(id).await
    }
}
