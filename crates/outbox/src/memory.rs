use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use events::DomainEvent;
use tokio::sync::RwLock;

use crate::{
    EventId, OutboxError, OutboxRecord, Result,
    idempotency::{HandlerKey, IdempotencyLedger, MarkOutcome},
    store::OutboxStore,
};

/// In-memory outbox for tests and database-less runs.
///
/// Mirrors the PostgreSQL store's ordering, lease and attempt semantics.
/// [`InMemoryOutboxStore::set_unavailable`] simulates a missing outbox table.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    records: Arc<RwLock<Vec<OutboxRecord>>>,
    next_sequence: Arc<AtomicI64>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryOutboxStore {
    /// Creates a new empty in-memory outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail with [`OutboxError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(OutboxError::Unavailable(
                "relation \"outbox_events\" does not exist".to_string(),
            ))
        }
    }

    /// Stores records staged by a committed transaction, all or nothing.
    pub async fn insert_committed(&self, records: Vec<OutboxRecord>) -> Result<()> {
        self.ensure_available()?;
        let mut store = self.records.write().await;
        for record in &records {
            if store.iter().any(|r| r.id == record.id) {
                return Err(OutboxError::Duplicate(record.id));
            }
        }
        for mut record in records {
            record.sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
            store.push(record);
        }
        Ok(())
    }

    /// Snapshot of every record in insertion order.
    pub async fn records(&self) -> Vec<OutboxRecord> {
        self.records.read().await.clone()
    }

    /// Returns the total number of records stored.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Number of unprocessed records, dead letters included.
    pub async fn unprocessed_count(&self) -> usize {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| !r.is_processed())
            .count()
    }

    fn oldest_first(records: &mut [OutboxRecord]) {
        records.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then(a.sequence.cmp(&b.sequence))
        });
    }
}

pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(lease)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn add_event(&self, event: &DomainEvent) -> Result<()> {
        let record = OutboxRecord::from_event(event)?;
        self.insert_committed(vec![record]).await
    }

    async fn mark_processed(&self, id: EventId) -> Result<()> {
        self.ensure_available()?;
        let mut store = self.records.write().await;
        let record = store
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(OutboxError::NotFound(id))?;

        if record.processed_at.is_none() {
            record.processed_at = Some(Utc::now());
        }
        record.locked_by = None;
        record.locked_until = None;
        Ok(())
    }

    async fn increment_attempt(&self, id: EventId, error: Option<&str>) -> Result<u32> {
        self.ensure_available()?;
        let mut store = self.records.write().await;
        let record = store
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(OutboxError::NotFound(id))?;

        record.attempt += 1;
        record.error = error.map(str::to_string);
        record.locked_by = None;
        record.locked_until = None;
        Ok(record.attempt)
    }

    async fn fetch_pending(&self, limit: usize, max_attempts: u32) -> Result<Vec<OutboxRecord>> {
        self.ensure_available()?;
        let now = Utc::now();
        let mut pending: Vec<OutboxRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.is_pending(max_attempts, now))
            .cloned()
            .collect();

        Self::oldest_first(&mut pending);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: usize,
        max_attempts: u32,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>> {
        self.ensure_available()?;
        let now = Utc::now();
        let until = lease_deadline(now, lease);

        // The write lock makes select-and-lease atomic, like SKIP LOCKED does.
        let mut store = self.records.write().await;
        let mut ids: Vec<(DateTime<Utc>, i64, EventId)> = store
            .iter()
            .filter(|r| r.is_pending(max_attempts, now))
            .map(|r| (r.occurred_at, r.sequence, r.id))
            .collect();
        ids.sort();
        ids.truncate(limit);

        let mut claimed = Vec::with_capacity(ids.len());
        for (_, _, id) in ids {
            if let Some(record) = store.iter_mut().find(|r| r.id == id) {
                record.locked_by = Some(worker_id.to_string());
                record.locked_until = Some(until);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn dead_letters(&self, max_attempts: u32, limit: usize) -> Result<Vec<OutboxRecord>> {
        self.ensure_available()?;
        let mut dead: Vec<OutboxRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.is_dead_letter(max_attempts))
            .cloned()
            .collect();

        Self::oldest_first(&mut dead);
        dead.truncate(limit);
        Ok(dead)
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>> {
        self.ensure_available()?;
        Ok(self
            .records
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }
}

/// In-memory idempotency ledger.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyLedger {
    keys: Arc<RwLock<HashSet<String>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryIdempotencyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail with [`OutboxError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.keys.read().await.is_empty()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(OutboxError::Unavailable(
                "relation \"event_idempotency\" does not exist".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryIdempotencyLedger {
    async fn has_handled(&self, key: &HandlerKey) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.keys.read().await.contains(key.as_str()))
    }

    async fn mark_handled(&self, key: &HandlerKey) -> Result<MarkOutcome> {
        self.ensure_available()?;
        if self.keys.write().await.insert(key.as_str().to_string()) {
            Ok(MarkOutcome::Recorded)
        } else {
            Ok(MarkOutcome::AlreadyRecorded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{AggregateId, UserId};
    use events::OrderCreatedData;

    fn order_created() -> DomainEvent {
        DomainEvent::order_created(OrderCreatedData {
            order_id: AggregateId::new(),
            user_id: UserId::new(),
            total_amount: 1999,
            currency: "USD".to_string(),
        })
    }

    #[tokio::test]
    async fn test_add_and_fetch_pending() {
        let store = InMemoryOutboxStore::new();
        let first = order_created();
        let second = order_created();
        store.add_event(&first).await.unwrap();
        store.add_event(&second).await.unwrap();

        let pending = store.fetch_pending(50, 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id());
        assert_eq!(pending[1].id, second.id());
        assert!(pending.iter().all(|r| r.attempt == 0));
    }

    #[tokio::test]
    async fn test_fetch_respects_limit() {
        let store = InMemoryOutboxStore::new();
        for _ in 0..5 {
            store.add_event(&order_created()).await.unwrap();
        }
        assert_eq!(store.fetch_pending(3, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = InMemoryOutboxStore::new();
        let event = order_created();
        store.add_event(&event).await.unwrap();

        let result = store.add_event(&event).await;
        assert!(matches!(result, Err(OutboxError::Duplicate(id)) if id == event.id()));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_mark_processed_is_idempotent() {
        let store = InMemoryOutboxStore::new();
        let event = order_created();
        store.add_event(&event).await.unwrap();

        store.mark_processed(event.id()).await.unwrap();
        let first = store.get(event.id()).await.unwrap().unwrap().processed_at;
        store.mark_processed(event.id()).await.unwrap();
        let second = store.get(event.id()).await.unwrap().unwrap().processed_at;

        assert!(first.is_some());
        assert_eq!(first, second);
        assert!(store.fetch_pending(50, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_processed_unknown_id() {
        let store = InMemoryOutboxStore::new();
        let result = store.mark_processed(EventId::new()).await;
        assert!(matches!(result, Err(OutboxError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_attempt_cap_excludes_record() {
        let store = InMemoryOutboxStore::new();
        let event = order_created();
        store.add_event(&event).await.unwrap();

        for expected in 1..=3 {
            let attempt = store
                .increment_attempt(event.id(), Some("boom"))
                .await
                .unwrap();
            assert_eq!(attempt, expected);
        }

        assert!(store.fetch_pending(50, 3).await.unwrap().is_empty());
        assert_eq!(store.fetch_pending(50, 4).await.unwrap().len(), 1);

        let dead = store.dead_letters(3, 50).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_claim_leases_rows() {
        let store = InMemoryOutboxStore::new();
        for _ in 0..4 {
            store.add_event(&order_created()).await.unwrap();
        }

        let lease = Duration::from_secs(30);
        let a = store.claim_pending("worker-a", 3, 10, lease).await.unwrap();
        let b = store.claim_pending("worker-b", 3, 10, lease).await.unwrap();

        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 1);
        assert!(a.iter().all(|r| r.locked_by.as_deref() == Some("worker-a")));
        assert!(a.iter().all(|r| !b.iter().any(|other| other.id == r.id)));

        // A failed attempt releases the lease.
        store.increment_attempt(a[0].id, None).await.unwrap();
        let again = store.claim_pending("worker-b", 10, 10, lease).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, a[0].id);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let store = InMemoryOutboxStore::new();
        store.add_event(&order_created()).await.unwrap();

        let first = store
            .claim_pending("worker-a", 10, 10, Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store
            .claim_pending("worker-b", 10, 10, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].locked_by.as_deref(), Some("worker-b"));
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = InMemoryOutboxStore::new();
        store.set_unavailable(true);

        let result = store.add_event(&order_created()).await;
        assert!(matches!(result, Err(OutboxError::Unavailable(_))));
        assert!(store.fetch_pending(50, 10).await.unwrap_err().is_unavailable());

        store.set_unavailable(false);
        assert!(store.fetch_pending(50, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_insert_if_absent() {
        let ledger = InMemoryIdempotencyLedger::new();
        let key = HandlerKey::new("finalize", EventId::new());

        assert!(!ledger.has_handled(&key).await.unwrap());
        assert_eq!(
            ledger.mark_handled(&key).await.unwrap(),
            MarkOutcome::Recorded
        );
        assert!(ledger.has_handled(&key).await.unwrap());
        assert_eq!(
            ledger.mark_handled(&key).await.unwrap(),
            MarkOutcome::AlreadyRecorded
        );
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_ledger_keys_are_per_handler() {
        let ledger = InMemoryIdempotencyLedger::new();
        let event_id = EventId::new();

        ledger
            .mark_handled(&HandlerKey::new("a", event_id))
            .await
            .unwrap();
        assert!(
            !ledger
                .has_handled(&HandlerKey::new("b", event_id))
                .await
                .unwrap()
        );
    }
}
