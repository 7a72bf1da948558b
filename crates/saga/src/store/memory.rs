use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use common::{AggregateId, UserId};
use domain::{CartItem, Order, OrderLine, User};
use events::DomainEvent;
use outbox::{InMemoryOutboxStore, OutboxError, OutboxRecord};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{OrderTransaction, StoreError, TransactionProvider};

/// Operations that can be told to fail, for rollback tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    InsertOrder,
    UpdateOrder,
    InsertOrderLines,
    ClearCart,
    Commit,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    orders: HashMap<AggregateId, Order>,
    lines: Vec<OrderLine>,
    carts: HashMap<UserId, Vec<CartItem>>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_point: Option<FailPoint>,
}

/// In-memory transaction provider for tests and database-less runs.
///
/// Transactions are serialized: `begin` takes an exclusive lock on the tables
/// and works on a private copy, which replaces the tables on commit. Outbox
/// rows go to the shared [`InMemoryOutboxStore`] only on commit.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    tables: Arc<Mutex<Tables>>,
    outbox: InMemoryOutboxStore,
    faults: Arc<std::sync::Mutex<Faults>>,
    cart_clear_writes: Arc<AtomicUsize>,
}

impl InMemoryOrderStore {
    /// Creates an empty store with its own outbox.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outbox(&self) -> &InMemoryOutboxStore {
        &self.outbox
    }

    /// Makes the given operation fail until cleared with `None`.
    pub fn set_fail_point(&self, point: Option<FailPoint>) {
        self.faults
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .fail_point = point;
    }

    fn check(faults: &std::sync::Mutex<Faults>, point: FailPoint) -> Result<(), StoreError> {
        let armed = faults
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .fail_point;
        if armed == Some(point) {
            Err(StoreError::Simulated(point))
        } else {
            Ok(())
        }
    }

    pub async fn seed_user(&self, user: User) {
        self.tables.lock().await.users.insert(user.id, user);
    }

    pub async fn set_cart(&self, user_id: UserId, items: Vec<CartItem>) {
        self.tables.lock().await.carts.insert(user_id, items);
    }

    pub async fn cart(&self, user_id: UserId) -> Vec<CartItem> {
        self.tables
            .lock()
            .await
            .carts
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn order(&self, order_id: AggregateId) -> Option<Order> {
        self.tables.lock().await.orders.get(&order_id).cloned()
    }

    pub async fn order_count(&self) -> usize {
        self.tables.lock().await.orders.len()
    }

    pub async fn lines_for(&self, order_id: AggregateId) -> Vec<OrderLine> {
        self.tables
            .lock()
            .await
            .lines
            .iter()
            .filter(|l| l.order_id == order_id)
            .cloned()
            .collect()
    }

    pub async fn line_count(&self) -> usize {
        self.tables.lock().await.lines.len()
    }

    /// Number of `clear_cart` calls made, committed or not.
    pub fn cart_clear_writes(&self) -> usize {
        self.cart_clear_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionProvider for InMemoryOrderStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryTransaction {
            guard,
            working,
            staged_events: Vec::new(),
            outbox: self.outbox.clone(),
            faults: self.faults.clone(),
            cart_clear_writes: self.cart_clear_writes.clone(),
        })
    }
}

/// Transaction over [`InMemoryOrderStore`].
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    staged_events: Vec<OutboxRecord>,
    outbox: InMemoryOutboxStore,
    faults: Arc<std::sync::Mutex<Faults>>,
    cart_clear_writes: Arc<AtomicUsize>,
}

impl InMemoryTransaction {
    fn check(&self, point: FailPoint) -> Result<(), StoreError> {
        InMemoryOrderStore::check(&self.faults, point)
    }
}

#[async_trait]
impl OrderTransaction for InMemoryTransaction {
    async fn find_user(&mut self, user_id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.working.users.get(&user_id).cloned())
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        self.check(FailPoint::InsertOrder)?;
        if self.working.orders.contains_key(&order.id) {
            return Err(StoreError::DuplicateOrder(order.id));
        }
        self.working.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_order(&mut self, order_id: AggregateId) -> Result<Option<Order>, StoreError> {
        Ok(self.working.orders.get(&order_id).cloned())
    }

    async fn update_order(&mut self, order: &Order) -> Result<(), StoreError> {
        self.check(FailPoint::UpdateOrder)?;
        let existing = self
            .working
            .orders
            .get_mut(&order.id)
            .ok_or(StoreError::OrderNotFound(order.id))?;
        *existing = order.clone();
        Ok(())
    }

    async fn insert_order_lines(&mut self, lines: &[OrderLine]) -> Result<(), StoreError> {
        self.check(FailPoint::InsertOrderLines)?;
        for line in lines {
            if !self.working.orders.contains_key(&line.order_id) {
                return Err(StoreError::OrderNotFound(line.order_id));
            }
        }
        self.working.lines.extend_from_slice(lines);
        Ok(())
    }

    async fn find_order_lines(
        &mut self,
        order_id: AggregateId,
    ) -> Result<Vec<OrderLine>, StoreError> {
        Ok(self
            .working
            .lines
            .iter()
            .filter(|l| l.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn find_cart_items(&mut self, user_id: UserId) -> Result<Vec<CartItem>, StoreError> {
        Ok(self
            .working
            .carts
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn count_cart_items(&mut self, user_id: UserId) -> Result<u64, StoreError> {
        Ok(self
            .working
            .carts
            .get(&user_id)
            .map_or(0, |items| items.len() as u64))
    }

    async fn clear_cart(&mut self, user_id: UserId) -> Result<u64, StoreError> {
        self.cart_clear_writes.fetch_add(1, Ordering::SeqCst);
        self.check(FailPoint::ClearCart)?;
        let removed = self
            .working
            .carts
            .remove(&user_id)
            .map_or(0, |items| items.len() as u64);
        Ok(removed)
    }

    async fn enqueue_event(&mut self, event: &DomainEvent) -> Result<(), OutboxError> {
        if !self.outbox.is_available() {
            return Err(OutboxError::Unavailable(
                "relation \"outbox_events\" does not exist".to_string(),
            ));
        }
        let record = OutboxRecord::from_event(event)?;
        if self.staged_events.iter().any(|r| r.id == record.id) {
            return Err(OutboxError::Duplicate(record.id));
        }
        self.staged_events.push(record);
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.check(FailPoint::Commit)?;
        let InMemoryTransaction {
            mut guard,
            working,
            staged_events,
            outbox,
            ..
        } = self;

        if !staged_events.is_empty() {
            outbox
                .insert_committed(staged_events)
                .await
                .map_err(|e| StoreError::Corrupt(format!("outbox commit failed: {e}")))?;
        }
        *guard = working;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}
