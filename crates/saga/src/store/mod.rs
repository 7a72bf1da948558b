//! Transaction provider consumed by the saga.
//!
//! Every write of one saga run goes through a single [`OrderTransaction`];
//! nothing is visible to other readers until [`OrderTransaction::commit`].

mod memory;
mod postgres;

use async_trait::async_trait;
use common::{AggregateId, UserId};
use domain::{CartItem, Order, OrderLine, User};
use events::DomainEvent;
use outbox::OutboxError;
use thiserror::Error;

pub use memory::{FailPoint, InMemoryOrderStore};
pub use postgres::PgOrderStore;

/// Errors raised by the transaction provider.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be mapped back into the domain model.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// A value does not fit its column.
    #[error("Value out of range for {column}: {value}")]
    OutOfRange { column: &'static str, value: u64 },

    /// An order with this id already exists.
    #[error("Order already exists: {0}")]
    DuplicateOrder(AggregateId),

    /// The row to update does not exist.
    #[error("Order not found: {0}")]
    OrderNotFound(AggregateId),

    /// Failure injected by the in-memory store.
    #[error("Simulated failure at {0:?}")]
    Simulated(FailPoint),
}

/// Opens transactions.
#[async_trait]
pub trait TransactionProvider: Send + Sync {
    type Tx: OrderTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// One open transaction.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait OrderTransaction: Send {
    async fn find_user(&mut self, user_id: UserId) -> Result<Option<User>, StoreError>;

    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError>;

    /// Reads an order and locks it for the rest of the transaction.
    async fn find_order(&mut self, order_id: AggregateId) -> Result<Option<Order>, StoreError>;

    /// Writes back status, payment status and payment-intent fields.
    async fn update_order(&mut self, order: &Order) -> Result<(), StoreError>;

    async fn insert_order_lines(&mut self, lines: &[OrderLine]) -> Result<(), StoreError>;

    async fn find_order_lines(&mut self, order_id: AggregateId)
    -> Result<Vec<OrderLine>, StoreError>;

    /// The user's cart rows, oldest first.
    async fn find_cart_items(&mut self, user_id: UserId) -> Result<Vec<CartItem>, StoreError>;

    async fn count_cart_items(&mut self, user_id: UserId) -> Result<u64, StoreError>;

    /// Deletes the user's cart rows and returns how many were removed.
    async fn clear_cart(&mut self, user_id: UserId) -> Result<u64, StoreError>;

    /// Adds an outbox row that commits or rolls back with this transaction.
    ///
    /// [`OutboxError::Unavailable`] leaves the transaction usable.
    async fn enqueue_event(&mut self, event: &DomainEvent) -> Result<(), OutboxError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: TransactionProvider + ?Sized> TransactionProvider for std::sync::Arc<T> {
    type Tx = T::Tx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        (**self).begin().await
    }
}
