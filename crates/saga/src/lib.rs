//! Order-creation saga.
//!
//! One checkout runs as a single database transaction:
//! 1. Resolve the user
//! 2. Persist the order and enqueue `order.created`
//! 3. Branch on payment: corporate bank transfers are approved on the spot,
//!    everything else gets a gateway payment intent
//! 4. Snapshot the cart into order lines
//! 5. Clear the cart
//!
//! Any failure rolls the whole transaction back, outbox rows included.
//! Follow-up work that waits on payment runs later from delivered events.

pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod services;
pub mod state;
pub mod store;

pub use coordinator::{FinalizeOutcome, OrderCreationResult, OrderCreationSaga, OrderDetails};
pub use error::{Result, SagaError};
pub use handlers::FinalizeOnPaymentSucceeded;
pub use services::{GatewayError, InMemoryPaymentGateway, PaymentGateway, PaymentIntent};
pub use state::SagaState;
pub use store::{
    FailPoint, InMemoryOrderStore, OrderTransaction, PgOrderStore, StoreError,
    TransactionProvider,
};
