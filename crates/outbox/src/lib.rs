//! Transactional outbox for domain events.
//!
//! - [`OutboxStore`] persists events next to the business write that produced them
//! - [`IdempotencyLedger`] records which handler has already applied which event
//! - [`OutboxDispatcher`] polls pending rows and publishes them with bounded retries
//! - [`Outbox`] enqueues outside a transaction and degrades to in-process publish
//!   when the table is missing

pub mod dispatcher;
pub mod error;
pub mod idempotency;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;
pub mod writer;

pub use common::EventId;
pub use dispatcher::{
    ClaimSettings, DispatcherConfig, HandlerFailurePolicy, OutboxDispatcher, TickReport,
};
pub use error::{OutboxError, Result};
pub use idempotency::{HandlerKey, IdempotencyLedger, Idempotent, MarkOutcome};
pub use memory::{InMemoryIdempotencyLedger, InMemoryOutboxStore};
pub use postgres::{PostgresIdempotencyLedger, PostgresOutboxStore};
pub use record::OutboxRecord;
pub use store::OutboxStore;
pub use writer::{EnqueueOutcome, Outbox, publish_in_process};
