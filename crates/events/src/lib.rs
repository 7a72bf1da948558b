//! Domain events and the in-process bus that fans them out.
//!
//! - [`DomainEvent`] is the immutable event value with a typed [`EventPayload`]
//! - [`EventPublisher`] is the seam the outbox dispatcher publishes through
//! - [`InProcessEventBus`] delivers each event to every matching subscriber
//!   concurrently and reports handler failures instead of propagating them

pub mod bus;
pub mod error;
pub mod event;

pub use bus::{
    EventFilter, EventHandler, EventLogger, EventPublisher, FnHandler, HandlerError,
    HandlerFailure, InProcessEventBus, PublishError, PublishReport, SubscriptionId,
};
pub use common::{AggregateId, EventId, UserId};
pub use error::{EventError, Result};
pub use event::{
    DomainEvent, EventPayload, OrderCreatedData, PaymentFailedData, PaymentIntentCreatedData,
    PaymentReference, PaymentSucceededData, event_types,
};
