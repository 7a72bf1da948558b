//! External services called by the saga.

pub mod payment;

pub use payment::{GatewayError, InMemoryPaymentGateway, PaymentGateway, PaymentIntent};
