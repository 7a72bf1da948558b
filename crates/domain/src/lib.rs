//! Order domain for the order-creation saga.
//!
//! This crate provides:
//! - The order record, its lines and the cart snapshot it is built from
//! - Order and payment status, with payment confirmation as a one-way transition
//! - Users and their account type, which selects the payment branch
//! - The order-creation request and its validation

pub mod error;
pub mod order;
pub mod user;

pub use common::{AggregateId, UserId};
pub use error::{OrderError, Result};
pub use order::{
    CartItem, Money, Order, OrderCreationRequest, OrderItem, OrderLine, OrderStatus,
    PaymentMethod, PaymentStatus, PaymentTransition, ProductId, generate_order_number,
    validate_amounts, validate_currency,
};
pub use user::{AccountType, User};
