//! Domain error types.

use thiserror::Error;

/// Reasons an order-creation request is rejected before any write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    /// Currency is not a three-letter uppercase code.
    #[error("Invalid currency: {0:?} (expected a three-letter uppercase code)")]
    InvalidCurrency(String),

    /// Order total is negative.
    #[error("Invalid total amount: {0} (must not be negative)")]
    NegativeTotal(i64),

    /// A line has a zero quantity.
    #[error("Invalid quantity for {product_id}: {quantity} (must be greater than 0)")]
    InvalidQuantity { product_id: String, quantity: u32 },

    /// A line quantity does not fit the stored column.
    #[error("Quantity for {product_id} too large: {quantity} (at most {max})")]
    QuantityTooLarge {
        product_id: String,
        quantity: u32,
        max: u32,
    },

    /// A line has a negative unit price.
    #[error("Invalid price for {product_id}: {price} (must not be negative)")]
    NegativePrice { product_id: String, price: i64 },

    /// An unrecognised payment method or account type string.
    #[error("Unknown {kind}: {value:?}")]
    UnknownVariant { kind: &'static str, value: String },
}

/// Result type for domain validation.
pub type Result<T> = std::result::Result<T, OrderError>;
