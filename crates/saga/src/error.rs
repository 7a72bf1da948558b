//! Saga error types.

use common::{AggregateId, UserId};
use domain::OrderError;
use events::PaymentReference;
use outbox::OutboxError;
use thiserror::Error;

use crate::services::GatewayError;
use crate::store::StoreError;

/// Errors that abort a saga run. The transaction has been rolled back when
/// one of these is returned.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The requesting user does not exist.
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// Order not found.
    #[error("Order not found: {0}")]
    OrderNotFound(AggregateId),

    /// The request failed validation.
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] OrderError),

    /// The payment reference does not belong to the order.
    #[error("Payment reference {reference} does not match order {order_id}")]
    PaymentReferenceMismatch {
        order_id: AggregateId,
        reference: PaymentReference,
    },

    /// The payment gateway refused or could not be reached.
    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// A read or write inside the transaction failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The outbox insert failed for a reason other than a missing table.
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),
}

impl SagaError {
    /// True for errors caused by the request rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SagaError::UserNotFound(_)
                | SagaError::OrderNotFound(_)
                | SagaError::InvalidRequest(_)
                | SagaError::PaymentReferenceMismatch { .. }
        )
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
