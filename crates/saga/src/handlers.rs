//! Event handlers that drive saga follow-up work.

use std::sync::Arc;

use async_trait::async_trait;
use events::{DomainEvent, EventHandler, EventPayload, EventPublisher, HandlerError};

use crate::coordinator::OrderCreationSaga;
use crate::services::PaymentGateway;
use crate::store::TransactionProvider;

/// Clears the buyer's remaining cart once `payment.succeeded` is delivered.
///
/// Re-running it is harmless, but wrap it in `outbox::Idempotent` so a
/// redelivered event is skipped without opening a transaction.
pub struct FinalizeOnPaymentSucceeded<T, G, P> {
    saga: Arc<OrderCreationSaga<T, G, P>>,
}

impl<T, G, P> FinalizeOnPaymentSucceeded<T, G, P> {
    pub fn new(saga: Arc<OrderCreationSaga<T, G, P>>) -> Self {
        Self { saga }
    }
}

#[async_trait]
impl<T, G, P> EventHandler for FinalizeOnPaymentSucceeded<T, G, P>
where
    T: TransactionProvider + 'static,
    G: PaymentGateway + 'static,
    P: EventPublisher + 'static,
{
    fn name(&self) -> &str {
        "finalize_order_on_payment_succeeded"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let EventPayload::PaymentSucceeded(data) = event.payload() else {
            return Ok(());
        };

        let outcome = self
            .saga
            .finalize_after_payment(data.order_id)
            .await
            .map_err(|e| HandlerError::new(e.to_string()))?;

        tracing::debug!(
            event_id = %event.id(),
            order_id = %outcome.order_id,
            items_cleared = outcome.items_cleared,
            "Payment follow-up applied"
        );
        Ok(())
    }
}
