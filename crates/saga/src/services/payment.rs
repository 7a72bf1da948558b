//! Payment gateway trait and sandbox implementation.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use common::AggregateId;
use domain::{Money, Order, OrderCreationRequest};
use thiserror::Error;
use uuid::Uuid;

/// A payment intent created by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    /// Opaque gateway reference.
    pub id: String,
    /// Handed to the client to complete payment.
    pub client_secret: String,
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Payment declined: {0}")]
    Declined(String),

    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),
}

/// Creates payment intents with an external provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(
        &self,
        order: &Order,
        request: &OrderCreationRequest,
    ) -> Result<PaymentIntent, GatewayError>;
}

#[async_trait]
impl<T: PaymentGateway + ?Sized> PaymentGateway for Arc<T> {
    async fn create_payment_intent(
        &self,
        order: &Order,
        request: &OrderCreationRequest,
    ) -> Result<PaymentIntent, GatewayError> {
        (**self).create_payment_intent(order, request).await
    }
}

#[derive(Debug, Default)]
struct SandboxState {
    intents: Vec<(String, AggregateId, Money)>,
    next_id: u32,
    fail_with: Option<GatewayError>,
}

/// Sandbox gateway for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<Mutex<SandboxState>>,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following call fail with `error`, or succeed again with `None`.
    pub fn set_failure(&self, error: Option<GatewayError>) {
        self.lock().fail_with = error;
    }

    /// Number of intents created so far.
    pub fn call_count(&self) -> usize {
        self.lock().intents.len()
    }

    /// Returns the order an intent was created for.
    pub fn intent_order(&self, intent_id: &str) -> Option<AggregateId> {
        self.lock()
            .intents
            .iter()
            .find(|(id, _, _)| id == intent_id)
            .map(|(_, order_id, _)| *order_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    #[tracing::instrument(skip(self, order, request), fields(order_id = %order.id, amount = order.total_amount.cents()))]
    async fn create_payment_intent(
        &self,
        order: &Order,
        request: &OrderCreationRequest,
    ) -> Result<PaymentIntent, GatewayError> {
        let mut state = self.lock();

        if let Some(error) = state.fail_with.clone() {
            return Err(error);
        }

        state.next_id += 1;
        let id = format!("pi_{:04}", state.next_id);
        let client_secret = format!("{id}_secret_{}", Uuid::new_v4().simple());
        state
            .intents
            .push((id.clone(), order.id, order.total_amount));

        tracing::debug!(
            intent_id = %id,
            method = %request.payment_method,
            currency = %request.currency,
            "Sandbox payment intent created"
        );
        Ok(PaymentIntent { id, client_secret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::UserId;
    use domain::PaymentMethod;

    fn order() -> Order {
        Order::new(
            UserId::new(),
            Money::from_cents(5000),
            "USD",
            Some(PaymentMethod::Card),
            None,
        )
    }

    #[tokio::test]
    async fn test_sequential_intent_ids() {
        let gateway = InMemoryPaymentGateway::new();
        let request = OrderCreationRequest::new(PaymentMethod::Card, "USD");
        let order = order();

        let first = gateway
            .create_payment_intent(&order, &request)
            .await
            .unwrap();
        let second = gateway
            .create_payment_intent(&order, &request)
            .await
            .unwrap();

        assert_eq!(first.id, "pi_0001");
        assert_eq!(second.id, "pi_0002");
        assert!(first.client_secret.starts_with("pi_0001_secret_"));
        assert_eq!(gateway.call_count(), 2);
        assert_eq!(gateway.intent_order("pi_0001"), Some(order.id));
    }

    #[tokio::test]
    async fn test_failure_toggle() {
        let gateway = InMemoryPaymentGateway::new();
        gateway.set_failure(Some(GatewayError::Declined("card expired".to_string())));

        let request = OrderCreationRequest::new(PaymentMethod::Card, "USD");
        let result = gateway.create_payment_intent(&order(), &request).await;
        assert!(matches!(result, Err(GatewayError::Declined(_))));
        assert_eq!(gateway.call_count(), 0);

        gateway.set_failure(None);
        assert!(gateway.create_payment_intent(&order(), &request).await.is_ok());
    }
}
