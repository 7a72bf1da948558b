//! Persisted order records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    Money, OrderItem, OrderStatus, PaymentMethod, PaymentStatus, PaymentTransition, ProductId,
};
use crate::{AggregateId, UserId};

/// Human-readable order number: `ORD-YYYYMMDD-XXXXXXXX`.
///
/// The suffix is the first eight hex digits of the order id, upper-cased.
pub fn generate_order_number(id: AggregateId, at: DateTime<Utc>) -> String {
    let simple = id.as_uuid().simple().to_string().to_uppercase();
    format!("ORD-{}-{}", at.format("%Y%m%d"), &simple[..8])
}

/// The order row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: AggregateId,
    pub order_number: String,
    pub user_id: UserId,
    pub total_amount: Money,
    pub currency: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    /// `None` for orders created through the legacy path.
    pub payment_method: Option<PaymentMethod>,
    /// Gateway payment-intent id, once one exists.
    pub payment_intent_id: Option<String>,
    pub client_secret: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// A new pending order with a fresh id and order number.
    pub fn new(
        user_id: UserId,
        total_amount: Money,
        currency: impl Into<String>,
        payment_method: Option<PaymentMethod>,
        notes: Option<String>,
    ) -> Self {
        let id = AggregateId::new();
        let now = Utc::now();
        Self {
            id,
            order_number: generate_order_number(id, now),
            user_id,
            total_amount,
            currency: currency.into(),
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            payment_method,
            payment_intent_id: None,
            client_secret: None,
            notes,
            created_at: now,
            updated_at: now,
        }
    }

    /// Records the gateway's payment intent on the order.
    pub fn attach_payment_intent(&mut self, intent_id: impl Into<String>, client_secret: String) {
        self.payment_intent_id = Some(intent_id.into());
        self.client_secret = Some(client_secret);
        self.updated_at = Utc::now();
    }

    /// Applies a successful payment. The order becomes confirmed.
    pub fn mark_payment_succeeded(&mut self) -> PaymentTransition {
        let transition = self.payment_status.on_success();
        if transition.is_applied() {
            self.payment_status = PaymentStatus::Succeeded;
            self.status = OrderStatus::Confirmed;
            self.updated_at = Utc::now();
        }
        transition
    }

    /// Applies a failed payment. The order stays pending so it can be retried.
    pub fn mark_payment_failed(&mut self) -> PaymentTransition {
        let transition = self.payment_status.on_failure();
        if transition.is_applied() {
            self.payment_status = PaymentStatus::Failed;
            self.updated_at = Utc::now();
        }
        transition
    }
}

/// An immutable line of a placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub order_id: AggregateId,
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Money,
}

impl OrderLine {
    pub fn from_item(order_id: AggregateId, item: &OrderItem) -> Self {
        Self {
            order_id,
            product_id: item.product_id.clone(),
            product_name: item.product_name.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
        }
    }

    pub fn total_price(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }
}

/// A row of the user's cart at the time the order is placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub user_id: UserId,
    pub product_id: ProductId,
    pub quantity: u32,
}

impl CartItem {
    pub fn new(user_id: UserId, product_id: impl Into<ProductId>, quantity: u32) -> Self {
        Self {
            user_id,
            product_id: product_id.into(),
            quantity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn order() -> Order {
        Order::new(
            UserId::new(),
            Money::from_cents(4999),
            "USD",
            Some(PaymentMethod::Card),
            None,
        )
    }

    #[test]
    fn test_order_number_format() {
        let id = AggregateId::parse_str("0a1b2c3d-4e5f-4a6b-8c7d-9e0f1a2b3c4d").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(generate_order_number(id, at), "ORD-20240307-0A1B2C3D");
    }

    #[test]
    fn test_new_order_is_pending() {
        let order = order();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.payment_status, PaymentStatus::Pending);
        assert!(order.order_number.starts_with("ORD-"));
        assert!(order.payment_intent_id.is_none());
    }

    #[test]
    fn test_payment_success_confirms_order() {
        let mut order = order();
        assert!(order.mark_payment_succeeded().is_applied());
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert_eq!(order.payment_status, PaymentStatus::Succeeded);

        assert_eq!(
            order.mark_payment_succeeded(),
            PaymentTransition::AlreadySucceeded
        );
        assert_eq!(
            order.mark_payment_failed(),
            PaymentTransition::AlreadySucceeded
        );
        assert_eq!(order.payment_status, PaymentStatus::Succeeded);
    }

    #[test]
    fn test_failed_payment_keeps_order_pending() {
        let mut order = order();
        assert!(order.mark_payment_failed().is_applied());
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.payment_status, PaymentStatus::Failed);

        assert!(order.mark_payment_succeeded().is_applied());
        assert_eq!(order.status, OrderStatus::Confirmed);
    }

    #[test]
    fn test_attach_payment_intent() {
        let mut order = order();
        order.attach_payment_intent("pi_123", "pi_123_secret".to_string());
        assert_eq!(order.payment_intent_id.as_deref(), Some("pi_123"));
        assert_eq!(order.client_secret.as_deref(), Some("pi_123_secret"));
        assert_eq!(order.payment_status, PaymentStatus::Pending);
    }

    #[test]
    fn test_order_line_from_item() {
        let order_id = AggregateId::new();
        let item = OrderItem::new("SKU-1", "Lamp", 2, Money::from_cents(1250));
        let line = OrderLine::from_item(order_id, &item);
        assert_eq!(line.order_id, order_id);
        assert_eq!(line.total_price().cents(), 2500);
    }
}
