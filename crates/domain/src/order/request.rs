//! Order-creation request and validation.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{Money, OrderItem};
use crate::{OrderError, Result};

/// How the customer intends to pay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    ApplePay,
    GooglePay,
    BankTransfer,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::ApplePay => "apple_pay",
            PaymentMethod::GooglePay => "google_pay",
            PaymentMethod::BankTransfer => "bank_transfer",
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = OrderError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "card" => Ok(PaymentMethod::Card),
            "apple_pay" => Ok(PaymentMethod::ApplePay),
            "google_pay" => Ok(PaymentMethod::GooglePay),
            "bank_transfer" => Ok(PaymentMethod::BankTransfer),
            other => Err(OrderError::UnknownVariant {
                kind: "payment method",
                value: other.to_string(),
            }),
        }
    }
}

/// What the customer submitted at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreationRequest {
    pub payment_method: PaymentMethod,
    pub currency: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl OrderCreationRequest {
    pub fn new(payment_method: PaymentMethod, currency: impl Into<String>) -> Self {
        Self {
            payment_method,
            currency: currency.into(),
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Checks the request together with its priced lines and total.
    pub fn validate(&self, items: &[OrderItem], total: Money) -> Result<()> {
        validate_currency(&self.currency)?;
        validate_amounts(items, total)
    }
}

/// Accepts three-letter uppercase codes such as `USD`.
pub fn validate_currency(currency: &str) -> Result<()> {
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(OrderError::InvalidCurrency(currency.to_string()))
    }
}

/// Largest quantity a single line may carry. Lines are stored in a
/// signed 32-bit column.
pub const MAX_LINE_QUANTITY: u32 = i32::MAX as u32;

/// Rejects a negative total, zero or oversized quantities and negative unit
/// prices.
pub fn validate_amounts(items: &[OrderItem], total: Money) -> Result<()> {
    if total.is_negative() {
        return Err(OrderError::NegativeTotal(total.cents()));
    }

    for item in items {
        if item.quantity == 0 {
            return Err(OrderError::InvalidQuantity {
                product_id: item.product_id.to_string(),
                quantity: item.quantity,
            });
        }
        if item.quantity > MAX_LINE_QUANTITY {
            return Err(OrderError::QuantityTooLarge {
                product_id: item.product_id.to_string(),
                quantity: item.quantity,
                max: MAX_LINE_QUANTITY,
            });
        }
        if item.unit_price.is_negative() {
            return Err(OrderError::NegativePrice {
                product_id: item.product_id.to_string(),
                price: item.unit_price.cents(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items() -> Vec<OrderItem> {
        vec![OrderItem::new("SKU-1", "Mug", 2, Money::from_cents(800))]
    }

    #[test]
    fn test_valid_request() {
        let request = OrderCreationRequest::new(PaymentMethod::Card, "USD");
        assert!(request.validate(&items(), Money::from_cents(1600)).is_ok());
        assert!(request.validate(&[], Money::zero()).is_ok());
    }

    #[test]
    fn test_currency_must_be_three_uppercase_letters() {
        for bad in ["usd", "US", "USDT", "U$D", ""] {
            let request = OrderCreationRequest::new(PaymentMethod::Card, bad);
            assert_eq!(
                request.validate(&items(), Money::from_cents(1600)),
                Err(OrderError::InvalidCurrency(bad.to_string()))
            );
        }
    }

    #[test]
    fn test_negative_total_rejected() {
        let request = OrderCreationRequest::new(PaymentMethod::Card, "EUR");
        assert_eq!(
            request.validate(&items(), Money::from_cents(-1)),
            Err(OrderError::NegativeTotal(-1))
        );
    }

    #[test]
    fn test_line_checks() {
        let request = OrderCreationRequest::new(PaymentMethod::Card, "EUR");

        let zero_qty = vec![OrderItem::new("SKU-1", "Mug", 0, Money::from_cents(800))];
        assert!(matches!(
            request.validate(&zero_qty, Money::zero()),
            Err(OrderError::InvalidQuantity { quantity: 0, .. })
        ));

        let negative = vec![OrderItem::new("SKU-2", "Refund", 1, Money::from_cents(-5))];
        assert!(matches!(
            request.validate(&negative, Money::zero()),
            Err(OrderError::NegativePrice { price: -5, .. })
        ));
    }

    #[test]
    fn test_quantity_must_fit_storage() {
        let request = OrderCreationRequest::new(PaymentMethod::Card, "EUR");

        let at_limit = vec![OrderItem::new(
            "SKU-1",
            "Bulk",
            MAX_LINE_QUANTITY,
            Money::zero(),
        )];
        assert!(request.validate(&at_limit, Money::zero()).is_ok());

        let over = vec![OrderItem::new("SKU-1", "Bulk", 3_000_000_000, Money::zero())];
        assert_eq!(
            validate_amounts(&over, Money::zero()),
            Err(OrderError::QuantityTooLarge {
                product_id: "SKU-1".to_string(),
                quantity: 3_000_000_000,
                max: MAX_LINE_QUANTITY,
            })
        );
    }

    #[test]
    fn test_payment_method_wire_format() {
        let request: OrderCreationRequest = serde_json::from_str(
            r#"{"paymentMethod":"bank_transfer","currency":"GBP","notes":"PO-991"}"#,
        )
        .unwrap();
        assert_eq!(request.payment_method, PaymentMethod::BankTransfer);
        assert_eq!(request.notes.as_deref(), Some("PO-991"));
        assert_eq!(
            "apple_pay".parse::<PaymentMethod>().unwrap(),
            PaymentMethod::ApplePay
        );
    }
}
