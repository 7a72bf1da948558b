use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EventError, Result};
use crate::{AggregateId, EventId, UserId};

/// Dotted type tags used for routing, outbox rows and idempotency keys.
pub mod event_types {
    pub const ORDER_CREATED: &str = "order.created";
    pub const PAYMENT_INTENT_CREATED: &str = "payment.intent_created";
    pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
    pub const PAYMENT_FAILED: &str = "payment.failed";
}

/// Payload of `order.created`.
///
/// Emitted before payment is known; consumers must not read it as "paid".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedData {
    pub order_id: AggregateId,
    pub user_id: UserId,
    /// Order total in minor units (cents).
    pub total_amount: i64,
    pub currency: String,
}

/// Payload of `payment.intent_created`. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentCreatedData {
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub payment_intent_id: String,
}

/// Where a successful payment came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PaymentReference {
    /// Synthetic reference for corporate bank transfers approved without a gateway.
    BankTransfer,
    /// Opaque payment-intent id returned by the gateway.
    Gateway(String),
}

impl PaymentReference {
    /// Stable string form used in keys and logs.
    pub fn as_key(&self) -> String {
        match self {
            PaymentReference::BankTransfer => "bank_transfer".to_string(),
            PaymentReference::Gateway(id) => format!("gateway:{id}"),
        }
    }
}

impl std::fmt::Display for PaymentReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_key())
    }
}

/// Payload of `payment.succeeded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSucceededData {
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub payment_reference: PaymentReference,
}

/// Payload of `payment.failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailedData {
    pub order_id: AggregateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Typed event payload, keyed by event type.
///
/// Known types carry their own schema. Anything else is kept as an open
/// JSON object under [`EventPayload::Other`] so stored rows always round-trip.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    OrderCreated(OrderCreatedData),
    PaymentIntentCreated(PaymentIntentCreatedData),
    PaymentSucceeded(PaymentSucceededData),
    PaymentFailed(PaymentFailedData),
    Other {
        event_type: String,
        data: Map<String, Value>,
    },
}

impl EventPayload {
    /// Returns the dotted type tag.
    pub fn event_type(&self) -> &str {
        match self {
            EventPayload::OrderCreated(_) => event_types::ORDER_CREATED,
            EventPayload::PaymentIntentCreated(_) => event_types::PAYMENT_INTENT_CREATED,
            EventPayload::PaymentSucceeded(_) => event_types::PAYMENT_SUCCEEDED,
            EventPayload::PaymentFailed(_) => event_types::PAYMENT_FAILED,
            EventPayload::Other { event_type, .. } => event_type,
        }
    }

    /// Returns the order the payload refers to, if it names one.
    pub fn order_id(&self) -> Option<AggregateId> {
        match self {
            EventPayload::OrderCreated(d) => Some(d.order_id),
            EventPayload::PaymentIntentCreated(d) => Some(d.order_id),
            EventPayload::PaymentSucceeded(d) => Some(d.order_id),
            EventPayload::PaymentFailed(d) => Some(d.order_id),
            EventPayload::Other { .. } => None,
        }
    }

    /// Encodes the payload body (without the type tag) as JSON.
    pub fn to_json(&self) -> Result<Value> {
        let value = match self {
            EventPayload::OrderCreated(d) => serde_json::to_value(d)?,
            EventPayload::PaymentIntentCreated(d) => serde_json::to_value(d)?,
            EventPayload::PaymentSucceeded(d) => serde_json::to_value(d)?,
            EventPayload::PaymentFailed(d) => serde_json::to_value(d)?,
            EventPayload::Other { data, .. } => Value::Object(data.clone()),
        };
        Ok(value)
    }

    /// Decodes a payload body for the given type tag.
    pub fn from_json(event_type: &str, data: Value) -> Result<Self> {
        fn decode<T: for<'de> Deserialize<'de>>(event_type: &str, data: Value) -> Result<T> {
            serde_json::from_value(data).map_err(|source| EventError::MalformedPayload {
                event_type: event_type.to_string(),
                source,
            })
        }

        if event_type.is_empty() {
            return Err(EventError::EmptyEventType);
        }

        let payload = match event_type {
            event_types::ORDER_CREATED => EventPayload::OrderCreated(decode(event_type, data)?),
            event_types::PAYMENT_INTENT_CREATED => {
                EventPayload::PaymentIntentCreated(decode(event_type, data)?)
            }
            event_types::PAYMENT_SUCCEEDED => {
                EventPayload::PaymentSucceeded(decode(event_type, data)?)
            }
            event_types::PAYMENT_FAILED => EventPayload::PaymentFailed(decode(event_type, data)?),
            other => match data {
                Value::Object(data) => EventPayload::Other {
                    event_type: other.to_string(),
                    data,
                },
                _ => {
                    return Err(EventError::PayloadNotObject {
                        event_type: other.to_string(),
                    });
                }
            },
        };
        Ok(payload)
    }
}

/// An immutable domain event.
///
/// Fields are private; once built an event cannot change. Re-publishing a
/// stored event rebuilds it with [`DomainEvent::restore`], keeping its id and
/// timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    id: EventId,
    occurred_at: DateTime<Utc>,
    aggregate_id: Option<AggregateId>,
    payload: EventPayload,
}

impl DomainEvent {
    /// Creates an event with a fresh id and the current time.
    pub fn new(payload: EventPayload, aggregate_id: Option<AggregateId>) -> Self {
        Self {
            id: EventId::new(),
            occurred_at: Utc::now(),
            aggregate_id,
            payload,
        }
    }

    /// Creates an event from a raw type tag and JSON body.
    pub fn create(
        event_type: &str,
        data: Value,
        aggregate_id: Option<AggregateId>,
    ) -> Result<Self> {
        Ok(Self::new(
            EventPayload::from_json(event_type, data)?,
            aggregate_id,
        ))
    }

    /// Rebuilds a previously created event from its stored parts.
    pub fn restore(
        id: EventId,
        event_type: &str,
        data: Value,
        occurred_at: DateTime<Utc>,
        aggregate_id: Option<AggregateId>,
    ) -> Result<Self> {
        Ok(Self {
            id,
            occurred_at,
            aggregate_id,
            payload: EventPayload::from_json(event_type, data)?,
        })
    }

    pub fn order_created(data: OrderCreatedData) -> Self {
        let order_id = data.order_id;
        Self::new(EventPayload::OrderCreated(data), Some(order_id))
    }

    pub fn payment_intent_created(data: PaymentIntentCreatedData) -> Self {
        let order_id = data.order_id;
        Self::new(EventPayload::PaymentIntentCreated(data), Some(order_id))
    }

    pub fn payment_succeeded(data: PaymentSucceededData) -> Self {
        let order_id = data.order_id;
        Self::new(EventPayload::PaymentSucceeded(data), Some(order_id))
    }

    pub fn payment_failed(data: PaymentFailedData) -> Self {
        let order_id = data.order_id;
        Self::new(EventPayload::PaymentFailed(data), Some(order_id))
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        self.payload.event_type()
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn aggregate_id(&self) -> Option<AggregateId> {
        self.aggregate_id
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_created() -> OrderCreatedData {
        OrderCreatedData {
            order_id: AggregateId::new(),
            user_id: UserId::new(),
            total_amount: 12_345,
            currency: "PLN".to_string(),
        }
    }

    #[test]
    fn new_assigns_fresh_identity() {
        let a = DomainEvent::order_created(order_created());
        let b = DomainEvent::order_created(order_created());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.event_type(), "order.created");
    }

    #[test]
    fn typed_constructors_set_aggregate_from_payload() {
        let data = order_created();
        let order_id = data.order_id;
        let event = DomainEvent::order_created(data);
        assert_eq!(event.aggregate_id(), Some(order_id));
        assert_eq!(event.payload().order_id(), Some(order_id));
    }

    #[test]
    fn restore_keeps_id_and_timestamp() {
        let original = DomainEvent::payment_failed(PaymentFailedData {
            order_id: AggregateId::new(),
            reason: Some("card declined".to_string()),
        });
        let body = original.payload().to_json().unwrap();

        let restored = DomainEvent::restore(
            original.id(),
            original.event_type(),
            body,
            original.occurred_at(),
            original.aggregate_id(),
        )
        .unwrap();

        assert_eq!(restored, original);
    }

    #[test]
    fn payment_reference_wire_format() {
        let synthetic = serde_json::to_value(PaymentReference::BankTransfer).unwrap();
        assert_eq!(synthetic, json!({"kind": "bank_transfer"}));

        let gateway = serde_json::to_value(PaymentReference::Gateway("pi_123".into())).unwrap();
        assert_eq!(gateway, json!({"kind": "gateway", "id": "pi_123"}));

        assert_eq!(PaymentReference::BankTransfer.as_key(), "bank_transfer");
        assert_eq!(
            PaymentReference::Gateway("pi_123".into()).as_key(),
            "gateway:pi_123"
        );
    }

    #[test]
    fn payload_uses_camel_case_keys() {
        let data = order_created();
        let body = EventPayload::OrderCreated(data.clone()).to_json().unwrap();
        assert_eq!(body["totalAmount"], json!(12_345));
        assert_eq!(body["orderId"], json!(data.order_id.to_string()));
    }

    #[test]
    fn unknown_types_are_kept_open() {
        let event = DomainEvent::create(
            "inventory.restocked",
            json!({"sku": "SKU-1", "qty": 4}),
            None,
        )
        .unwrap();

        assert_eq!(event.event_type(), "inventory.restocked");
        assert_eq!(
            event.payload().to_json().unwrap(),
            json!({"sku": "SKU-1", "qty": 4})
        );
    }

    #[test]
    fn known_type_with_wrong_shape_is_rejected() {
        let result = EventPayload::from_json(event_types::ORDER_CREATED, json!({"orderId": 7}));
        assert!(matches!(result, Err(EventError::MalformedPayload { .. })));
    }

    #[test]
    fn open_payload_must_be_an_object() {
        let result = EventPayload::from_json("custom.thing", json!([1, 2, 3]));
        assert!(matches!(result, Err(EventError::PayloadNotObject { .. })));

        let result = EventPayload::from_json("", json!({}));
        assert!(matches!(result, Err(EventError::EmptyEventType)));
    }
}
