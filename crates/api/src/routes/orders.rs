//! Checkout, payment and order lookup endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{AggregateId, UserId};
use domain::{
    Money, OrderCreationRequest, OrderItem, PaymentMethod, PaymentStatus, PaymentTransition,
};
use events::{InProcessEventBus, PaymentReference};
use outbox::OutboxStore;
use saga::{
    FinalizeOutcome, OrderCreationResult, OrderCreationSaga, OrderDetails, PaymentGateway,
    TransactionProvider,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Saga wired the way the process host runs it.
pub type AppSaga<T> = OrderCreationSaga<T, Arc<dyn PaymentGateway>, InProcessEventBus>;

/// Shared application state accessible from all handlers.
pub struct AppState<T, O> {
    pub saga: Arc<AppSaga<T>>,
    pub outbox: O,
    /// Dead-letter threshold, shared with the dispatcher.
    pub max_attempts: u32,
}

// -- Request types --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub user_id: String,
    pub payment_method: PaymentMethod,
    pub currency: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub items: Vec<OrderItemRequest>,
    /// Defaults to the sum of the item totals.
    #[serde(default)]
    pub total_amount: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyOrderRequest {
    pub user_id: String,
    pub currency: String,
    #[serde(default)]
    pub items: Vec<OrderItemRequest>,
    #[serde(default)]
    pub total_amount: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemRequest {
    pub product_id: String,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentRequest {
    /// Gateway payment-intent id; omitted for bank transfers.
    #[serde(default)]
    pub payment_intent_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FailPaymentRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

impl<T> Envelope<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentUpdateResponse {
    pub order_id: AggregateId,
    /// `applied`, `already_succeeded` or `already_failed`.
    pub transition: &'static str,
    pub payment_status: PaymentStatus,
}

// -- Handlers --

/// POST /orders
///
/// Run the checkout saga against the user's current cart.
#[tracing::instrument(skip(state, req), fields(payment_method = %req.payment_method))]
pub async fn create<T, O>(
    State(state): State<Arc<AppState<T, O>>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<Envelope<OrderCreationResult>>), ApiError>
where
    T: TransactionProvider + 'static,
    O: OutboxStore + 'static,
{
    let user_id = parse_user_id(&req.user_id)?;
    let items = to_items(&req.items);
    let total = total_for(&items, req.total_amount);
    let cart = state.saga.cart_snapshot(user_id).await?;

    let request = OrderCreationRequest {
        payment_method: req.payment_method,
        currency: req.currency,
        notes: req.notes,
    };
    let result = state
        .saga
        .create_order(user_id, &request, &items, &cart, total)
        .await?;

    Ok((StatusCode::CREATED, Envelope::ok(result)))
}

/// POST /orders/legacy
///
/// Record an order without payment handling.
#[tracing::instrument(skip(state, req))]
pub async fn create_legacy<T, O>(
    State(state): State<Arc<AppState<T, O>>>,
    Json(req): Json<LegacyOrderRequest>,
) -> Result<(StatusCode, Json<Envelope<OrderCreationResult>>), ApiError>
where
    T: TransactionProvider + 'static,
    O: OutboxStore + 'static,
{
    let user_id = parse_user_id(&req.user_id)?;
    let items = to_items(&req.items);
    let total = total_for(&items, req.total_amount);

    let result = state
        .saga
        .create_order_legacy(user_id, &items, total, &req.currency)
        .await?;

    Ok((StatusCode::CREATED, Envelope::ok(result)))
}

/// GET /orders/{id}
///
/// An order with its lines.
#[tracing::instrument(skip(state))]
pub async fn get<T, O>(
    State(state): State<Arc<AppState<T, O>>>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<OrderDetails>>, ApiError>
where
    T: TransactionProvider + 'static,
    O: OutboxStore + 'static,
{
    let order_id = parse_order_id(&id)?;
    let details = state
        .saga
        .get_order(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order not found: {order_id}")))?;

    Ok(Envelope::ok(details))
}

/// POST /orders/{id}/finalize
///
/// Clear the buyer's remaining cart.
#[tracing::instrument(skip(state))]
pub async fn finalize<T, O>(
    State(state): State<Arc<AppState<T, O>>>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<FinalizeOutcome>>, ApiError>
where
    T: TransactionProvider + 'static,
    O: OutboxStore + 'static,
{
    let order_id = parse_order_id(&id)?;
    let outcome = state.saga.finalize_after_payment(order_id).await?;
    Ok(Envelope::ok(outcome))
}

/// POST /orders/{id}/payment/confirm
#[tracing::instrument(skip(state, req))]
pub async fn confirm_payment<T, O>(
    State(state): State<Arc<AppState<T, O>>>,
    Path(id): Path<String>,
    req: Option<Json<ConfirmPaymentRequest>>,
) -> Result<Json<Envelope<PaymentUpdateResponse>>, ApiError>
where
    T: TransactionProvider + 'static,
    O: OutboxStore + 'static,
{
    let order_id = parse_order_id(&id)?;
    let Json(req) = req.unwrap_or_default();
    let reference = match req.payment_intent_id {
        Some(intent_id) => PaymentReference::Gateway(intent_id),
        None => PaymentReference::BankTransfer,
    };

    let transition = state.saga.confirm_payment(order_id, reference).await?;
    Ok(Envelope::ok(payment_update(order_id, transition)))
}

/// POST /orders/{id}/payment/fail
#[tracing::instrument(skip(state, req))]
pub async fn fail_payment<T, O>(
    State(state): State<Arc<AppState<T, O>>>,
    Path(id): Path<String>,
    req: Option<Json<FailPaymentRequest>>,
) -> Result<Json<Envelope<PaymentUpdateResponse>>, ApiError>
where
    T: TransactionProvider + 'static,
    O: OutboxStore + 'static,
{
    let order_id = parse_order_id(&id)?;
    let Json(req) = req.unwrap_or_default();

    let transition = state.saga.fail_payment(order_id, req.reason).await?;
    Ok(Envelope::ok(payment_update(order_id, transition)))
}

// -- Helpers --

fn payment_update(order_id: AggregateId, transition: PaymentTransition) -> PaymentUpdateResponse {
    let (label, payment_status) = match transition {
        PaymentTransition::Applied { to, .. } => ("applied", to),
        PaymentTransition::AlreadySucceeded => ("already_succeeded", PaymentStatus::Succeeded),
        PaymentTransition::AlreadyFailed => ("already_failed", PaymentStatus::Failed),
    };
    PaymentUpdateResponse {
        order_id,
        transition: label,
        payment_status,
    }
}

fn to_items(items: &[OrderItemRequest]) -> Vec<OrderItem> {
    items
        .iter()
        .map(|item| {
            OrderItem::new(
                item.product_id.as_str(),
                item.product_name.as_str(),
                item.quantity,
                Money::from_cents(item.unit_price),
            )
        })
        .collect()
}

fn total_for(items: &[OrderItem], explicit: Option<i64>) -> Money {
    explicit
        .map(Money::from_cents)
        .unwrap_or_else(|| items.iter().map(OrderItem::total_price).sum())
}

fn parse_user_id(id: &str) -> Result<UserId, ApiError> {
    UserId::parse_str(id).map_err(|e| ApiError::BadRequest(format!("Invalid userId: {e}")))
}

fn parse_order_id(id: &str) -> Result<AggregateId, ApiError> {
    AggregateId::parse_str(id).map_err(|e| ApiError::BadRequest(format!("Invalid order id: {e}")))
}
