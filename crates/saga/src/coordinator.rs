//! Order-creation saga coordinator.

use std::time::Instant;

use common::{AggregateId, UserId};
use domain::{
    CartItem, Money, Order, OrderCreationRequest, OrderItem, OrderLine, PaymentMethod,
    PaymentTransition, validate_amounts, validate_currency,
};
use events::{
    DomainEvent, EventPublisher, OrderCreatedData, PaymentFailedData, PaymentIntentCreatedData,
    PaymentReference, PaymentSucceededData, PublishReport,
};
use outbox::{OutboxError, publish_in_process};
use serde::Serialize;

use crate::error::{Result, SagaError};
use crate::services::PaymentGateway;
use crate::state::SagaState;
use crate::store::{OrderTransaction, TransactionProvider};

/// What a committed checkout hands back to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreationResult {
    pub order: Order,
    pub lines: Vec<OrderLine>,
    /// Gateway payment-intent id; `None` for auto-approved and legacy orders.
    pub payment_intent_id: Option<String>,
    pub client_secret: Option<String>,
    /// Saga states visited, in order.
    pub trail: Vec<SagaState>,
    /// Event types written to the outbox, in insertion order.
    pub enqueued_events: Vec<String>,
    /// Events published in-process after commit because the outbox was missing.
    #[serde(skip)]
    pub fallback_publishes: Vec<PublishReport>,
}

/// Result of [`OrderCreationSaga::finalize_after_payment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeOutcome {
    pub order_id: AggregateId,
    pub items_cleared: u64,
}

/// An order with its lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetails {
    pub order: Order,
    pub lines: Vec<OrderLine>,
}

/// Bookkeeping for one run.
#[derive(Default)]
struct Run {
    trail: Vec<SagaState>,
    enqueued: Vec<String>,
    /// Events that could not be written to the outbox; published after commit.
    deferred: Vec<DomainEvent>,
}

impl Run {
    fn enter(&mut self, state: SagaState) {
        debug_assert!(!self.last().is_terminal(), "saga stepped past {}", self.last());
        tracing::debug!(state = %state, "Saga step");
        self.trail.push(state);
    }

    fn last(&self) -> SagaState {
        self.trail.last().copied().unwrap_or_default()
    }
}

/// Runs checkouts and payment follow-ups as single transactions.
///
/// Every write of a run, outbox rows included, goes through one
/// [`OrderTransaction`]; on any error the transaction is rolled back and
/// nothing from the run is visible.
///
/// The gateway call happens while the transaction is open. This keeps the
/// order and its payment reference atomic at the cost of holding row locks
/// for one network round trip.
pub struct OrderCreationSaga<T, G, P> {
    store: T,
    gateway: G,
    publisher: P,
}

impl<T, G, P> OrderCreationSaga<T, G, P>
where
    T: TransactionProvider,
    G: PaymentGateway,
    P: EventPublisher,
{
    /// `publisher` is only used when the outbox table is missing.
    pub fn new(store: T, gateway: G, publisher: P) -> Self {
        Self {
            store,
            gateway,
            publisher,
        }
    }

    pub fn store(&self) -> &T {
        &self.store
    }

    /// Places an order from a checkout.
    ///
    /// `items` are the priced lines to snapshot, `cart` the cart rows they came
    /// from (only its emptiness matters) and `total` the amount to charge.
    #[tracing::instrument(
        skip(self, request, items, cart),
        fields(user_id = %user_id, payment_method = %request.payment_method, total = total.cents())
    )]
    pub async fn create_order(
        &self,
        user_id: UserId,
        request: &OrderCreationRequest,
        items: &[OrderItem],
        cart: &[CartItem],
        total: Money,
    ) -> Result<OrderCreationResult> {
        metrics::counter!("saga_executions_total", "path" => "checkout").increment(1);
        let started = Instant::now();
        let mut run = Run::default();
        run.enter(SagaState::Validating);

        if let Err(e) = request.validate(items, total) {
            return Err(self.failed(&run, "checkout", started, e.into()));
        }

        let mut tx = self.begin(&run, "checkout", started).await?;
        match self
            .checkout_steps(&mut tx, &mut run, user_id, request, items, cart, total)
            .await
        {
            Ok((order, lines)) => {
                let fallback_publishes = self.commit(tx, &mut run, "checkout", started).await?;
                run.enter(SagaState::Completed);
                self.completed(&run, "checkout", started, &order);

                Ok(OrderCreationResult {
                    payment_intent_id: order.payment_intent_id.clone(),
                    client_secret: order.client_secret.clone(),
                    order,
                    lines,
                    trail: run.trail,
                    enqueued_events: run.enqueued,
                    fallback_publishes,
                })
            }
            Err(e) => Err(self.abort(tx, &run, "checkout", started, e).await),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn checkout_steps(
        &self,
        tx: &mut T::Tx,
        run: &mut Run,
        user_id: UserId,
        request: &OrderCreationRequest,
        items: &[OrderItem],
        cart: &[CartItem],
        total: Money,
    ) -> Result<(Order, Vec<OrderLine>)> {
        let user = tx
            .find_user(user_id)
            .await?
            .ok_or(SagaError::UserNotFound(user_id))?;

        let mut order = Order::new(
            user.id,
            total,
            &request.currency,
            Some(request.payment_method),
            request.notes.clone(),
        );
        tx.insert_order(&order).await?;
        Self::enqueue(
            tx,
            run,
            DomainEvent::order_created(OrderCreatedData {
                order_id: order.id,
                user_id: user.id,
                total_amount: total.cents(),
                currency: order.currency.clone(),
            }),
        )
        .await?;
        run.enter(SagaState::OrderPersisted);

        run.enter(SagaState::PaymentBranchSelected);
        if request.payment_method == PaymentMethod::BankTransfer && user.is_corporate() {
            order.mark_payment_succeeded();
            tx.update_order(&order).await?;
            Self::enqueue(
                tx,
                run,
                DomainEvent::payment_succeeded(PaymentSucceededData {
                    order_id: order.id,
                    user_id: user.id,
                    payment_reference: PaymentReference::BankTransfer,
                }),
            )
            .await?;
            run.enter(SagaState::CorporateAutoApproved);
        } else {
            let intent = self.gateway.create_payment_intent(&order, request).await?;
            order.attach_payment_intent(intent.id.clone(), intent.client_secret);
            tx.update_order(&order).await?;
            Self::enqueue(
                tx,
                run,
                DomainEvent::payment_intent_created(PaymentIntentCreatedData {
                    order_id: order.id,
                    user_id: user.id,
                    payment_intent_id: intent.id,
                }),
            )
            .await?;
            run.enter(SagaState::GatewayPaymentInitiated);
        }

        let lines = Self::materialize(tx, run, &order, items).await?;

        if !cart.is_empty() {
            tx.clear_cart(user.id).await?;
            run.enter(SagaState::CartCleared);
        }

        Ok((order, lines))
    }

    /// Record-only creation path: no user lookup, no payment branch.
    ///
    /// Writes the order with a pending payment, its lines and `order.created`,
    /// and always clears the user's cart.
    #[tracing::instrument(skip(self, items), fields(user_id = %user_id, total = total.cents()))]
    pub async fn create_order_legacy(
        &self,
        user_id: UserId,
        items: &[OrderItem],
        total: Money,
        currency: &str,
    ) -> Result<OrderCreationResult> {
        metrics::counter!("saga_executions_total", "path" => "legacy").increment(1);
        let started = Instant::now();
        let mut run = Run::default();
        run.enter(SagaState::Validating);

        if let Err(e) = validate_currency(currency).and_then(|()| validate_amounts(items, total)) {
            return Err(self.failed(&run, "legacy", started, e.into()));
        }

        let mut tx = self.begin(&run, "legacy", started).await?;
        match Self::legacy_steps(&mut tx, &mut run, user_id, items, total, currency).await {
            Ok((order, lines)) => {
                let fallback_publishes = self.commit(tx, &mut run, "legacy", started).await?;
                run.enter(SagaState::LegacyCompleted);
                self.completed(&run, "legacy", started, &order);

                Ok(OrderCreationResult {
                    payment_intent_id: None,
                    client_secret: None,
                    order,
                    lines,
                    trail: run.trail,
                    enqueued_events: run.enqueued,
                    fallback_publishes,
                })
            }
            Err(e) => Err(self.abort(tx, &run, "legacy", started, e).await),
        }
    }

    async fn legacy_steps(
        tx: &mut T::Tx,
        run: &mut Run,
        user_id: UserId,
        items: &[OrderItem],
        total: Money,
        currency: &str,
    ) -> Result<(Order, Vec<OrderLine>)> {
        let order = Order::new(user_id, total, currency, None, None);
        tx.insert_order(&order).await?;
        Self::enqueue(
            tx,
            run,
            DomainEvent::order_created(OrderCreatedData {
                order_id: order.id,
                user_id,
                total_amount: total.cents(),
                currency: order.currency.clone(),
            }),
        )
        .await?;
        run.enter(SagaState::OrderPersisted);

        let lines = Self::materialize(tx, run, &order, items).await?;

        tx.clear_cart(user_id).await?;
        run.enter(SagaState::CartCleared);

        Ok((order, lines))
    }

    /// Clears whatever is left in the order owner's cart.
    ///
    /// Safe to call any number of times; later calls find an empty cart and
    /// write nothing.
    #[tracing::instrument(skip(self), fields(order_id = %order_id))]
    pub async fn finalize_after_payment(&self, order_id: AggregateId) -> Result<FinalizeOutcome> {
        let mut tx = self.store.begin().await?;
        let result = async {
            let order = tx
                .find_order(order_id)
                .await?
                .ok_or(SagaError::OrderNotFound(order_id))?;

            let remaining = tx.count_cart_items(order.user_id).await?;
            if remaining == 0 {
                return Ok(0);
            }
            Ok::<_, SagaError>(tx.clear_cart(order.user_id).await?)
        }
        .await;

        match result {
            Ok(items_cleared) => {
                tx.commit().await?;
                tracing::info!(items_cleared, "Order finalized after payment");
                Ok(FinalizeOutcome {
                    order_id,
                    items_cleared,
                })
            }
            Err(e) => {
                Self::rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    /// Records a confirmed payment.
    ///
    /// Payment success is one-way: confirming an order that already succeeded
    /// (a corporate auto-approval, or a repeated webhook) changes nothing and
    /// emits nothing. The reference must belong to the order: the gateway
    /// intent the order holds, or the synthetic bank-transfer reference for
    /// bank-transfer orders.
    #[tracing::instrument(skip(self), fields(order_id = %order_id, reference = %reference))]
    pub async fn confirm_payment(
        &self,
        order_id: AggregateId,
        reference: PaymentReference,
    ) -> Result<PaymentTransition> {
        self.apply_payment(order_id, |order| {
            check_reference(order, &reference)?;
            let transition = order.mark_payment_succeeded();
            let event = DomainEvent::payment_succeeded(PaymentSucceededData {
                order_id: order.id,
                user_id: order.user_id,
                payment_reference: reference,
            });
            Ok((transition, event))
        })
        .await
    }

    /// Records a failed payment. The order stays pending and may be paid later.
    #[tracing::instrument(skip(self), fields(order_id = %order_id))]
    pub async fn fail_payment(
        &self,
        order_id: AggregateId,
        reason: Option<String>,
    ) -> Result<PaymentTransition> {
        self.apply_payment(order_id, |order| {
            let transition = order.mark_payment_failed();
            let event = DomainEvent::payment_failed(PaymentFailedData {
                order_id: order.id,
                reason,
            });
            Ok((transition, event))
        })
        .await
    }

    async fn apply_payment<F>(&self, order_id: AggregateId, change: F) -> Result<PaymentTransition>
    where
        F: FnOnce(&mut Order) -> Result<(PaymentTransition, DomainEvent)> + Send,
    {
        let mut tx = self.store.begin().await?;
        let mut run = Run::default();

        let result = async {
            let mut order = tx
                .find_order(order_id)
                .await?
                .ok_or(SagaError::OrderNotFound(order_id))?;

            let (transition, event) = change(&mut order)?;
            if transition.is_applied() {
                tx.update_order(&order).await?;
                Self::enqueue(&mut tx, &mut run, event).await?;
            }
            Ok::<_, SagaError>(transition)
        }
        .await;

        match result {
            Ok(transition) if transition.is_applied() => {
                tx.commit().await?;
                self.publish_deferred(&mut run).await;
                tracing::info!(?transition, "Payment status updated");
                Ok(transition)
            }
            Ok(transition) => {
                Self::rollback_quietly(tx).await;
                tracing::info!(?transition, "Payment status unchanged");
                Ok(transition)
            }
            Err(e) => {
                Self::rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    /// Reads an order and its lines.
    pub async fn get_order(&self, order_id: AggregateId) -> Result<Option<OrderDetails>> {
        let mut tx = self.store.begin().await?;
        let result = async {
            let Some(order) = tx.find_order(order_id).await? else {
                return Ok(None);
            };
            let lines = tx.find_order_lines(order_id).await?;
            Ok::<_, SagaError>(Some(OrderDetails { order, lines }))
        }
        .await;

        Self::rollback_quietly(tx).await;
        result
    }

    /// Reads the user's current cart, for callers that pass it to
    /// [`Self::create_order`].
    pub async fn cart_snapshot(&self, user_id: UserId) -> Result<Vec<CartItem>> {
        let mut tx = self.store.begin().await?;
        let result = tx.find_cart_items(user_id).await.map_err(SagaError::from);
        Self::rollback_quietly(tx).await;
        result
    }

    async fn materialize(
        tx: &mut T::Tx,
        run: &mut Run,
        order: &Order,
        items: &[OrderItem],
    ) -> Result<Vec<OrderLine>> {
        let lines: Vec<OrderLine> = items
            .iter()
            .map(|item| OrderLine::from_item(order.id, item))
            .collect();
        if !lines.is_empty() {
            tx.insert_order_lines(&lines).await?;
        }
        run.enter(SagaState::ItemsMaterialized);
        Ok(lines)
    }

    /// Writes an event into the transaction's outbox.
    ///
    /// A missing outbox table does not fail the run: the event is held and
    /// published in-process once the transaction has committed.
    async fn enqueue(tx: &mut T::Tx, run: &mut Run, event: DomainEvent) -> Result<()> {
        match tx.enqueue_event(&event).await {
            Ok(()) => {
                run.enqueued.push(event.event_type().to_string());
                Ok(())
            }
            Err(OutboxError::Unavailable(reason)) => {
                tracing::warn!(
                    event_id = %event.id(),
                    event_type = event.event_type(),
                    reason = %reason,
                    "Outbox unavailable, event will be published in-process after commit"
                );
                run.deferred.push(event);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn begin(&self, run: &Run, path: &'static str, started: Instant) -> Result<T::Tx> {
        self.store
            .begin()
            .await
            .map_err(|e| self.failed(run, path, started, e.into()))
    }

    async fn commit(
        &self,
        tx: T::Tx,
        run: &mut Run,
        path: &'static str,
        started: Instant,
    ) -> Result<Vec<PublishReport>> {
        if let Err(e) = tx.commit().await {
            return Err(self.failed(run, path, started, e.into()));
        }
        for event_type in &run.enqueued {
            metrics::counter!("outbox_events_enqueued_total", "event_type" => event_type.clone())
                .increment(1);
        }
        Ok(self.publish_deferred(run).await)
    }

    async fn publish_deferred(&self, run: &mut Run) -> Vec<PublishReport> {
        let mut reports = Vec::with_capacity(run.deferred.len());
        for event in run.deferred.drain(..) {
            match publish_in_process(&self.publisher, &event).await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(
                    event_id = %event.id(),
                    event_type = event.event_type(),
                    error = %e,
                    "In-process publish failed; event is lost"
                ),
            }
        }
        reports
    }

    async fn abort(
        &self,
        tx: T::Tx,
        run: &Run,
        path: &'static str,
        started: Instant,
        error: SagaError,
    ) -> SagaError {
        Self::rollback_quietly(tx).await;
        self.failed(run, path, started, error)
    }

    async fn rollback_quietly(tx: T::Tx) {
        if let Err(e) = tx.rollback().await {
            tracing::error!(error = %e, "Rollback failed");
        }
    }

    fn failed(&self, run: &Run, path: &'static str, started: Instant, error: SagaError) -> SagaError {
        let failed_at = run.last();
        metrics::counter!("saga_failed_total", "path" => path, "state" => failed_at.as_str())
            .increment(1);
        metrics::histogram!("saga_duration_seconds", "path" => path)
            .record(started.elapsed().as_secs_f64());
        tracing::warn!(
            state = %SagaState::Failed,
            failed_at = %failed_at,
            trail = ?run.trail,
            error = %error,
            "Order saga rolled back"
        );
        error
    }

    fn completed(&self, run: &Run, path: &'static str, started: Instant, order: &Order) {
        metrics::counter!("saga_completed_total", "path" => path).increment(1);
        metrics::histogram!("saga_duration_seconds", "path" => path)
            .record(started.elapsed().as_secs_f64());
        tracing::info!(
            order_id = %order.id,
            order_number = %order.order_number,
            payment_status = %order.payment_status,
            trail = ?run.trail,
            "Order saga completed"
        );
    }
}

fn check_reference(order: &Order, reference: &PaymentReference) -> Result<()> {
    let matches = match reference {
        PaymentReference::BankTransfer => order.payment_method == Some(PaymentMethod::BankTransfer),
        PaymentReference::Gateway(id) => order.payment_intent_id.as_deref() == Some(id.as_str()),
    };
    if matches {
        Ok(())
    } else {
        Err(SagaError::PaymentReferenceMismatch {
            order_id: order.id,
            reference: reference.clone(),
        })
    }
}
