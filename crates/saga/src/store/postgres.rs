use async_trait::async_trait;
use common::{AggregateId, UserId};
use domain::{CartItem, Money, Order, OrderLine, PaymentMethod, ProductId, User};
use events::DomainEvent;
use outbox::{OutboxError, postgres::insert_outbox_record};
use sqlx::{Connection, PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use super::{OrderTransaction, StoreError, TransactionProvider};

/// PostgreSQL transaction provider.
#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionProvider for PgOrderStore {
    type Tx = PgOrderTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(PgOrderTransaction {
            tx: self.pool.begin().await?,
        })
    }
}

/// One PostgreSQL transaction.
pub struct PgOrderTransaction {
    tx: Transaction<'static, Postgres>,
}

fn parse<T>(value: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| StoreError::Corrupt(e.to_string()))
}

fn to_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column}: {value}")))
}

fn row_to_order(row: PgRow) -> Result<Order, StoreError> {
    let payment_method: Option<String> = row.try_get("payment_method")?;

    Ok(Order {
        id: AggregateId::from_uuid(row.try_get::<Uuid, _>("id")?),
        order_number: row.try_get("order_number")?,
        user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
        total_amount: Money::from_cents(row.try_get("total_amount")?),
        currency: row.try_get("currency")?,
        status: parse(row.try_get::<&str, _>("status")?)?,
        payment_status: parse(row.try_get::<&str, _>("payment_status")?)?,
        payment_method: payment_method
            .as_deref()
            .map(parse::<PaymentMethod>)
            .transpose()?,
        payment_intent_id: row.try_get("payment_intent_id")?,
        client_secret: row.try_get("client_secret")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_line(row: PgRow) -> Result<OrderLine, StoreError> {
    Ok(OrderLine {
        order_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
        product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
        product_name: row.try_get("product_name")?,
        quantity: to_u32(row.try_get("quantity")?, "quantity")?,
        unit_price: Money::from_cents(row.try_get("unit_price")?),
    })
}

fn row_to_cart_item(user_id: UserId, row: PgRow) -> Result<CartItem, StoreError> {
    Ok(CartItem::new(
        user_id,
        row.try_get::<String, _>("product_id")?,
        to_u32(row.try_get("quantity")?, "quantity")?,
    ))
}

#[async_trait]
impl OrderTransaction for PgOrderTransaction {
    async fn find_user(&mut self, user_id: UserId) -> Result<Option<User>, StoreError> {
        let row: Option<PgRow> = sqlx::query("SELECT id, account_type FROM users WHERE id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?;

        match row {
            Some(row) => Ok(Some(User {
                id: UserId::from_uuid(row.try_get::<Uuid, _>("id")?),
                account_type: parse(row.try_get::<&str, _>("account_type")?)?,
            })),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self, order), fields(order_id = %order.id))]
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, order_number, user_id, total_amount, currency, status, payment_status,
                payment_method, payment_intent_id, client_secret, notes, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(&order.order_number)
        .bind(order.user_id.as_uuid())
        .bind(order.total_amount.cents())
        .bind(&order.currency)
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(order.payment_method.map(|m| m.as_str()))
        .bind(&order.payment_intent_id)
        .bind(&order.client_secret)
        .bind(&order.notes)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return StoreError::DuplicateOrder(order.id);
            }
            StoreError::Database(e)
        })?;

        Ok(())
    }

    async fn find_order(&mut self, order_id: AggregateId) -> Result<Option<Order>, StoreError> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT id, order_number, user_id, total_amount, currency, status, payment_status,
                   payment_method, payment_intent_id, client_secret, notes, created_at, updated_at
            FROM orders
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(row_to_order).transpose()
    }

    #[tracing::instrument(skip(self, order), fields(order_id = %order.id))]
    async fn update_order(&mut self, order: &Order) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2,
                payment_status = $3,
                payment_intent_id = $4,
                client_secret = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(&order.payment_intent_id)
        .bind(&order.client_secret)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::OrderNotFound(order.id));
        }
        Ok(())
    }

    async fn insert_order_lines(&mut self, lines: &[OrderLine]) -> Result<(), StoreError> {
        for line in lines {
            let quantity =
                i32::try_from(line.quantity).map_err(|_| StoreError::OutOfRange {
                    column: "order_lines.quantity",
                    value: u64::from(line.quantity),
                })?;
            sqlx::query(
                r#"
                INSERT INTO order_lines (order_id, product_id, product_name, quantity, unit_price)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(line.order_id.as_uuid())
            .bind(line.product_id.as_str())
            .bind(&line.product_name)
            .bind(quantity)
            .bind(line.unit_price.cents())
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn find_order_lines(
        &mut self,
        order_id: AggregateId,
    ) -> Result<Vec<OrderLine>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, product_id, product_name, quantity, unit_price
            FROM order_lines
            WHERE order_id = $1
            ORDER BY product_id ASC
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(row_to_line).collect()
    }

    async fn find_cart_items(&mut self, user_id: UserId) -> Result<Vec<CartItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, quantity
            FROM cart_items
            WHERE user_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter()
            .map(|row| row_to_cart_item(user_id, row))
            .collect()
    }

    async fn count_cart_items(&mut self, user_id: UserId) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cart_items WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .fetch_one(&mut *self.tx)
            .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn clear_cart(&mut self, user_id: UserId) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM cart_items WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected())
    }

    async fn enqueue_event(&mut self, event: &DomainEvent) -> Result<(), OutboxError> {
        // A failed statement poisons the whole transaction unless it ran in a savepoint.
        let mut savepoint = self.tx.begin().await?;
        match insert_outbox_record(&mut *savepoint, event).await {
            Ok(()) => {
                savepoint.commit().await?;
                Ok(())
            }
            Err(e) => {
                savepoint.rollback().await?;
                Err(e)
            }
        }
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
