use std::time::Duration;

use async_trait::async_trait;
use common::AggregateId;
use events::DomainEvent;
use sqlx::{PgExecutor, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    EventId, OutboxError, OutboxRecord, Result,
    idempotency::{HandlerKey, IdempotencyLedger, MarkOutcome},
    store::OutboxStore,
};

/// SQLSTATE for "relation does not exist".
const UNDEFINED_TABLE: &str = "42P01";

const RECORD_COLUMNS: &str = "id, type, aggregate_id, payload, occurred_at, processed_at, \
     attempt, error, seq, locked_by, locked_until";

/// Maps a missing table to [`OutboxError::Unavailable`]; everything else stays a
/// database error.
pub fn classify(error: sqlx::Error) -> OutboxError {
    if let sqlx::Error::Database(ref db_err) = error
        && db_err.code().as_deref() == Some(UNDEFINED_TABLE)
    {
        return OutboxError::Unavailable(db_err.message().to_string());
    }
    OutboxError::Database(error)
}

/// Inserts an outbox row using any executor, typically an open transaction,
/// so the event commits or rolls back with the business write.
pub async fn insert_outbox_record<'e, E>(executor: E, event: &DomainEvent) -> Result<()>
where
    E: PgExecutor<'e>,
{
    let record = OutboxRecord::from_event(event)?;

    sqlx::query(
        r#"
        INSERT INTO outbox_events (id, type, aggregate_id, payload, occurred_at, attempt)
        VALUES ($1, $2, $3, $4, $5, 0)
        "#,
    )
    .bind(record.id.as_uuid())
    .bind(&record.event_type)
    .bind(record.aggregate_id.map(|id| id.as_uuid()))
    .bind(&record.payload)
    .bind(record.occurred_at)
    .execute(executor)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(ref db_err) = e
            && db_err.is_unique_violation()
        {
            return OutboxError::Duplicate(record.id);
        }
        classify(e)
    })?;

    Ok(())
}

fn row_to_record(row: PgRow) -> Result<OutboxRecord> {
    let attempt: i32 = row.try_get("attempt")?;

    Ok(OutboxRecord {
        id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
        event_type: row.try_get("type")?,
        aggregate_id: row
            .try_get::<Option<Uuid>, _>("aggregate_id")?
            .map(AggregateId::from_uuid),
        payload: row.try_get("payload")?,
        occurred_at: row.try_get("occurred_at")?,
        processed_at: row.try_get("processed_at")?,
        attempt: u32::try_from(attempt).unwrap_or(0),
        error: row.try_get("error")?,
        sequence: row.try_get("seq")?,
        locked_by: row.try_get("locked_by")?,
        locked_until: row.try_get("locked_until")?,
    })
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// PostgreSQL-backed outbox.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[tracing::instrument(skip(self, event), fields(event_id = %event.id(), event_type = event.event_type()))]
    async fn add_event(&self, event: &DomainEvent) -> Result<()> {
        insert_outbox_record(&self.pool, event).await
    }

    async fn mark_processed(&self, id: EventId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET processed_at = COALESCE(processed_at, now()),
                locked_by = NULL,
                locked_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    async fn increment_attempt(&self, id: EventId, error: Option<&str>) -> Result<u32> {
        let attempt: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE outbox_events
            SET attempt = attempt + 1,
                error = $2,
                locked_by = NULL,
                locked_until = NULL
            WHERE id = $1
            RETURNING attempt
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        attempt
            .map(|a| u32::try_from(a).unwrap_or(0))
            .ok_or(OutboxError::NotFound(id))
    }

    async fn fetch_pending(&self, limit: usize, max_attempts: u32) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM outbox_events
            WHERE processed_at IS NULL
              AND attempt < $1
              AND (locked_until IS NULL OR locked_until < now())
            ORDER BY occurred_at ASC, seq ASC
            LIMIT $2
            "#
        ))
        .bind(to_i32(max_attempts))
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.into_iter().map(row_to_record).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: usize,
        max_attempts: u32,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            WITH batch AS (
                SELECT id
                FROM outbox_events
                WHERE processed_at IS NULL
                  AND attempt < $1
                  AND (locked_until IS NULL OR locked_until < now())
                ORDER BY occurred_at ASC, seq ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events o
            SET locked_by = $3,
                locked_until = now() + make_interval(secs => $4)
            FROM batch
            WHERE o.id = batch.id
            RETURNING o.id, o.type, o.aggregate_id, o.payload, o.occurred_at, o.processed_at,
                      o.attempt, o.error, o.seq, o.locked_by, o.locked_until
            "#,
        )
        .bind(to_i32(max_attempts))
        .bind(to_i64(limit))
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        // UPDATE ... RETURNING does not preserve the CTE's ordering.
        let mut records = rows
            .into_iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(records)
    }

    async fn dead_letters(&self, max_attempts: u32, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM outbox_events
            WHERE processed_at IS NULL AND attempt >= $1
            ORDER BY occurred_at ASC, seq ASC
            LIMIT $2
            "#
        ))
        .bind(to_i32(max_attempts))
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.into_iter().map(row_to_record).collect()
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>> {
        let row: Option<PgRow> = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM outbox_events WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.map(row_to_record).transpose()
    }
}

/// PostgreSQL-backed idempotency ledger over a unique `handler_key` column.
#[derive(Clone)]
pub struct PostgresIdempotencyLedger {
    pool: PgPool,
}

impl PostgresIdempotencyLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyLedger for PostgresIdempotencyLedger {
    async fn has_handled(&self, key: &HandlerKey) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM event_idempotency WHERE handler_key = $1)",
        )
        .bind(key.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        Ok(exists)
    }

    async fn mark_handled(&self, key: &HandlerKey) -> Result<MarkOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO event_idempotency (handler_key)
            VALUES ($1)
            ON CONFLICT (handler_key) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        if result.rows_affected() == 0 {
            Ok(MarkOutcome::AlreadyRecorded)
        } else {
            Ok(MarkOutcome::Recorded)
        }
    }
}
