//! PostgreSQL outbox store over the `outbox_events` table

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::storage::postgres::PgTx;

use super::{
    truncate_reason, NewOutboxEvent, OutboxError, OutboxEvent, OutboxStore, DEFAULT_MAX_RETRIES,
};

type OutboxRow = (
    Uuid,
    String,
    String,
    String,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    i32,
    Option<String>,
);

const SELECT_COLUMNS: &str = r#"
    SELECT id, aggregate_id, aggregate_type, event_type, payload,
           occurred_on, processed_at, retry_count, last_error
    FROM outbox_events
"#;

fn into_event(row: OutboxRow) -> OutboxEvent {
    let (
        id,
        aggregate_id,
        aggregate_type,
        event_type,
        payload,
        occurred_on,
        processed_at,
        retry_count,
        last_error,
    ) = row;

    OutboxEvent {
        id,
        aggregate_id,
        aggregate_type,
        event_type,
        payload,
        occurred_on,
        processed_at,
        retry_count: u32::try_from(retry_count).unwrap_or_default(),
        last_error,
    }
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Outbox store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    max_retries: u32,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn exists(&self, id: Uuid) -> Result<bool, OutboxError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM outbox_events WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    fn max_retries_i32(&self) -> i32 {
        i32::try_from(self.max_retries).unwrap_or(i32::MAX)
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    type Tx = PgTx;

    async fn save_event(
        &self,
        tx: &mut PgTx,
        event: NewOutboxEvent,
    ) -> Result<OutboxEvent, OutboxError> {
        let record = event.into_record();

        sqlx::query(
            r#"
            INSERT INTO outbox_events
                (id, aggregate_id, aggregate_type, event_type, payload, occurred_on, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, 0)
            "#,
        )
        .bind(record.id)
        .bind(&record.aggregate_id)
        .bind(&record.aggregate_type)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.occurred_on)
        .execute(&mut **tx)
        .await?;

        Ok(record)
    }

    async fn get_unprocessed_events(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE processed_at IS NULL AND retry_count < $1 \
             ORDER BY occurred_on ASC, seq ASC LIMIT $2"
        );

        let rows: Vec<OutboxRow> = sqlx::query_as(&sql)
            .bind(self.max_retries_i32())
            .bind(to_limit(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(into_event).collect())
    }

    async fn mark_as_processed(&self, id: Uuid) -> Result<(), OutboxError> {
        let result = sqlx::query(
            "UPDATE outbox_events SET processed_at = NOW() WHERE id = $1 AND processed_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && !self.exists(id).await? {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    async fn increment_retry(&self, id: Uuid, reason: &str) -> Result<u32, OutboxError> {
        let updated: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE outbox_events
            SET retry_count = retry_count + 1, last_error = $2
            WHERE id = $1 AND processed_at IS NULL
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .bind(truncate_reason(reason))
        .fetch_optional(&self.pool)
        .await?;

        let count = match updated {
            Some(count) => count,
            None => sqlx::query_scalar("SELECT retry_count FROM outbox_events WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(OutboxError::NotFound(id))?,
        };

        Ok(u32::try_from(count).unwrap_or_default())
    }

    async fn get_quarantined_events(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE processed_at IS NULL AND retry_count >= $1 \
             ORDER BY occurred_on ASC, seq ASC LIMIT $2"
        );

        let rows: Vec<OutboxRow> = sqlx::query_as(&sql)
            .bind(self.max_retries_i32())
            .bind(to_limit(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(into_event).collect())
    }

    async fn requeue(&self, id: Uuid) -> Result<(), OutboxError> {
        let result = sqlx::query(
            "UPDATE outbox_events SET retry_count = 0 WHERE id = $1 AND processed_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && !self.exists(id).await? {
            return Err(OutboxError::NotFound(id));
        }

        tracing::info!(event_id = %id, "Outbox event requeued");
        Ok(())
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = $1");

        let row: Option<OutboxRow> =
            sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await?;

        Ok(row.map(into_event))
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
