use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

use crate::domain::errors::truncate_error;
use crate::domain::{next_after_failure, NewOutboxMessage, OutboxMessage, OutboxStatus, OutboxStatusCounts};

#[async_trait]
pub trait OutboxRepositoryTrait: Send + Sync {
    /// Claims up to `limit` pending messages, oldest id first.
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxMessage>>;

    async fn mark_published(&self, outbox_message_id: i64) -> Result<()>;

    /// Counts one failed attempt and returns the status the message ends in.
    async fn record_failed_attempt(
        &self,
        outbox_message_id: i64,
        max_retry_count: i32,
        error_message: &str,
    ) -> Result<OutboxStatus>;

    /// Fails a message without spending its retry budget.
    async fn mark_failed(&self, outbox_message_id: i64, error_message: &str) -> Result<()>;

    /// Puts a failed message back in the queue with a fresh retry budget.
    /// Returns false when the message is missing or not failed.
    async fn requeue_failed(&self, outbox_message_id: i64) -> Result<bool>;

    async fn find(&self, outbox_message_id: i64) -> Result<Option<OutboxMessage>>;

    async fn count_by_status(&self) -> Result<OutboxStatusCounts>;
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PersistedOutboxMessage {
    pub id: i64,
    pub aggregate_id: String,
    pub event_type: String,
    pub queue: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub correlation_id: Option<String>,
    pub status: String,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl TryFrom<PersistedOutboxMessage> for OutboxMessage {
    type Error = anyhow::Error;

    fn try_from(row: PersistedOutboxMessage) -> Result<Self> {
        let status = row
            .status
            .parse::<OutboxStatus>()
            .map_err(|_| anyhow::anyhow!("Unknown outbox status {} on message {}", row.status, row.id))?;
        Ok(OutboxMessage {
            id: row.id,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            queue: row.queue,
            payload: row.payload,
            content_type: row.content_type,
            correlation_id: row.correlation_id,
            status,
            retry_count: row.retry_count,
            last_error: row.last_error,
            created_at: row.created_at,
            published_at: row.published_at,
        })
    }
}

const OUTBOX_COLUMNS: &str = "id, aggregate_id, event_type, queue, payload, content_type, \
     correlation_id, status, retry_count, last_error, created_at, published_at";

#[derive(Clone)]
pub struct PostgresOutboxRepository {
    pool: PgPool,
    claim_lease: Duration,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool, claim_lease: Duration) -> Self {
        Self { pool, claim_lease }
    }

    /// Stages a message inside the caller's transaction. The row only becomes
    /// visible to the poller once that transaction commits.
    pub async fn insert_pending(
        tx: &mut Transaction<'_, Postgres>,
        message: &NewOutboxMessage,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO outbox_messages
                (aggregate_id, event_type, queue, payload, content_type, correlation_id, status, retry_count, created_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, 'PENDING', 0, NOW())
            RETURNING id
            "#,
        )
        .bind(&message.aggregate_id)
        .bind(&message.event_type)
        .bind(&message.queue)
        .bind(&message.payload)
        .bind(&message.content_type)
        .bind(&message.correlation_id)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to insert message into outbox_messages")?;

        Ok(id)
    }
}

#[async_trait]
impl OutboxRepositoryTrait for PostgresOutboxRepository {
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxMessage>> {
        // Rows stay PENDING; the lease keeps a second poller off them while
        // this one is publishing.
        let query = format!(
            r#"
            WITH claimed AS (
                SELECT id FROM outbox_messages
                WHERE status = 'PENDING'
                  AND (claimed_until IS NULL OR claimed_until < NOW())
                ORDER BY id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_messages o
            SET claimed_until = NOW() + make_interval(secs => $2)
            FROM claimed
            WHERE o.id = claimed.id
            RETURNING o.{}
            "#,
            OUTBOX_COLUMNS.replace(", ", ", o.")
        );

        let rows: Vec<PersistedOutboxMessage> = sqlx::query_as(&query)
            .bind(limit)
            .bind(self.claim_lease.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .context("Failed to claim pending outbox messages")?;

        let mut messages = rows
            .into_iter()
            .map(OutboxMessage::try_from)
            .collect::<Result<Vec<_>>>()?;
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    async fn mark_published(&self, outbox_message_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'PUBLISHED', published_at = NOW(), claimed_until = NULL, last_error = NULL
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(outbox_message_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to mark outbox message {} as published", outbox_message_id))?;
        Ok(())
    }

    async fn record_failed_attempt(
        &self,
        outbox_message_id: i64,
        max_retry_count: i32,
        error_message: &str,
    ) -> Result<OutboxStatus> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(i32, String)> = sqlx::query_as(
            "SELECT retry_count, status FROM outbox_messages WHERE id = $1 FOR UPDATE",
        )
        .bind(outbox_message_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (retry_count, status) = match current {
            Some((retry_count, status)) => (retry_count, status),
            None => {
                tx.rollback().await?;
                return Err(anyhow::anyhow!("Outbox message {} not found", outbox_message_id));
            }
        };

        if status != OutboxStatus::Pending.to_string() {
            tracing::warn!(
                "Attempted to record failure for already {} outbox message {}",
                status,
                outbox_message_id
            );
            tx.commit().await?;
            return status
                .parse::<OutboxStatus>()
                .map_err(|_| anyhow::anyhow!("Unknown outbox status {}", status));
        }

        let (new_retry_count, new_status) = next_after_failure(retry_count, max_retry_count);
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = $1, retry_count = $2, last_error = $3, claimed_until = NULL
            WHERE id = $4
            "#,
        )
        .bind(new_status.to_string())
        .bind(new_retry_count)
        .bind(truncate_error(error_message))
        .bind(outbox_message_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(new_status)
    }

    async fn mark_failed(&self, outbox_message_id: i64, error_message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'FAILED', retry_count = retry_count + 1, last_error = $1, claimed_until = NULL
            WHERE id = $2 AND status = 'PENDING'
            "#,
        )
        .bind(truncate_error(error_message))
        .bind(outbox_message_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to mark outbox message {} as failed", outbox_message_id))?;
        Ok(())
    }

    async fn requeue_failed(&self, outbox_message_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'PENDING', retry_count = 0, last_error = NULL, claimed_until = NULL
            WHERE id = $1 AND status = 'FAILED'
            "#,
        )
        .bind(outbox_message_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to requeue outbox message {}", outbox_message_id))?;
        Ok(result.rows_affected() == 1)
    }

    async fn find(&self, outbox_message_id: i64) -> Result<Option<OutboxMessage>> {
        let query = format!("SELECT {} FROM outbox_messages WHERE id = $1", OUTBOX_COLUMNS);
        let row: Option<PersistedOutboxMessage> = sqlx::query_as(&query)
            .bind(outbox_message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(OutboxMessage::try_from).transpose()
    }

    async fn count_by_status(&self) -> Result<OutboxStatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox_messages GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .context("Failed to count outbox messages")?;

        let mut counts = OutboxStatusCounts::default();
        for (status, count) in rows {
            match status.parse::<OutboxStatus>() {
                Ok(OutboxStatus::Pending) => counts.pending = count,
                Ok(OutboxStatus::Published) => counts.published = count,
                Ok(OutboxStatus::Failed) => counts.failed = count,
                Err(_) => tracing::warn!("Ignoring unknown outbox status {}", status),
            }
        }
        Ok(counts)
    }
}
