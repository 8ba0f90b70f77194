use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use std::fmt;

/// Dedup key for one consumer applying one event to one aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub consumer: String,
    pub event_kind: String,
    pub aggregate_id: String,
}

impl IdempotencyKey {
    pub fn new(consumer: &str, event_kind: &str, aggregate_id: impl ToString) -> Self {
        Self {
            consumer: consumer.to_string(),
            event_kind: event_kind.to_string(),
            aggregate_id: aggregate_id.to_string(),
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.consumer, self.event_kind, self.aggregate_id)
    }
}

#[async_trait]
pub trait IdempotencyGuardTrait: Send + Sync {
    /// Records the key. `Ok(true)` the first time, `Ok(false)` if it was
    /// already there. Check and insert happen as one step.
    async fn try_mark_processed(&self, key: &IdempotencyKey) -> Result<bool>;

    async fn is_processed(&self, key: &IdempotencyKey) -> Result<bool>;

    /// Forgets a key whose side effects did not complete, so a redelivery
    /// can apply them.
    async fn release(&self, key: &IdempotencyKey) -> Result<()>;
}

#[derive(Clone)]
pub struct PostgresIdempotencyGuard {
    pool: PgPool,
}

impl PostgresIdempotencyGuard {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyGuardTrait for PostgresIdempotencyGuard {
    async fn try_mark_processed(&self, key: &IdempotencyKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO consumer_idempotency (key, consumer, event_kind, aggregate_id, processed_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key.to_string())
        .bind(&key.consumer)
        .bind(&key.event_kind)
        .bind(&key.aggregate_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record idempotency key {}", key))?;

        Ok(result.rows_affected() == 1)
    }

    async fn is_processed(&self, key: &IdempotencyKey) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM consumer_idempotency WHERE key = $1)",
        )
        .bind(key.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn release(&self, key: &IdempotencyKey) -> Result<()> {
        sqlx::query("DELETE FROM consumer_idempotency WHERE key = $1")
            .bind(key.to_string())
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to release idempotency key {}", key))?;
        Ok(())
    }
}
