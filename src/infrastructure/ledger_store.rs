use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{PgExecutor, PgPool};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    CompletionRecord, Fund, LedgerTransaction, LoadedTransaction, NewOutboxMessage, Security,
    StatusDescriptor, TransactionDraft, TransactionStatus, TransactionSubType, TransactionType,
};
use crate::infrastructure::outbox::PostgresOutboxRepository;

/// Builds the outbox row for a transaction that has just been written.
pub type TransactionOutboxBuilder =
    dyn Fn(&LoadedTransaction) -> Result<NewOutboxMessage> + Send + Sync;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedTransaction {
    pub transaction: LedgerTransaction,
    /// `None` when the idempotency key matched an earlier request.
    pub outbox_message_id: Option<i64>,
    pub replayed: bool,
}

#[async_trait]
pub trait LedgerStoreTrait: Send + Sync {
    async fn find_by_idempotency_key(&self, key: Uuid) -> Result<Option<LedgerTransaction>>;

    /// Writes the transaction, its idempotency key and its outbox message in
    /// one commit. A known key returns the stored transaction and writes
    /// nothing.
    async fn record_transaction(
        &self,
        draft: &TransactionDraft,
        idempotency_key: Option<Uuid>,
        build_outbox: &TransactionOutboxBuilder,
    ) -> Result<RecordedTransaction>;

    async fn load_transaction(&self, id: i64) -> Result<Option<LoadedTransaction>>;

    /// Moves a transaction from `expected` to `status`. Returns false if it
    /// was no longer in `expected`.
    async fn update_status(
        &self,
        id: i64,
        expected: TransactionStatus,
        status: TransactionStatus,
    ) -> Result<bool>;
}

#[async_trait]
pub trait CompletionStoreTrait: Send + Sync {
    /// Stores the first report for an aggregate and applies its final status.
    /// Returns false for a duplicate, which changes nothing.
    async fn record_completion(&self, record: &CompletionRecord) -> Result<bool>;

    async fn find_completion(&self, aggregate_id: &str) -> Result<Option<CompletionRecord>>;
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: i64,
    fund_id: i32,
    security_id: Option<i32>,
    sub_type_id: i32,
    trade_date: NaiveDate,
    settle_date: NaiveDate,
    quantity: Decimal,
    price: Decimal,
    amount: Decimal,
    currency: String,
    status_id: i32,
    created_by_user_id: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    fund_code: Option<String>,
    fund_name: Option<String>,
    security_ticker: Option<String>,
    security_name: Option<String>,
    sub_type_description: Option<String>,
    sub_type_type_id: Option<i32>,
    type_id: Option<i32>,
    type_description: Option<String>,
    status_description: Option<String>,
}

impl TransactionRow {
    fn into_loaded(self) -> Result<LoadedTransaction> {
        let status = TransactionStatus::from_code(self.status_id).ok_or_else(|| {
            anyhow::anyhow!("Transaction {} has unknown status {}", self.id, self.status_id)
        })?;

        let fund = match (self.fund_code, self.fund_name) {
            (Some(code), Some(name)) => Some(Fund {
                id: self.fund_id,
                code,
                name,
            }),
            _ => None,
        };
        let security = match (self.security_id, self.security_ticker, self.security_name) {
            (Some(id), Some(ticker), Some(name)) => Some(Security { id, ticker, name }),
            _ => None,
        };
        let transaction_type = match (self.type_id, self.type_description) {
            (Some(id), Some(description)) => Some(TransactionType { id, description }),
            _ => None,
        };
        let sub_type = match (self.sub_type_description, self.sub_type_type_id) {
            (Some(description), Some(type_id)) => Some(TransactionSubType {
                id: self.sub_type_id,
                description,
                type_id,
                transaction_type,
            }),
            _ => None,
        };
        let status_descriptor = self.status_description.map(|description| StatusDescriptor {
            id: self.status_id,
            description,
        });

        Ok(LoadedTransaction {
            transaction: LedgerTransaction {
                id: self.id,
                fund_id: self.fund_id,
                security_id: self.security_id,
                sub_type_id: self.sub_type_id,
                trade_date: self.trade_date,
                settle_date: self.settle_date,
                quantity: self.quantity,
                price: self.price,
                amount: self.amount,
                currency: self.currency,
                status,
                created_by_user_id: self.created_by_user_id,
                created_at: self.created_at,
                updated_at: self.updated_at,
            },
            fund,
            security,
            sub_type,
            status: status_descriptor,
        })
    }
}

const LOAD_TRANSACTION_SQL: &str = r#"
    SELECT t.id, t.fund_id, t.security_id, t.sub_type_id, t.trade_date, t.settle_date,
           t.quantity, t.price, t.amount, t.currency, t.status_id, t.created_by_user_id,
           t.created_at, t.updated_at,
           f.code AS fund_code, f.name AS fund_name,
           s.ticker AS security_ticker, s.name AS security_name,
           st.description AS sub_type_description, st.type_id AS sub_type_type_id,
           tt.id AS type_id, tt.description AS type_description,
           ts.description AS status_description
    FROM ledger_transactions t
    LEFT JOIN funds f ON f.id = t.fund_id
    LEFT JOIN securities s ON s.id = t.security_id
    LEFT JOIN transaction_sub_types st ON st.id = t.sub_type_id
    LEFT JOIN transaction_types tt ON tt.id = st.type_id
    LEFT JOIN transaction_statuses ts ON ts.id = t.status_id
    WHERE t.id = $1
"#;

async fn load_with<'e, E: PgExecutor<'e>>(executor: E, id: i64) -> Result<Option<LoadedTransaction>> {
    let row: Option<TransactionRow> = sqlx::query_as(LOAD_TRANSACTION_SQL)
        .bind(id)
        .fetch_optional(executor)
        .await
        .with_context(|| format!("Failed to load transaction {}", id))?;
    row.map(TransactionRow::into_loaded).transpose()
}

#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStoreTrait for PostgresLedgerStore {
    async fn find_by_idempotency_key(&self, key: Uuid) -> Result<Option<LedgerTransaction>> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT transaction_id FROM transaction_idempotency WHERE idempotency_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match id {
            Some(id) => Ok(load_with(&self.pool, id).await?.map(|l| l.transaction)),
            None => Ok(None),
        }
    }

    async fn record_transaction(
        &self,
        draft: &TransactionDraft,
        idempotency_key: Option<Uuid>,
        build_outbox: &TransactionOutboxBuilder,
    ) -> Result<RecordedTransaction> {
        let mut tx = self.pool.begin().await?;

        if let Some(key) = idempotency_key {
            let existing: Option<i64> = sqlx::query_scalar(
                "SELECT transaction_id FROM transaction_idempotency WHERE idempotency_key = $1",
            )
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(id) = existing {
                let loaded = load_with(&mut *tx, id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Idempotency key {} points at missing transaction {}", key, id))?;
                tx.commit().await?;
                return Ok(RecordedTransaction {
                    transaction: loaded.transaction,
                    outbox_message_id: None,
                    replayed: true,
                });
            }
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO ledger_transactions
                (fund_id, security_id, sub_type_id, trade_date, settle_date, quantity, price, amount,
                 currency, status_id, created_by_user_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            RETURNING id
            "#,
        )
        .bind(draft.fund_id)
        .bind(draft.security_id)
        .bind(draft.sub_type_id)
        .bind(draft.trade_date)
        .bind(draft.settle_date)
        .bind(draft.quantity)
        .bind(draft.price)
        .bind(draft.amount)
        .bind(&draft.currency)
        .bind(TransactionStatus::Pending.code())
        .bind(&draft.created_by_user_id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to insert ledger transaction")?;

        if let Some(key) = idempotency_key {
            // A concurrent request with the same key blocks here until it
            // commits, then this insert does nothing.
            let claimed = sqlx::query(
                r#"
                INSERT INTO transaction_idempotency (idempotency_key, transaction_id, created_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (idempotency_key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("Failed to store transaction idempotency key")?
            .rows_affected()
                == 1;

            if !claimed {
                tx.rollback().await?;
                let winner = self
                    .find_by_idempotency_key(key)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Idempotency key {} lost its transaction", key))?;
                debug!("Idempotency key {} was taken concurrently by transaction {}", key, winner.id);
                return Ok(RecordedTransaction {
                    transaction: winner,
                    outbox_message_id: None,
                    replayed: true,
                });
            }
        }

        let loaded = load_with(&mut *tx, id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Transaction {} vanished inside its own transaction", id))?;
        let outbox_message = build_outbox(&loaded)?;
        let outbox_message_id = PostgresOutboxRepository::insert_pending(&mut tx, &outbox_message).await?;

        tx.commit().await?;

        Ok(RecordedTransaction {
            transaction: loaded.transaction,
            outbox_message_id: Some(outbox_message_id),
            replayed: false,
        })
    }

    async fn load_transaction(&self, id: i64) -> Result<Option<LoadedTransaction>> {
        load_with(&self.pool, id).await
    }

    async fn update_status(
        &self,
        id: i64,
        expected: TransactionStatus,
        status: TransactionStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE ledger_transactions SET status_id = $1, updated_at = NOW() WHERE id = $2 AND status_id = $3",
        )
        .bind(status.code())
        .bind(id)
        .bind(expected.code())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update status of transaction {}", id))?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CompletionRow {
    aggregate_id: String,
    success: bool,
    final_status: i32,
    error_message: Option<String>,
    correlation_id: String,
    actor_id: Option<String>,
    processed_at: DateTime<Utc>,
    received_at: DateTime<Utc>,
}

#[async_trait]
impl CompletionStoreTrait for PostgresLedgerStore {
    async fn record_completion(&self, record: &CompletionRecord) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO completion_records
                (aggregate_id, success, final_status, error_message, correlation_id, actor_id, processed_at, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (aggregate_id) DO NOTHING
            "#,
        )
        .bind(&record.aggregate_id)
        .bind(record.success)
        .bind(record.final_status)
        .bind(&record.error_message)
        .bind(&record.correlation_id)
        .bind(&record.actor_id)
        .bind(record.processed_at)
        .bind(record.received_at)
        .execute(&mut *tx)
        .await
        .context("Failed to store completion record")?
        .rows_affected()
            == 1;

        if inserted {
            if let (Ok(id), Some(status)) = (
                record.aggregate_id.parse::<i64>(),
                TransactionStatus::from_code(record.final_status),
            ) {
                sqlx::query(
                    "UPDATE ledger_transactions SET status_id = $1, updated_at = NOW() WHERE id = $2 AND status_id <> $1",
                )
                .bind(status.code())
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("Failed to apply completion status")?;
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn find_completion(&self, aggregate_id: &str) -> Result<Option<CompletionRecord>> {
        let row: Option<CompletionRow> = sqlx::query_as(
            r#"
            SELECT aggregate_id, success, final_status, error_message, correlation_id, actor_id, processed_at, received_at
            FROM completion_records WHERE aggregate_id = $1
            "#,
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| CompletionRecord {
            aggregate_id: r.aggregate_id,
            success: r.success,
            final_status: r.final_status,
            error_message: r.error_message,
            correlation_id: r.correlation_id,
            actor_id: r.actor_id,
            processed_at: r.processed_at,
            received_at: r.received_at,
        }))
    }
}
