use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

pub const IMPORT_ACTOR: &str = "system|bulk-import";

/// An instrument waiting in the staging table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StagedInstrument {
    pub ticker: String,
    pub name: String,
    pub isin: Option<String>,
    pub security_type_id: i32,
    pub currency: String,
}

impl StagedInstrument {
    /// Upper-cased ticker, the natural key of a security.
    pub fn ticker_key(&self) -> String {
        self.ticker.trim().to_uppercase()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ticker.trim().is_empty() {
            return Err("ticker is empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err(format!("instrument {} has no name", self.ticker));
        }
        let currency = self.currency.trim();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!(
                "instrument {} has invalid currency {:?}",
                self.ticker, self.currency
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub created: usize,
    pub updated: usize,
}

#[async_trait]
pub trait InstrumentCatalogTrait: Send + Sync {
    async fn count_staged(&self) -> Result<i64>;

    /// A page of staged instruments ordered by ticker.
    async fn fetch_staged(&self, offset: i64, limit: i64) -> Result<Vec<StagedInstrument>>;

    /// Creates or updates securities keyed by upper-cased ticker, all or nothing.
    async fn upsert_securities(&self, instruments: &[StagedInstrument]) -> Result<UpsertCounts>;
}

#[derive(Clone)]
pub struct PostgresInstrumentCatalog {
    pool: PgPool,
}

impl PostgresInstrumentCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstrumentCatalogTrait for PostgresInstrumentCatalog {
    async fn count_staged(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM instrument_import_staging WHERE ticker IS NOT NULL AND name IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to count staged instruments")?;
        Ok(count)
    }

    async fn fetch_staged(&self, offset: i64, limit: i64) -> Result<Vec<StagedInstrument>> {
        let rows: Vec<StagedInstrument> = sqlx::query_as(
            r#"
            SELECT ticker, name, isin, security_type_id, currency
            FROM instrument_import_staging
            WHERE ticker IS NOT NULL AND name IS NOT NULL
            ORDER BY ticker
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read staged instruments")?;
        Ok(rows)
    }

    async fn upsert_securities(&self, instruments: &[StagedInstrument]) -> Result<UpsertCounts> {
        let mut tx = self.pool.begin().await?;
        let mut counts = UpsertCounts::default();

        for instrument in instruments {
            // xmax is zero only for freshly inserted rows.
            let inserted: bool = sqlx::query_scalar(
                r#"
                INSERT INTO securities (ticker, name, isin, security_type_id, currency, created_by, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, NOW())
                ON CONFLICT (ticker) DO UPDATE
                SET name = EXCLUDED.name,
                    isin = EXCLUDED.isin,
                    security_type_id = EXCLUDED.security_type_id,
                    currency = EXCLUDED.currency,
                    updated_at = NOW()
                RETURNING (xmax = 0)
                "#,
            )
            .bind(instrument.ticker_key())
            .bind(instrument.name.trim())
            .bind(&instrument.isin)
            .bind(instrument.security_type_id)
            .bind(instrument.currency.trim().to_uppercase())
            .bind(IMPORT_ACTOR)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("Failed to upsert security {}", instrument.ticker))?;

            if inserted {
                counts.created += 1;
            } else {
                counts.updated += 1;
            }
        }

        tx.commit().await?;
        Ok(counts)
    }
}
