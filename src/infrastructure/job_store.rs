use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::domain::{JobError, JobRecord, JobStatus, JobStatusUpdate, NewJob, NewOutboxMessage};
use crate::infrastructure::outbox::PostgresOutboxRepository;

/// Builds the job command message for a job that has just been written.
pub type JobOutboxBuilder = dyn Fn(&JobRecord) -> Result<NewOutboxMessage> + Send + Sync;

#[async_trait]
pub trait JobStoreTrait: Send + Sync {
    /// Inserts the job and its command message in one commit.
    async fn create_job_with_outbox(
        &self,
        job: &NewJob,
        build_outbox: &JobOutboxBuilder,
    ) -> Result<(JobRecord, i64)>;

    async fn find_job(&self, id: i64) -> Result<Option<JobRecord>>;

    async fn update_job_status(&self, id: i64, update: JobStatusUpdate) -> Result<JobRecord>;
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    reference_id: String,
    description: String,
    status: String,
    created_at: DateTime<Utc>,
    running_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|_| anyhow::anyhow!("Unknown job status {} on job {}", row.status, row.id))?;
        Ok(JobRecord {
            id: row.id,
            reference_id: row.reference_id,
            description: row.description,
            status,
            created_at: row.created_at,
            running_at: row.running_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStoreTrait for PostgresJobStore {
    async fn create_job_with_outbox(
        &self,
        job: &NewJob,
        build_outbox: &JobOutboxBuilder,
    ) -> Result<(JobRecord, i64)> {
        let mut tx = self.pool.begin().await?;

        let row: JobRow = sqlx::query_as(
            r#"
            INSERT INTO core_jobs (reference_id, description, status, created_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING id, reference_id, description, status, created_at, running_at, finished_at
            "#,
        )
        .bind(&job.reference_id)
        .bind(&job.description)
        .bind(JobStatus::New.to_string())
        .fetch_one(&mut *tx)
        .await
        .context("Failed to insert core job")?;

        let record = JobRecord::try_from(row)?;
        let outbox_message = build_outbox(&record)?;
        let outbox_message_id = PostgresOutboxRepository::insert_pending(&mut tx, &outbox_message).await?;

        tx.commit().await?;
        Ok((record, outbox_message_id))
    }

    async fn find_job(&self, id: i64) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, reference_id, description, status, created_at, running_at, finished_at FROM core_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn update_job_status(&self, id: i64, update: JobStatusUpdate) -> Result<JobRecord> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            UPDATE core_jobs
            SET status = $1, running_at = $2, finished_at = $3, updated_at = NOW()
            WHERE id = $4
            RETURNING id, reference_id, description, status, created_at, running_at, finished_at
            "#,
        )
        .bind(update.status.to_string())
        .bind(update.running_at)
        .bind(update.finished_at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to update status of job {}", id))?;

        match row {
            Some(row) => JobRecord::try_from(row),
            None => Err(JobError::NotFound(id).into()),
        }
    }
}
