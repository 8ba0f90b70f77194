use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;

pub const MAX_REFERENCE_ID_LEN: usize = 50;
pub const MAX_DESCRIPTION_LEN: usize = 255;

pub const BULK_IMPORT_COMMAND: &str = "BulkImport";
pub const TEST_CONNECTION_COMMAND: &str = "TestConnection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    New,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum JobError {
    #[error("Reference id cannot be empty")]
    EmptyReferenceId,
    #[error("Reference id cannot exceed 50 characters")]
    ReferenceIdTooLong,
    #[error("Job description cannot be empty")]
    EmptyDescription,
    #[error("Job description cannot exceed 255 characters")]
    DescriptionTooLong,
    #[error("Running date must be set when the status is Running")]
    MissingRunningDate,
    #[error("Finished date must be set when the status is Complete or Failed")]
    MissingFinishedDate,
    #[error("Job {0} not found")]
    NotFound(i64),
}

/// A unit of asynchronous work tracked from creation to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub reference_id: String,
    pub description: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub running_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Validated input for a job that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub reference_id: String,
    pub description: String,
}

impl NewJob {
    pub fn new(reference_id: &str, description: &str) -> Result<Self, JobError> {
        let reference_id = reference_id.trim();
        let description = description.trim();
        if reference_id.is_empty() {
            return Err(JobError::EmptyReferenceId);
        }
        if reference_id.chars().count() > MAX_REFERENCE_ID_LEN {
            return Err(JobError::ReferenceIdTooLong);
        }
        if description.is_empty() {
            return Err(JobError::EmptyDescription);
        }
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(JobError::DescriptionTooLong);
        }
        Ok(Self {
            reference_id: reference_id.to_string(),
            description: description.to_string(),
        })
    }

    pub fn into_record(self, id: i64, created_at: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id,
            reference_id: self.reference_id,
            description: self.description,
            status: JobStatus::New,
            created_at,
            running_at: None,
            finished_at: None,
        }
    }
}

/// A requested status change, checked before it reaches storage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobStatusUpdate {
    pub status: JobStatus,
    pub running_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatusUpdate {
    pub fn new(
        status: JobStatus,
        running_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<Self, JobError> {
        if status == JobStatus::Running && running_at.is_none() {
            return Err(JobError::MissingRunningDate);
        }
        if matches!(status, JobStatus::Complete | JobStatus::Failed) && finished_at.is_none() {
            return Err(JobError::MissingFinishedDate);
        }
        Ok(Self {
            status,
            running_at,
            finished_at,
        })
    }

    pub fn running(at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Running,
            running_at: Some(at),
            finished_at: None,
        }
    }

    pub fn finished(success: bool, running_at: Option<DateTime<Utc>>, at: DateTime<Utc>) -> Self {
        Self {
            status: if success {
                JobStatus::Complete
            } else {
                JobStatus::Failed
            },
            running_at,
            finished_at: Some(at),
        }
    }
}

impl JobRecord {
    pub fn apply(&mut self, update: JobStatusUpdate) {
        self.status = update.status;
        self.running_at = update.running_at;
        self.finished_at = update.finished_at;
    }
}

/// Command asking a worker to import the staged instrument catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkImportMessage {
    pub job_id: i64,
    pub reference_id: String,
    pub command_type: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Command asking a worker to run a connectivity probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityProbeMessage {
    pub job_id: i64,
    pub reference_id: String,
    pub command_type: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}
