use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::domain::{
    BulkImportMessage, ConnectivityProbeMessage, JobError, JobRecord, NewJob, NewOutboxMessage,
    BULK_IMPORT_COMMAND, TEST_CONNECTION_COMMAND,
};
use crate::infrastructure::codec::{encode_json, JSON_CONTENT_TYPE};
use crate::infrastructure::config::QueueNames;
use crate::infrastructure::job_store::JobStoreTrait;

pub const BULK_IMPORT_EVENT: &str = "jobs.BulkImport";
pub const TEST_CONNECTION_EVENT: &str = "jobs.TestConnection";

#[derive(Debug, Error)]
pub enum JobCommandError {
    #[error(transparent)]
    Validation(#[from] JobError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartedJob {
    pub job: JobRecord,
    pub outbox_message_id: i64,
    pub correlation_id: String,
}

/// Creates jobs together with the command message that starts them.
pub struct JobCommandService {
    store: Arc<dyn JobStoreTrait>,
    queues: QueueNames,
}

impl JobCommandService {
    pub fn new(store: Arc<dyn JobStoreTrait>, queues: QueueNames) -> Self {
        Self { store, queues }
    }

    pub async fn start_bulk_import(
        &self,
        reference_id: &str,
        description: &str,
        correlation_id: Option<String>,
    ) -> Result<StartedJob, JobCommandError> {
        self.start(
            reference_id,
            description,
            correlation_id,
            &self.queues.bulk_import,
            BULK_IMPORT_EVENT,
            |job, correlation_id| BulkImportMessage {
                job_id: job.id,
                reference_id: job.reference_id.clone(),
                command_type: BULK_IMPORT_COMMAND.to_string(),
                correlation_id: Some(correlation_id.to_string()),
            },
        )
        .await
    }

    pub async fn start_connectivity_probe(
        &self,
        reference_id: &str,
        description: &str,
        correlation_id: Option<String>,
    ) -> Result<StartedJob, JobCommandError> {
        self.start(
            reference_id,
            description,
            correlation_id,
            &self.queues.test_connection,
            TEST_CONNECTION_EVENT,
            |job, correlation_id| ConnectivityProbeMessage {
                job_id: job.id,
                reference_id: job.reference_id.clone(),
                command_type: TEST_CONNECTION_COMMAND.to_string(),
                correlation_id: Some(correlation_id.to_string()),
            },
        )
        .await
    }

    async fn start<M, F>(
        &self,
        reference_id: &str,
        description: &str,
        correlation_id: Option<String>,
        queue: &str,
        event_type: &str,
        command: F,
    ) -> Result<StartedJob, JobCommandError>
    where
        M: Serialize,
        F: Fn(&JobRecord, &str) -> M + Send + Sync + 'static,
    {
        let job = NewJob::new(reference_id, description)?;
        let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let (message_type, destination, message_correlation) =
            (event_type.to_string(), queue.to_string(), correlation_id.clone());
        let build_outbox = move |record: &JobRecord| -> anyhow::Result<NewOutboxMessage> {
            Ok(NewOutboxMessage {
                aggregate_id: record.id.to_string(),
                event_type: message_type.clone(),
                queue: destination.clone(),
                payload: encode_json(&command(record, &message_correlation))?,
                content_type: JSON_CONTENT_TYPE.to_string(),
                correlation_id: Some(message_correlation.clone()),
            })
        };

        let (job, outbox_message_id) = self.store.create_job_with_outbox(&job, &build_outbox).await?;
        info!(
            "Job {} ({}) queued on {} with outbox message {}",
            job.id, event_type, queue, outbox_message_id
        );

        Ok(StartedJob {
            job,
            outbox_message_id,
            correlation_id,
        })
    }
}
