use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info};

use crate::application::consumers::{job_left_unfinished, release_key};
use crate::application::services::BulkImportProcessor;
use crate::domain::{BulkImportMessage, DeliveryError, JobStatusUpdate, BULK_IMPORT_COMMAND};
use crate::infrastructure::codec::decode_json;
use crate::infrastructure::consumer_runner::{HandlerOutcome, MessageHandler};
use crate::infrastructure::idempotency::{IdempotencyGuardTrait, IdempotencyKey};
use crate::infrastructure::job_store::JobStoreTrait;
use crate::infrastructure::kafka_consumer::Delivery;

pub const BULK_IMPORT_CONSUMER: &str = "bulk-import-processor";

pub struct BulkImportConsumer {
    queue: String,
    guard: Arc<dyn IdempotencyGuardTrait>,
    jobs: Arc<dyn JobStoreTrait>,
    processor: BulkImportProcessor,
}

impl BulkImportConsumer {
    pub fn new(
        queue: impl Into<String>,
        guard: Arc<dyn IdempotencyGuardTrait>,
        jobs: Arc<dyn JobStoreTrait>,
        processor: BulkImportProcessor,
    ) -> Self {
        Self {
            queue: queue.into(),
            guard,
            jobs,
            processor,
        }
    }

    async fn import(&self, message: &BulkImportMessage) -> Result<(), DeliveryError> {
        let job = self
            .jobs
            .find_job(message.job_id)
            .await?
            .ok_or_else(|| DeliveryError::permanent(format!("Job {} not found", message.job_id)))?;

        let running_at = Utc::now();
        self.jobs
            .update_job_status(job.id, JobStatusUpdate::running(running_at))
            .await?;
        info!("Job {} ({}) is running", job.id, job.reference_id);

        match self.processor.run(job.id, &message.reference_id).await {
            Ok(_) => {
                self.jobs
                    .update_job_status(
                        job.id,
                        JobStatusUpdate::finished(true, Some(running_at), Utc::now()),
                    )
                    .await?;
                info!("Job {} complete", job.id);
                Ok(())
            }
            Err(e) => {
                error!("Bulk import for job {} failed: {:#}", job.id, e);
                if let Err(update_err) = self
                    .jobs
                    .update_job_status(
                        job.id,
                        JobStatusUpdate::finished(false, Some(running_at), Utc::now()),
                    )
                    .await
                {
                    error!("Failed to mark job {} as failed: {:#}", job.id, update_err);
                }
                Err(DeliveryError::from(e))
            }
        }
    }
}

#[async_trait]
impl MessageHandler for BulkImportConsumer {
    fn name(&self) -> &str {
        BULK_IMPORT_CONSUMER
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn handle(&self, delivery: &Delivery) -> Result<HandlerOutcome, DeliveryError> {
        let message: BulkImportMessage = decode_json(&delivery.payload)
            .map_err(|e| DeliveryError::permanent(e.to_string()))?;
        if message.command_type != BULK_IMPORT_COMMAND {
            return Err(DeliveryError::permanent(format!(
                "unexpected command type {:?} on {}",
                message.command_type, self.queue
            )));
        }

        let key = IdempotencyKey::new(BULK_IMPORT_CONSUMER, BULK_IMPORT_COMMAND, message.job_id);
        if !self.guard.try_mark_processed(&key).await?
            && !job_left_unfinished(self.jobs.as_ref(), &key, message.job_id).await?
        {
            return Ok(HandlerOutcome::Duplicate);
        }

        match self.import(&message).await {
            Ok(()) => Ok(HandlerOutcome::Processed),
            Err(e) => {
                release_key(self.guard.as_ref(), &key).await;
                Err(e)
            }
        }
    }
}
