use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::application::consumers::{job_left_unfinished, release_key};
use crate::domain::{ConnectivityProbeMessage, DeliveryError, JobStatusUpdate, TEST_CONNECTION_COMMAND};
use crate::infrastructure::codec::decode_json;
use crate::infrastructure::consumer_runner::{HandlerOutcome, MessageHandler};
use crate::infrastructure::idempotency::{IdempotencyGuardTrait, IdempotencyKey};
use crate::infrastructure::job_store::JobStoreTrait;
use crate::infrastructure::kafka_consumer::Delivery;

pub const CONNECTIVITY_PROBE_CONSUMER: &str = "connectivity-probe";

/// Exercises the API, queue and worker path end to end: marks the job
/// running, waits, then marks it complete.
pub struct ConnectivityProbeConsumer {
    queue: String,
    guard: Arc<dyn IdempotencyGuardTrait>,
    jobs: Arc<dyn JobStoreTrait>,
    simulated_delay: Duration,
}

impl ConnectivityProbeConsumer {
    pub fn new(
        queue: impl Into<String>,
        guard: Arc<dyn IdempotencyGuardTrait>,
        jobs: Arc<dyn JobStoreTrait>,
        simulated_delay: Duration,
    ) -> Self {
        Self {
            queue: queue.into(),
            guard,
            jobs,
            simulated_delay,
        }
    }

    async fn probe(&self, message: &ConnectivityProbeMessage) -> Result<(), DeliveryError> {
        let job = self
            .jobs
            .find_job(message.job_id)
            .await?
            .ok_or_else(|| DeliveryError::permanent(format!("Job {} not found", message.job_id)))?;

        let running_at = Utc::now();
        self.jobs
            .update_job_status(job.id, JobStatusUpdate::running(running_at))
            .await?;
        info!(
            "Job {} running, simulating work for {:?}",
            job.id, self.simulated_delay
        );

        tokio::time::sleep(self.simulated_delay).await;

        self.jobs
            .update_job_status(
                job.id,
                JobStatusUpdate::finished(true, Some(running_at), Utc::now()),
            )
            .await?;
        info!("Connectivity probe for job {} completed", job.id);
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ConnectivityProbeConsumer {
    fn name(&self) -> &str {
        CONNECTIVITY_PROBE_CONSUMER
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn handle(&self, delivery: &Delivery) -> Result<HandlerOutcome, DeliveryError> {
        let message: ConnectivityProbeMessage = decode_json(&delivery.payload)
            .map_err(|e| DeliveryError::permanent(e.to_string()))?;
        if message.command_type != TEST_CONNECTION_COMMAND {
            return Err(DeliveryError::permanent(format!(
                "unexpected command type {:?} on {}",
                message.command_type, self.queue
            )));
        }

        let key = IdempotencyKey::new(CONNECTIVITY_PROBE_CONSUMER, TEST_CONNECTION_COMMAND, message.job_id);
        if !self.guard.try_mark_processed(&key).await?
            && !job_left_unfinished(self.jobs.as_ref(), &key, message.job_id).await?
        {
            return Ok(HandlerOutcome::Duplicate);
        }

        if let Err(e) = self.probe(&message).await {
            release_key(self.guard.as_ref(), &key).await;
            return Err(e);
        }
        Ok(HandlerOutcome::Processed)
    }
}
