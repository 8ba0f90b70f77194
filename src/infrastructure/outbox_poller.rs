use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::domain::{DeliveryError, ErrorKind, OutboxMessage, OutboxStatus};
use crate::infrastructure::codec::verify_payload;
use crate::infrastructure::config::{env_flag, env_or};
use crate::infrastructure::health::{ComponentState, HealthRegistry};
use crate::infrastructure::kafka_abstraction::{MessagePublisherTrait, OutboundMessage};
use crate::infrastructure::outbox::OutboxRepositoryTrait;

pub const OUTBOX_PROCESSOR_COMPONENT: &str = "outbox-processor";

#[derive(Clone, Debug)]
pub struct OutboxPollerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_retry_count: i32,
    pub fail_fast_permanent: bool,
    pub claim_lease: Duration,
}

impl Default for OutboxPollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 50,
            max_retry_count: 5,
            fail_fast_permanent: true,
            claim_lease: Duration::from_secs(30),
        }
    }
}

impl OutboxPollerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: Duration::from_millis(env_or(
                "OUTBOX_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            batch_size: env_or("OUTBOX_BATCH_SIZE", defaults.batch_size).max(1),
            max_retry_count: env_or("OUTBOX_MAX_RETRY_COUNT", defaults.max_retry_count).max(0),
            fail_fast_permanent: env_flag("OUTBOX_FAIL_FAST_PERMANENT", defaults.fail_fast_permanent),
            claim_lease: Duration::from_secs(env_or(
                "OUTBOX_CLAIM_LEASE_SECS",
                defaults.claim_lease.as_secs(),
            )),
        }
    }
}

/// Result of one message going through the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Published,
    Retrying { retry_count: i32 },
    Failed,
    /// The broker call finished but the store could not record it.
    Unrecorded,
}

/// Counts for a single poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub published: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct OutboxPollingService {
    outbox_repo: Arc<dyn OutboxRepositoryTrait>,
    publisher: Arc<dyn MessagePublisherTrait>,
    config: OutboxPollerConfig,
    health: Option<HealthRegistry>,
}

impl OutboxPollingService {
    pub fn new(
        outbox_repo: Arc<dyn OutboxRepositoryTrait>,
        publisher: Arc<dyn MessagePublisherTrait>,
        config: OutboxPollerConfig,
    ) -> Self {
        Self {
            outbox_repo,
            publisher,
            config,
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        health.register(OUTBOX_PROCESSOR_COMPONENT);
        self.health = Some(health);
        self
    }

    fn set_state(&self, state: ComponentState) {
        if let Some(health) = &self.health {
            health.set(OUTBOX_PROCESSOR_COMPONENT, state);
        }
    }

    /// Polls until `shutdown` fires. A batch in flight is always finished.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("OutboxPollingService started with config: {:?}", self.config);
        self.set_state(ComponentState::Running);

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("OutboxPollingService received shutdown signal. Exiting.");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match self.run_once().await {
                Ok(report) if report.fetched > 0 => info!(
                    "Outbox cycle: fetched {}, published {}, retrying {}, failed {}",
                    report.fetched, report.published, report.retried, report.failed
                ),
                Ok(_) => {}
                Err(e) => {
                    error!("Error fetching messages from outbox: {:#}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        self.set_state(ComponentState::Stopped);
        info!("OutboxPollingService stopped.");
    }

    /// Runs a single poll cycle.
    pub async fn run_once(&self) -> Result<BatchReport> {
        let messages = self.outbox_repo.fetch_pending(self.config.batch_size).await?;
        let mut report = BatchReport {
            fetched: messages.len(),
            ..Default::default()
        };

        if !messages.is_empty() {
            debug!("Fetched {} messages from outbox for processing.", messages.len());
        }

        for message in messages {
            match self.process_message(message).await {
                MessageOutcome::Published => report.published += 1,
                MessageOutcome::Retrying { .. } => report.retried += 1,
                MessageOutcome::Failed => report.failed += 1,
                MessageOutcome::Unrecorded => {}
            }
        }

        Ok(report)
    }

    pub async fn process_message(&self, message: OutboxMessage) -> MessageOutcome {
        let span = info_span!(
            "outbox_message",
            outbox_message_id = message.id,
            correlation_id = message.correlation_id.as_deref().unwrap_or(""),
            queue = %message.queue,
        );

        async move {
            match self.publish(&message).await {
                Ok(()) => {
                    info!(
                        "Published outbox message {} ({}) for aggregate {}",
                        message.id, message.event_type, message.aggregate_id
                    );
                    if let Err(e) = self.outbox_repo.mark_published(message.id).await {
                        // Already on the broker; consumers absorb the redelivery.
                        error!(
                            "Failed to mark message {} as published after broker ack: {:#}",
                            message.id, e
                        );
                        return MessageOutcome::Unrecorded;
                    }
                    MessageOutcome::Published
                }
                Err(e) if e.kind == ErrorKind::Permanent && self.config.fail_fast_permanent => {
                    error!(
                        "Outbox message {} cannot be delivered and is marked failed: {}",
                        message.id, e
                    );
                    match self.outbox_repo.mark_failed(message.id, &e.message).await {
                        Ok(()) => MessageOutcome::Failed,
                        Err(repo_err) => {
                            error!(
                                "Failed to mark message {} as failed: {:#}",
                                message.id, repo_err
                            );
                            MessageOutcome::Unrecorded
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to publish outbox message {} (attempt {}): {}",
                        message.id,
                        message.retry_count + 1,
                        e
                    );
                    match self
                        .outbox_repo
                        .record_failed_attempt(message.id, self.config.max_retry_count, &e.message)
                        .await
                    {
                        Ok(OutboxStatus::Failed) => {
                            error!(
                                "Outbox message {} failed after {} attempts. Last error: {}",
                                message.id,
                                message.retry_count + 1,
                                e
                            );
                            MessageOutcome::Failed
                        }
                        Ok(_) => MessageOutcome::Retrying {
                            retry_count: message.retry_count + 1,
                        },
                        Err(repo_err) => {
                            error!(
                                "Failed to record failed attempt for message {}: {:#}",
                                message.id, repo_err
                            );
                            MessageOutcome::Unrecorded
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn publish(&self, message: &OutboxMessage) -> Result<(), DeliveryError> {
        verify_payload(&message.payload, &message.content_type)
            .map_err(|e| DeliveryError::permanent(e.to_string()))?;

        self.publisher
            .publish_raw(&OutboundMessage {
                queue: message.queue.clone(),
                key: message.aggregate_id.clone(),
                payload: message.payload.clone(),
                content_type: message.content_type.clone(),
                correlation_id: message.correlation_id.clone(),
            })
            .await
            .map_err(DeliveryError::from)
    }

    /// Operator action: give a failed message a fresh retry budget.
    pub async fn requeue_failed(&self, outbox_message_id: i64) -> Result<bool> {
        let requeued = self.outbox_repo.requeue_failed(outbox_message_id).await?;
        if requeued {
            info!("Outbox message {} requeued for delivery", outbox_message_id);
        } else {
            warn!(
                "Outbox message {} was not requeued (missing or not failed)",
                outbox_message_id
            );
        }
        Ok(requeued)
    }
}
