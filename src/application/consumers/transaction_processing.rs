use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::consumers::release_key;
use crate::application::services::ProcessTransactionHandler;
use crate::domain::{CompletionNotification, DeliveryError, TransactionCreatedEvent};
use crate::infrastructure::codec::decode_event;
use crate::infrastructure::completion_client::CompletionCallbackTrait;
use crate::infrastructure::consumer_runner::{HandlerOutcome, MessageHandler};
use crate::infrastructure::idempotency::{IdempotencyGuardTrait, IdempotencyKey};
use crate::infrastructure::kafka_consumer::Delivery;

pub const TRANSACTION_CONSUMER: &str = "transaction-processor";
const TRANSACTION_CREATED_KIND: &str = "TransactionCreated";

/// Settles newly created transactions and reports the result back.
pub struct TransactionProcessingConsumer {
    queue: String,
    guard: Arc<dyn IdempotencyGuardTrait>,
    processor: ProcessTransactionHandler,
    callback: Arc<dyn CompletionCallbackTrait>,
}

impl TransactionProcessingConsumer {
    pub fn new(
        queue: impl Into<String>,
        guard: Arc<dyn IdempotencyGuardTrait>,
        processor: ProcessTransactionHandler,
        callback: Arc<dyn CompletionCallbackTrait>,
    ) -> Self {
        Self {
            queue: queue.into(),
            guard,
            processor,
            callback,
        }
    }
}

#[async_trait]
impl MessageHandler for TransactionProcessingConsumer {
    fn name(&self) -> &str {
        TRANSACTION_CONSUMER
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn handle(&self, delivery: &Delivery) -> Result<HandlerOutcome, DeliveryError> {
        let event: TransactionCreatedEvent = decode_event(&delivery.payload)
            .map_err(|e| DeliveryError::permanent(e.to_string()))?;
        let correlation_id = event
            .correlation_id
            .clone()
            .or_else(|| delivery.correlation_id.clone())
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let key = IdempotencyKey::new(TRANSACTION_CONSUMER, TRANSACTION_CREATED_KIND, event.transaction_id);
        if !self.guard.try_mark_processed(&key).await? {
            // The key is written before the status change. A transaction still
            // Pending under a recorded key was never settled.
            if !self.processor.is_pending(event.transaction_id).await? {
                return Ok(HandlerOutcome::Duplicate);
            }
            warn!(
                "Key {} is recorded but transaction {} is still Pending, applying again",
                key, event.transaction_id
            );
        }

        info!(
            "Processing transaction {} (fund {}, correlation {})",
            event.transaction_id, event.fund_code, correlation_id
        );
        let result = match self.processor.process(event.transaction_id, Utc::now()).await {
            Ok(result) => result,
            Err(e) => {
                release_key(self.guard.as_ref(), &key).await;
                return Err(e);
            }
        };

        let notification = CompletionNotification {
            aggregate_id: result.transaction_id.to_string(),
            success: result.success,
            final_status: result.final_status_id,
            error_message: result.error_message.clone(),
            processed_at: Utc::now(),
            correlation_id,
            actor_id: result.created_by_user_id.clone(),
        };
        if let Err(e) = self.callback.notify(&notification).await {
            // The status change is committed; a lost report is not retried.
            warn!(
                "Completion callback for transaction {} failed: {:#}",
                result.transaction_id, e
            );
        }

        if result.success {
            Ok(HandlerOutcome::Processed)
        } else {
            Ok(HandlerOutcome::Rejected(result.error_message.unwrap_or_default()))
        }
    }
}
