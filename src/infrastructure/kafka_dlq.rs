use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

use crate::domain::errors::truncate_error;
use crate::infrastructure::kafka_abstraction::{BrokerError, MessagePublisherTrait, OutboundMessage};
use crate::infrastructure::kafka_consumer::Delivery;

pub const DEAD_LETTER_CONTENT_TYPE: &str = "application/x-bincode; type=DeadLetterMessage";

/// `<queue>.dlq`
pub fn dlq_name(queue: &str) -> String {
    format!("{}.dlq", queue)
}

// Timestamps go over the wire as unix milliseconds.
mod bincode_datetime {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::de::{Deserialize, Error};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(dt.timestamp_millis())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = i64::deserialize(deserializer)?;
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| D::Error::custom(format!("invalid timestamp {}", millis)))
    }
}

/// A delivery that could not be processed, with the reason it was parked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub source_queue: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub failure_reason: String,
    #[serde(with = "bincode_datetime")]
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterMessage {
    pub fn from_delivery(delivery: &Delivery, failure_reason: &str) -> Self {
        Self {
            source_queue: delivery.queue.clone(),
            key: delivery.key.clone(),
            payload: delivery.payload.clone(),
            content_type: delivery.content_type.clone(),
            correlation_id: delivery.correlation_id.clone(),
            failure_reason: truncate_error(failure_reason),
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BrokerError> {
        bincode::serialize(self).map_err(|e| BrokerError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BrokerError> {
        bincode::deserialize(bytes).map_err(|e| BrokerError::SerializationError(e.to_string()))
    }
}

#[async_trait]
pub trait DeadLetterQueueTrait: Send + Sync {
    async fn send_to_dlq(&self, delivery: &Delivery, failure_reason: &str) -> Result<(), BrokerError>;
}

#[derive(Clone)]
pub struct DeadLetterQueue {
    publisher: Arc<dyn MessagePublisherTrait>,
}

impl DeadLetterQueue {
    pub fn new(publisher: Arc<dyn MessagePublisherTrait>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl DeadLetterQueueTrait for DeadLetterQueue {
    async fn send_to_dlq(&self, delivery: &Delivery, failure_reason: &str) -> Result<(), BrokerError> {
        let message = DeadLetterMessage::from_delivery(delivery, failure_reason);
        let queue = dlq_name(&delivery.queue);

        warn!(
            "Dead-lettering message from {} (offset {}) to {}: {}",
            delivery.queue, delivery.offset, queue, message.failure_reason
        );

        self.publisher
            .publish_raw(&OutboundMessage {
                queue: queue.clone(),
                key: delivery
                    .key
                    .clone()
                    .unwrap_or_else(|| delivery.offset.to_string()),
                payload: message.encode()?,
                content_type: DEAD_LETTER_CONTENT_TYPE.to_string(),
                correlation_id: delivery.correlation_id.clone(),
            })
            .await
            .map_err(|e| {
                error!("Failed to publish to dead-letter queue {}: {}", queue, e);
                e
            })
    }
}
