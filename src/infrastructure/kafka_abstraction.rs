use async_trait::async_trait;
use dashmap::DashSet;
use rdkafka::{
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
    config::ClientConfig,
    error::{KafkaError, RDKafkaErrorCode},
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord, Producer},
    util::Timeout,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::domain::{DeliveryError, ErrorKind};
use crate::infrastructure::codec::JSON_CONTENT_TYPE;
use crate::infrastructure::config::env_or;

pub const CONTENT_TYPE_HEADER: &str = "content-type";
pub const CORRELATION_ID_HEADER: &str = "correlation-id";

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub publish_timeout: Duration,
    pub metadata_timeout: Duration,
    pub topic_partitions: i32,
    pub topic_replication: i32,
    pub security_protocol: String,
    pub auto_offset_reset: String,
    pub consumer_session_timeout_ms: i32,
    pub consumer_max_poll_interval_ms: i32,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: "core-ledger-worker".to_string(),
            publish_timeout: Duration::from_millis(5000),
            metadata_timeout: Duration::from_secs(3),
            topic_partitions: 1,
            topic_replication: 1,
            security_protocol: "PLAINTEXT".to_string(),
            auto_offset_reset: "earliest".to_string(),
            consumer_session_timeout_ms: 10000,
            consumer_max_poll_interval_ms: 300000,
        }
    }
}

impl KafkaConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bootstrap_servers: env_or("KAFKA_BOOTSTRAP_SERVERS", defaults.bootstrap_servers),
            group_id: env_or("KAFKA_GROUP_ID", defaults.group_id),
            publish_timeout: Duration::from_millis(env_or(
                "KAFKA_PUBLISH_TIMEOUT_MS",
                defaults.publish_timeout.as_millis() as u64,
            )),
            topic_partitions: env_or("KAFKA_TOPIC_PARTITIONS", defaults.topic_partitions),
            topic_replication: env_or("KAFKA_TOPIC_REPLICATION", defaults.topic_replication),
            ..defaults
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Producer error: {0}")]
    ProducerError(String),
    #[error("Consumer error: {0}")]
    ConsumerError(String),
    #[error("Message rejected by broker: {0}")]
    Rejected(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Timeout error: {0}")]
    TimeoutError(String),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Rejected(_) | BrokerError::SerializationError(_) => ErrorKind::Permanent,
            _ => ErrorKind::Transient,
        }
    }

    /// Errors after which the client is rebuilt on the next call.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionError(_) | BrokerError::TimeoutError(_)
        )
    }
}

impl From<KafkaError> for BrokerError {
    fn from(error: KafkaError) -> Self {
        match &error {
            KafkaError::ClientCreation(msg) => BrokerError::ConnectionError(msg.clone()),
            KafkaError::MessageProduction(code) => match code {
                RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::BrokerNotAvailable
                | RDKafkaErrorCode::Resolve => BrokerError::ConnectionError(error.to_string()),
                RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::OperationTimedOut => BrokerError::TimeoutError(error.to_string()),
                RDKafkaErrorCode::MessageSizeTooLarge | RDKafkaErrorCode::InvalidMessage => {
                    BrokerError::Rejected(error.to_string())
                }
                _ => BrokerError::ProducerError(error.to_string()),
            },
            KafkaError::MessageConsumption(_) => BrokerError::ConsumerError(error.to_string()),
            KafkaError::AdminOp(_) | KafkaError::AdminOpCreation(_) => {
                BrokerError::ConfigurationError(error.to_string())
            }
            _ => BrokerError::ProducerError(error.to_string()),
        }
    }
}

impl From<BrokerError> for DeliveryError {
    fn from(error: BrokerError) -> Self {
        DeliveryError::new(error.kind(), error.to_string())
    }
}

/// A message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub queue: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub correlation_id: Option<String>,
}

#[async_trait]
pub trait MessagePublisherTrait: Send + Sync {
    /// Makes sure the durable queue exists. Safe to call repeatedly.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn publish_raw(&self, message: &OutboundMessage) -> Result<(), BrokerError>;

    async fn is_connected(&self) -> bool;
}

/// Serializes `value` as JSON and publishes it through `publisher`.
pub async fn publish_json<T: Serialize + ?Sized>(
    publisher: &dyn MessagePublisherTrait,
    queue: &str,
    key: &str,
    value: &T,
    correlation_id: Option<&str>,
) -> Result<(), BrokerError> {
    let payload =
        serde_json::to_vec(value).map_err(|e| BrokerError::SerializationError(e.to_string()))?;
    publisher
        .publish_raw(&OutboundMessage {
            queue: queue.to_string(),
            key: key.to_string(),
            payload,
            content_type: JSON_CONTENT_TYPE.to_string(),
            correlation_id: correlation_id.map(str::to_string),
        })
        .await
}

/// Long-lived broker connection shared by the publisher and the consumers.
///
/// The producer and admin clients are created lazily and dropped on
/// connection-level errors; the next call builds them again and re-declares
/// queues, since the declared set belongs to a connection generation.
pub struct KafkaConnection {
    config: KafkaConfig,
    producer: RwLock<Option<FutureProducer>>,
    admin: RwLock<Option<Arc<AdminClient<DefaultClientContext>>>>,
    declared: DashSet<String>,
    generation: AtomicU64,
}

impl KafkaConnection {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            producer: RwLock::new(None),
            admin: RwLock::new(None),
            declared: DashSet::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("security.protocol", &self.config.security_protocol);
        config
    }

    pub fn consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = self.base_config();
        config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set("enable.partition.eof", "false")
            .set("allow.auto.create.topics", "false")
            .set(
                "session.timeout.ms",
                self.config.consumer_session_timeout_ms.to_string(),
            )
            .set(
                "max.poll.interval.ms",
                self.config.consumer_max_poll_interval_ms.to_string(),
            );
        config
    }

    pub async fn producer(&self) -> Result<FutureProducer, BrokerError> {
        if let Some(producer) = self.producer.read().await.as_ref() {
            return Ok(producer.clone());
        }

        let mut guard = self.producer.write().await;
        if let Some(producer) = guard.as_ref() {
            return Ok(producer.clone());
        }

        let producer: FutureProducer = self
            .base_config()
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set(
                "message.timeout.ms",
                self.config.publish_timeout.as_millis().to_string(),
            )
            .create()?;

        info!(
            "Kafka producer connected to {} (generation {})",
            self.config.bootstrap_servers,
            self.generation()
        );
        *guard = Some(producer.clone());
        Ok(producer)
    }

    async fn admin(&self) -> Result<Arc<AdminClient<DefaultClientContext>>, BrokerError> {
        if let Some(admin) = self.admin.read().await.as_ref() {
            return Ok(admin.clone());
        }

        let mut guard = self.admin.write().await;
        if let Some(admin) = guard.as_ref() {
            return Ok(admin.clone());
        }

        let admin: AdminClient<DefaultClientContext> = self.base_config().create()?;
        let admin = Arc::new(admin);
        *guard = Some(admin.clone());
        Ok(admin)
    }

    /// Creates the topic backing `queue` unless this generation already did.
    pub async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        if self.declared.contains(queue) {
            return Ok(());
        }

        let admin = self.admin().await?;
        let topic = NewTopic::new(
            queue,
            self.config.topic_partitions,
            TopicReplication::Fixed(self.config.topic_replication),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.config.metadata_timeout));

        let results = match admin.create_topics(&[topic], &options).await {
            Ok(results) => results,
            Err(e) => {
                let err = BrokerError::from(e);
                if err.is_connection_level() {
                    self.reset(&err.to_string()).await;
                }
                return Err(err);
            }
        };

        for result in results {
            match result {
                Ok(name) => info!("Declared queue {}", name),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!("Queue {} already exists", name)
                }
                Err((name, code)) => {
                    return Err(BrokerError::ConfigurationError(format!(
                        "failed to declare queue {}: {}",
                        name, code
                    )))
                }
            }
        }

        self.declared.insert(queue.to_string());
        Ok(())
    }

    /// Drops the clients so the next call reconnects.
    pub async fn reset(&self, reason: &str) {
        self.producer.write().await.take();
        self.admin.write().await.take();
        self.declared.clear();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            "Kafka connection reset (now generation {}): {}",
            generation, reason
        );
    }

    pub async fn is_connected(&self) -> bool {
        let producer = match self.producer().await {
            Ok(producer) => producer,
            Err(e) => {
                warn!("Kafka health probe could not create a producer: {}", e);
                return false;
            }
        };

        let timeout = self.config.metadata_timeout;
        let probe = tokio::task::spawn_blocking(move || {
            producer.client().fetch_metadata(None, timeout).map(|_| ())
        })
        .await;

        match probe {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Kafka health probe failed: {}", e);
                false
            }
            Err(e) => {
                warn!("Kafka health probe task failed: {}", e);
                false
            }
        }
    }
}

#[derive(Clone)]
pub struct KafkaPublisher {
    connection: Arc<KafkaConnection>,
}

impl KafkaPublisher {
    pub fn new(connection: Arc<KafkaConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl MessagePublisherTrait for KafkaPublisher {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.connection.declare_queue(queue).await
    }

    async fn publish_raw(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        self.connection.declare_queue(&message.queue).await?;
        let producer = self.connection.producer().await?;

        let mut headers = OwnedHeaders::new().insert(Header {
            key: CONTENT_TYPE_HEADER,
            value: Some(message.content_type.as_str()),
        });
        if let Some(correlation_id) = &message.correlation_id {
            headers = headers.insert(Header {
                key: CORRELATION_ID_HEADER,
                value: Some(correlation_id.as_str()),
            });
        }

        let record = FutureRecord::to(&message.queue)
            .key(message.key.as_str())
            .payload(message.payload.as_slice())
            .headers(headers);

        match producer
            .send(record, Timeout::After(self.connection.config().publish_timeout))
            .await
        {
            Ok(_) => Ok(()),
            Err((e, _)) => {
                let err = BrokerError::from(e);
                if err.is_connection_level() {
                    self.connection.reset(&err.to_string()).await;
                }
                Err(err)
            }
        }
    }

    async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }
}
