use async_trait::async_trait;
use dashmap::DashSet;
use rdkafka::{
    client::ClientContext,
    consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer},
    message::{BorrowedMessage, Headers, Message},
    Offset, TopicPartitionList,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

use crate::infrastructure::kafka_abstraction::{
    BrokerError, KafkaConnection, CONTENT_TYPE_HEADER, CORRELATION_ID_HEADER,
};
use crate::infrastructure::kafka_dlq::{DeadLetterQueue, DeadLetterQueueTrait};

/// One inbound message plus the position needed to settle it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub queue: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub partition: i32,
    pub offset: i64,
    pub redelivered: bool,
}

/// Inbound side of a durable queue, consumed one message at a time.
#[async_trait]
pub trait MessageSourceTrait: Send + Sync {
    fn queue(&self) -> &str;

    /// Waits up to `wait` for the next message.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// With `requeue` the message is delivered again; without it is dropped.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    /// Copies the message to `<queue>.dlq`, then settles the original.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError>;
}

struct LoggingConsumerContext;

impl ClientContext for LoggingConsumerContext {}

impl ConsumerContext for LoggingConsumerContext {
    fn pre_rebalance(&self, _consumer: &rdkafka::consumer::BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Pre-rebalance: {:?}", rebalance);
    }

    fn post_rebalance(&self, _consumer: &rdkafka::consumer::BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Post-rebalance: {:?}", rebalance);
    }
}

type LoggingConsumer = StreamConsumer<LoggingConsumerContext>;

/// Kafka topic consumed as a queue: ack commits the offset, a requeue seeks
/// back to it.
pub struct KafkaMessageSource {
    consumer: LoggingConsumer,
    queue: String,
    dlq: DeadLetterQueue,
    requeued: DashSet<(i32, i64)>,
}

impl KafkaMessageSource {
    pub fn new(
        connection: Arc<KafkaConnection>,
        queue: &str,
        dlq: DeadLetterQueue,
    ) -> Result<Self, BrokerError> {
        let group_id = format!("{}.{}", connection.config().group_id, queue);
        info!(
            "KafkaMessageSource: creating consumer for {} (group {}, bootstrap {})",
            queue,
            group_id,
            connection.config().bootstrap_servers
        );

        let consumer: LoggingConsumer = connection
            .consumer_config(&group_id)
            .set("max.partition.fetch.bytes", "1048576")
            .create_with_context(LoggingConsumerContext)?;
        consumer.subscribe(&[queue])?;

        Ok(Self {
            consumer,
            queue: queue.to_string(),
            dlq,
            requeued: DashSet::new(),
        })
    }

    fn to_delivery(&self, message: &BorrowedMessage<'_>) -> Delivery {
        let mut content_type = None;
        let mut correlation_id = None;
        if let Some(headers) = message.headers() {
            for header in headers.iter() {
                let value = header
                    .value
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
                match header.key {
                    CONTENT_TYPE_HEADER => content_type = value,
                    CORRELATION_ID_HEADER => correlation_id = value,
                    _ => {}
                }
            }
        }

        let partition = message.partition();
        let offset = message.offset();
        Delivery {
            queue: message.topic().to_string(),
            key: message
                .key()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            content_type,
            correlation_id,
            partition,
            offset,
            redelivered: self.requeued.remove(&(partition, offset)).is_some(),
        }
    }

    fn commit(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &delivery.queue,
            delivery.partition,
            Offset::Offset(delivery.offset + 1),
        )?;
        self.consumer.commit(&tpl, CommitMode::Async)?;
        Ok(())
    }
}

#[async_trait]
impl MessageSourceTrait for KafkaMessageSource {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        match timeout(wait, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(BrokerError::from(e)),
            Ok(Ok(message)) => Ok(Some(self.to_delivery(&message))),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.commit(delivery)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        if !requeue {
            return self.commit(delivery);
        }
        self.requeued.insert((delivery.partition, delivery.offset));
        self.consumer.seek(
            &delivery.queue,
            delivery.partition,
            Offset::Offset(delivery.offset),
            Duration::from_secs(5),
        )?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        self.dlq.send_to_dlq(delivery, reason).await?;
        self.commit(delivery)
    }
}
