use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::domain::{DeliveryError, ErrorKind};
use crate::infrastructure::health::{ComponentState, HealthRegistry};
use crate::infrastructure::kafka_abstraction::BrokerError;
use crate::infrastructure::kafka_consumer::{Delivery, MessageSourceTrait};

/// What a handler did with a message it could read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Processed,
    /// Already applied by an earlier delivery; nothing was done.
    Duplicate,
    /// A business rule refused the work. The message is still consumed.
    Rejected(String),
}

/// Job-specific logic behind one queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Consumer name, used for health reporting and idempotency keys.
    fn name(&self) -> &str;

    fn queue(&self) -> &str;

    async fn handle(&self, delivery: &Delivery) -> Result<HandlerOutcome, DeliveryError>;
}

/// How a delivery was settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Requeued,
    DeadLettered,
}

/// Drives one handler against one queue, a message at a time.
pub struct ConsumerRunner {
    source: Box<dyn MessageSourceTrait>,
    handler: Arc<dyn MessageHandler>,
    health: Option<HealthRegistry>,
    receive_wait: Duration,
    requeue_backoff: Duration,
}

impl ConsumerRunner {
    pub fn new(source: Box<dyn MessageSourceTrait>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            source,
            handler,
            health: None,
            receive_wait: Duration::from_millis(500),
            requeue_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        health.register(self.handler.name());
        self.health = Some(health);
        self
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn with_requeue_backoff(mut self, backoff: Duration) -> Self {
        self.requeue_backoff = backoff;
        self
    }

    fn set_state(&self, state: ComponentState) {
        if let Some(health) = &self.health {
            health.set(self.handler.name(), state);
        }
    }

    /// Consumes until `shutdown` fires. A message being handled is always
    /// settled before the loop exits.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Consumer {} listening on {}",
            self.handler.name(),
            self.source.queue()
        );
        self.set_state(ComponentState::Running);

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.source.receive(self.receive_wait) => received,
            };

            let pause = match received {
                Ok(Some(delivery)) => match self.handle_delivery(&delivery).await {
                    Ok(Disposition::Requeued) => Some(self.requeue_backoff),
                    Ok(_) => None,
                    Err(e) => {
                        error!(
                            "Consumer {} could not settle offset {} on {}: {}",
                            self.handler.name(),
                            delivery.offset,
                            delivery.queue,
                            e
                        );
                        Some(self.receive_wait)
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    warn!(
                        "Consumer {} failed to receive from {}: {}",
                        self.handler.name(),
                        self.source.queue(),
                        e
                    );
                    Some(self.receive_wait)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(pause) => {}
                }
            }
        }

        self.set_state(ComponentState::Stopped);
        info!("Consumer {} stopped", self.handler.name());
    }

    /// Runs the handler for one delivery and settles it: success and
    /// business rejections are acked, permanent errors dead-lettered and
    /// transient errors requeued.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<Disposition, BrokerError> {
        let span = info_span!(
            "consume",
            consumer = self.handler.name(),
            queue = %delivery.queue,
            offset = delivery.offset,
            correlation_id = delivery.correlation_id.as_deref().unwrap_or(""),
        );

        async move {
            match self.handler.handle(delivery).await {
                Ok(HandlerOutcome::Processed) => {
                    debug!("Message processed");
                    self.source.ack(delivery).await?;
                    Ok(Disposition::Acked)
                }
                Ok(HandlerOutcome::Duplicate) => {
                    info!("Message already processed, acknowledging without side effects");
                    self.source.ack(delivery).await?;
                    Ok(Disposition::Acked)
                }
                Ok(HandlerOutcome::Rejected(reason)) => {
                    warn!("Message rejected by business rules: {}", reason);
                    self.source.ack(delivery).await?;
                    Ok(Disposition::Acked)
                }
                Err(e) => match e.kind {
                    ErrorKind::Permanent => {
                        error!("Message cannot be processed, dead-lettering: {}", e);
                        self.source.dead_letter(delivery, &e.message).await?;
                        Ok(Disposition::DeadLettered)
                    }
                    ErrorKind::BusinessRejection => {
                        warn!("Message rejected: {}", e);
                        self.source.ack(delivery).await?;
                        Ok(Disposition::Acked)
                    }
                    ErrorKind::Transient => {
                        warn!("Processing failed, requeueing: {}", e);
                        self.source.nack(delivery, true).await?;
                        Ok(Disposition::Requeued)
                    }
                },
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::in_memory_broker::InMemoryBroker;
    use crate::infrastructure::kafka_abstraction::{MessagePublisherTrait, OutboundMessage};

    struct ScriptedHandler;

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        fn name(&self) -> &str {
            "scripted"
        }

        fn queue(&self) -> &str {
            "q"
        }

        async fn handle(&self, delivery: &Delivery) -> Result<HandlerOutcome, DeliveryError> {
            match delivery.payload.as_slice() {
                b"ok" => Ok(HandlerOutcome::Processed),
                b"no" => Ok(HandlerOutcome::Rejected("nope".to_string())),
                b"retry" if !delivery.redelivered => Err(DeliveryError::transient("db down")),
                b"retry" => Ok(HandlerOutcome::Processed),
                _ => Err(DeliveryError::permanent("garbage")),
            }
        }
    }

    async fn publish(broker: &InMemoryBroker, body: &[u8]) {
        broker
            .publish_raw(&OutboundMessage {
                queue: "q".to_string(),
                key: "k".to_string(),
                payload: body.to_vec(),
                content_type: "application/json".to_string(),
                correlation_id: None,
            })
            .await
            .unwrap();
    }

    async fn next(broker: &InMemoryBroker, runner: &ConsumerRunner) -> Disposition {
        let delivery = runner
            .source
            .receive(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        let disposition = runner.handle_delivery(&delivery).await.unwrap();
        assert_eq!(broker.unacked_len("q"), 0);
        disposition
    }

    #[tokio::test]
    async fn test_dispositions_follow_error_kind() {
        let broker = InMemoryBroker::new();
        let runner = ConsumerRunner::new(Box::new(broker.source("q")), Arc::new(ScriptedHandler));

        for body in [&b"ok"[..], b"no", b"junk", b"retry"] {
            publish(&broker, body).await;
        }

        assert_eq!(next(&broker, &runner).await, Disposition::Acked);
        assert_eq!(next(&broker, &runner).await, Disposition::Acked);
        assert_eq!(next(&broker, &runner).await, Disposition::DeadLettered);
        assert_eq!(next(&broker, &runner).await, Disposition::Requeued);
        assert_eq!(next(&broker, &runner).await, Disposition::Acked);

        assert_eq!(broker.dead_letters("q").len(), 1);
        assert_eq!(broker.acked_count("q"), 4);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let broker = InMemoryBroker::new();
        let health = HealthRegistry::new();
        let runner = ConsumerRunner::new(Box::new(broker.source("q")), Arc::new(ScriptedHandler))
            .with_health(health.clone())
            .with_receive_wait(Duration::from_millis(20));

        let token = CancellationToken::new();
        let task = tokio::spawn(runner.run(token.clone()));
        publish(&broker, b"ok").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(health.state("scripted"), Some(ComponentState::Running));

        token.cancel();
        task.await.unwrap();
        assert_eq!(health.state("scripted"), Some(ComponentState::Stopped));
        assert_eq!(broker.acked_count("q"), 1);
    }
}
