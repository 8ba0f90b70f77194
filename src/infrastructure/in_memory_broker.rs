use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crate::infrastructure::kafka_abstraction::{BrokerError, MessagePublisherTrait, OutboundMessage};
use crate::infrastructure::kafka_consumer::{Delivery, MessageSourceTrait};
use crate::infrastructure::kafka_dlq::{dlq_name, DeadLetterMessage, DeadLetterQueue, DeadLetterQueueTrait};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    unacked: HashMap<i64, Delivery>,
    published: Vec<OutboundMessage>,
    next_offset: i64,
    acked: usize,
}

#[derive(Default)]
struct BrokerState {
    declared: HashSet<String>,
    queues: HashMap<String, QueueState>,
}

/// Process-local broker with the same queue semantics as the Kafka adapter.
/// Test support only; the worker binary always talks to Kafka.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    available: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            available: Arc::new(AtomicBool::new(true)),
            notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a test panicked mid-update.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulates the broker going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available {
            self.notify.notify_waiters();
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.lock().declared.contains(queue)
    }

    /// Every message ever accepted for `queue`, in publish order.
    pub fn published(&self, queue: &str) -> Vec<OutboundMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.published.clone())
            .unwrap_or_default()
    }

    pub fn ready_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    pub fn unacked_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    pub fn acked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.acked).unwrap_or(0)
    }

    /// Messages parked on `<queue>.dlq`.
    pub fn dead_letters(&self, queue: &str) -> Vec<DeadLetterMessage> {
        self.published(&dlq_name(queue))
            .iter()
            .filter_map(|m| DeadLetterMessage::decode(&m.payload).ok())
            .collect()
    }

    pub fn source(&self, queue: &str) -> InMemoryMessageSource {
        InMemoryMessageSource {
            broker: self.clone(),
            queue: queue.to_string(),
            dlq: DeadLetterQueue::new(Arc::new(self.clone())),
        }
    }

    fn try_pop(&self, queue: &str) -> Option<Delivery> {
        let mut state = self.lock();
        let q = state.queues.get_mut(queue)?;
        let delivery = q.ready.pop_front()?;
        q.unacked.insert(delivery.offset, delivery.clone());
        Some(delivery)
    }

    fn settle(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let q = state
            .queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| BrokerError::ConsumerError(format!("unknown queue {}", delivery.queue)))?;
        let mut pending = q.unacked.remove(&delivery.offset).ok_or_else(|| {
            BrokerError::ConsumerError(format!(
                "offset {} on {} is not awaiting acknowledgement",
                delivery.offset, delivery.queue
            ))
        })?;

        if requeue {
            pending.redelivered = true;
            q.ready.push_front(pending);
            drop(state);
            self.notify.notify_waiters();
        } else {
            q.acked += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl MessagePublisherTrait for InMemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        if !self.is_available() {
            return Err(BrokerError::ConnectionError("broker unavailable".to_string()));
        }
        let mut state = self.lock();
        state.declared.insert(queue.to_string());
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish_raw(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        self.declare_queue(&message.queue).await?;
        {
            let mut state = self.lock();
            let q = state.queues.entry(message.queue.clone()).or_default();
            let offset = q.next_offset;
            q.next_offset += 1;
            q.published.push(message.clone());
            q.ready.push_back(Delivery {
                queue: message.queue.clone(),
                key: Some(message.key.clone()),
                payload: message.payload.clone(),
                content_type: Some(message.content_type.clone()),
                correlation_id: message.correlation_id.clone(),
                partition: 0,
                offset,
                redelivered: false,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.is_available()
    }
}

pub struct InMemoryMessageSource {
    broker: InMemoryBroker,
    queue: String,
    dlq: DeadLetterQueue,
}

#[async_trait]
impl MessageSourceTrait for InMemoryMessageSource {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        if !self.broker.is_available() {
            return Err(BrokerError::ConnectionError("broker unavailable".to_string()));
        }

        let notified = self.broker.notify.notified();
        if let Some(delivery) = self.broker.try_pop(&self.queue) {
            return Ok(Some(delivery));
        }

        let _ = tokio::time::timeout(wait, notified).await;
        Ok(self.broker.try_pop(&self.queue))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.broker.settle(delivery, false)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.broker.settle(delivery, requeue)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        self.dlq.send_to_dlq(delivery, reason).await?;
        self.broker.settle(delivery, false)
    }
}
