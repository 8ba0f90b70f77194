#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use core_ledger_outbox::domain::{CompletionNotification, TransactionDraft};
use core_ledger_outbox::infrastructure::completion_client::CompletionCallbackTrait;
use core_ledger_outbox::infrastructure::config::QueueNames;
use core_ledger_outbox::infrastructure::consumer_runner::{ConsumerRunner, Disposition};
use core_ledger_outbox::infrastructure::kafka_consumer::MessageSourceTrait;
use core_ledger_outbox::infrastructure::{
    InMemoryBroker, InMemoryStore, OutboxPollerConfig, OutboxPollingService,
};

/// A draft that passes every domain rule against the reference data.
pub fn valid_draft() -> TransactionDraft {
    let today = Utc::now().date_naive();
    TransactionDraft {
        fund_id: 1,
        security_id: Some(1),
        sub_type_id: 1,
        trade_date: today,
        settle_date: today + ChronoDuration::days(2),
        quantity: dec!(100),
        price: dec!(10.50),
        amount: dec!(1050.00),
        currency: "brl".to_string(),
        created_by_user_id: "trader-7".to_string(),
    }
}

pub fn queues() -> QueueNames {
    QueueNames::default()
}

pub fn poller_config() -> OutboxPollerConfig {
    OutboxPollerConfig {
        poll_interval: Duration::from_millis(10),
        batch_size: 50,
        max_retry_count: 5,
        fail_fast_permanent: true,
        claim_lease: Duration::from_secs(30),
    }
}

pub fn poller(store: &InMemoryStore, broker: &InMemoryBroker) -> OutboxPollingService {
    OutboxPollingService::new(
        Arc::new(store.clone()),
        Arc::new(broker.clone()),
        poller_config(),
    )
}

/// Completion callback double that remembers every notification.
#[derive(Default)]
pub struct RecordingCallback {
    sent: Mutex<Vec<CompletionNotification>>,
    fail: bool,
}

impl RecordingCallback {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<CompletionNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionCallbackTrait for RecordingCallback {
    async fn notify(&self, notification: &CompletionNotification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        if self.fail {
            anyhow::bail!("callback endpoint unreachable");
        }
        Ok(())
    }
}

/// Feeds every ready message on `queue` through `runner` and returns how
/// each one was settled. Requeued messages come back in the same drain.
pub async fn drain(broker: &InMemoryBroker, queue: &str, runner: &ConsumerRunner) -> Vec<Disposition> {
    let source = broker.source(queue);
    let mut dispositions = Vec::new();
    while let Some(delivery) = source.receive(Duration::from_millis(20)).await.unwrap() {
        dispositions.push(runner.handle_delivery(&delivery).await.unwrap());
        if dispositions.len() > 20 {
            panic!("queue {} never drained", queue);
        }
    }
    dispositions
}
