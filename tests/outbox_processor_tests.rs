mod common;

use async_trait::async_trait;
use mockall::mock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use core_ledger_outbox::domain::{NewOutboxMessage, OutboxStatus};
use core_ledger_outbox::infrastructure::codec::JSON_CONTENT_TYPE;
use core_ledger_outbox::infrastructure::health::{ComponentState, HealthRegistry};
use core_ledger_outbox::infrastructure::kafka_abstraction::{BrokerError, OutboundMessage};
use core_ledger_outbox::infrastructure::outbox_poller::{MessageOutcome, OUTBOX_PROCESSOR_COMPONENT};
use core_ledger_outbox::infrastructure::{
    InMemoryBroker, InMemoryStore, MessagePublisherTrait, OutboxPollerConfig,
    OutboxPollingService, OutboxRepositoryTrait,
};

mock! {
    pub Publisher {}

    #[async_trait]
    impl MessagePublisherTrait for Publisher {
        async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;
        async fn publish_raw(&self, message: &OutboundMessage) -> Result<(), BrokerError>;
        async fn is_connected(&self) -> bool;
    }
}

const QUEUE: &str = "jobs.test-connection.queue";

fn json_message(aggregate_id: &str) -> NewOutboxMessage {
    NewOutboxMessage {
        aggregate_id: aggregate_id.to_string(),
        event_type: "jobs.TestConnection".to_string(),
        queue: QUEUE.to_string(),
        payload: format!(r#"{{"jobId":{}}}"#, aggregate_id).into_bytes(),
        content_type: JSON_CONTENT_TYPE.to_string(),
        correlation_id: Some(format!("corr-{}", aggregate_id)),
    }
}

#[tokio::test]
async fn test_pending_messages_are_published_once() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    let first = store.insert_outbox(json_message("1"));
    let second = store.insert_outbox(json_message("2"));
    let poller = common::poller(&store, &broker);

    let report = poller.run_once().await.unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(report.published, 2);

    for id in [first, second] {
        let message = store.outbox_message(id).unwrap();
        assert_eq!(message.status, OutboxStatus::Published);
        assert!(message.published_at.is_some());
    }

    let published = broker.published(QUEUE);
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].key, "1");
    assert_eq!(published[0].correlation_id.as_deref(), Some("corr-1"));

    let report = poller.run_once().await.unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(broker.published(QUEUE).len(), 2);
}

#[tokio::test]
async fn test_message_fails_after_max_retry_count_plus_one_attempts() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    broker.set_available(false);
    let id = store.insert_outbox(json_message("7"));
    let poller = common::poller(&store, &broker);

    for attempt in 1..=5 {
        let report = poller.run_once().await.unwrap();
        assert_eq!(report.retried, 1, "attempt {}", attempt);
        let message = store.outbox_message(id).unwrap();
        assert_eq!(message.status, OutboxStatus::Pending);
        assert_eq!(message.retry_count, attempt);
        assert!(message.last_error.unwrap().contains("broker unavailable"));
    }

    let report = poller.run_once().await.unwrap();
    assert_eq!(report.failed, 1);
    let message = store.outbox_message(id).unwrap();
    assert_eq!(message.status, OutboxStatus::Failed);
    assert_eq!(message.retry_count, 6);

    // Failed rows are never picked up again, even with the broker back.
    broker.set_available(true);
    let report = poller.run_once().await.unwrap();
    assert_eq!(report.fetched, 0);
    assert!(broker.published(QUEUE).is_empty());
}

#[tokio::test]
async fn test_one_failing_message_does_not_block_the_batch() {
    let store = InMemoryStore::new();
    let failing = store.insert_outbox(json_message("1"));
    let healthy = store.insert_outbox(json_message("2"));

    let mut publisher = MockPublisher::new();
    publisher
        .expect_publish_raw()
        .withf(|message| message.key == "1")
        .times(1)
        .returning(|_| Err(BrokerError::TimeoutError("publish timed out".to_string())));
    publisher
        .expect_publish_raw()
        .withf(|message| message.key == "2")
        .times(1)
        .returning(|_| Ok(()));

    let poller = OutboxPollingService::new(
        Arc::new(store.clone()),
        Arc::new(publisher),
        common::poller_config(),
    );
    let report = poller.run_once().await.unwrap();

    assert_eq!(report.published, 1);
    assert_eq!(report.retried, 1);

    let failing = store.outbox_message(failing).unwrap();
    assert_eq!(failing.status, OutboxStatus::Pending);
    assert_eq!(failing.retry_count, 1);

    let healthy = store.outbox_message(healthy).unwrap();
    assert_eq!(healthy.status, OutboxStatus::Published);
    assert_eq!(healthy.retry_count, 0);
}

#[tokio::test]
async fn test_broker_rejection_fails_fast() {
    let store = InMemoryStore::new();
    let id = store.insert_outbox(json_message("3"));

    let mut publisher = MockPublisher::new();
    publisher
        .expect_publish_raw()
        .times(1)
        .returning(|_| Err(BrokerError::Rejected("message too large".to_string())));

    let poller = OutboxPollingService::new(
        Arc::new(store.clone()),
        Arc::new(publisher),
        common::poller_config(),
    );
    let message = store.find(id).await.unwrap().unwrap();
    assert_eq!(poller.process_message(message).await, MessageOutcome::Failed);

    let message = store.outbox_message(id).unwrap();
    assert_eq!(message.status, OutboxStatus::Failed);
    assert_eq!(message.retry_count, 1);
}

#[tokio::test]
async fn test_corrupt_payload_is_retried_when_fail_fast_is_off() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    let id = store.insert_outbox(NewOutboxMessage {
        payload: b"{not json".to_vec(),
        ..json_message("4")
    });

    let poller = OutboxPollingService::new(
        Arc::new(store.clone()),
        Arc::new(broker.clone()),
        OutboxPollerConfig {
            fail_fast_permanent: false,
            ..common::poller_config()
        },
    );
    let report = poller.run_once().await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(store.outbox_message(id).unwrap().status, OutboxStatus::Pending);

    let fail_fast = common::poller(&store, &broker);
    let report = fail_fast.run_once().await.unwrap();
    assert_eq!(report.failed, 1);
    let message = store.outbox_message(id).unwrap();
    assert_eq!(message.status, OutboxStatus::Failed);
    assert_eq!(message.retry_count, 2);
    assert!(broker.published(QUEUE).is_empty());
}

#[tokio::test]
async fn test_requeue_failed_gives_a_fresh_retry_budget() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    broker.set_available(false);
    let id = store.insert_outbox(json_message("5"));
    let poller = OutboxPollingService::new(
        Arc::new(store.clone()),
        Arc::new(broker.clone()),
        OutboxPollerConfig {
            max_retry_count: 0,
            ..common::poller_config()
        },
    );

    poller.run_once().await.unwrap();
    assert_eq!(store.outbox_message(id).unwrap().status, OutboxStatus::Failed);

    assert!(poller.requeue_failed(id).await.unwrap());
    let message = store.outbox_message(id).unwrap();
    assert_eq!(message.status, OutboxStatus::Pending);
    assert_eq!(message.retry_count, 0);
    assert!(message.last_error.is_none());

    broker.set_available(true);
    poller.run_once().await.unwrap();
    assert_eq!(store.outbox_message(id).unwrap().status, OutboxStatus::Published);
    assert!(!poller.requeue_failed(id).await.unwrap());
    assert!(!poller.requeue_failed(999).await.unwrap());
}

#[tokio::test]
async fn test_claimed_rows_are_skipped_by_a_second_fetch() {
    let store = InMemoryStore::new();
    store.insert_outbox(json_message("1"));
    store.insert_outbox(json_message("2"));

    let first = store.fetch_pending(1).await.unwrap();
    let second = store.fetch_pending(10).await.unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_ne!(first[0].id, second[0].id);
    assert!(store.fetch_pending(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_store_outage_surfaces_as_cycle_error() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    store.insert_outbox(json_message("1"));
    store.set_unavailable(true);

    let poller = common::poller(&store, &broker);
    assert!(poller.run_once().await.is_err());
    assert!(broker.published(QUEUE).is_empty());
}

#[tokio::test]
async fn test_run_publishes_until_shutdown() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    let health = HealthRegistry::new();
    let poller = common::poller(&store, &broker).with_health(health.clone());
    assert_eq!(
        health.state(OUTBOX_PROCESSOR_COMPONENT),
        Some(ComponentState::Starting)
    );

    let token = CancellationToken::new();
    let task = tokio::spawn(poller.run(token.clone()));
    let id = store.insert_outbox(json_message("9"));

    for _ in 0..50 {
        if store.outbox_message(id).unwrap().status == OutboxStatus::Published {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.outbox_message(id).unwrap().status, OutboxStatus::Published);
    assert_eq!(
        health.state(OUTBOX_PROCESSOR_COMPONENT),
        Some(ComponentState::Running)
    );

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        health.state(OUTBOX_PROCESSOR_COMPONENT),
        Some(ComponentState::Stopped)
    );
}
