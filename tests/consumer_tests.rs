mod common;

use std::sync::Arc;
use std::time::Duration;

use common::RecordingCallback;
use core_ledger_outbox::application::consumers::transaction_processing::TRANSACTION_CONSUMER;
use core_ledger_outbox::application::{
    BulkImportConsumer, BulkImportProcessor, ConnectivityProbeConsumer, JobCommandService,
    ProcessTransactionHandler, TransactionCommandService, TransactionProcessingConsumer,
};
use core_ledger_outbox::application::consumers::connectivity_probe::CONNECTIVITY_PROBE_CONSUMER;
use core_ledger_outbox::domain::{
    BulkImportMessage, JobStatus, TraceContext, TransactionCreatedEvent, TransactionStatus,
    BULK_IMPORT_COMMAND, TEST_CONNECTION_COMMAND,
};
use core_ledger_outbox::infrastructure::codec::{decode_event, encode_event, JSON_CONTENT_TYPE};
use core_ledger_outbox::infrastructure::consumer_runner::{ConsumerRunner, Disposition};
use core_ledger_outbox::infrastructure::idempotency::{IdempotencyGuardTrait, IdempotencyKey};
use core_ledger_outbox::infrastructure::instrument_catalog::StagedInstrument;
use core_ledger_outbox::infrastructure::kafka_abstraction::{publish_json, OutboundMessage};
use core_ledger_outbox::infrastructure::kafka_consumer::MessageSourceTrait;
use core_ledger_outbox::infrastructure::{InMemoryBroker, InMemoryStore, MessagePublisherTrait};

struct TransactionFixture {
    store: InMemoryStore,
    broker: InMemoryBroker,
    queue: String,
    callback: Arc<RecordingCallback>,
}

impl TransactionFixture {
    fn new(callback: RecordingCallback) -> Self {
        Self {
            store: InMemoryStore::with_reference_data(),
            broker: InMemoryBroker::new(),
            queue: common::queues().transaction_created,
            callback: Arc::new(callback),
        }
    }

    /// Records a transaction and lets the outbox publish it.
    async fn create_and_publish(&self) -> i64 {
        let commands = TransactionCommandService::new(Arc::new(self.store.clone()), self.queue.clone());
        let recorded = commands
            .create_transaction(common::valid_draft(), None, TraceContext::new("corr-42"))
            .await
            .unwrap();
        common::poller(&self.store, &self.broker)
            .run_once()
            .await
            .unwrap();
        recorded.transaction.id
    }

    fn runner_with_guard(&self, ledger: &InMemoryStore, guard: &InMemoryStore) -> ConsumerRunner {
        let consumer = TransactionProcessingConsumer::new(
            self.queue.clone(),
            Arc::new(guard.clone()),
            ProcessTransactionHandler::new(Arc::new(ledger.clone())),
            self.callback.clone(),
        );
        ConsumerRunner::new(Box::new(self.broker.source(&self.queue)), Arc::new(consumer))
    }

    fn runner(&self) -> ConsumerRunner {
        self.runner_with_guard(&self.store, &self.store)
    }
}

fn processed_key(transaction_id: i64) -> IdempotencyKey {
    IdempotencyKey::new(TRANSACTION_CONSUMER, "TransactionCreated", transaction_id)
}

#[tokio::test]
async fn test_transaction_is_executed_and_reported() {
    let fixture = TransactionFixture::new(RecordingCallback::default());
    let id = fixture.create_and_publish().await;

    let dispositions = common::drain(&fixture.broker, &fixture.queue, &fixture.runner()).await;
    assert_eq!(dispositions, vec![Disposition::Acked]);

    let transaction = fixture.store.transaction(id).unwrap();
    assert_eq!(transaction.status, TransactionStatus::Executed);

    let sent = fixture.callback.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].aggregate_id, id.to_string());
    assert!(sent[0].success);
    assert_eq!(sent[0].final_status, 2);
    assert_eq!(sent[0].correlation_id, "corr-42");
    assert_eq!(sent[0].actor_id.as_deref(), Some("trader-7"));
    assert!(sent[0].error_message.is_none());
}

#[tokio::test]
async fn test_redelivered_event_is_applied_once() {
    let fixture = TransactionFixture::new(RecordingCallback::default());
    let id = fixture.create_and_publish().await;

    let original = fixture.broker.published(&fixture.queue)[0].clone();
    fixture.broker.publish_raw(&original).await.unwrap();

    let dispositions = common::drain(&fixture.broker, &fixture.queue, &fixture.runner()).await;
    assert_eq!(dispositions, vec![Disposition::Acked, Disposition::Acked]);
    assert_eq!(fixture.callback.sent().len(), 1);
    assert_eq!(
        fixture.store.transaction(id).unwrap().status,
        TransactionStatus::Executed
    );
    assert!(fixture.store.is_processed(&processed_key(id)).await.unwrap());
}

#[tokio::test]
async fn test_rule_violation_is_acked_and_reported_as_failure() {
    let fixture = TransactionFixture::new(RecordingCallback::failing());
    let id = fixture.create_and_publish().await;
    fixture
        .store
        .tamper_transaction(id, |transaction| transaction.currency = "R$".to_string());

    let dispositions = common::drain(&fixture.broker, &fixture.queue, &fixture.runner()).await;
    assert_eq!(dispositions, vec![Disposition::Acked]);
    assert_eq!(
        fixture.store.transaction(id).unwrap().status,
        TransactionStatus::Failed
    );

    // The callback failed but the settlement stands.
    let sent = fixture.callback.sent();
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].success);
    assert_eq!(sent[0].final_status, 8);
    assert!(sent[0].error_message.is_some());
}

#[tokio::test]
async fn test_missing_transaction_is_reported_as_failed() {
    let fixture = TransactionFixture::new(RecordingCallback::default());
    let id = fixture.create_and_publish().await;
    let ledger = InMemoryStore::with_reference_data();

    let runner = fixture.runner_with_guard(&ledger, &fixture.store);
    let dispositions = common::drain(&fixture.broker, &fixture.queue, &runner).await;

    assert_eq!(dispositions, vec![Disposition::Acked]);
    let sent = fixture.callback.sent();
    assert_eq!(sent[0].aggregate_id, id.to_string());
    assert!(!sent[0].success);
    assert_eq!(sent[0].final_status, 8);
}

#[tokio::test]
async fn test_key_recorded_without_settlement_does_not_hide_the_event() {
    let fixture = TransactionFixture::new(RecordingCallback::default());
    let id = fixture.create_and_publish().await;
    // The worker stopped right after recording the key.
    assert!(fixture.store.try_mark_processed(&processed_key(id)).await.unwrap());

    let dispositions = common::drain(&fixture.broker, &fixture.queue, &fixture.runner()).await;

    assert_eq!(dispositions, vec![Disposition::Acked]);
    assert_eq!(
        fixture.store.transaction(id).unwrap().status,
        TransactionStatus::Executed
    );
    assert_eq!(fixture.callback.sent().len(), 1);
}

#[tokio::test]
async fn test_event_without_correlation_id_is_reported_with_a_generated_one() {
    let fixture = TransactionFixture::new(RecordingCallback::default());
    let id = fixture.create_and_publish().await;
    let original = fixture.broker.published(&fixture.queue)[0].clone();
    let mut event: TransactionCreatedEvent = decode_event(&original.payload).unwrap();
    event.correlation_id = None;

    let broker = InMemoryBroker::new();
    broker
        .publish_raw(&OutboundMessage {
            payload: encode_event(&event),
            correlation_id: None,
            ..original
        })
        .await
        .unwrap();
    let consumer = TransactionProcessingConsumer::new(
        fixture.queue.clone(),
        Arc::new(fixture.store.clone()),
        ProcessTransactionHandler::new(Arc::new(fixture.store.clone())),
        fixture.callback.clone(),
    );
    let runner = ConsumerRunner::new(Box::new(broker.source(&fixture.queue)), Arc::new(consumer));

    let dispositions = common::drain(&broker, &fixture.queue, &runner).await;
    assert_eq!(dispositions, vec![Disposition::Acked]);
    let sent = fixture.callback.sent();
    assert_eq!(sent[0].aggregate_id, id.to_string());
    assert!(uuid::Uuid::parse_str(&sent[0].correlation_id).is_ok());
}

#[tokio::test]
async fn test_undecodable_payload_is_dead_lettered_and_consumption_continues() {
    let fixture = TransactionFixture::new(RecordingCallback::default());
    fixture
        .broker
        .publish_raw(&OutboundMessage {
            queue: fixture.queue.clone(),
            key: "garbage".to_string(),
            payload: b"not a protobuf message".to_vec(),
            content_type: "application/x-protobuf".to_string(),
            correlation_id: None,
        })
        .await
        .unwrap();
    let id = fixture.create_and_publish().await;

    let dispositions = common::drain(&fixture.broker, &fixture.queue, &fixture.runner()).await;
    assert_eq!(
        dispositions,
        vec![Disposition::DeadLettered, Disposition::Acked]
    );

    let parked = fixture.broker.dead_letters(&fixture.queue);
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].payload, b"not a protobuf message".to_vec());
    assert_eq!(
        fixture.store.transaction(id).unwrap().status,
        TransactionStatus::Executed
    );
}

#[tokio::test]
async fn test_storage_outage_requeues_and_releases_the_key() {
    let fixture = TransactionFixture::new(RecordingCallback::default());
    let id = fixture.create_and_publish().await;
    let guard = InMemoryStore::new();
    fixture.store.set_unavailable(true);

    let runner = fixture.runner_with_guard(&fixture.store, &guard);
    let source = fixture.broker.source(&fixture.queue);

    let delivery = source.receive(Duration::from_millis(20)).await.unwrap().unwrap();
    assert_eq!(
        runner.handle_delivery(&delivery).await.unwrap(),
        Disposition::Requeued
    );
    assert!(!guard.is_processed(&processed_key(id)).await.unwrap());
    assert!(fixture.callback.sent().is_empty());

    fixture.store.set_unavailable(false);
    let delivery = source.receive(Duration::from_millis(20)).await.unwrap().unwrap();
    assert!(delivery.redelivered);
    assert_eq!(
        runner.handle_delivery(&delivery).await.unwrap(),
        Disposition::Acked
    );
    assert!(guard.is_processed(&processed_key(id)).await.unwrap());
    assert_eq!(
        fixture.store.transaction(id).unwrap().status,
        TransactionStatus::Executed
    );
}

fn staged(ticker: &str, name: &str) -> StagedInstrument {
    StagedInstrument {
        ticker: ticker.to_string(),
        name: name.to_string(),
        isin: None,
        security_type_id: 1,
        currency: "BRL".to_string(),
    }
}

fn bulk_import_runner(
    broker: &InMemoryBroker,
    store: &InMemoryStore,
    catalog: &InMemoryStore,
) -> ConsumerRunner {
    let queue = common::queues().bulk_import;
    let consumer = BulkImportConsumer::new(
        queue.clone(),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        BulkImportProcessor::new(Arc::new(catalog.clone()), 2),
    );
    ConsumerRunner::new(Box::new(broker.source(&queue)), Arc::new(consumer))
}

#[tokio::test]
async fn test_bulk_import_job_runs_to_completion() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    store.stage_instruments(vec![
        staged("VALE3", "Vale ON"),
        staged("ITUB4", "Itau PN"),
        staged("BBAS3", "Banco do Brasil ON"),
    ]);

    let jobs = JobCommandService::new(Arc::new(store.clone()), common::queues());
    let started = jobs
        .start_bulk_import("BIMP-2024-05", "Nightly instrument import", None)
        .await
        .unwrap();
    assert_eq!(started.job.status, JobStatus::New);
    common::poller(&store, &broker).run_once().await.unwrap();

    let queue = common::queues().bulk_import;
    let published = broker.published(&queue);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].content_type, JSON_CONTENT_TYPE);
    assert_eq!(
        published[0].correlation_id.as_deref(),
        Some(started.correlation_id.as_str())
    );

    let runner = bulk_import_runner(&broker, &store, &store);
    let dispositions = common::drain(&broker, &queue, &runner).await;
    assert_eq!(dispositions, vec![Disposition::Acked]);

    let job = store.job(started.job.id).unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert!(job.running_at.is_some());
    assert!(job.finished_at.is_some());
    assert_eq!(store.securities().len(), 3);
}

#[tokio::test]
async fn test_bulk_import_failure_marks_job_failed_and_requeues() {
    let store = InMemoryStore::new();
    let catalog = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    let jobs = JobCommandService::new(Arc::new(store.clone()), common::queues());
    let started = jobs
        .start_bulk_import("BIMP-9", "Import against a dead catalogue", None)
        .await
        .unwrap();
    common::poller(&store, &broker).run_once().await.unwrap();
    catalog.set_unavailable(true);

    let queue = common::queues().bulk_import;
    let runner = bulk_import_runner(&broker, &store, &catalog);
    let source = broker.source(&queue);
    let delivery = source.receive(Duration::from_millis(20)).await.unwrap().unwrap();

    assert_eq!(
        runner.handle_delivery(&delivery).await.unwrap(),
        Disposition::Requeued
    );
    assert_eq!(store.job(started.job.id).unwrap().status, JobStatus::Failed);
    assert_eq!(broker.ready_len(&queue), 1);
}

#[tokio::test]
async fn test_bulk_import_for_unknown_job_is_dead_lettered() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    let queue = common::queues().bulk_import;
    let ghost = BulkImportMessage {
        job_id: 404,
        reference_id: "BIMP-404".to_string(),
        command_type: BULK_IMPORT_COMMAND.to_string(),
        correlation_id: None,
    };
    let wrong_command = BulkImportMessage {
        job_id: 1,
        command_type: TEST_CONNECTION_COMMAND.to_string(),
        ..ghost.clone()
    };
    publish_json(&broker, &queue, "404", &ghost, None).await.unwrap();
    publish_json(&broker, &queue, "1", &wrong_command, None).await.unwrap();

    let runner = bulk_import_runner(&broker, &store, &store);
    let dispositions = common::drain(&broker, &queue, &runner).await;

    assert_eq!(
        dispositions,
        vec![Disposition::DeadLettered, Disposition::DeadLettered]
    );
    let parked = broker.dead_letters(&queue);
    assert!(parked[0].failure_reason.contains("Job 404 not found"));
    assert!(parked[1].failure_reason.contains("unexpected command type"));
}

#[tokio::test]
async fn test_connectivity_probe_completes_the_job_once() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    let queue = common::queues().test_connection;
    let jobs = JobCommandService::new(Arc::new(store.clone()), common::queues());
    let started = jobs
        .start_connectivity_probe("PROBE-1", "Connectivity check", Some("corr-probe".to_string()))
        .await
        .unwrap();
    common::poller(&store, &broker).run_once().await.unwrap();

    let original = broker.published(&queue)[0].clone();
    broker.publish_raw(&original).await.unwrap();

    let consumer = ConnectivityProbeConsumer::new(
        queue.clone(),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Duration::from_millis(5),
    );
    let runner = ConsumerRunner::new(Box::new(broker.source(&queue)), Arc::new(consumer));
    let dispositions = common::drain(&broker, &queue, &runner).await;

    assert_eq!(dispositions, vec![Disposition::Acked, Disposition::Acked]);
    let job = store.job(started.job.id).unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert!(job.finished_at.unwrap() >= job.running_at.unwrap());
    assert_eq!(started.correlation_id, "corr-probe");
}

#[tokio::test]
async fn test_connectivity_probe_runs_when_its_key_outlived_a_crash() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    let queue = common::queues().test_connection;
    let jobs = JobCommandService::new(Arc::new(store.clone()), common::queues());
    let started = jobs
        .start_connectivity_probe("PROBE-2", "Connectivity check", None)
        .await
        .unwrap();
    common::poller(&store, &broker).run_once().await.unwrap();
    let key = IdempotencyKey::new(CONNECTIVITY_PROBE_CONSUMER, TEST_CONNECTION_COMMAND, started.job.id);
    assert!(store.try_mark_processed(&key).await.unwrap());

    let consumer = ConnectivityProbeConsumer::new(
        queue.clone(),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Duration::from_millis(5),
    );
    let runner = ConsumerRunner::new(Box::new(broker.source(&queue)), Arc::new(consumer));
    let dispositions = common::drain(&broker, &queue, &runner).await;

    assert_eq!(dispositions, vec![Disposition::Acked]);
    assert_eq!(store.job(started.job.id).unwrap().status, JobStatus::Complete);
}
