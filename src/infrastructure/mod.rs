pub mod auth;
pub mod codec;
pub mod completion_client;
pub mod config;
pub mod consumer_runner;
pub mod health;
pub mod idempotency;
pub mod in_memory_broker;
pub mod in_memory_store;
pub mod instrument_catalog;
pub mod job_store;
pub mod kafka_abstraction;
pub mod kafka_consumer;
pub mod kafka_dlq;
pub mod ledger_store;
pub mod logging;
pub mod outbox;
pub mod outbox_poller;
pub mod shutdown;

pub use config::AppConfig;
pub use consumer_runner::{ConsumerRunner, HandlerOutcome, MessageHandler};
pub use in_memory_broker::InMemoryBroker;
pub use in_memory_store::InMemoryStore;
pub use kafka_abstraction::{KafkaConfig, KafkaConnection, KafkaPublisher, MessagePublisherTrait};
pub use outbox::{OutboxRepositoryTrait, PostgresOutboxRepository};
pub use outbox_poller::{OutboxPollerConfig, OutboxPollingService};
