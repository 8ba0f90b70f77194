pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod web;

// Re-export commonly used types
pub use application::{
    CompletionService, JobCommandService, ProcessTransactionHandler, TransactionCommandService,
};
pub use domain::{DeliveryError, ErrorKind, OutboxMessage, OutboxStatus, TransactionCreatedEvent};
pub use infrastructure::{
    AppConfig, ConsumerRunner, KafkaConfig, KafkaConnection, KafkaPublisher,
    MessagePublisherTrait, OutboxPollerConfig, OutboxPollingService, OutboxRepositoryTrait,
    PostgresOutboxRepository,
};
