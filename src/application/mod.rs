pub mod consumers;
pub mod event_mapper;
pub mod services;

pub use consumers::{BulkImportConsumer, ConnectivityProbeConsumer, TransactionProcessingConsumer};
pub use event_mapper::{map_transaction_created, MappingError};
pub use services::*;
