pub mod bulk_import;
pub mod completion_service;
pub mod job_service;
pub mod transaction_processing;
pub mod transaction_service;

pub use bulk_import::{BulkImportProcessor, ImportSummary};
pub use completion_service::{CompletionReceipt, CompletionService, UserNotifier};
pub use job_service::{JobCommandError, JobCommandService, StartedJob};
pub use transaction_processing::{ProcessTransactionHandler, ProcessingResult};
pub use transaction_service::{TransactionCommandError, TransactionCommandService};
