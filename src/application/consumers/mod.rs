pub mod bulk_import;
pub mod connectivity_probe;
pub mod transaction_processing;

pub use bulk_import::BulkImportConsumer;
pub use connectivity_probe::ConnectivityProbeConsumer;
pub use transaction_processing::TransactionProcessingConsumer;

use tracing::{error, warn};

use crate::domain::{DeliveryError, JobStatus};
use crate::infrastructure::idempotency::{IdempotencyGuardTrait, IdempotencyKey};
use crate::infrastructure::job_store::JobStoreTrait;

/// Forgets a key after a failed apply so the redelivery is not mistaken for
/// a duplicate.
pub(crate) async fn release_key(guard: &dyn IdempotencyGuardTrait, key: &IdempotencyKey) {
    if let Err(e) = guard.release(key).await {
        error!("Failed to release idempotency key {}: {:#}", key, e);
    }
}

/// A recorded key only counts once the job reached Complete. Anything else
/// means the worker stopped between recording the key and finishing.
pub(crate) async fn job_left_unfinished(
    jobs: &dyn JobStoreTrait,
    key: &IdempotencyKey,
    job_id: i64,
) -> Result<bool, DeliveryError> {
    match jobs.find_job(job_id).await? {
        Some(job) if job.status != JobStatus::Complete => {
            warn!(
                "Key {} is recorded but job {} is {}, applying again",
                key, job_id, job.status
            );
            Ok(true)
        }
        _ => Ok(false),
    }
}
