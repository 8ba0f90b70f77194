use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::{DeliveryError, SettlementOutcome, TransactionError, TransactionStatus};
use crate::infrastructure::ledger_store::LedgerStoreTrait;

/// Outcome of settling one transaction, reported back through the
/// completion callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingResult {
    pub success: bool,
    pub transaction_id: i64,
    pub final_status_id: i32,
    /// `None` when the transaction could not be loaded.
    pub created_by_user_id: Option<String>,
    pub error_message: Option<String>,
}

impl ProcessingResult {
    fn rejected(
        transaction_id: i64,
        status: i32,
        created_by_user_id: Option<String>,
        error: &TransactionError,
    ) -> Self {
        Self {
            success: false,
            transaction_id,
            final_status_id: status,
            created_by_user_id,
            error_message: Some(error.to_string()),
        }
    }
}

/// Re-validates a pending transaction and moves it to Executed or Failed.
///
/// Domain rule violations are an answer, not an error: they come back as an
/// unsuccessful `ProcessingResult`. Only storage trouble surfaces as a
/// (transient) `DeliveryError`.
pub struct ProcessTransactionHandler {
    store: Arc<dyn LedgerStoreTrait>,
}

impl ProcessTransactionHandler {
    pub fn new(store: Arc<dyn LedgerStoreTrait>) -> Self {
        Self { store }
    }

    pub async fn is_pending(&self, transaction_id: i64) -> Result<bool, DeliveryError> {
        Ok(self
            .store
            .load_transaction(transaction_id)
            .await?
            .is_some_and(|loaded| loaded.transaction.status == TransactionStatus::Pending))
    }

    pub async fn process(
        &self,
        transaction_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ProcessingResult, DeliveryError> {
        let Some(loaded) = self.store.load_transaction(transaction_id).await? else {
            warn!("Transaction {} not found", transaction_id);
            return Ok(ProcessingResult::rejected(
                transaction_id,
                TransactionStatus::Failed.code(),
                None,
                &TransactionError::NotFound(transaction_id),
            ));
        };

        let mut transaction = loaded.transaction;
        let outcome = match transaction.settle(now) {
            Ok(outcome) => outcome,
            Err(not_pending) => {
                warn!("Skipping settlement: {}", not_pending);
                return Ok(ProcessingResult::rejected(
                    transaction.id,
                    transaction.status.code(),
                    Some(transaction.created_by_user_id),
                    &not_pending,
                ));
            }
        };

        let moved = self
            .store
            .update_status(transaction.id, TransactionStatus::Pending, transaction.status)
            .await?;
        if !moved {
            return Err(DeliveryError::transient(format!(
                "transaction {} left Pending while it was being settled",
                transaction.id
            )));
        }

        Ok(match outcome {
            SettlementOutcome::Executed => {
                info!("Transaction {} executed", transaction.id);
                ProcessingResult {
                    success: true,
                    transaction_id: transaction.id,
                    final_status_id: TransactionStatus::Executed.code(),
                    created_by_user_id: Some(transaction.created_by_user_id),
                    error_message: None,
                }
            }
            SettlementOutcome::Rejected(violation) => {
                info!("Transaction {} failed validation: {}", transaction.id, violation);
                ProcessingResult::rejected(
                    transaction.id,
                    TransactionStatus::Failed.code(),
                    Some(transaction.created_by_user_id),
                    &violation,
                )
            }
        })
    }
}
