use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::event_mapper::map_transaction_created;
use crate::domain::{
    LoadedTransaction, NewOutboxMessage, TraceContext, TransactionDraft, TransactionError,
    TRANSACTION_CREATED_EVENT,
};
use crate::infrastructure::codec::{encode_event, protobuf_content_type};
use crate::infrastructure::ledger_store::{LedgerStoreTrait, RecordedTransaction};

#[derive(Debug, Error)]
pub enum TransactionCommandError {
    #[error(transparent)]
    Validation(#[from] TransactionError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Write side for ledger transactions. A successful call has committed the
/// transaction and exactly one pending `TransactionCreated` outbox row;
/// broker availability never affects the outcome.
pub struct TransactionCommandService {
    store: Arc<dyn LedgerStoreTrait>,
    queue: String,
}

impl TransactionCommandService {
    pub fn new(store: Arc<dyn LedgerStoreTrait>, queue: impl Into<String>) -> Self {
        Self {
            store,
            queue: queue.into(),
        }
    }

    pub async fn create_transaction(
        &self,
        draft: TransactionDraft,
        idempotency_key: Option<Uuid>,
        trace: TraceContext,
    ) -> Result<RecordedTransaction, TransactionCommandError> {
        let draft = draft.validate(Utc::now())?;

        let trace = match trace.correlation_id {
            Some(_) => trace,
            None => TraceContext {
                correlation_id: Some(Uuid::new_v4().to_string()),
                ..trace
            },
        };

        let queue = self.queue.clone();
        let event_trace = trace.clone();
        let build_outbox = move |loaded: &LoadedTransaction| -> anyhow::Result<NewOutboxMessage> {
            let event = map_transaction_created(loaded, &event_trace, Utc::now())?;
            Ok(NewOutboxMessage {
                aggregate_id: event.aggregate_id(),
                event_type: TRANSACTION_CREATED_EVENT.to_string(),
                queue: queue.clone(),
                payload: encode_event(&event),
                content_type: protobuf_content_type(TRANSACTION_CREATED_EVENT),
                correlation_id: event_trace.correlation_id.clone(),
            })
        };

        let recorded = self
            .store
            .record_transaction(&draft, idempotency_key, &build_outbox)
            .await?;

        if recorded.replayed {
            warn!(
                "Idempotency key {:?} already used; returning transaction {}",
                idempotency_key, recorded.transaction.id
            );
        } else {
            info!(
                "Transaction {} recorded with outbox message {:?} (correlation {})",
                recorded.transaction.id,
                recorded.outbox_message_id,
                trace.correlation_id.as_deref().unwrap_or("")
            );
        }
        Ok(recorded)
    }
}
