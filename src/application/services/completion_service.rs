use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::domain::{CompletionNotification, CompletionRecord};
use crate::infrastructure::ledger_store::CompletionStoreTrait;

/// Fan-out of accepted completions to whoever is watching (the originating
/// user's live session, in practice).
#[derive(Clone)]
pub struct UserNotifier {
    sender: broadcast::Sender<CompletionRecord>,
}

impl Default for UserNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl UserNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CompletionRecord> {
        self.sender.subscribe()
    }

    fn publish(&self, record: CompletionRecord) {
        // No subscribers is the normal case for a headless worker.
        if self.sender.send(record).is_err() {
            debug!("No live subscribers for completion notifications");
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionReceipt {
    pub aggregate_id: String,
    pub duplicate: bool,
}

/// Receiving side of the completion callback.
pub struct CompletionService {
    store: Arc<dyn CompletionStoreTrait>,
    notifier: UserNotifier,
}

impl CompletionService {
    pub fn new(store: Arc<dyn CompletionStoreTrait>, notifier: UserNotifier) -> Self {
        Self { store, notifier }
    }

    pub fn notifier(&self) -> &UserNotifier {
        &self.notifier
    }

    /// Applies the first report for an aggregate. Later reports for the
    /// same aggregate are acknowledged and ignored.
    pub async fn receive(&self, notification: CompletionNotification) -> Result<CompletionReceipt> {
        let aggregate_id = notification.aggregate_id.clone();
        let record = notification.into_record(Utc::now());

        if !self.store.record_completion(&record).await? {
            info!(
                "Duplicate completion for aggregate {} (correlation {}) ignored",
                aggregate_id, record.correlation_id
            );
            return Ok(CompletionReceipt {
                aggregate_id,
                duplicate: true,
            });
        }

        info!(
            "Completion applied for aggregate {}: success={}, status={}",
            aggregate_id, record.success, record.final_status
        );
        self.notifier.publish(record);
        Ok(CompletionReceipt {
            aggregate_id,
            duplicate: false,
        })
    }
}
