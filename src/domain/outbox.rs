use crate::domain::errors::truncate_error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

/// An event staged for delivery, written in the same commit as the business change.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxMessage {
    pub aggregate_id: String,
    pub event_type: String,
    pub queue: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub id: i64,
    pub aggregate_id: String,
    pub event_type: String,
    pub queue: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub correlation_id: Option<String>,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn from_new(id: i64, message: NewOutboxMessage, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            aggregate_id: message.aggregate_id,
            event_type: message.event_type,
            queue: message.queue,
            payload: message.payload,
            content_type: message.content_type,
            correlation_id: message.correlation_id,
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at,
            published_at: None,
        }
    }

    pub fn mark_published(&mut self, at: DateTime<Utc>) {
        self.status = OutboxStatus::Published;
        self.published_at = Some(at);
        self.last_error = None;
    }

    /// Counts one failed attempt. The message fails for good once the
    /// attempt count exceeds `max_retry_count`.
    pub fn record_failure(&mut self, error: &str, max_retry_count: i32) -> OutboxStatus {
        let (retry_count, status) = next_after_failure(self.retry_count, max_retry_count);
        self.retry_count = retry_count;
        self.status = status;
        self.last_error = Some(truncate_error(error));
        status
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.retry_count += 1;
        self.status = OutboxStatus::Failed;
        self.last_error = Some(truncate_error(error));
    }

    /// Manual recovery of a failed message.
    pub fn reset_for_retry(&mut self) -> bool {
        if self.status != OutboxStatus::Failed {
            return false;
        }
        self.status = OutboxStatus::Pending;
        self.retry_count = 0;
        self.last_error = None;
        true
    }
}

/// Retry bookkeeping shared by every outbox store.
pub fn next_after_failure(retry_count: i32, max_retry_count: i32) -> (i32, OutboxStatus) {
    let retry_count = retry_count + 1;
    if retry_count > max_retry_count {
        (retry_count, OutboxStatus::Failed)
    } else {
        (retry_count, OutboxStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStatusCounts {
    pub pending: i64,
    pub published: i64,
    pub failed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboxMessage {
        OutboxMessage::from_new(
            1,
            NewOutboxMessage {
                aggregate_id: "42".to_string(),
                event_type: "ledger.TransactionCreated.v1".to_string(),
                queue: "transaction.created.queue".to_string(),
                payload: vec![8, 42],
                content_type: "application/x-protobuf".to_string(),
                correlation_id: Some("corr-1".to_string()),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_failure_ceiling_allows_max_plus_one_attempts() {
        let mut msg = message();
        for attempt in 1..=5 {
            assert_eq!(msg.record_failure("down", 5), OutboxStatus::Pending);
            assert_eq!(msg.retry_count, attempt);
        }
        assert_eq!(msg.record_failure("down", 5), OutboxStatus::Failed);
        assert_eq!(msg.retry_count, 6);
    }

    #[test]
    fn test_zero_ceiling_fails_on_first_error() {
        assert_eq!(next_after_failure(0, 0), (1, OutboxStatus::Failed));
    }

    #[test]
    fn test_publish_clears_last_error() {
        let mut msg = message();
        msg.record_failure("timeout", 5);
        msg.mark_published(Utc::now());
        assert_eq!(msg.status, OutboxStatus::Published);
        assert!(msg.published_at.is_some());
        assert!(msg.last_error.is_none());
    }

    #[test]
    fn test_reset_only_applies_to_failed() {
        let mut msg = message();
        assert!(!msg.reset_for_retry());
        msg.mark_failed("corrupt payload");
        assert!(msg.reset_for_retry());
        assert_eq!(msg.status, OutboxStatus::Pending);
        assert_eq!(msg.retry_count, 0);
    }

    #[test]
    fn test_status_text_matches_storage() {
        assert_eq!(OutboxStatus::Pending.to_string(), "PENDING");
        assert_eq!("FAILED".parse::<OutboxStatus>().unwrap(), OutboxStatus::Failed);
    }
}
