use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome a worker reported for one aggregate, as accepted by the
/// receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub aggregate_id: String,
    pub success: bool,
    pub final_status: i32,
    pub error_message: Option<String>,
    pub correlation_id: String,
    pub actor_id: Option<String>,
    pub processed_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// What a worker sends back once it has finished with an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionNotification {
    pub aggregate_id: String,
    pub success: bool,
    pub final_status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub processed_at: DateTime<Utc>,
    pub correlation_id: String,
    /// Creator of the aggregate. Unknown when the aggregate itself was not
    /// found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
}

impl CompletionNotification {
    pub fn into_record(self, received_at: DateTime<Utc>) -> CompletionRecord {
        CompletionRecord {
            aggregate_id: self.aggregate_id,
            success: self.success,
            final_status: self.final_status,
            error_message: self.error_message,
            correlation_id: self.correlation_id,
            actor_id: self.actor_id,
            processed_at: self.processed_at,
            received_at,
        }
    }
}
