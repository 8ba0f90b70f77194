use serde::{Deserialize, Serialize};

pub const TRANSACTION_CREATED_EVENT: &str = "ledger.TransactionCreated.v1";
pub const TRANSACTION_CREATED_SCHEMA_VERSION: u32 = 1;

/// Denormalized snapshot of a newly recorded ledger transaction.
///
/// Decimals travel as strings to keep their scale, dates as ISO-8601 and
/// timestamps as unix milliseconds. Field tags are append-only.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransactionCreatedEvent {
    #[prost(int64, tag = "1")]
    pub transaction_id: i64,
    #[prost(int32, tag = "2")]
    pub fund_id: i32,
    #[prost(string, tag = "3")]
    pub fund_code: String,
    #[prost(string, tag = "4")]
    pub fund_name: String,
    #[prost(int32, optional, tag = "5")]
    pub security_id: Option<i32>,
    #[prost(string, optional, tag = "6")]
    pub security_ticker: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub security_name: Option<String>,
    #[prost(int32, tag = "8")]
    pub sub_type_id: i32,
    #[prost(string, tag = "9")]
    pub sub_type_description: String,
    #[prost(int32, tag = "10")]
    pub type_id: i32,
    #[prost(string, tag = "11")]
    pub type_description: String,
    #[prost(string, tag = "12")]
    pub trade_date: String,
    #[prost(string, tag = "13")]
    pub settle_date: String,
    #[prost(string, tag = "14")]
    pub quantity: String,
    #[prost(string, tag = "15")]
    pub price: String,
    #[prost(string, tag = "16")]
    pub amount: String,
    #[prost(string, tag = "17")]
    pub currency: String,
    #[prost(int32, tag = "18")]
    pub status_id: i32,
    #[prost(string, tag = "19")]
    pub status_description: String,
    #[prost(int64, tag = "20")]
    pub created_at_unix_ms: i64,
    #[prost(string, tag = "21")]
    pub created_by_user_id: String,
    #[prost(string, optional, tag = "22")]
    pub correlation_id: Option<String>,
    #[prost(string, optional, tag = "23")]
    pub request_id: Option<String>,
    #[prost(int64, tag = "24")]
    pub occurred_at_unix_ms: i64,
    #[prost(uint32, tag = "25")]
    pub schema_version: u32,
}

impl TransactionCreatedEvent {
    pub fn aggregate_id(&self) -> String {
        self.transaction_id.to_string()
    }
}

/// Trace identifiers propagated from the originating request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub correlation_id: Option<String>,
    pub request_id: Option<String>,
}

impl TraceContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}
