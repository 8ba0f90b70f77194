use axum::{
    extract::{rejection::JsonRejection, FromRef, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use validator::Validate;

use crate::application::CompletionService;
use crate::domain::CompletionNotification;
use crate::infrastructure::auth::{AuthService, AuthenticatedCaller};
use crate::infrastructure::health::HealthService;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub completions: Arc<CompletionService>,
    pub health: Arc<HealthService>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Body of a worker's completion report. Everything is optional at the
/// serde level so a missing field is a 400 with a field list instead of a
/// deserialization failure.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TransactionProcessedRequest {
    #[validate(required, length(min = 1, max = 100))]
    pub aggregate_id: Option<String>,
    #[validate(required)]
    pub success: Option<bool>,
    #[validate(required)]
    pub final_status: Option<i32>,
    #[validate(length(max = 2000))]
    pub error_message: Option<String>,
    #[validate(required)]
    pub processed_at: Option<DateTime<Utc>>,
    #[validate(required, length(min = 1))]
    pub correlation_id: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub actor_id: Option<String>,
}

impl TransactionProcessedRequest {
    fn into_notification(self) -> Option<CompletionNotification> {
        Some(CompletionNotification {
            aggregate_id: self.aggregate_id?,
            success: self.success?,
            final_status: self.final_status?,
            error_message: self.error_message,
            processed_at: self.processed_at?,
            correlation_id: self.correlation_id?,
            actor_id: self.actor_id,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionProcessedResponse {
    pub aggregate_id: String,
    pub received: bool,
    pub duplicate: bool,
}

pub async fn transaction_processed(
    AuthenticatedCaller(caller): AuthenticatedCaller,
    State(completions): State<Arc<CompletionService>>,
    payload: Result<Json<TransactionProcessedRequest>, JsonRejection>,
) -> Result<Json<TransactionProcessedResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        api_error(StatusCode::BAD_REQUEST, rejection.body_text())
    })?;

    if let Err(errors) = request.validate() {
        let mut fields: Vec<String> = errors
            .field_errors()
            .keys()
            .map(|field| field.to_string())
            .collect();
        fields.sort();
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Invalid or missing fields: {}", fields.join(", ")),
        ));
    }

    let notification = request
        .into_notification()
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Missing required fields"))?;

    info!(
        "Completion report from {} for aggregate {} (correlation {})",
        caller.sub, notification.aggregate_id, notification.correlation_id
    );

    let receipt = completions.receive(notification).await.map_err(|e| {
        error!("Failed to apply completion report: {:#}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to record completion")
    })?;

    Ok(Json(TransactionProcessedResponse {
        aggregate_id: receipt.aggregate_id,
        received: true,
        duplicate: receipt.duplicate,
    }))
}

pub async fn health(State(health): State<Arc<HealthService>>) -> impl IntoResponse {
    Json(health.report().await)
}

pub async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "alive" })))
}

pub async fn readiness(State(health): State<Arc<HealthService>>) -> impl IntoResponse {
    let report = health.report().await;
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
