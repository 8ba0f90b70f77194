use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::infrastructure::completion_client::TRANSACTION_PROCESSED_PATH;
use crate::web::handlers::{health, liveness, readiness, transaction_processed, AppState};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(TRANSACTION_PROCESSED_PATH, post(transaction_processed))
        .route("/health", get(health))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
