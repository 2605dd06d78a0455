//! HTTP routes

pub mod events;
pub mod subscription;
pub mod usage;
pub mod webhooks;

use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/usage", get(usage::get_usage))
        .route("/v1/usage/{feature}/charge", post(usage::charge))
        .route("/v1/usage/{feature}/session", post(usage::session))
        .route("/v1/subscription", get(subscription::get_subscription))
        .route("/v1/subscription/cancel", post(subscription::cancel))
        .route("/v1/subscription/resume", post(subscription::resume))
        .route("/v1/events", get(events::list_events))
        .route("/v1/webhooks/billing", post(webhooks::billing_webhook))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Caller identity from the X-User-Id header
///
/// Upstream auth terminates before this service and forwards the
/// resolved user id; a request without one is rejected.
pub(crate) fn user_id_from_headers(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or(ApiError::Unauthorized)
}
