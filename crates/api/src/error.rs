//! API error handling
//!
//! Maps quota errors onto HTTP responses. Quota denials are a business
//! outcome and return 402 with enough context for the client to prompt
//! an upgrade; storage faults return 503 so clients retry instead of
//! treating the failure as a denial.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use clipvault_quota::QuotaError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Missing or invalid X-User-Id header")]
    Unauthorized,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Quota(QuotaError::QuotaExceeded {
                feature,
                current_usage,
                limit,
            }) => (
                StatusCode::PAYMENT_REQUIRED,
                serde_json::json!({
                    "error": "quota_exceeded",
                    "feature": feature.to_string(),
                    "current_usage": current_usage,
                    "limit": limit,
                    "upgrade": "Upgrade to premium for unlimited usage",
                }),
            ),
            Self::Quota(QuotaError::ClipTooLarge { words, limit }) => (
                StatusCode::PAYMENT_REQUIRED,
                serde_json::json!({
                    "error": "clip_too_large",
                    "words": words,
                    "limit": limit,
                    "upgrade": "Upgrade to premium for unlimited clip size",
                }),
            ),
            Self::Quota(QuotaError::Database(e)) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    serde_json::json!({ "error": "service_unavailable" }),
                )
            }
            Self::Quota(QuotaError::WebhookSignatureInvalid) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": "invalid_signature" }),
            ),
            Self::Quota(QuotaError::NotFound(msg)) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": "not_found", "detail": msg }),
            ),
            Self::Quota(QuotaError::InvalidStateTransition(msg)) => (
                StatusCode::CONFLICT,
                serde_json::json!({ "error": "invalid_state", "detail": msg }),
            ),
            Self::Quota(QuotaError::UnknownSubscriptionReference(reference)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                serde_json::json!({ "error": "unknown_subscription_reference", "reference": reference }),
            ),
            Self::Quota(QuotaError::UnsupportedEvent(msg)) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": "unsupported", "detail": msg }),
            ),
            Self::Quota(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": "internal_error" }),
                )
            }
            Self::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": "bad_request", "detail": msg }),
            ),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": "unauthorized" }),
            ),
        };

        (status, Json(body)).into_response()
    }
}
