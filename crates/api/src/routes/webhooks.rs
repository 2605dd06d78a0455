//! Billing webhook endpoint

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;

use clipvault_quota::{Applied, QuotaError};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /v1/webhooks/billing
///
/// Acknowledges with 200 only once the state change, or a durable
/// failure record, is stored. Storage faults return 503 so the
/// provider redelivers; processing failures are recorded on the claim
/// row and acknowledged, since redelivery cannot fix them.
pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<impl IntoResponse> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Quota(QuotaError::WebhookSignatureInvalid))?;

    let event = state.quota.reconciler.verify_event(&body, signature)?;
    let event_id = event.id.clone();
    let event_type = event.event_type.clone();

    match state.quota.reconciler.apply(&event).await {
        Ok(applied) => {
            let result = match applied {
                Applied::Processed => "processed",
                Applied::Duplicate => "duplicate",
                Applied::Stale => "stale",
            };
            Ok(Json(serde_json::json!({
                "received": true,
                "result": result,
            })))
        }
        Err(QuotaError::Database(e)) => Err(ApiError::Quota(QuotaError::Database(e))),
        Err(e) => {
            // Failure is recorded on the claim row; ack so the provider
            // stops redelivering an event we cannot apply
            tracing::warn!(
                event_id = %event_id,
                event_type = %event_type,
                "Billing event failed processing: {}",
                e
            );
            Ok(Json(serde_json::json!({
                "received": true,
                "result": "error",
                "error": e.to_string(),
            })))
        }
    }
}
