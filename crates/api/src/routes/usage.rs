//! Usage and charge endpoints

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use clipvault_shared::{Feature, Period};

use crate::error::{ApiError, ApiResult};
use crate::routes::user_id_from_headers;
use crate::state::AppState;

fn parse_feature(raw: &str) -> Result<Feature, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("unknown feature: {}", raw)))
}

fn idempotency_key(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-idempotency-key").and_then(|v| v.to_str().ok())
}

/// Client input, so a bad value is a 400, not a storage fault
fn positive_amount(amount: i64) -> Result<i64, ApiError> {
    if amount <= 0 {
        return Err(ApiError::BadRequest(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(amount)
}

/// GET /v1/usage - current-period usage across all features
pub async fn get_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user_id = user_id_from_headers(&headers)?;
    let summary = state
        .quota
        .gate
        .usage_summary(user_id, Period::current())
        .await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize, Default)]
pub struct ChargeRequest {
    pub amount: Option<i64>,
    /// Word count of the clip being sent; validated against the
    /// per-clip cap before anything is charged
    pub words: Option<i64>,
}

/// POST /v1/usage/{feature}/charge
pub async fn charge(
    State(state): State<AppState>,
    Path(feature): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ChargeRequest>>,
) -> ApiResult<impl IntoResponse> {
    let user_id = user_id_from_headers(&headers)?;
    let feature = parse_feature(&feature)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let amount = positive_amount(request.amount.unwrap_or(1))?;

    if feature == Feature::Clips {
        if let Some(words) = request.words {
            state.quota.gate.check_clip_words(user_id, words).await?;
        }
    }

    let receipt = state
        .quota
        .gate
        .check_and_charge(user_id, feature, amount, idempotency_key(&headers))
        .await?;
    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub action: String,
    /// Minutes to charge when ending a session
    pub minutes: Option<i64>,
}

/// POST /v1/usage/{feature}/session
///
/// `start` records an audit event only; `end` charges the elapsed
/// minutes against the feature's monthly cap.
pub async fn session(
    State(state): State<AppState>,
    Path(feature): Path<String>,
    headers: HeaderMap,
    Json(request): Json<SessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let user_id = user_id_from_headers(&headers)?;
    let feature = parse_feature(&feature)?;

    match request.action.as_str() {
        "start" => {
            state
                .quota
                .gate
                .record_session_start(user_id, feature)
                .await?;
            Ok(Json(serde_json::json!({ "status": "recorded" })))
        }
        "end" => {
            let minutes = request.minutes.ok_or_else(|| {
                ApiError::BadRequest("minutes is required to end a session".to_string())
            })?;
            let minutes = positive_amount(minutes)?;
            let receipt = state
                .quota
                .gate
                .check_and_charge(user_id, feature, minutes, idempotency_key(&headers))
                .await?;
            Ok(Json(serde_json::json!({
                "status": "charged",
                "receipt": receipt,
            })))
        }
        other => Err(ApiError::BadRequest(format!(
            "unknown session action: {}",
            other
        ))),
    }
}
