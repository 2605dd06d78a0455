//! Subscription endpoints

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use time::OffsetDateTime;

use clipvault_quota::effective_tier;
use clipvault_shared::Subscription;

use crate::error::ApiResult;
use crate::routes::user_id_from_headers;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    /// Tier as stored
    pub tier: String,
    /// Tier after lazy grace and cancellation expiry
    pub effective_tier: String,
    pub status: String,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<OffsetDateTime>,
    pub grace_period_expires_at: Option<OffsetDateTime>,
}

fn to_response(sub: Subscription) -> ApiResult<SubscriptionResponse> {
    let effective = effective_tier(&sub, OffsetDateTime::now_utc())?;
    Ok(SubscriptionResponse {
        tier: sub.tier,
        effective_tier: effective.to_string(),
        status: sub.status,
        cancel_at_period_end: sub.cancel_at_period_end,
        current_period_end: sub.current_period_end,
        grace_period_expires_at: sub.grace_period_expires_at,
    })
}

/// GET /v1/subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user_id = user_id_from_headers(&headers)?;
    let sub = state.quota.subscriptions.get(user_id).await?;
    Ok(Json(to_response(sub)?))
}

/// POST /v1/subscription/cancel - cancel at period end
pub async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user_id = user_id_from_headers(&headers)?;
    let sub = state
        .quota
        .subscriptions
        .set_cancel_at_period_end(user_id, true)
        .await?;
    Ok(Json(to_response(sub)?))
}

/// POST /v1/subscription/resume - undo a pending cancellation
pub async fn resume(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user_id = user_id_from_headers(&headers)?;
    let sub = state
        .quota
        .subscriptions
        .set_cancel_at_period_end(user_id, false)
        .await?;
    Ok(Json(to_response(sub)?))
}
