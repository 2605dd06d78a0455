//! Usage event history endpoint

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use time::OffsetDateTime;

use clipvault_quota::EventQuery;
use clipvault_shared::UsageEventType;

use crate::error::{ApiError, ApiResult};
use crate::routes::user_id_from_headers;
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct ListEventsParams {
    pub event_type: Option<String>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub from: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub to: Option<OffsetDateTime>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /v1/events - a user's usage events, newest first
pub async fn list_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListEventsParams>,
) -> ApiResult<impl IntoResponse> {
    let user_id = user_id_from_headers(&headers)?;

    let event_type: Option<UsageEventType> = match params.event_type.as_deref() {
        Some(raw) => Some(
            raw.parse()
                .map_err(|_| ApiError::BadRequest(format!("unknown event type: {}", raw)))?,
        ),
        None => None,
    };

    let page = state
        .quota
        .events
        .query(
            user_id,
            EventQuery {
                event_type,
                from: params.from,
                to: params.to,
                limit: params.limit,
                offset: params.offset,
            },
        )
        .await?;
    Ok(Json(page))
}
