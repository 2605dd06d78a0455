//! Usage event log
//!
//! Append-only audit trail of feature usage and subscription changes.
//! Appends from the request path are best-effort at the call sites; the
//! log itself never rejects a well-formed event.

use std::collections::VecDeque;
use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use clipvault_shared::{Feature, PaginatedResponse, UsageEvent, UsageEventType};

use crate::error::QuotaResult;

/// An event to be appended; id and timestamp are assigned by the log
#[derive(Debug, Clone)]
pub struct NewUsageEvent {
    pub user_id: Uuid,
    pub event_type: UsageEventType,
    pub feature: Option<Feature>,
    pub amount: Option<i64>,
    /// Counter row the event charged, for joining audit to ledger
    pub usage_record_id: Option<Uuid>,
    /// Subscription row in effect when the event happened
    pub subscription_id: Option<Uuid>,
    pub metadata: serde_json::Value,
}

impl NewUsageEvent {
    pub fn new(user_id: Uuid, event_type: UsageEventType) -> Self {
        Self {
            user_id,
            event_type,
            feature: None,
            amount: None,
            usage_record_id: None,
            subscription_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_feature(mut self, feature: Feature, amount: i64) -> Self {
        self.feature = Some(feature);
        self.amount = Some(amount);
        self
    }

    pub fn with_usage_record(mut self, usage_record_id: Uuid) -> Self {
        self.usage_record_id = Some(usage_record_id);
        self
    }

    pub fn with_subscription(mut self, subscription_id: Uuid) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Filters for querying a user's event history
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub event_type: Option<UsageEventType>,
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

impl EventQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

enum Backend {
    Postgres(PgPool),
    InMemory(Arc<Mutex<VecDeque<UsageEvent>>>),
}

/// Append-only store for usage events
pub struct UsageEventLog {
    backend: Backend,
}

impl UsageEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            backend: Backend::Postgres(pool),
        }
    }

    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::InMemory(Arc::new(Mutex::new(VecDeque::new()))),
        }
    }

    /// Append one event and return it as stored
    pub async fn append(&self, event: NewUsageEvent) -> QuotaResult<UsageEvent> {
        let metadata = match event.metadata {
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        };

        match &self.backend {
            Backend::Postgres(pool) => {
                let stored = sqlx::query_as::<_, UsageEvent>(
                    r#"
                    INSERT INTO usage_events
                        (user_id, usage_record_id, subscription_id, event_type, feature, amount, metadata)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    RETURNING *
                    "#,
                )
                .bind(event.user_id)
                .bind(event.usage_record_id)
                .bind(event.subscription_id)
                .bind(event.event_type.to_string())
                .bind(event.feature.map(|f| f.to_string()))
                .bind(event.amount)
                .bind(&metadata)
                .fetch_one(pool)
                .await?;

                Ok(stored)
            }
            Backend::InMemory(log) => {
                let stored = UsageEvent {
                    id: Uuid::new_v4(),
                    user_id: event.user_id,
                    usage_record_id: event.usage_record_id,
                    subscription_id: event.subscription_id,
                    event_type: event.event_type.to_string(),
                    feature: event.feature.map(|f| f.to_string()),
                    amount: event.amount,
                    metadata,
                    created_at: OffsetDateTime::now_utc(),
                };
                log.lock().await.push_front(stored.clone());
                Ok(stored)
            }
        }
    }

    /// A user's events, newest first
    pub async fn query(
        &self,
        user_id: Uuid,
        query: EventQuery,
    ) -> QuotaResult<PaginatedResponse<UsageEvent>> {
        let limit = query.limit();
        let offset = query.offset();
        let page = offset / limit + 1;

        match &self.backend {
            Backend::Postgres(pool) => {
                let event_type = query.event_type.map(|t| t.to_string());

                let total: i64 = sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*) FROM usage_events
                    WHERE user_id = $1
                      AND ($2::VARCHAR IS NULL OR event_type = $2)
                      AND ($3::TIMESTAMPTZ IS NULL OR created_at >= $3)
                      AND ($4::TIMESTAMPTZ IS NULL OR created_at <= $4)
                    "#,
                )
                .bind(user_id)
                .bind(&event_type)
                .bind(query.from)
                .bind(query.to)
                .fetch_one(pool)
                .await?;

                let events = sqlx::query_as::<_, UsageEvent>(
                    r#"
                    SELECT * FROM usage_events
                    WHERE user_id = $1
                      AND ($2::VARCHAR IS NULL OR event_type = $2)
                      AND ($3::TIMESTAMPTZ IS NULL OR created_at >= $3)
                      AND ($4::TIMESTAMPTZ IS NULL OR created_at <= $4)
                    ORDER BY created_at DESC
                    LIMIT $5 OFFSET $6
                    "#,
                )
                .bind(user_id)
                .bind(&event_type)
                .bind(query.from)
                .bind(query.to)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await?;

                Ok(PaginatedResponse::new(events, total, page, limit))
            }
            Backend::InMemory(log) => {
                let log = log.lock().await;
                let type_filter = query.event_type.map(|t| t.to_string());
                let matching: Vec<UsageEvent> = log
                    .iter()
                    .filter(|e| e.user_id == user_id)
                    .filter(|e| {
                        type_filter
                            .as_ref()
                            .map(|t| &e.event_type == t)
                            .unwrap_or(true)
                    })
                    .filter(|e| query.from.map(|f| e.created_at >= f).unwrap_or(true))
                    .filter(|e| query.to.map(|t| e.created_at <= t).unwrap_or(true))
                    .cloned()
                    .collect();

                let total = matching.len() as i64;
                let events: Vec<UsageEvent> = matching
                    .into_iter()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .collect();

                Ok(PaginatedResponse::new(events, total, page, limit))
            }
        }
    }
}
