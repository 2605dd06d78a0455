//! Monthly usage counters
//!
//! One `usage_records` row per (user, year, month), created lazily by
//! the first charge of the period. All mutations are single atomic
//! upsert-add statements so concurrent charges never lose updates, and
//! `increment_within_limit` pushes the ceiling check into the same
//! statement so concurrent charges can never overshoot a limit.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use clipvault_shared::{Feature, Limit, Period, UsageRecord};

use crate::error::{QuotaError, QuotaResult};

enum Backend {
    Postgres(PgPool),
    InMemory(Arc<Mutex<HashMap<(Uuid, i32, i32), UsageRecord>>>),
}

/// Store for per-user, per-month feature counters
pub struct UsageCounter {
    backend: Backend,
}

impl UsageCounter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            backend: Backend::Postgres(pool),
        }
    }

    /// In-memory backend with identical semantics, used by tests
    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::InMemory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    /// Read the record for a period without creating it
    pub async fn get(&self, user_id: Uuid, period: Period) -> QuotaResult<Option<UsageRecord>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let record = sqlx::query_as::<_, UsageRecord>(
                    "SELECT * FROM usage_records WHERE user_id = $1 AND year = $2 AND month = $3",
                )
                .bind(user_id)
                .bind(period.year)
                .bind(period.month)
                .fetch_optional(pool)
                .await?;
                Ok(record)
            }
            Backend::InMemory(map) => {
                let map = map.lock().await;
                Ok(map.get(&(user_id, period.year, period.month)).cloned())
            }
        }
    }

    /// Unconditionally add `amount` to a feature counter
    ///
    /// Returns the record id and the counter value after the add.
    pub async fn increment(
        &self,
        user_id: Uuid,
        period: Period,
        feature: Feature,
        amount: i64,
    ) -> QuotaResult<(Uuid, i64)> {
        validate_amount(amount)?;

        match &self.backend {
            Backend::Postgres(pool) => {
                let col = feature.column();
                let sql = format!(
                    r#"
                    INSERT INTO usage_records (user_id, year, month, {col})
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (user_id, year, month) DO UPDATE SET
                        {col} = usage_records.{col} + EXCLUDED.{col},
                        updated_at = NOW()
                    RETURNING id, {col}
                    "#
                );

                let (id, new_total): (Uuid, i64) = sqlx::query_as(&sql)
                    .bind(user_id)
                    .bind(period.year)
                    .bind(period.month)
                    .bind(amount)
                    .fetch_one(pool)
                    .await?;

                Ok((id, new_total))
            }
            Backend::InMemory(map) => {
                let mut map = map.lock().await;
                let record = entry(&mut map, user_id, period);
                add(record, feature, amount);
                Ok((record.id, record.count_for(feature)))
            }
        }
    }

    /// Add `amount` only if the result stays within `limit`
    ///
    /// The check and the add happen in one atomic statement; a `None`
    /// return means the ceiling would have been exceeded and nothing
    /// was written. `Limit::Unlimited` always applies the add.
    pub async fn increment_within_limit(
        &self,
        user_id: Uuid,
        period: Period,
        feature: Feature,
        amount: i64,
        limit: Limit,
    ) -> QuotaResult<Option<(Uuid, i64)>> {
        validate_amount(amount)?;

        let max = match limit {
            Limit::Unlimited => {
                return self.increment(user_id, period, feature, amount).await.map(Some);
            }
            Limit::Count(max) => max,
        };

        // A fresh row starts at zero, so the insert arm only needs the
        // amount itself to fit; the conditional WHERE covers the
        // conflict arm.
        if amount > max {
            return Ok(None);
        }

        match &self.backend {
            Backend::Postgres(pool) => {
                let col = feature.column();
                let sql = format!(
                    r#"
                    INSERT INTO usage_records (user_id, year, month, {col})
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (user_id, year, month) DO UPDATE SET
                        {col} = usage_records.{col} + EXCLUDED.{col},
                        updated_at = NOW()
                    WHERE usage_records.{col} + EXCLUDED.{col} <= $5
                    RETURNING id, {col}
                    "#
                );

                let applied: Option<(Uuid, i64)> = sqlx::query_as(&sql)
                    .bind(user_id)
                    .bind(period.year)
                    .bind(period.month)
                    .bind(amount)
                    .bind(max)
                    .fetch_optional(pool)
                    .await?;

                Ok(applied)
            }
            Backend::InMemory(map) => {
                let mut map = map.lock().await;
                let record = entry(&mut map, user_id, period);
                if record.count_for(feature) + amount > max {
                    return Ok(None);
                }
                add(record, feature, amount);
                Ok(Some((record.id, record.count_for(feature))))
            }
        }
    }
}

fn validate_amount(amount: i64) -> QuotaResult<()> {
    if amount <= 0 {
        return Err(QuotaError::Internal(format!(
            "charge amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

fn entry<'a>(
    map: &'a mut HashMap<(Uuid, i32, i32), UsageRecord>,
    user_id: Uuid,
    period: Period,
) -> &'a mut UsageRecord {
    map.entry((user_id, period.year, period.month))
        .or_insert_with(|| {
            let mut record = UsageRecord::empty(user_id, period);
            record.id = Uuid::new_v4();
            record
        })
}

fn add(record: &mut UsageRecord, feature: Feature, amount: i64) {
    match feature {
        Feature::Clips => record.clips_count += amount,
        Feature::Files => record.files_count += amount,
        Feature::FocusMinutes => record.focus_mode_minutes += amount,
        Feature::CompactMinutes => record.compact_mode_minutes += amount,
    }
    record.updated_at = OffsetDateTime::now_utc();
}
