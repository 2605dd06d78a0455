//! Quota gate
//!
//! The single enforcement point feature code goes through: resolve the
//! user's effective tier, look up the limit, and charge the counter
//! atomically. Denials and successes both leave an audit trail, but a
//! failed audit append never fails the charge itself.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use clipvault_shared::{Feature, Limit, Period, SubscriptionTier, UsageEventType};

use crate::error::{QuotaError, QuotaResult};
use crate::events::{NewUsageEvent, UsageEventLog};
use crate::policy::FeatureLimits;
use crate::subscription::{effective_tier, SubscriptionStore};
use crate::usage::UsageCounter;

/// Outcome of a read-only quota check
#[derive(Debug, Clone, Copy)]
pub struct QuotaCheck {
    /// Whether one more unit of the feature would be allowed
    pub allowed: bool,
    pub current_usage: i64,
    pub limit: Limit,
}

/// Proof of a successful (or replayed) charge
#[derive(Debug, Clone, Serialize)]
pub struct ChargeReceipt {
    pub feature: Feature,
    pub amount: i64,
    pub new_total: i64,
    /// Finite ceiling at charge time; None for unlimited tiers
    pub limit: Option<i64>,
    /// True when an idempotency key replayed a prior outcome
    pub replayed: bool,
}

/// Per-feature line in a usage summary
#[derive(Debug, Clone, Serialize)]
pub struct FeatureUsage {
    pub feature: Feature,
    pub used: i64,
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub allowed: bool,
}

/// Snapshot of a user's tier and per-feature usage for one period
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub tier: SubscriptionTier,
    pub period: String,
    pub features: Vec<FeatureUsage>,
}

const OUTCOME_CHARGED: &str = "charged";
const OUTCOME_DENIED: &str = "denied";

#[derive(Debug, Clone, sqlx::FromRow)]
struct ChargeKeyRow {
    amount: i64,
    outcome: String,
    recorded_usage: i64,
}

enum KeyBackend {
    Postgres(PgPool),
    InMemory(Arc<Mutex<HashMap<(Uuid, String), ChargeKeyRow>>>),
}

/// Recorded outcomes of keyed charges, replayed on retry
struct ChargeKeys {
    backend: KeyBackend,
}

impl ChargeKeys {
    async fn find(&self, user_id: Uuid, key: &str) -> QuotaResult<Option<ChargeKeyRow>> {
        match &self.backend {
            KeyBackend::Postgres(pool) => {
                let row = sqlx::query_as::<_, ChargeKeyRow>(
                    r#"
                    SELECT amount, outcome, recorded_usage FROM usage_charge_keys
                    WHERE user_id = $1 AND idempotency_key = $2
                    "#,
                )
                .bind(user_id)
                .bind(key)
                .fetch_optional(pool)
                .await?;
                Ok(row)
            }
            KeyBackend::InMemory(map) => {
                Ok(map.lock().await.get(&(user_id, key.to_string())).cloned())
            }
        }
    }

    /// First writer wins; a concurrent duplicate insert is a no-op
    async fn record(
        &self,
        user_id: Uuid,
        key: &str,
        feature: Feature,
        amount: i64,
        outcome: &str,
        recorded_usage: i64,
    ) -> QuotaResult<()> {
        match &self.backend {
            KeyBackend::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO usage_charge_keys
                        (user_id, idempotency_key, feature, amount, outcome, recorded_usage)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (user_id, idempotency_key) DO NOTHING
                    "#,
                )
                .bind(user_id)
                .bind(key)
                .bind(feature.to_string())
                .bind(amount)
                .bind(outcome)
                .bind(recorded_usage)
                .execute(pool)
                .await?;
                Ok(())
            }
            KeyBackend::InMemory(map) => {
                map.lock()
                    .await
                    .entry((user_id, key.to_string()))
                    .or_insert(ChargeKeyRow {
                        amount,
                        outcome: outcome.to_string(),
                        recorded_usage,
                    });
                Ok(())
            }
        }
    }
}

/// Quota enforcement over subscription state, usage counters, and the
/// event log
pub struct QuotaGate {
    subscriptions: Arc<SubscriptionStore>,
    counter: Arc<UsageCounter>,
    events: Arc<UsageEventLog>,
    keys: ChargeKeys,
}

impl QuotaGate {
    pub fn new(
        pool: PgPool,
        subscriptions: Arc<SubscriptionStore>,
        counter: Arc<UsageCounter>,
        events: Arc<UsageEventLog>,
    ) -> Self {
        Self {
            subscriptions,
            counter,
            events,
            keys: ChargeKeys {
                backend: KeyBackend::Postgres(pool),
            },
        }
    }

    pub fn new_in_memory(
        subscriptions: Arc<SubscriptionStore>,
        counter: Arc<UsageCounter>,
        events: Arc<UsageEventLog>,
    ) -> Self {
        Self {
            subscriptions,
            counter,
            events,
            keys: ChargeKeys {
                backend: KeyBackend::InMemory(Arc::new(Mutex::new(HashMap::new()))),
            },
        }
    }

    /// Would one more unit of `feature` be allowed right now?
    ///
    /// Read-only; charges nothing and appends no events.
    pub async fn check_only(&self, user_id: Uuid, feature: Feature) -> QuotaResult<QuotaCheck> {
        let now = OffsetDateTime::now_utc();
        let tier = self.subscriptions.effective_tier_for(user_id, now).await?;
        let limit = FeatureLimits::for_tier(tier).limit_for(feature);
        let period = Period::containing(now);
        let current = self
            .counter
            .get(user_id, period)
            .await?
            .map(|r| r.count_for(feature))
            .unwrap_or(0);

        Ok(QuotaCheck {
            allowed: limit.allows(current, 1),
            current_usage: current,
            limit,
        })
    }

    /// Charge `amount` of `feature` against the current period
    pub async fn check_and_charge(
        &self,
        user_id: Uuid,
        feature: Feature,
        amount: i64,
        idempotency_key: Option<&str>,
    ) -> QuotaResult<ChargeReceipt> {
        self.check_and_charge_at(user_id, feature, amount, idempotency_key, Period::current())
            .await
    }

    /// Charge against an explicit period
    ///
    /// With an idempotency key, a repeated call replays the recorded
    /// outcome - a charge is never applied twice and a denial never
    /// retried into success.
    pub async fn check_and_charge_at(
        &self,
        user_id: Uuid,
        feature: Feature,
        amount: i64,
        idempotency_key: Option<&str>,
        period: Period,
    ) -> QuotaResult<ChargeReceipt> {
        let sub = self.subscriptions.get(user_id).await?;
        let tier = effective_tier(&sub, OffsetDateTime::now_utc())?;
        let limit = FeatureLimits::for_tier(tier).limit_for(feature);
        // Synthetic free defaults carry a nil id and leave the audit
        // rows unlinked
        let subscription_id = (sub.id != Uuid::nil()).then_some(sub.id);

        if let Some(key) = idempotency_key {
            if let Some(row) = self.keys.find(user_id, key).await? {
                return self.replay(feature, limit, row);
            }
        }

        match self
            .counter
            .increment_within_limit(user_id, period, feature, amount, limit)
            .await?
        {
            Some((record_id, new_total)) => {
                let mut audit = NewUsageEvent::new(user_id, success_event(feature))
                    .with_feature(feature, amount)
                    .with_usage_record(record_id);
                if let Some(sub_id) = subscription_id {
                    audit = audit.with_subscription(sub_id);
                }
                self.append_best_effort(audit).await;

                if let Some(key) = idempotency_key {
                    self.keys
                        .record(user_id, key, feature, amount, OUTCOME_CHARGED, new_total)
                        .await?;
                }

                Ok(ChargeReceipt {
                    feature,
                    amount,
                    new_total,
                    limit: limit.as_count(),
                    replayed: false,
                })
            }
            None => {
                let current = self
                    .counter
                    .get(user_id, period)
                    .await?
                    .map(|r| r.count_for(feature))
                    .unwrap_or(0);
                let max = limit.as_count().unwrap_or(0);

                let mut audit = NewUsageEvent::new(user_id, UsageEventType::QuotaExceeded)
                    .with_feature(feature, amount)
                    .with_metadata(serde_json::json!({
                        "current_usage": current,
                        "limit": max,
                    }));
                if let Some(sub_id) = subscription_id {
                    audit = audit.with_subscription(sub_id);
                }
                self.append_best_effort(audit).await;

                if let Some(key) = idempotency_key {
                    self.keys
                        .record(user_id, key, feature, amount, OUTCOME_DENIED, current)
                        .await?;
                }

                Err(QuotaError::QuotaExceeded {
                    feature,
                    current_usage: current,
                    limit: max,
                })
            }
        }
    }

    fn replay(
        &self,
        feature: Feature,
        limit: Limit,
        row: ChargeKeyRow,
    ) -> QuotaResult<ChargeReceipt> {
        if row.outcome == OUTCOME_CHARGED {
            Ok(ChargeReceipt {
                feature,
                amount: row.amount,
                new_total: row.recorded_usage,
                limit: limit.as_count(),
                replayed: true,
            })
        } else {
            Err(QuotaError::QuotaExceeded {
                feature,
                current_usage: row.recorded_usage,
                limit: limit.as_count().unwrap_or(row.recorded_usage),
            })
        }
    }

    /// Validate a clip's word count against the tier's per-clip cap
    ///
    /// A per-action bound, not a monthly counter: nothing is charged.
    pub async fn check_clip_words(&self, user_id: Uuid, words: i64) -> QuotaResult<()> {
        let tier = self
            .subscriptions
            .effective_tier_for(user_id, OffsetDateTime::now_utc())
            .await?;
        match FeatureLimits::for_tier(tier).words_per_clip {
            Limit::Count(max) if words > max => {
                Err(QuotaError::ClipTooLarge { words, limit: max })
            }
            _ => Ok(()),
        }
    }

    /// Record the start of a focus or compact session in the audit log
    pub async fn record_session_start(
        &self,
        user_id: Uuid,
        feature: Feature,
    ) -> QuotaResult<()> {
        let event_type = match feature {
            Feature::FocusMinutes => UsageEventType::FocusModeStarted,
            Feature::CompactMinutes => UsageEventType::CompactModeStarted,
            other => {
                return Err(QuotaError::UnsupportedEvent(format!(
                    "no session tracking for feature: {}",
                    other
                )))
            }
        };
        self.events
            .append(NewUsageEvent::new(user_id, event_type))
            .await?;
        Ok(())
    }

    /// Tier plus per-feature usage for one period
    pub async fn usage_summary(&self, user_id: Uuid, period: Period) -> QuotaResult<UsageSummary> {
        let tier = self
            .subscriptions
            .effective_tier_for(user_id, OffsetDateTime::now_utc())
            .await?;
        let limits = FeatureLimits::for_tier(tier);
        let record = self.counter.get(user_id, period).await?;

        let features = Feature::all()
            .into_iter()
            .map(|feature| {
                let used = record.as_ref().map(|r| r.count_for(feature)).unwrap_or(0);
                let limit = limits.limit_for(feature);
                FeatureUsage {
                    feature,
                    used,
                    limit: limit.as_count(),
                    remaining: limit.remaining(used),
                    allowed: limit.allows(used, 1),
                }
            })
            .collect();

        Ok(UsageSummary {
            tier,
            period: period.to_string(),
            features,
        })
    }

    async fn append_best_effort(&self, event: NewUsageEvent) {
        if let Err(e) = self.events.append(event.clone()).await {
            tracing::warn!(
                user_id = %event.user_id,
                event_type = %event.event_type,
                "Failed to append usage event: {}",
                e
            );
        }
    }
}

fn success_event(feature: Feature) -> UsageEventType {
    match feature {
        Feature::Clips => UsageEventType::ClipSent,
        Feature::Files => UsageEventType::FileUploaded,
        Feature::FocusMinutes => UsageEventType::FocusModeEnded,
        Feature::CompactMinutes => UsageEventType::CompactModeEnded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventQuery;
    use crate::subscription::SubscriptionSnapshot;
    use clipvault_shared::{SubscriptionStatus, SubscriptionTier};
    use time::Duration;

    fn in_memory_gate() -> QuotaGate {
        QuotaGate::new_in_memory(
            Arc::new(SubscriptionStore::new_in_memory()),
            Arc::new(UsageCounter::new_in_memory()),
            Arc::new(UsageEventLog::new_in_memory()),
        )
    }

    async fn make_premium(gate: &QuotaGate, user: Uuid) {
        let now = OffsetDateTime::now_utc();
        gate.subscriptions
            .upsert(SubscriptionSnapshot {
                user_id: user,
                tier: SubscriptionTier::Premium,
                status: SubscriptionStatus::Active,
                stripe_customer_id: Some("cus_gate".to_string()),
                stripe_subscription_id: Some("sub_gate".to_string()),
                stripe_price_id: None,
                current_period_start: Some(now),
                current_period_end: Some(now + Duration::days(30)),
                trial_end: None,
                cancel_at_period_end: false,
                cancel_at: None,
                canceled_at: None,
                grace_period_expires_at: None,
                event_at: now,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_charge_within_limit_succeeds() {
        let gate = in_memory_gate();
        let user = Uuid::new_v4();

        let receipt = gate
            .check_and_charge(user, Feature::Clips, 1, None)
            .await
            .unwrap();
        assert_eq!(receipt.new_total, 1);
        assert_eq!(receipt.limit, Some(100));
        assert!(!receipt.replayed);
    }

    #[tokio::test]
    async fn test_denial_reports_usage_and_logs_event() {
        let gate = in_memory_gate();
        let user = Uuid::new_v4();

        gate.check_and_charge(user, Feature::Files, 10, None)
            .await
            .unwrap();
        let err = gate
            .check_and_charge(user, Feature::Files, 1, None)
            .await
            .unwrap_err();
        match err {
            QuotaError::QuotaExceeded {
                feature,
                current_usage,
                limit,
            } => {
                assert_eq!(feature, Feature::Files);
                assert_eq!(current_usage, 10);
                assert_eq!(limit, 10);
            }
            other => panic!("expected QuotaExceeded, got {:?}", other),
        }

        let query = EventQuery {
            event_type: Some(UsageEventType::QuotaExceeded),
            ..Default::default()
        };
        let page = gate.events.query(user, query).await.unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_premium_charge_unlimited_still_counted() {
        let gate = in_memory_gate();
        let user = Uuid::new_v4();
        make_premium(&gate, user).await;

        for _ in 0..150 {
            gate.check_and_charge(user, Feature::Clips, 1, None)
                .await
                .unwrap();
        }
        let check = gate.check_only(user, Feature::Clips).await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.current_usage, 150);
        assert_eq!(check.limit, Limit::Unlimited);
    }

    #[tokio::test]
    async fn test_charge_event_links_counter_and_subscription_rows() {
        let gate = in_memory_gate();
        let user = Uuid::new_v4();
        make_premium(&gate, user).await;

        gate.check_and_charge(user, Feature::Clips, 1, None)
            .await
            .unwrap();

        let record = gate
            .counter
            .get(user, Period::current())
            .await
            .unwrap()
            .unwrap();
        let sub = gate.subscriptions.get(user).await.unwrap();

        let page = gate.events.query(user, EventQuery::default()).await.unwrap();
        let charged = &page.data[0];
        assert_eq!(charged.event_type, "clip_sent");
        assert_eq!(charged.usage_record_id, Some(record.id));
        assert_eq!(charged.subscription_id, Some(sub.id));
    }

    #[tokio::test]
    async fn test_free_default_charge_event_has_no_subscription_link() {
        let gate = in_memory_gate();
        let user = Uuid::new_v4();

        gate.check_and_charge(user, Feature::Clips, 1, None)
            .await
            .unwrap();

        let page = gate.events.query(user, EventQuery::default()).await.unwrap();
        assert!(page.data[0].usage_record_id.is_some());
        assert!(page.data[0].subscription_id.is_none());
    }

    #[tokio::test]
    async fn test_check_only_does_not_charge() {
        let gate = in_memory_gate();
        let user = Uuid::new_v4();

        let check = gate.check_only(user, Feature::Clips).await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.current_usage, 0);

        let check = gate.check_only(user, Feature::Clips).await.unwrap();
        assert_eq!(check.current_usage, 0, "check_only must not mutate");
    }

    #[tokio::test]
    async fn test_idempotent_charge_replays_once() {
        let gate = in_memory_gate();
        let user = Uuid::new_v4();

        let first = gate
            .check_and_charge(user, Feature::Clips, 1, Some("req-1"))
            .await
            .unwrap();
        let second = gate
            .check_and_charge(user, Feature::Clips, 1, Some("req-1"))
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.new_total, first.new_total);

        let check = gate.check_only(user, Feature::Clips).await.unwrap();
        assert_eq!(check.current_usage, 1, "replay must not charge again");
    }

    #[tokio::test]
    async fn test_idempotent_denial_replays_denial() {
        let gate = in_memory_gate();
        let user = Uuid::new_v4();

        gate.check_and_charge(user, Feature::Files, 10, None)
            .await
            .unwrap();
        let first = gate
            .check_and_charge(user, Feature::Files, 1, Some("req-2"))
            .await;
        let second = gate
            .check_and_charge(user, Feature::Files, 1, Some("req-2"))
            .await;

        assert!(matches!(first, Err(QuotaError::QuotaExceeded { .. })));
        assert!(matches!(second, Err(QuotaError::QuotaExceeded { .. })));

        let page = gate.events.query(user, EventQuery::default()).await.unwrap();
        let denials = page
            .data
            .iter()
            .filter(|e| e.event_type == "quota_exceeded")
            .count();
        assert_eq!(denials, 1, "replayed denial appends no second event");
    }

    #[tokio::test]
    async fn test_clip_words_free_capped_premium_not() {
        let gate = in_memory_gate();
        let free_user = Uuid::new_v4();
        let premium_user = Uuid::new_v4();
        make_premium(&gate, premium_user).await;

        gate.check_clip_words(free_user, 1000).await.unwrap();
        let err = gate.check_clip_words(free_user, 1001).await.unwrap_err();
        assert!(matches!(
            err,
            QuotaError::ClipTooLarge { words: 1001, limit: 1000 }
        ));

        gate.check_clip_words(premium_user, 50_000).await.unwrap();
    }

    #[tokio::test]
    async fn test_session_start_records_audit_event() {
        let gate = in_memory_gate();
        let user = Uuid::new_v4();

        gate.record_session_start(user, Feature::FocusMinutes)
            .await
            .unwrap();
        let err = gate
            .record_session_start(user, Feature::Clips)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::UnsupportedEvent(_)));

        let page = gate.events.query(user, EventQuery::default()).await.unwrap();
        assert_eq!(page.data[0].event_type, "focus_mode_started");
    }

    #[tokio::test]
    async fn test_usage_summary_covers_all_features() {
        let gate = in_memory_gate();
        let user = Uuid::new_v4();

        gate.check_and_charge(user, Feature::Clips, 3, None)
            .await
            .unwrap();

        let summary = gate.usage_summary(user, Period::current()).await.unwrap();
        assert_eq!(summary.tier, SubscriptionTier::Free);
        assert_eq!(summary.features.len(), 4);

        let clips = summary
            .features
            .iter()
            .find(|f| f.feature == Feature::Clips)
            .unwrap();
        assert_eq!(clips.used, 3);
        assert_eq!(clips.remaining, Some(97));
    }
}
