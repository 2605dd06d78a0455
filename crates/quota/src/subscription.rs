//! Subscription state
//!
//! At most one subscription row per user; free-tier users usually have
//! no row at all and readers synthesize a free default. Tier and status
//! strings are parsed exactly once at this boundary - unknown stored
//! values are an error, never silently coerced to free.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use clipvault_shared::{Subscription, SubscriptionStatus, SubscriptionTier};

use crate::error::{QuotaError, QuotaResult};

/// Full subscription state as derived from one billing event
///
/// The reconciler maps every applicable event to one of these and
/// writes it whole; partial field updates are never made.
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_price_id: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub grace_period_expires_at: Option<OffsetDateTime>,
    /// Provider timestamp of the event this snapshot came from
    pub event_at: OffsetDateTime,
}

impl SubscriptionSnapshot {
    /// Reject snapshots that would violate subscription invariants
    pub fn validate(&self) -> QuotaResult<()> {
        if self.tier == SubscriptionTier::Premium && self.stripe_subscription_id.is_none() {
            return Err(QuotaError::InvalidStateTransition(
                "premium tier requires a provider subscription id".to_string(),
            ));
        }
        if self.tier == SubscriptionTier::GracePeriod && self.grace_period_expires_at.is_none() {
            return Err(QuotaError::InvalidStateTransition(
                "grace period requires an expiry deadline".to_string(),
            ));
        }
        if self.status == SubscriptionStatus::Canceled && self.current_period_end.is_none() {
            return Err(QuotaError::InvalidStateTransition(
                "canceled subscription requires a period end".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a stored tier value, rejecting anything outside the enum
pub fn parse_tier(value: &str) -> QuotaResult<SubscriptionTier> {
    value
        .parse()
        .map_err(|_| QuotaError::InvalidTier(value.to_string()))
}

/// Parse a stored status value
pub fn parse_status(value: &str) -> QuotaResult<SubscriptionStatus> {
    value
        .parse()
        .map_err(|_| QuotaError::Internal(format!("invalid subscription status: {}", value)))
}

/// Resolve the tier a user should be treated as right now
///
/// Lazy transitions are computed on read without writing: an expired
/// grace window reads as free, and a cancel-at-period-end subscription
/// past its period end reads as free. The durable row only changes when
/// the reconciler observes the corresponding provider event.
pub fn effective_tier(sub: &Subscription, now: OffsetDateTime) -> QuotaResult<SubscriptionTier> {
    let tier = parse_tier(&sub.tier)?;
    match tier {
        SubscriptionTier::Free => Ok(SubscriptionTier::Free),
        SubscriptionTier::GracePeriod => match sub.grace_period_expires_at {
            Some(deadline) if deadline <= now => Ok(SubscriptionTier::Free),
            _ => Ok(SubscriptionTier::GracePeriod),
        },
        SubscriptionTier::Premium => {
            let status = parse_status(&sub.status)?;
            if status == SubscriptionStatus::Canceled {
                return Ok(SubscriptionTier::Free);
            }
            let period_over = sub
                .current_period_end
                .map(|end| end <= now)
                .unwrap_or(false);
            if sub.cancel_at_period_end && period_over {
                Ok(SubscriptionTier::Free)
            } else {
                Ok(SubscriptionTier::Premium)
            }
        }
    }
}

/// A free-tier default for users with no subscription row
///
/// Never persisted; `id` is nil to make the synthetic origin visible.
pub fn default_free(user_id: Uuid) -> Subscription {
    let now = OffsetDateTime::now_utc();
    Subscription {
        id: Uuid::nil(),
        user_id,
        tier: SubscriptionTier::Free.to_string(),
        status: SubscriptionStatus::Active.to_string(),
        stripe_customer_id: None,
        stripe_subscription_id: None,
        stripe_price_id: None,
        current_period_start: None,
        current_period_end: None,
        trial_end: None,
        cancel_at_period_end: false,
        cancel_at: None,
        canceled_at: None,
        grace_period_expires_at: None,
        last_event_at: None,
        created_at: now,
        updated_at: now,
    }
}

enum Backend {
    Postgres(PgPool),
    InMemory(Arc<RwLock<HashMap<Uuid, Subscription>>>),
}

/// Store for subscription rows
pub struct SubscriptionStore {
    backend: Backend,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            backend: Backend::Postgres(pool),
        }
    }

    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::InMemory(Arc::new(RwLock::new(HashMap::new()))),
        }
    }

    /// Fetch a user's subscription, synthesizing a free default when
    /// absent. Never writes.
    pub async fn get(&self, user_id: Uuid) -> QuotaResult<Subscription> {
        let found = match &self.backend {
            Backend::Postgres(pool) => {
                sqlx::query_as::<_, Subscription>(
                    "SELECT * FROM subscriptions WHERE user_id = $1",
                )
                .bind(user_id)
                .fetch_optional(pool)
                .await?
            }
            Backend::InMemory(map) => map.read().await.get(&user_id).cloned(),
        };
        Ok(found.unwrap_or_else(|| default_free(user_id)))
    }

    /// The tier a user should be charged against right now
    pub async fn effective_tier_for(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> QuotaResult<SubscriptionTier> {
        let sub = self.get(user_id).await?;
        effective_tier(&sub, now)
    }

    /// Look up a subscription by the billing provider's customer id
    pub async fn find_by_customer(
        &self,
        stripe_customer_id: &str,
    ) -> QuotaResult<Option<Subscription>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let found = sqlx::query_as::<_, Subscription>(
                    "SELECT * FROM subscriptions WHERE stripe_customer_id = $1",
                )
                .bind(stripe_customer_id)
                .fetch_optional(pool)
                .await?;
                Ok(found)
            }
            Backend::InMemory(map) => {
                let map = map.read().await;
                Ok(map
                    .values()
                    .find(|s| s.stripe_customer_id.as_deref() == Some(stripe_customer_id))
                    .cloned())
            }
        }
    }

    /// Write a full snapshot, creating or replacing the user's row
    ///
    /// Validates invariants first; `updated_at` always moves forward.
    pub async fn upsert(&self, snapshot: SubscriptionSnapshot) -> QuotaResult<Subscription> {
        snapshot.validate()?;

        match &self.backend {
            Backend::Postgres(pool) => {
                let sub = sqlx::query_as::<_, Subscription>(
                    r#"
                    INSERT INTO subscriptions (
                        user_id, tier, status, stripe_customer_id, stripe_subscription_id,
                        stripe_price_id, current_period_start, current_period_end, trial_end,
                        cancel_at_period_end, cancel_at, canceled_at,
                        grace_period_expires_at, last_event_at
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                    ON CONFLICT (user_id) DO UPDATE SET
                        tier = EXCLUDED.tier,
                        status = EXCLUDED.status,
                        stripe_customer_id = EXCLUDED.stripe_customer_id,
                        stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                        stripe_price_id = EXCLUDED.stripe_price_id,
                        current_period_start = EXCLUDED.current_period_start,
                        current_period_end = EXCLUDED.current_period_end,
                        trial_end = EXCLUDED.trial_end,
                        cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                        cancel_at = EXCLUDED.cancel_at,
                        canceled_at = EXCLUDED.canceled_at,
                        grace_period_expires_at = EXCLUDED.grace_period_expires_at,
                        last_event_at = EXCLUDED.last_event_at,
                        updated_at = NOW()
                    RETURNING *
                    "#,
                )
                .bind(snapshot.user_id)
                .bind(snapshot.tier.to_string())
                .bind(snapshot.status.to_string())
                .bind(&snapshot.stripe_customer_id)
                .bind(&snapshot.stripe_subscription_id)
                .bind(&snapshot.stripe_price_id)
                .bind(snapshot.current_period_start)
                .bind(snapshot.current_period_end)
                .bind(snapshot.trial_end)
                .bind(snapshot.cancel_at_period_end)
                .bind(snapshot.cancel_at)
                .bind(snapshot.canceled_at)
                .bind(snapshot.grace_period_expires_at)
                .bind(snapshot.event_at)
                .fetch_one(pool)
                .await?;

                Ok(sub)
            }
            Backend::InMemory(map) => {
                let mut map = map.write().await;
                let now = OffsetDateTime::now_utc();
                let existing = map.get(&snapshot.user_id);
                let sub = Subscription {
                    id: existing.map(|s| s.id).unwrap_or_else(Uuid::new_v4),
                    user_id: snapshot.user_id,
                    tier: snapshot.tier.to_string(),
                    status: snapshot.status.to_string(),
                    stripe_customer_id: snapshot.stripe_customer_id,
                    stripe_subscription_id: snapshot.stripe_subscription_id,
                    stripe_price_id: snapshot.stripe_price_id,
                    current_period_start: snapshot.current_period_start,
                    current_period_end: snapshot.current_period_end,
                    trial_end: snapshot.trial_end,
                    cancel_at_period_end: snapshot.cancel_at_period_end,
                    cancel_at: snapshot.cancel_at,
                    canceled_at: snapshot.canceled_at,
                    grace_period_expires_at: snapshot.grace_period_expires_at,
                    last_event_at: Some(snapshot.event_at),
                    created_at: existing.map(|s| s.created_at).unwrap_or(now),
                    updated_at: now,
                };
                map.insert(snapshot.user_id, sub.clone());
                Ok(sub)
            }
        }
    }

    /// Toggle the cancel-at-period-end flag without touching tier or
    /// status. Cancel requires a provider-backed subscription; resume
    /// requires the paid period to still be running.
    pub async fn set_cancel_at_period_end(
        &self,
        user_id: Uuid,
        cancel: bool,
    ) -> QuotaResult<Subscription> {
        let existing = self.get(user_id).await?;
        let now = OffsetDateTime::now_utc();

        if existing.stripe_subscription_id.is_none() {
            return Err(QuotaError::InvalidStateTransition(
                "no provider subscription to cancel or resume".to_string(),
            ));
        }
        if !cancel {
            let period_over = existing
                .current_period_end
                .map(|end| end <= now)
                .unwrap_or(true);
            if existing.cancel_at_period_end && period_over {
                return Err(QuotaError::InvalidStateTransition(
                    "billing period already ended, resubscribe instead".to_string(),
                ));
            }
        }

        match &self.backend {
            Backend::Postgres(pool) => {
                let sub = sqlx::query_as::<_, Subscription>(
                    r#"
                    UPDATE subscriptions
                    SET cancel_at_period_end = $2, updated_at = NOW()
                    WHERE user_id = $1
                    RETURNING *
                    "#,
                )
                .bind(user_id)
                .bind(cancel)
                .fetch_optional(pool)
                .await?;

                sub.ok_or_else(|| {
                    QuotaError::NotFound(format!("subscription for user {}", user_id))
                })
            }
            Backend::InMemory(map) => {
                let mut map = map.write().await;
                let sub = map.get_mut(&user_id).ok_or_else(|| {
                    QuotaError::NotFound(format!("subscription for user {}", user_id))
                })?;
                sub.cancel_at_period_end = cancel;
                sub.updated_at = now;
                Ok(sub.clone())
            }
        }
    }
}
