//! Billing event reconciliation
//!
//! Applies provider webhook events to subscription state. Every event
//! passes three gates before it mutates anything: signature
//! verification, an atomic idempotency claim, and a staleness check
//! against the newest event already applied. Events that fail
//! processing have the failure recorded on the claim row so the
//! provider's retry can succeed later.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use uuid::Uuid;

use clipvault_shared::{SubscriptionStatus, SubscriptionTier, UsageEventType};

use crate::error::{QuotaError, QuotaResult};
use crate::events::{NewUsageEvent, UsageEventLog};
use crate::subscription::{effective_tier, SubscriptionSnapshot, SubscriptionStore};

type HmacSha256 = Hmac<Sha256>;

/// Signatures older than this are rejected outright
const SIGNATURE_TOLERANCE_SECONDS: i64 = 300;

/// A claim stuck in 'processing' longer than this is considered
/// abandoned and may be reclaimed by a retry
const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

const RESULT_PROCESSING: &str = "processing";
const RESULT_SUCCESS: &str = "success";
const DEFAULT_GRACE_PERIOD_DAYS: i64 = 7;

/// Grace window granted after a failed payment, in days
pub fn grace_period_days() -> i64 {
    std::env::var("GRACE_PERIOD_DAYS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_GRACE_PERIOD_DAYS)
}

// =============================================================================
// Event payload
// =============================================================================

/// A verified billing provider event
#[derive(Debug, Clone, Deserialize)]
pub struct BillingEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Provider-side creation time, unix seconds
    pub created: i64,
    pub data: BillingEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingEventData {
    pub object: BillingObject,
}

/// The object embedded in an event, flattened across the shapes used
/// by subscription, checkout, and invoice events
#[derive(Debug, Clone, Deserialize)]
pub struct BillingObject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    /// Subscription id carried by checkout and invoice objects
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: Option<bool>,
    #[serde(default)]
    pub cancel_at: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl BillingEvent {
    fn event_time(&self) -> QuotaResult<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.created)
            .map_err(|e| QuotaError::UnsupportedEvent(format!("bad event timestamp: {}", e)))
    }

    /// Subscription id regardless of which object shape carried it
    fn subscription_id(&self) -> Option<String> {
        let object = &self.data.object;
        if self.event_type.starts_with("customer.subscription.") {
            object.id.clone()
        } else {
            object.subscription.clone()
        }
    }
}

/// Outcome of applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Event was applied (or intentionally skipped) for the first time
    Processed,
    /// Another delivery of this event already holds or finished the claim
    Duplicate,
    /// Event predates state already applied; acknowledged without effect
    Stale,
}

// =============================================================================
// Idempotency claims
// =============================================================================

struct ClaimEntry {
    result: String,
    started_at: OffsetDateTime,
}

enum DedupBackend {
    Postgres(PgPool),
    InMemory(Arc<Mutex<HashMap<String, ClaimEntry>>>),
}

impl DedupBackend {
    /// Atomically claim an event for processing
    ///
    /// Returns false when another delivery holds a live claim or has
    /// already finished. A claim stuck past the processing timeout is
    /// taken over.
    async fn claim(&self, event: &BillingEvent) -> QuotaResult<bool> {
        match self {
            Self::Postgres(pool) => {
                let event_time = event.event_time()?;
                let claimed: Option<Uuid> = sqlx::query_scalar(
                    r#"
                    INSERT INTO billing_webhook_events
                        (provider_event_id, event_type, event_timestamp, processing_result, processing_started_at)
                    VALUES ($1, $2, $3, 'processing', NOW())
                    ON CONFLICT (provider_event_id) DO UPDATE
                    SET processing_result = 'processing',
                        processing_started_at = NOW()
                    WHERE billing_webhook_events.processing_result = 'processing'
                      AND billing_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL
                    RETURNING id
                    "#,
                )
                .bind(&event.id)
                .bind(&event.event_type)
                .bind(event_time)
                .bind(PROCESSING_TIMEOUT_MINUTES.to_string())
                .fetch_optional(pool)
                .await?;

                Ok(claimed.is_some())
            }
            Self::InMemory(map) => {
                let mut map = map.lock().await;
                let now = OffsetDateTime::now_utc();
                match map.get_mut(&event.id) {
                    Some(entry)
                        if entry.result == RESULT_PROCESSING
                            && entry.started_at
                                < now - Duration::minutes(PROCESSING_TIMEOUT_MINUTES) =>
                    {
                        entry.started_at = now;
                        Ok(true)
                    }
                    Some(_) => Ok(false),
                    None => {
                        map.insert(
                            event.id.clone(),
                            ClaimEntry {
                                result: RESULT_PROCESSING.to_string(),
                                started_at: now,
                            },
                        );
                        Ok(true)
                    }
                }
            }
        }
    }

    /// Store the processing outcome on the claim row, retrying once
    async fn record_result(&self, event_id: &str, result: &str, error: Option<&str>) {
        match self {
            Self::Postgres(pool) => {
                let update = sqlx::query(
                    r#"
                    UPDATE billing_webhook_events
                    SET processing_result = $2, error_message = $3, processed_at = NOW()
                    WHERE provider_event_id = $1
                    "#,
                )
                .bind(event_id)
                .bind(result)
                .bind(error);

                if let Err(e) = update.execute(pool).await {
                    tracing::warn!(event_id, "Failed to record webhook result, retrying: {}", e);
                    let retry = sqlx::query(
                        r#"
                        UPDATE billing_webhook_events
                        SET processing_result = $2, error_message = $3, processed_at = NOW()
                        WHERE provider_event_id = $1
                        "#,
                    )
                    .bind(event_id)
                    .bind(result)
                    .bind(error)
                    .execute(pool)
                    .await;
                    if let Err(e) = retry {
                        tracing::error!(event_id, "Failed to record webhook result: {}", e);
                    }
                }
            }
            Self::InMemory(map) => {
                if let Some(entry) = map.lock().await.get_mut(event_id) {
                    entry.result = result.to_string();
                }
            }
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Turns billing provider webhooks into subscription state
pub struct BillingReconciler {
    subscriptions: Arc<SubscriptionStore>,
    events: Arc<UsageEventLog>,
    webhook_secret: String,
    dedup: DedupBackend,
}

impl BillingReconciler {
    pub fn new(
        pool: PgPool,
        subscriptions: Arc<SubscriptionStore>,
        events: Arc<UsageEventLog>,
        webhook_secret: String,
    ) -> Self {
        Self {
            subscriptions,
            events,
            webhook_secret,
            dedup: DedupBackend::Postgres(pool),
        }
    }

    pub fn new_in_memory(
        subscriptions: Arc<SubscriptionStore>,
        events: Arc<UsageEventLog>,
        webhook_secret: String,
    ) -> Self {
        Self {
            subscriptions,
            events,
            webhook_secret,
            dedup: DedupBackend::InMemory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    /// Verify a webhook signature header and parse the payload
    ///
    /// The header format is `t=<unix>,v1=<hex hmac>`; the HMAC covers
    /// `<timestamp>.<payload>` keyed with the endpoint secret.
    pub fn verify_event(&self, payload: &str, signature_header: &str) -> QuotaResult<BillingEvent> {
        let mut timestamp: Option<i64> = None;
        let mut signature: Option<&str> = None;
        for part in signature_header.split(',') {
            match part.split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => signature = Some(value),
                _ => {}
            }
        }
        let (timestamp, signature) = match (timestamp, signature) {
            (Some(t), Some(s)) => (t, s),
            _ => return Err(QuotaError::WebhookSignatureInvalid),
        };

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECONDS {
            return Err(QuotaError::WebhookSignatureInvalid);
        }

        let secret = self
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.webhook_secret);
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| QuotaError::Internal(format!("webhook secret invalid: {}", e)))?;
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());
        if expected != signature {
            return Err(QuotaError::WebhookSignatureInvalid);
        }

        serde_json::from_str(payload)
            .map_err(|e| QuotaError::UnsupportedEvent(format!("unparseable event payload: {}", e)))
    }

    /// Apply one verified event to subscription state
    ///
    /// Safe to call repeatedly with the same event. The processing
    /// result lands on the claim row before this returns, so a caller
    /// may acknowledge the delivery once it has a result either way.
    pub async fn apply(&self, event: &BillingEvent) -> QuotaResult<Applied> {
        if !self.dedup.claim(event).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate billing event, skipping"
            );
            return Ok(Applied::Duplicate);
        }

        match self.process(event).await {
            Ok(applied) => {
                self.dedup.record_result(&event.id, RESULT_SUCCESS, None).await;
                Ok(applied)
            }
            Err(e) => {
                self.dedup
                    .record_result(&event.id, "error", Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn process(&self, event: &BillingEvent) -> QuotaResult<Applied> {
        let event_time = event.event_time()?;
        let user_id = self.resolve_user(event).await?;
        let existing = self.subscriptions.get(user_id).await?;

        // Out-of-order delivery: an event older than the state we hold
        // is acknowledged but never applied
        if let Some(last) = existing.last_event_at {
            if event_time <= last {
                tracing::info!(
                    event_id = %event.id,
                    user_id = %user_id,
                    "Stale billing event, state is newer"
                );
                return Ok(Applied::Stale);
            }
        }

        let now = OffsetDateTime::now_utc();
        let old_tier = effective_tier(&existing, now)?;

        let snapshot = match self.snapshot_for(event, &existing, user_id, event_time, old_tier)? {
            Some(snapshot) => snapshot,
            None => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Billing event has no subscription effect, acknowledging"
                );
                return Ok(Applied::Processed);
            }
        };

        let new_tier = snapshot.tier;
        let stored = self.subscriptions.upsert(snapshot).await?;

        if new_tier.rank() != old_tier.rank() {
            let change = if new_tier.rank() > old_tier.rank() {
                UsageEventType::SubscriptionUpgraded
            } else {
                UsageEventType::SubscriptionDowngraded
            };
            let audit = NewUsageEvent::new(user_id, change)
                .with_subscription(stored.id)
                .with_metadata(serde_json::json!({
                    "from": old_tier.to_string(),
                    "to": new_tier.to_string(),
                    "event_type": event.event_type,
                }));
            if let Err(e) = self.events.append(audit).await {
                tracing::warn!(user_id = %user_id, "Failed to append tier change event: {}", e);
            }
        }

        tracing::info!(
            event_id = %event.id,
            user_id = %user_id,
            from = %old_tier,
            to = %new_tier,
            "Applied billing event"
        );
        Ok(Applied::Processed)
    }

    /// Find the user an event belongs to
    ///
    /// Prefers the `user_id` stamped into object metadata at checkout;
    /// falls back to customer id lookup with backoff, since a checkout
    /// webhook can race the row that records the customer id.
    async fn resolve_user(&self, event: &BillingEvent) -> QuotaResult<Uuid> {
        if let Some(raw) = event.data.object.metadata.get("user_id") {
            return Uuid::parse_str(raw).map_err(|_| {
                QuotaError::UnsupportedEvent(format!("bad user_id in event metadata: {}", raw))
            });
        }

        let customer = event.data.object.customer.as_deref().ok_or_else(|| {
            QuotaError::UnknownSubscriptionReference(
                "event carries neither user metadata nor a customer id".to_string(),
            )
        })?;

        let strategy = ExponentialBackoff::from_millis(2).factor(50).take(3);
        let sub = Retry::spawn(strategy, || async {
            match self.subscriptions.find_by_customer(customer).await {
                Ok(Some(sub)) => Ok(sub),
                Ok(None) => Err(QuotaError::UnknownSubscriptionReference(
                    customer.to_string(),
                )),
                Err(e) => Err(e),
            }
        })
        .await?;

        Ok(sub.user_id)
    }

    /// Map an event to the full subscription state it implies
    ///
    /// Returns None for event types with no subscription effect.
    fn snapshot_for(
        &self,
        event: &BillingEvent,
        existing: &clipvault_shared::Subscription,
        user_id: Uuid,
        event_time: OffsetDateTime,
        current_tier: SubscriptionTier,
    ) -> QuotaResult<Option<SubscriptionSnapshot>> {
        let object = &event.data.object;
        let customer = object
            .customer
            .clone()
            .or_else(|| existing.stripe_customer_id.clone());
        let subscription_id = event
            .subscription_id()
            .or_else(|| existing.stripe_subscription_id.clone());
        let period_start = object
            .current_period_start
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
            .or(existing.current_period_start);
        let period_end = object
            .current_period_end
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
            .or(existing.current_period_end);
        let cancel_at_period_end = object
            .cancel_at_period_end
            .unwrap_or(existing.cancel_at_period_end);
        let price = object
            .price
            .clone()
            .or_else(|| existing.stripe_price_id.clone());
        let trial_end = object
            .trial_end
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
            .or(existing.trial_end);
        let cancel_at = object
            .cancel_at
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok());
        let canceled_at = object
            .canceled_at
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok());

        let base = SubscriptionSnapshot {
            user_id,
            tier: SubscriptionTier::Premium,
            status: SubscriptionStatus::Active,
            stripe_customer_id: customer,
            stripe_subscription_id: subscription_id,
            stripe_price_id: price,
            current_period_start: period_start,
            current_period_end: period_end,
            trial_end,
            cancel_at_period_end,
            cancel_at,
            canceled_at: None,
            grace_period_expires_at: None,
            event_at: event_time,
        };

        let snapshot = match event.event_type.as_str() {
            "checkout.session.completed" => base,

            "customer.subscription.created" | "customer.subscription.updated" => {
                match object.status.as_deref() {
                    Some("active") => base,
                    Some("trialing") => SubscriptionSnapshot {
                        status: SubscriptionStatus::Trialing,
                        ..base
                    },
                    Some("past_due") => SubscriptionSnapshot {
                        tier: SubscriptionTier::GracePeriod,
                        status: SubscriptionStatus::PastDue,
                        grace_period_expires_at: Some(
                            event_time + Duration::days(grace_period_days()),
                        ),
                        ..base
                    },
                    Some("unpaid") => SubscriptionSnapshot {
                        tier: SubscriptionTier::GracePeriod,
                        status: SubscriptionStatus::Unpaid,
                        grace_period_expires_at: Some(
                            event_time + Duration::days(grace_period_days()),
                        ),
                        ..base
                    },
                    Some("canceled") => SubscriptionSnapshot {
                        tier: SubscriptionTier::Free,
                        status: SubscriptionStatus::Canceled,
                        current_period_end: base.current_period_end.or(Some(event_time)),
                        canceled_at: canceled_at.or(Some(event_time)),
                        ..base
                    },
                    other => {
                        return Err(QuotaError::UnsupportedEvent(format!(
                            "subscription event without a recognized status: {:?}",
                            other
                        )))
                    }
                }
            }

            "invoice.payment_failed" => {
                // Only a paying subscription enters the grace period;
                // a failed invoice for an already-free user is noise
                if current_tier == SubscriptionTier::Free {
                    return Ok(None);
                }
                SubscriptionSnapshot {
                    tier: SubscriptionTier::GracePeriod,
                    status: SubscriptionStatus::PastDue,
                    grace_period_expires_at: Some(
                        event_time + Duration::days(grace_period_days()),
                    ),
                    ..base
                }
            }

            "invoice.payment_succeeded" | "invoice.paid" => base,

            "customer.subscription.deleted" => SubscriptionSnapshot {
                tier: SubscriptionTier::Free,
                status: SubscriptionStatus::Canceled,
                current_period_end: base.current_period_end.or(Some(event_time)),
                canceled_at: canceled_at.or(Some(event_time)),
                ..base
            },

            _ => return Ok(None),
        };

        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventQuery;

    const SECRET: &str = "whsec_test_secret";

    fn reconciler() -> (BillingReconciler, Arc<SubscriptionStore>, Arc<UsageEventLog>) {
        let subscriptions = Arc::new(SubscriptionStore::new_in_memory());
        let events = Arc::new(UsageEventLog::new_in_memory());
        let reconciler = BillingReconciler::new_in_memory(
            subscriptions.clone(),
            events.clone(),
            SECRET.to_string(),
        );
        (reconciler, subscriptions, events)
    }

    fn sign(payload: &str, timestamp: i64) -> String {
        let secret = SECRET.strip_prefix("whsec_").unwrap();
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    fn checkout_event(event_id: &str, user_id: Uuid, created: i64) -> BillingEvent {
        serde_json::from_value(serde_json::json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "created": created,
            "data": {
                "object": {
                    "id": "cs_1",
                    "customer": "cus_reco",
                    "subscription": "sub_reco",
                    "metadata": { "user_id": user_id.to_string() }
                }
            }
        }))
        .unwrap()
    }

    fn subscription_event(
        event_id: &str,
        event_type: &str,
        user_id: Uuid,
        status: &str,
        created: i64,
    ) -> BillingEvent {
        serde_json::from_value(serde_json::json!({
            "id": event_id,
            "type": event_type,
            "created": created,
            "data": {
                "object": {
                    "id": "sub_reco",
                    "customer": "cus_reco",
                    "status": status,
                    "metadata": { "user_id": user_id.to_string() }
                }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_verify_event_accepts_valid_signature() {
        let (reconciler, _, _) = reconciler();
        let user = Uuid::new_v4();
        let payload =
            serde_json::to_string(&serde_json::json!({
                "id": "evt_1",
                "type": "checkout.session.completed",
                "created": OffsetDateTime::now_utc().unix_timestamp(),
                "data": { "object": { "metadata": { "user_id": user.to_string() } } }
            }))
            .unwrap();
        let header = sign(&payload, OffsetDateTime::now_utc().unix_timestamp());

        let event = reconciler.verify_event(&payload, &header).unwrap();
        assert_eq!(event.id, "evt_1");
    }

    #[tokio::test]
    async fn test_verify_event_rejects_bad_signature() {
        let (reconciler, _, _) = reconciler();
        let payload = r#"{"id":"evt_1","type":"x","created":0,"data":{"object":{}}}"#;
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let header = format!("t={},v1=deadbeef", ts);

        let err = reconciler.verify_event(payload, &header).unwrap_err();
        assert!(matches!(err, QuotaError::WebhookSignatureInvalid));
    }

    #[tokio::test]
    async fn test_verify_event_rejects_old_timestamp() {
        let (reconciler, _, _) = reconciler();
        let payload = r#"{"id":"evt_1","type":"x","created":0,"data":{"object":{}}}"#;
        let old = OffsetDateTime::now_utc().unix_timestamp() - 600;
        let header = sign(payload, old);

        let err = reconciler.verify_event(payload, &header).unwrap_err();
        assert!(matches!(err, QuotaError::WebhookSignatureInvalid));
    }

    #[tokio::test]
    async fn test_checkout_upgrades_to_premium_with_audit() {
        let (reconciler, subscriptions, events) = reconciler();
        let user = Uuid::new_v4();
        let now = OffsetDateTime::now_utc().unix_timestamp();

        let applied = reconciler
            .apply(&checkout_event("evt_up", user, now))
            .await
            .unwrap();
        assert_eq!(applied, Applied::Processed);

        let sub = subscriptions.get(user).await.unwrap();
        assert_eq!(sub.tier, "premium");
        assert_eq!(sub.stripe_subscription_id.as_deref(), Some("sub_reco"));

        let page = events.query(user, EventQuery::default()).await.unwrap();
        assert_eq!(page.data[0].event_type, "subscription_upgraded");
    }

    #[tokio::test]
    async fn test_duplicate_event_applies_once() {
        let (reconciler, _, events) = reconciler();
        let user = Uuid::new_v4();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let event = checkout_event("evt_dup", user, now);

        assert_eq!(reconciler.apply(&event).await.unwrap(), Applied::Processed);
        assert_eq!(reconciler.apply(&event).await.unwrap(), Applied::Duplicate);

        let page = events.query(user, EventQuery::default()).await.unwrap();
        assert_eq!(page.total, 1, "exactly one tier change event");
    }

    #[tokio::test]
    async fn test_stale_event_does_not_regress_state() {
        let (reconciler, subscriptions, _) = reconciler();
        let user = Uuid::new_v4();
        let now = OffsetDateTime::now_utc().unix_timestamp();

        reconciler
            .apply(&checkout_event("evt_new", user, now))
            .await
            .unwrap();

        // An older deletion delivered late must not downgrade
        let stale = subscription_event(
            "evt_old",
            "customer.subscription.deleted",
            user,
            "canceled",
            now - 3600,
        );
        assert_eq!(reconciler.apply(&stale).await.unwrap(), Applied::Stale);
        assert_eq!(subscriptions.get(user).await.unwrap().tier, "premium");
    }

    #[tokio::test]
    async fn test_payment_failure_starts_grace_period() {
        let (reconciler, subscriptions, _) = reconciler();
        let user = Uuid::new_v4();
        let now = OffsetDateTime::now_utc().unix_timestamp();

        reconciler
            .apply(&checkout_event("evt_1", user, now - 10))
            .await
            .unwrap();

        let failed: BillingEvent = serde_json::from_value(serde_json::json!({
            "id": "evt_fail",
            "type": "invoice.payment_failed",
            "created": now,
            "data": { "object": {
                "customer": "cus_reco",
                "metadata": { "user_id": user.to_string() }
            } }
        }))
        .unwrap();
        reconciler.apply(&failed).await.unwrap();

        let sub = subscriptions.get(user).await.unwrap();
        assert_eq!(sub.tier, "grace_period");
        let deadline = sub.grace_period_expires_at.unwrap();
        let expected = OffsetDateTime::from_unix_timestamp(now).unwrap() + Duration::days(7);
        assert_eq!(deadline, expected);
    }

    #[tokio::test]
    async fn test_payment_failure_for_free_user_is_ignored() {
        let (reconciler, subscriptions, _) = reconciler();
        let user = Uuid::new_v4();
        let now = OffsetDateTime::now_utc().unix_timestamp();

        let failed: BillingEvent = serde_json::from_value(serde_json::json!({
            "id": "evt_noise",
            "type": "invoice.payment_failed",
            "created": now,
            "data": { "object": { "metadata": { "user_id": user.to_string() } } }
        }))
        .unwrap();

        assert_eq!(reconciler.apply(&failed).await.unwrap(), Applied::Processed);
        assert_eq!(subscriptions.get(user).await.unwrap().tier, "free");
    }

    #[tokio::test]
    async fn test_payment_success_recovers_from_grace() {
        let (reconciler, subscriptions, _) = reconciler();
        let user = Uuid::new_v4();
        let now = OffsetDateTime::now_utc().unix_timestamp();

        reconciler
            .apply(&checkout_event("evt_1", user, now - 20))
            .await
            .unwrap();
        let failed: BillingEvent = serde_json::from_value(serde_json::json!({
            "id": "evt_2",
            "type": "invoice.payment_failed",
            "created": now - 10,
            "data": { "object": { "metadata": { "user_id": user.to_string() } } }
        }))
        .unwrap();
        reconciler.apply(&failed).await.unwrap();

        let paid: BillingEvent = serde_json::from_value(serde_json::json!({
            "id": "evt_3",
            "type": "invoice.payment_succeeded",
            "created": now,
            "data": { "object": {
                "subscription": "sub_reco",
                "metadata": { "user_id": user.to_string() }
            } }
        }))
        .unwrap();
        reconciler.apply(&paid).await.unwrap();

        let sub = subscriptions.get(user).await.unwrap();
        assert_eq!(sub.tier, "premium");
        assert_eq!(sub.status, "active");
    }

    #[tokio::test]
    async fn test_subscription_deleted_downgrades_with_audit() {
        let (reconciler, subscriptions, events) = reconciler();
        let user = Uuid::new_v4();
        let now = OffsetDateTime::now_utc().unix_timestamp();

        reconciler
            .apply(&checkout_event("evt_1", user, now - 10))
            .await
            .unwrap();
        let deleted = subscription_event(
            "evt_del",
            "customer.subscription.deleted",
            user,
            "canceled",
            now,
        );
        reconciler.apply(&deleted).await.unwrap();

        let sub = subscriptions.get(user).await.unwrap();
        assert_eq!(sub.tier, "free");
        assert_eq!(sub.status, "canceled");
        assert_eq!(
            sub.canceled_at,
            Some(OffsetDateTime::from_unix_timestamp(now).unwrap())
        );

        let page = events.query(user, EventQuery::default()).await.unwrap();
        assert_eq!(page.data[0].event_type, "subscription_downgraded");
        assert_eq!(page.data[0].subscription_id, Some(sub.id));
    }

    #[tokio::test]
    async fn test_subscription_event_carries_price_and_trial() {
        let (reconciler, subscriptions, _) = reconciler();
        let user = Uuid::new_v4();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let trial_end = now + 14 * 86_400;

        let event: BillingEvent = serde_json::from_value(serde_json::json!({
            "id": "evt_trial",
            "type": "customer.subscription.created",
            "created": now,
            "data": { "object": {
                "id": "sub_reco",
                "customer": "cus_reco",
                "status": "trialing",
                "price": "price_pro",
                "trial_end": trial_end,
                "metadata": { "user_id": user.to_string() }
            } }
        }))
        .unwrap();
        reconciler.apply(&event).await.unwrap();

        let sub = subscriptions.get(user).await.unwrap();
        assert_eq!(sub.status, "trialing");
        assert_eq!(sub.stripe_price_id.as_deref(), Some("price_pro"));
        assert_eq!(
            sub.trial_end,
            Some(OffsetDateTime::from_unix_timestamp(trial_end).unwrap())
        );
    }

    #[tokio::test]
    async fn test_unpaid_status_stored_verbatim() {
        let (reconciler, subscriptions, _) = reconciler();
        let user = Uuid::new_v4();
        let now = OffsetDateTime::now_utc().unix_timestamp();

        let event = subscription_event(
            "evt_unpaid",
            "customer.subscription.updated",
            user,
            "unpaid",
            now,
        );
        reconciler.apply(&event).await.unwrap();

        let sub = subscriptions.get(user).await.unwrap();
        assert_eq!(sub.tier, "grace_period");
        assert_eq!(sub.status, "unpaid");
        assert!(sub.grace_period_expires_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_acknowledged() {
        let (reconciler, subscriptions, _) = reconciler();
        let user = Uuid::new_v4();
        let now = OffsetDateTime::now_utc().unix_timestamp();

        let event: BillingEvent = serde_json::from_value(serde_json::json!({
            "id": "evt_misc",
            "type": "customer.updated",
            "created": now,
            "data": { "object": { "metadata": { "user_id": user.to_string() } } }
        }))
        .unwrap();

        assert_eq!(reconciler.apply(&event).await.unwrap(), Applied::Processed);
        assert_eq!(subscriptions.get(user).await.unwrap().tier, "free");
    }

    #[tokio::test]
    async fn test_unknown_customer_is_an_error() {
        let (reconciler, _, _) = reconciler();
        let now = OffsetDateTime::now_utc().unix_timestamp();

        let event: BillingEvent = serde_json::from_value(serde_json::json!({
            "id": "evt_lost",
            "type": "customer.subscription.updated",
            "created": now,
            "data": { "object": { "id": "sub_x", "customer": "cus_missing", "status": "active" } }
        }))
        .unwrap();

        let err = reconciler.apply(&event).await.unwrap_err();
        assert!(matches!(err, QuotaError::UnknownSubscriptionReference(_)));
    }
}
