// Quota crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ClipVault Quota Module
//!
//! Subscription tiers, per-period usage metering, and billing event
//! reconciliation.
//!
//! ## Features
//!
//! - **Quota Gate**: Atomic check-and-charge of metered features
//! - **Usage Counters**: One row per user per calendar month, lazily created
//! - **Subscription State**: Free, grace period, and premium tiers with lazy expiry
//! - **Reconciliation**: Idempotent, ordered application of billing webhooks
//! - **Event Log**: Append-only audit trail of usage and tier changes
//! - **Invariants**: Runnable consistency checks over quota state

pub mod error;
pub mod events;
pub mod gate;
pub mod invariants;
pub mod policy;
pub mod reconciler;
pub mod subscription;
pub mod usage;


// Error
pub use error::{QuotaError, QuotaResult};

// Policy
pub use policy::FeatureLimits;

// Usage
pub use usage::UsageCounter;

// Subscription
pub use subscription::{
    default_free, effective_tier, SubscriptionSnapshot, SubscriptionStore,
};

// Events
pub use events::{EventQuery, NewUsageEvent, UsageEventLog};

// Gate
pub use gate::{ChargeReceipt, FeatureUsage, QuotaCheck, QuotaGate, UsageSummary};

// Reconciler
pub use reconciler::{
    grace_period_days, Applied, BillingEvent, BillingEventData, BillingObject, BillingReconciler,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main quota service that combines all quota functionality
pub struct QuotaService {
    pub subscriptions: Arc<SubscriptionStore>,
    pub usage: Arc<UsageCounter>,
    pub events: Arc<UsageEventLog>,
    pub gate: QuotaGate,
    pub reconciler: BillingReconciler,
    pub invariants: InvariantChecker,
}

impl QuotaService {
    /// Create a new quota service from environment variables
    pub fn from_env(pool: PgPool) -> QuotaResult<Self> {
        let webhook_secret = std::env::var("BILLING_WEBHOOK_SECRET")
            .map_err(|_| QuotaError::Internal("BILLING_WEBHOOK_SECRET must be set".to_string()))?;
        Ok(Self::new(pool, webhook_secret))
    }

    /// Create a new quota service with an explicit webhook secret
    pub fn new(pool: PgPool, webhook_secret: String) -> Self {
        let subscriptions = Arc::new(SubscriptionStore::new(pool.clone()));
        let usage = Arc::new(UsageCounter::new(pool.clone()));
        let events = Arc::new(UsageEventLog::new(pool.clone()));

        Self {
            gate: QuotaGate::new(
                pool.clone(),
                subscriptions.clone(),
                usage.clone(),
                events.clone(),
            ),
            reconciler: BillingReconciler::new(
                pool.clone(),
                subscriptions.clone(),
                events.clone(),
                webhook_secret,
            ),
            invariants: InvariantChecker::new(pool),
            subscriptions,
            usage,
            events,
        }
    }
}
