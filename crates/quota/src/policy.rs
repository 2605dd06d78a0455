//! Quota policy: the tier-to-limits table
//!
//! Pure lookup, no I/O. GRACE_PERIOD intentionally shares the free
//! limits: a lapsed-payment user keeps their data and a free-sized
//! allowance until the deadline passes or payment recovers.

use clipvault_shared::{Feature, Limit, SubscriptionTier};

/// Per-tier feature limits for one calendar-month period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureLimits {
    pub clips_per_month: Limit,
    pub files_per_month: Limit,
    pub focus_minutes_per_month: Limit,
    pub compact_minutes_per_month: Limit,
    /// Per-action validation ceiling, not a metered counter
    pub words_per_clip: Limit,
}

impl FeatureLimits {
    /// Look up the limits table for a tier
    pub fn for_tier(tier: SubscriptionTier) -> Self {
        match tier {
            SubscriptionTier::Free | SubscriptionTier::GracePeriod => Self::free(),
            SubscriptionTier::Premium => Self::premium(),
        }
    }

    fn free() -> Self {
        Self {
            clips_per_month: Limit::Count(100),
            files_per_month: Limit::Count(10),
            focus_minutes_per_month: Limit::Count(60),
            compact_minutes_per_month: Limit::Count(60),
            words_per_clip: Limit::Count(1_000),
        }
    }

    fn premium() -> Self {
        Self {
            clips_per_month: Limit::Unlimited,
            files_per_month: Limit::Unlimited,
            focus_minutes_per_month: Limit::Unlimited,
            compact_minutes_per_month: Limit::Unlimited,
            words_per_clip: Limit::Unlimited,
        }
    }

    /// The monthly limit governing a metered feature
    pub fn limit_for(&self, feature: Feature) -> Limit {
        match feature {
            Feature::Clips => self.clips_per_month,
            Feature::Files => self.files_per_month,
            Feature::FocusMinutes => self.focus_minutes_per_month,
            Feature::CompactMinutes => self.compact_minutes_per_month,
        }
    }
}
