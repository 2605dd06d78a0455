//! Common types used across ClipVault

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Subscription tier for quota enforcement
///
/// GracePeriod is a real stored tier, not a status flag: a premium user
/// whose payment failed keeps it until the grace deadline passes or the
/// billing provider resolves the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    GracePeriod,
    Premium,
}

impl Default for SubscriptionTier {
    fn default() -> Self {
        Self::Free
    }
}

impl SubscriptionTier {
    /// Ordering used to classify tier changes as upgrades or downgrades.
    /// Free: 0, GracePeriod: 1, Premium: 2
    pub fn rank(&self) -> u8 {
        match self {
            Self::Free => 0,
            Self::GracePeriod => 1,
            Self::Premium => 2,
        }
    }

    /// Whether this tier meters usage against finite limits
    pub fn is_metered(&self) -> bool {
        !matches!(self, Self::Premium)
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::GracePeriod => write!(f, "grace_period"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

impl std::str::FromStr for SubscriptionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "grace_period" => Ok(Self::GracePeriod),
            "premium" => Ok(Self::Premium),
            _ => Err(format!("Invalid subscription tier: {}", s)),
        }
    }
}

/// Subscription status as reported by the billing provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Trialing => write!(f, "trialing"),
            Self::PastDue => write!(f, "past_due"),
            Self::Canceled => write!(f, "canceled"),
            Self::Unpaid => write!(f, "unpaid"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "unpaid" => Ok(Self::Unpaid),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

/// Metered feature
///
/// Each variant maps to exactly one counter column on `usage_records`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Clips,
    Files,
    FocusMinutes,
    CompactMinutes,
}

impl Feature {
    /// The `usage_records` column holding this feature's counter
    pub fn column(&self) -> &'static str {
        match self {
            Self::Clips => "clips_count",
            Self::Files => "files_count",
            Self::FocusMinutes => "focus_mode_minutes",
            Self::CompactMinutes => "compact_mode_minutes",
        }
    }

    pub fn all() -> [Feature; 4] {
        [
            Self::Clips,
            Self::Files,
            Self::FocusMinutes,
            Self::CompactMinutes,
        ]
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clips => write!(f, "clips"),
            Self::Files => write!(f, "files"),
            Self::FocusMinutes => write!(f, "focus_minutes"),
            Self::CompactMinutes => write!(f, "compact_minutes"),
        }
    }
}

impl std::str::FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clips" => Ok(Self::Clips),
            "files" => Ok(Self::Files),
            "focus_minutes" => Ok(Self::FocusMinutes),
            "compact_minutes" => Ok(Self::CompactMinutes),
            _ => Err(format!("Invalid feature: {}", s)),
        }
    }
}

/// Audit event type for the usage event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageEventType {
    ClipSent,
    FileUploaded,
    FocusModeStarted,
    FocusModeEnded,
    CompactModeStarted,
    CompactModeEnded,
    QuotaExceeded,
    SubscriptionUpgraded,
    SubscriptionDowngraded,
}

impl std::fmt::Display for UsageEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClipSent => write!(f, "clip_sent"),
            Self::FileUploaded => write!(f, "file_uploaded"),
            Self::FocusModeStarted => write!(f, "focus_mode_started"),
            Self::FocusModeEnded => write!(f, "focus_mode_ended"),
            Self::CompactModeStarted => write!(f, "compact_mode_started"),
            Self::CompactModeEnded => write!(f, "compact_mode_ended"),
            Self::QuotaExceeded => write!(f, "quota_exceeded"),
            Self::SubscriptionUpgraded => write!(f, "subscription_upgraded"),
            Self::SubscriptionDowngraded => write!(f, "subscription_downgraded"),
        }
    }
}

impl std::str::FromStr for UsageEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clip_sent" => Ok(Self::ClipSent),
            "file_uploaded" => Ok(Self::FileUploaded),
            "focus_mode_started" => Ok(Self::FocusModeStarted),
            "focus_mode_ended" => Ok(Self::FocusModeEnded),
            "compact_mode_started" => Ok(Self::CompactModeStarted),
            "compact_mode_ended" => Ok(Self::CompactModeEnded),
            "quota_exceeded" => Ok(Self::QuotaExceeded),
            "subscription_upgraded" => Ok(Self::SubscriptionUpgraded),
            "subscription_downgraded" => Ok(Self::SubscriptionDowngraded),
            _ => Err(format!("Invalid usage event type: {}", s)),
        }
    }
}

// =============================================================================
// Periods and Limits
// =============================================================================

/// Calendar-month quota period (UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    /// 1-12
    pub month: i32,
}

impl Period {
    pub fn new(year: i32, month: i32) -> Self {
        Self { year, month }
    }

    /// The period containing the current UTC instant
    pub fn current() -> Self {
        Self::containing(OffsetDateTime::now_utc())
    }

    /// The period containing a given instant (UTC)
    pub fn containing(at: OffsetDateTime) -> Self {
        Self {
            year: at.year(),
            month: at.month() as i32,
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// A quota ceiling
///
/// Unlimited is a distinguished sentinel, not a large number; no
/// arithmetic is ever done against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Count(i64),
    Unlimited,
}

impl Limit {
    /// Whether charging `amount` on top of `current` stays within the limit
    pub fn allows(&self, current: i64, amount: i64) -> bool {
        match self {
            Self::Count(max) => current + amount <= *max,
            Self::Unlimited => true,
        }
    }

    /// The finite ceiling, if any
    pub fn as_count(&self) -> Option<i64> {
        match self {
            Self::Count(max) => Some(*max),
            Self::Unlimited => None,
        }
    }

    /// Remaining headroom given current usage (None when unlimited)
    pub fn remaining(&self, current: i64) -> Option<i64> {
        self.as_count().map(|max| (max - current).max(0))
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Subscription model
///
/// Tier and status are stored as VARCHAR and parsed at the storage
/// boundary; rows never hold values outside the closed enums.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tier: String,
    pub status: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_price_id: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    /// Provider-scheduled cancellation time, if any
    pub cancel_at: Option<OffsetDateTime>,
    /// When the provider actually canceled the subscription
    pub canceled_at: Option<OffsetDateTime>,
    pub grace_period_expires_at: Option<OffsetDateTime>,
    /// Provider timestamp of the newest billing event applied to this row
    pub last_event_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Usage record model - one row per (user, year, month)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub year: i32,
    pub month: i32,
    pub clips_count: i64,
    pub files_count: i64,
    pub focus_mode_minutes: i64,
    pub compact_mode_minutes: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UsageRecord {
    /// Current count for a feature's counter
    pub fn count_for(&self, feature: Feature) -> i64 {
        match feature {
            Feature::Clips => self.clips_count,
            Feature::Files => self.files_count,
            Feature::FocusMinutes => self.focus_mode_minutes,
            Feature::CompactMinutes => self.compact_mode_minutes,
        }
    }

    /// An empty record for a period that has seen no usage yet
    pub fn empty(user_id: Uuid, period: Period) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::nil(),
            user_id,
            year: period.year,
            month: period.month,
            clips_count: 0,
            files_count: 0,
            focus_mode_minutes: 0,
            compact_mode_minutes: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Usage event model - append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Counter row this event charged, when it charged one
    pub usage_record_id: Option<Uuid>,
    /// Subscription row in effect at event time, when one existed
    pub subscription_id: Option<Uuid>,
    pub event_type: String,
    pub feature: Option<String>,
    pub amount: Option<i64>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// API Response Types
// =============================================================================

/// Paginated response wrapper
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, total: i64, page: i64, per_page: i64) -> Self {
        let total_pages = (total + per_page - 1) / per_page;
        Self {
            data,
            total,
            page,
            per_page,
            total_pages,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // SubscriptionTier Tests
    // =========================================================================

    #[test]
    fn test_subscription_tier_default() {
        assert_eq!(SubscriptionTier::default(), SubscriptionTier::Free);
    }

    #[test]
    fn test_subscription_tier_rank_ordering() {
        assert!(SubscriptionTier::Free.rank() < SubscriptionTier::GracePeriod.rank());
        assert!(SubscriptionTier::GracePeriod.rank() < SubscriptionTier::Premium.rank());
    }

    #[test]
    fn test_subscription_tier_display() {
        assert_eq!(format!("{}", SubscriptionTier::Free), "free");
        assert_eq!(format!("{}", SubscriptionTier::GracePeriod), "grace_period");
        assert_eq!(format!("{}", SubscriptionTier::Premium), "premium");
    }

    #[test]
    fn test_subscription_tier_from_str() {
        assert_eq!(
            "free".parse::<SubscriptionTier>().unwrap(),
            SubscriptionTier::Free
        );
        assert_eq!(
            "FREE".parse::<SubscriptionTier>().unwrap(),
            SubscriptionTier::Free
        );
        assert_eq!(
            "Grace_Period".parse::<SubscriptionTier>().unwrap(),
            SubscriptionTier::GracePeriod
        );
        assert_eq!(
            "PREMIUM".parse::<SubscriptionTier>().unwrap(),
            SubscriptionTier::Premium
        );
        assert!("gold".parse::<SubscriptionTier>().is_err());
        assert!("".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_subscription_tier_round_trip() {
        for tier in [
            SubscriptionTier::Free,
            SubscriptionTier::GracePeriod,
            SubscriptionTier::Premium,
        ] {
            assert_eq!(tier.to_string().parse::<SubscriptionTier>().unwrap(), tier);
        }
    }

    #[test]
    fn test_subscription_tier_metered() {
        assert!(SubscriptionTier::Free.is_metered());
        assert!(SubscriptionTier::GracePeriod.is_metered());
        assert!(!SubscriptionTier::Premium.is_metered());
    }

    // =========================================================================
    // SubscriptionStatus Tests
    // =========================================================================

    #[test]
    fn test_subscription_status_round_trip() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Unpaid,
        ] {
            assert_eq!(
                status.to_string().parse::<SubscriptionStatus>().unwrap(),
                status
            );
        }
        assert!("paused".parse::<SubscriptionStatus>().is_err());
    }

    // =========================================================================
    // Feature Tests
    // =========================================================================

    #[test]
    fn test_feature_columns_unique() {
        let columns: std::collections::HashSet<_> =
            Feature::all().iter().map(|f| f.column()).collect();
        assert_eq!(columns.len(), 4);
    }

    #[test]
    fn test_feature_from_str() {
        assert_eq!("clips".parse::<Feature>().unwrap(), Feature::Clips);
        assert_eq!("FILES".parse::<Feature>().unwrap(), Feature::Files);
        assert_eq!(
            "focus_minutes".parse::<Feature>().unwrap(),
            Feature::FocusMinutes
        );
        assert_eq!(
            "compact_minutes".parse::<Feature>().unwrap(),
            Feature::CompactMinutes
        );
        assert!("words".parse::<Feature>().is_err());
    }

    // =========================================================================
    // UsageEventType Tests
    // =========================================================================

    #[test]
    fn test_usage_event_type_round_trip() {
        for et in [
            UsageEventType::ClipSent,
            UsageEventType::FileUploaded,
            UsageEventType::FocusModeStarted,
            UsageEventType::FocusModeEnded,
            UsageEventType::CompactModeStarted,
            UsageEventType::CompactModeEnded,
            UsageEventType::QuotaExceeded,
            UsageEventType::SubscriptionUpgraded,
            UsageEventType::SubscriptionDowngraded,
        ] {
            assert_eq!(et.to_string().parse::<UsageEventType>().unwrap(), et);
        }
    }

    // =========================================================================
    // Period Tests
    // =========================================================================

    #[test]
    fn test_period_containing() {
        let at = time::macros::datetime!(2026-08-29 12:00:00 UTC);
        let period = Period::containing(at);
        assert_eq!(period, Period::new(2026, 8));
    }

    #[test]
    fn test_period_next_rolls_over_year() {
        assert_eq!(Period::new(2026, 8).next(), Period::new(2026, 9));
        assert_eq!(Period::new(2026, 12).next(), Period::new(2027, 1));
    }

    #[test]
    fn test_period_display() {
        assert_eq!(Period::new(2026, 8).to_string(), "2026-08");
        assert_eq!(Period::new(2026, 12).to_string(), "2026-12");
    }

    // =========================================================================
    // Limit Tests
    // =========================================================================

    #[test]
    fn test_limit_allows_at_boundary() {
        let limit = Limit::Count(100);
        assert!(limit.allows(99, 1)); // lands exactly on the limit
        assert!(!limit.allows(100, 1)); // would exceed
        assert!(limit.allows(0, 100));
        assert!(!limit.allows(0, 101));
    }

    #[test]
    fn test_limit_unlimited_always_allows() {
        assert!(Limit::Unlimited.allows(i64::MAX - 1, 1));
        assert_eq!(Limit::Unlimited.as_count(), None);
        assert_eq!(Limit::Unlimited.remaining(1_000_000), None);
    }

    #[test]
    fn test_limit_remaining_floors_at_zero() {
        let limit = Limit::Count(10);
        assert_eq!(limit.remaining(3), Some(7));
        assert_eq!(limit.remaining(10), Some(0));
        assert_eq!(limit.remaining(15), Some(0));
    }

    // =========================================================================
    // UsageRecord Tests
    // =========================================================================

    #[test]
    fn test_usage_record_empty_is_zeroed() {
        let record = UsageRecord::empty(Uuid::new_v4(), Period::new(2026, 8));
        for feature in Feature::all() {
            assert_eq!(record.count_for(feature), 0);
        }
        assert_eq!(record.year, 2026);
        assert_eq!(record.month, 8);
    }

    // =========================================================================
    // PaginatedResponse Tests
    // =========================================================================

    #[test]
    fn test_paginated_response() {
        let response = PaginatedResponse::new(vec![1, 2, 3, 4, 5], 100, 1, 10);
        assert_eq!(response.total_pages, 10);
    }

    #[test]
    fn test_paginated_response_partial_page() {
        let response = PaginatedResponse::new(vec![1, 2, 3], 23, 3, 10);
        assert_eq!(response.total_pages, 3);
    }

    // =========================================================================
    // ID Wrapper Tests
    // =========================================================================

    #[test]
    fn test_user_id_new_unique() {
        assert_ne!(UserId::new(), UserId::new());
    }

    #[test]
    fn test_user_id_from_uuid() {
        let uuid = Uuid::new_v4();
        let user_id: UserId = uuid.into();
        assert_eq!(user_id.0, uuid);
    }
}
