//! Quota state invariant checks
//!
//! Read-only sweeps over subscription and usage state, meant to run
//! from an operator task or an admin endpoint. A violation means a bug
//! or manual intervention elsewhere; nothing here repairs state.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::QuotaResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub user_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run every check and aggregate the results
    pub async fn run_all_checks(&self) -> QuotaResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        let mut checks_run = 0;
        let mut checks_failed = 0;

        for name in Self::available_checks() {
            checks_run += 1;
            let found = self.run_check(name).await?;
            if !found.is_empty() {
                checks_failed += 1;
                violations.extend(found);
            }
        }

        Ok(InvariantCheckSummary {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single named check
    pub async fn run_check(&self, name: &str) -> QuotaResult<Vec<InvariantViolation>> {
        match name {
            "premium_has_subscription_reference" => {
                self.check_premium_has_subscription_reference().await
            }
            "grace_has_deadline" => self.check_grace_has_deadline().await,
            "counters_non_negative" => self.check_counters_non_negative().await,
            "canceled_has_period_end" => self.check_canceled_has_period_end().await,
            "tier_value_canonical" => self.check_tier_value_canonical().await,
            "customer_maps_to_one_user" => self.check_customer_maps_to_one_user().await,
            _ => Ok(Vec::new()),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "premium_has_subscription_reference",
            "grace_has_deadline",
            "counters_non_negative",
            "canceled_has_period_end",
            "tier_value_canonical",
            "customer_maps_to_one_user",
        ]
    }

    /// A premium row without a provider subscription id cannot be
    /// reconciled against future billing events
    async fn check_premium_has_subscription_reference(
        &self,
    ) -> QuotaResult<Vec<InvariantViolation>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            user_id: Uuid,
        }

        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT user_id FROM subscriptions
            WHERE tier = 'premium' AND stripe_subscription_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let user_ids: Vec<Uuid> = rows.iter().map(|r| r.user_id).collect();
        Ok(vec![InvariantViolation {
            invariant: "premium_has_subscription_reference".to_string(),
            description: format!(
                "{} premium subscription(s) have no provider subscription id",
                user_ids.len()
            ),
            context: serde_json::json!({ "count": user_ids.len() }),
            user_ids,
            severity: ViolationSeverity::Critical,
        }])
    }

    /// A grace-period row without a deadline never expires
    async fn check_grace_has_deadline(&self) -> QuotaResult<Vec<InvariantViolation>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            user_id: Uuid,
        }

        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT user_id FROM subscriptions
            WHERE tier = 'grace_period' AND grace_period_expires_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let user_ids: Vec<Uuid> = rows.iter().map(|r| r.user_id).collect();
        Ok(vec![InvariantViolation {
            invariant: "grace_has_deadline".to_string(),
            description: format!(
                "{} grace-period subscription(s) have no expiry deadline",
                user_ids.len()
            ),
            context: serde_json::json!({ "count": user_ids.len() }),
            user_ids,
            severity: ViolationSeverity::High,
        }])
    }

    /// Counters only ever move up within a period; a negative value
    /// means a write bypassed the counter
    async fn check_counters_non_negative(&self) -> QuotaResult<Vec<InvariantViolation>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            user_id: Uuid,
            year: i32,
            month: i32,
        }

        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT user_id, year, month FROM usage_records
            WHERE clips_count < 0 OR files_count < 0
               OR focus_mode_minutes < 0 OR compact_mode_minutes < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let periods: Vec<String> = rows
            .iter()
            .map(|r| format!("{:04}-{:02}", r.year, r.month))
            .collect();
        Ok(vec![InvariantViolation {
            invariant: "counters_non_negative".to_string(),
            user_ids: rows.iter().map(|r| r.user_id).collect(),
            description: format!("{} usage record(s) hold negative counters", rows.len()),
            context: serde_json::json!({ "periods": periods }),
            severity: ViolationSeverity::Critical,
        }])
    }

    /// A canceled subscription must record when paid access ends
    async fn check_canceled_has_period_end(&self) -> QuotaResult<Vec<InvariantViolation>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            user_id: Uuid,
        }

        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT user_id FROM subscriptions
            WHERE status = 'canceled' AND current_period_end IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let user_ids: Vec<Uuid> = rows.iter().map(|r| r.user_id).collect();
        Ok(vec![InvariantViolation {
            invariant: "canceled_has_period_end".to_string(),
            description: format!(
                "{} canceled subscription(s) have no period end",
                user_ids.len()
            ),
            context: serde_json::json!({ "count": user_ids.len() }),
            user_ids,
            severity: ViolationSeverity::High,
        }])
    }

    /// Tier and status values outside the closed enums would fail every
    /// parse at the storage boundary
    async fn check_tier_value_canonical(&self) -> QuotaResult<Vec<InvariantViolation>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            user_id: Uuid,
            tier: String,
            status: String,
        }

        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT user_id, tier, status FROM subscriptions
            WHERE tier NOT IN ('free', 'grace_period', 'premium')
               OR status NOT IN ('active', 'trialing', 'past_due', 'canceled', 'unpaid')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<String> = rows
            .iter()
            .map(|r| format!("{}/{}", r.tier, r.status))
            .collect();
        Ok(vec![InvariantViolation {
            invariant: "tier_value_canonical".to_string(),
            user_ids: rows.iter().map(|r| r.user_id).collect(),
            description: format!(
                "{} subscription(s) hold non-canonical tier or status values",
                rows.len()
            ),
            context: serde_json::json!({ "values": values }),
            severity: ViolationSeverity::High,
        }])
    }

    /// One billing customer must not fan out to multiple users
    async fn check_customer_maps_to_one_user(&self) -> QuotaResult<Vec<InvariantViolation>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            stripe_customer_id: String,
            user_count: i64,
        }

        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT stripe_customer_id, COUNT(DISTINCT user_id) AS user_count
            FROM subscriptions
            WHERE stripe_customer_id IS NOT NULL
            GROUP BY stripe_customer_id
            HAVING COUNT(DISTINCT user_id) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let customers: Vec<&str> = rows.iter().map(|r| r.stripe_customer_id.as_str()).collect();
        Ok(vec![InvariantViolation {
            invariant: "customer_maps_to_one_user".to_string(),
            user_ids: Vec::new(),
            description: format!(
                "{} billing customer(s) map to more than one user",
                rows.len()
            ),
            context: serde_json::json!({
                "customers": customers,
                "user_counts": rows.iter().map(|r| r.user_count).collect::<Vec<_>>(),
            }),
            severity: ViolationSeverity::Critical,
        }])
    }
}
