//! Billing Invariants Module
//!
//! Runnable consistency checks over subscriptions and coupons. Each check is a
//! read-only SQL query; violations carry enough context to debug the row.

use regdesk_shared::PlanTier;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plans::PlanCatalog;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Organization(s) affected; empty for coupon-level checks
    pub org_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Access or charges may be wrong
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleCurrentRow {
    organization_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct TermsMismatchRow {
    id: Uuid,
    organization_id: Uuid,
    plan_tier: String,
    registration_limit: i64,
    amount: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingCancelTimestampRow {
    id: Uuid,
    organization_id: Uuid,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct OverdueCancellationRow {
    id: Uuid,
    organization_id: Uuid,
    period_end: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct CouponUsesRow {
    id: Uuid,
    code: String,
    current_uses: i64,
    redemption_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct RedemptionAmountsRow {
    id: Uuid,
    organization_id: Uuid,
    original_amount: i64,
    discount_applied: i64,
    final_amount: i64,
}

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
    catalog: PlanCatalog,
}

impl InvariantChecker {
    pub fn new(pool: PgPool, catalog: PlanCatalog) -> Self {
        Self { pool, catalog }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_current_subscription().await?);
        violations.extend(self.check_catalog_terms_match().await?);
        violations.extend(self.check_cancellations_timestamped().await?);
        violations.extend(self.check_no_overdue_cancellations().await?);
        violations.extend(self.check_coupon_uses_match_redemptions().await?);
        violations.extend(self.check_redemption_amounts().await?);

        Ok(InvariantCheckSummary::from_violations(now, violations))
    }

    /// Invariant 1: At most one `active` or `canceling` subscription per organization
    async fn check_single_current_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleCurrentRow> = sqlx::query_as(
            r#"
            SELECT organization_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('active', 'canceling')
            GROUP BY organization_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_current_subscription".to_string(),
                org_ids: vec![row.organization_id],
                description: format!(
                    "Organization has {} current subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Current subscriptions carry the catalog limit and price for their tier
    async fn check_catalog_terms_match(&self) -> BillingResult<Vec<InvariantViolation>> {
        let free = self.catalog.plan(PlanTier::Free);
        let standard = self.catalog.plan(PlanTier::Standard);
        let enterprise = self.catalog.plan(PlanTier::Enterprise);

        let rows: Vec<TermsMismatchRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, plan_tier, registration_limit, amount
            FROM subscriptions
            WHERE status IN ('active', 'canceling')
              AND (
                  (plan_tier = 'free' AND (registration_limit <> $1 OR amount <> $2))
                  OR (plan_tier = 'standard' AND (registration_limit <> $3 OR amount <> $4))
                  OR (plan_tier = 'enterprise' AND (registration_limit <> $5 OR amount <> $6))
              )
            "#,
        )
        .bind(free.registration_limit)
        .bind(free.monthly_price_cents)
        .bind(standard.registration_limit)
        .bind(standard.monthly_price_cents)
        .bind(enterprise.registration_limit)
        .bind(enterprise.monthly_price_cents)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "catalog_terms_match".to_string(),
                org_ids: vec![row.organization_id],
                description: format!(
                    "Subscription on '{}' has limit {} and amount {} that differ from the catalog",
                    row.plan_tier, row.registration_limit, row.amount
                ),
                context: serde_json::json!({
                    "subscription_id": row.id,
                    "plan_tier": row.plan_tier,
                    "registration_limit": row.registration_limit,
                    "amount": row.amount,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: Every canceling or canceled subscription records when it was canceled
    async fn check_cancellations_timestamped(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingCancelTimestampRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, status
            FROM subscriptions
            WHERE status IN ('canceling', 'canceled')
              AND canceled_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cancellations_timestamped".to_string(),
                org_ids: vec![row.organization_id],
                description: format!("Subscription is '{}' with no canceled_at", row.status),
                context: serde_json::json!({
                    "subscription_id": row.id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: The finalizer keeps up
    ///
    /// A `canceling` row more than two hours past its period end means the
    /// finalizer has stopped running and the organization still has paid access.
    async fn check_no_overdue_cancellations(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverdueCancellationRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, period_end
            FROM subscriptions
            WHERE status = 'canceling'
              AND period_end < NOW() - INTERVAL '2 hours'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_overdue_cancellations".to_string(),
                org_ids: vec![row.organization_id],
                description: format!(
                    "Subscription is still canceling after its period ended at {}",
                    row.period_end
                ),
                context: serde_json::json!({
                    "subscription_id": row.id,
                    "period_end": row.period_end.unix_timestamp(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: A coupon's use count equals its number of redemptions
    async fn check_coupon_uses_match_redemptions(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CouponUsesRow> = sqlx::query_as(
            r#"
            SELECT c.id, c.code, c.current_uses, COUNT(r.id) as redemption_count
            FROM coupons c
            LEFT JOIN coupon_redemptions r ON r.coupon_id = c.id
            GROUP BY c.id, c.code, c.current_uses
            HAVING c.current_uses <> COUNT(r.id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "coupon_uses_match_redemptions".to_string(),
                org_ids: vec![],
                description: format!(
                    "Coupon '{}' counts {} uses but has {} redemptions",
                    row.code, row.current_uses, row.redemption_count
                ),
                context: serde_json::json!({
                    "coupon_id": row.id,
                    "current_uses": row.current_uses,
                    "redemption_count": row.redemption_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: Redemption amounts add up and are never negative
    async fn check_redemption_amounts(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RedemptionAmountsRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, original_amount, discount_applied, final_amount
            FROM coupon_redemptions
            WHERE final_amount <> original_amount - discount_applied
               OR final_amount < 0
               OR discount_applied < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "redemption_amounts".to_string(),
                org_ids: vec![row.organization_id],
                description: format!(
                    "Redemption amounts do not add up: {} - {} != {}",
                    row.original_amount, row.discount_applied, row.final_amount
                ),
                context: serde_json::json!({
                    "redemption_id": row.id,
                    "original_amount": row.original_amount,
                    "discount_applied": row.discount_applied,
                    "final_amount": row.final_amount,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_current_subscription" => self.check_single_current_subscription().await,
            "catalog_terms_match" => self.check_catalog_terms_match().await,
            "cancellations_timestamped" => self.check_cancellations_timestamped().await,
            "no_overdue_cancellations" => self.check_no_overdue_cancellations().await,
            "coupon_uses_match_redemptions" => self.check_coupon_uses_match_redemptions().await,
            "redemption_amounts" => self.check_redemption_amounts().await,
            other => Err(BillingError::InvalidInput(format!(
                "unknown invariant check '{}'",
                other
            ))),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_current_subscription",
            "catalog_terms_match",
            "cancellations_timestamped",
            "no_overdue_cancellations",
            "coupon_uses_match_redemptions",
            "redemption_amounts",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            org_ids: vec![Uuid::new_v4()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity: ViolationSeverity::High,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"single_current_subscription"));
        assert!(checks.contains(&"coupon_uses_match_redemptions"));
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::now_utc(),
            vec![
                violation("redemption_amounts"),
                violation("redemption_amounts"),
                violation("catalog_terms_match"),
            ],
        );
        assert_eq!(summary.checks_run, 6);
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 4);
        assert!(!summary.healthy);
    }

    #[test]
    fn test_empty_summary_is_healthy() {
        let summary = InvariantCheckSummary::from_violations(OffsetDateTime::now_utc(), vec![]);
        assert!(summary.healthy);
        assert_eq!(summary.checks_passed, 6);
    }
}
