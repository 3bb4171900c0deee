//! Persisted billing records

use regdesk_shared::{PlanTier, SubscriptionStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// One billing period of an organization's plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub plan_tier: PlanTier,
    pub status: SubscriptionStatus,
    pub registration_limit: i64,
    pub current_registration_count: i64,
    /// Monthly amount in minor currency units
    pub amount: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub cancel_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    /// Optimistic concurrency token, bumped on every whole-row write
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// A fresh active period starting at `now`; the registration count starts at 0
    pub fn new_period(
        organization_id: Uuid,
        plan_tier: PlanTier,
        registration_limit: i64,
        amount: i64,
        currency: &str,
        now: OffsetDateTime,
        period_days: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            plan_tier,
            status: SubscriptionStatus::Active,
            registration_limit,
            current_registration_count: 0,
            amount,
            currency: currency.to_string(),
            period_start: now,
            period_end: now + time::Duration::days(period_days),
            cancel_reason: None,
            canceled_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// `active`, or `canceling` with the paid period still running
    pub fn grants_access(&self, now: OffsetDateTime) -> bool {
        match self.status {
            SubscriptionStatus::Active => true,
            SubscriptionStatus::Canceling => self.period_end > now,
            SubscriptionStatus::Canceled => false,
        }
    }
}

/// How a coupon reduces a charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    /// `discount_value` is a percentage in `[0, 100]`
    Percentage,
    /// `discount_value` is an amount in minor currency units
    Fixed,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Percentage => "percentage",
            DiscountType::Fixed => "fixed",
        }
    }
}

impl std::fmt::Display for DiscountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A promotional discount definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: Uuid,
    /// Always trimmed and upper-case
    pub code: String,
    pub description: Option<String>,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub currency: String,
    pub active: bool,
    pub max_uses: Option<i64>,
    pub current_uses: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    /// `None` means the coupon applies to every plan
    pub applicable_plans: Option<Vec<PlanTier>>,
    pub created_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Coupon {
    /// Codes are case-insensitive: compare and store them trimmed and upper-cased
    pub fn normalize_code(code: &str) -> String {
        code.trim().to_uppercase()
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_uses.is_some_and(|max| self.current_uses >= max)
    }

    pub fn applies_to(&self, tier: PlanTier) -> bool {
        match &self.applicable_plans {
            Some(plans) if !plans.is_empty() => plans.contains(&tier),
            _ => true,
        }
    }
}

/// Immutable record of one successful coupon application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    pub id: Uuid,
    pub coupon_id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub original_amount: i64,
    pub discount_applied: i64,
    pub final_amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub redeemed_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coupon() -> Coupon {
        let now = OffsetDateTime::now_utc();
        Coupon {
            id: Uuid::new_v4(),
            code: "SPRING25".to_string(),
            description: None,
            discount_type: DiscountType::Percentage,
            discount_value: Decimal::from(25),
            currency: "usd".to_string(),
            active: true,
            max_uses: None,
            current_uses: 0,
            expires_at: None,
            applicable_plans: None,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(Coupon::normalize_code("  spring25 "), "SPRING25");
    }

    #[test]
    fn test_exhaustion() {
        let mut c = coupon();
        assert!(!c.is_exhausted());
        c.max_uses = Some(2);
        c.current_uses = 1;
        assert!(!c.is_exhausted());
        c.current_uses = 2;
        assert!(c.is_exhausted());
    }

    #[test]
    fn test_applicability() {
        let mut c = coupon();
        assert!(c.applies_to(PlanTier::Enterprise));
        c.applicable_plans = Some(vec![PlanTier::Standard]);
        assert!(c.applies_to(PlanTier::Standard));
        assert!(!c.applies_to(PlanTier::Enterprise));
        c.applicable_plans = Some(vec![]);
        assert!(c.applies_to(PlanTier::Enterprise));
    }

    #[test]
    fn test_new_period_window() {
        let now = OffsetDateTime::now_utc();
        let sub = Subscription::new_period(
            Uuid::new_v4(),
            PlanTier::Standard,
            5_000,
            1_900,
            "usd",
            now,
            30,
        );
        assert_eq!(sub.period_end - sub.period_start, time::Duration::days(30));
        assert_eq!(sub.current_registration_count, 0);
        assert!(sub.is_active());
    }

    #[test]
    fn test_grants_access_until_canceling_period_ends() {
        let now = OffsetDateTime::now_utc();
        let mut sub = Subscription::new_period(
            Uuid::new_v4(),
            PlanTier::Standard,
            5_000,
            1_900,
            "usd",
            now,
            30,
        );
        assert!(sub.grants_access(now));

        sub.status = SubscriptionStatus::Canceling;
        assert!(sub.grants_access(now));
        assert!(!sub.grants_access(sub.period_end));

        sub.status = SubscriptionStatus::Canceled;
        assert!(!sub.grants_access(now));
    }

    #[test]
    fn test_subscription_timestamps_serialize_as_rfc3339() {
        let now = time::macros::datetime!(2025-03-01 12:00 UTC);
        let sub =
            Subscription::new_period(Uuid::nil(), PlanTier::Free, 100, 0, "usd", now, 30);
        let json = serde_json::to_value(&sub).unwrap();
        assert_eq!(json["period_start"], "2025-03-01T12:00:00Z");
        assert_eq!(json["period_end"], "2025-03-31T12:00:00Z");
        assert_eq!(json["plan_tier"], "free");
    }
}
