//! Promotional coupons
//!
//! Validation, discount arithmetic, redemption tracking, administration and
//! analytics. Amounts are integers in minor currency units; discount math is done
//! in `Decimal` and rounded half away from zero.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use regdesk_shared::PlanTier;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::models::{Coupon, DiscountType, Redemption};
use crate::store::BillingStore;

/// Longest accepted coupon code
pub const MAX_CODE_LEN: usize = 64;

/// Smallest charge a partial discount may produce
const MIN_DISCOUNTED_AMOUNT: i64 = 100;

/// Rows returned in [`CouponAnalytics::top_users`]
const TOP_USERS_LIMIT: usize = 10;

/// Apply a discount to `amount`
///
/// The result is floored at 0 when `value >= 100` and at 100 otherwise, then
/// capped at `amount`. The floor compares the raw value for both discount types,
/// so a fixed discount of 100 cents or more also gets the 0 floor.
pub fn discounted_amount(discount_type: DiscountType, value: Decimal, amount: i64) -> i64 {
    let original = Decimal::from(amount);
    let raw = match discount_type {
        DiscountType::Percentage => original * (Decimal::ONE - value / Decimal::ONE_HUNDRED),
        DiscountType::Fixed => original - value,
    };
    let raw = raw
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0);

    let floor = if value >= Decimal::ONE_HUNDRED {
        0
    } else {
        MIN_DISCOUNTED_AMOUNT
    };
    raw.max(floor).min(amount)
}

/// What a valid coupon takes off
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CouponDiscount {
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CouponValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount: Option<CouponDiscount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscountPreview {
    pub code: String,
    pub original_amount: i64,
    pub discount_amount: i64,
    pub final_amount: i64,
}

/// Input for recording a redemption
#[derive(Debug, Clone, Deserialize)]
pub struct TrackUsage {
    pub code: String,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub original_amount: i64,
    pub discount_applied: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCoupon {
    pub code: String,
    pub description: Option<String>,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub currency: Option<String>,
    pub max_uses: Option<i64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub applicable_plans: Option<Vec<PlanTier>>,
    pub created_by: Option<Uuid>,
}

/// Partial update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CouponUpdate {
    pub description: Option<String>,
    pub discount_type: Option<DiscountType>,
    pub discount_value: Option<Decimal>,
    pub active: Option<bool>,
    pub max_uses: Option<i64>,
    /// Remove the usage cap; cannot be combined with `max_uses`
    #[serde(default)]
    pub clear_max_uses: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    /// Make the coupon non-expiring; cannot be combined with `expires_at`
    #[serde(default)]
    pub clear_expires_at: bool,
    /// An empty list removes the plan restriction
    pub applicable_plans: Option<Vec<PlanTier>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopCouponUser {
    pub user_id: Uuid,
    pub redemptions: i64,
    pub total_discount: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CouponAnalytics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_id: Option<Uuid>,
    pub total_redemptions: i64,
    pub total_discount: i64,
    pub average_discount: f64,
    /// Redemptions per distinct coupon that was redeemed
    pub redemption_rate: f64,
    pub top_users: Vec<TopCouponUser>,
}

fn validate_code(code: &str) -> BillingResult<()> {
    if code.is_empty() {
        return Err(BillingError::InvalidInput("coupon code is required".into()));
    }
    if code.len() > MAX_CODE_LEN {
        return Err(BillingError::InvalidInput(format!(
            "coupon code must be at most {} characters",
            MAX_CODE_LEN
        )));
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(BillingError::InvalidInput(
            "coupon code may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(())
}

fn validate_discount(discount_type: DiscountType, value: Decimal) -> BillingResult<()> {
    if value.is_sign_negative() {
        return Err(BillingError::InvalidInput(
            "discount value must not be negative".into(),
        ));
    }
    if discount_type == DiscountType::Percentage && value > Decimal::ONE_HUNDRED {
        return Err(BillingError::InvalidInput(
            "percentage discount must be between 0 and 100".into(),
        ));
    }
    Ok(())
}

fn validate_max_uses(max_uses: Option<i64>, current_uses: i64) -> BillingResult<()> {
    match max_uses {
        Some(max) if max < 1 => Err(BillingError::InvalidInput(
            "max uses must be at least 1".into(),
        )),
        Some(max) if max < current_uses => Err(BillingError::InvalidInput(format!(
            "max uses cannot be lower than the {} redemptions already recorded",
            current_uses
        ))),
        _ => Ok(()),
    }
}

fn non_empty_plans(plans: Option<Vec<PlanTier>>) -> Option<Vec<PlanTier>> {
    plans.filter(|p| !p.is_empty())
}

/// Coupon validation, application and administration
#[derive(Clone)]
pub struct CouponEngine {
    store: Arc<dyn BillingStore>,
    config: Arc<BillingConfig>,
}

impl CouponEngine {
    pub fn new(store: Arc<dyn BillingStore>, config: Arc<BillingConfig>) -> Self {
        Self { store, config }
    }

    /// Load a coupon and check that it can be used right now
    async fn usable_coupon(&self, code: &str) -> BillingResult<Coupon> {
        let coupon = self
            .store
            .get_coupon_by_code(&Coupon::normalize_code(code))
            .await?
            .ok_or(BillingError::CouponNotFound)?;

        if !coupon.active {
            return Err(BillingError::CouponInactive);
        }
        if coupon.is_expired(OffsetDateTime::now_utc()) {
            return Err(BillingError::CouponExpired);
        }
        if coupon.is_exhausted() {
            return Err(BillingError::CouponExhausted);
        }
        Ok(coupon)
    }

    /// Check a code without applying it. Only infrastructure failures are `Err`.
    pub async fn validate_coupon(&self, code: &str) -> BillingResult<CouponValidation> {
        match self.usable_coupon(code).await {
            Ok(coupon) => Ok(CouponValidation {
                valid: true,
                error: None,
                discount: Some(CouponDiscount {
                    code: coupon.code,
                    discount_type: coupon.discount_type,
                    discount_value: coupon.discount_value,
                    currency: coupon.currency,
                }),
            }),
            Err(e) if e.is_infrastructure() => Err(e),
            Err(e) => Ok(CouponValidation {
                valid: false,
                error: Some(e.to_string()),
                discount: None,
            }),
        }
    }

    /// Discounted amount for a charge on `plan_tier`
    pub async fn apply_coupon(
        &self,
        code: &str,
        amount: i64,
        plan_tier: PlanTier,
    ) -> BillingResult<i64> {
        Ok(self.preview_discount(code, amount, plan_tier).await?.final_amount)
    }

    pub async fn preview_discount(
        &self,
        code: &str,
        amount: i64,
        plan_tier: PlanTier,
    ) -> BillingResult<DiscountPreview> {
        if amount < 0 {
            return Err(BillingError::InvalidInput(
                "amount must not be negative".into(),
            ));
        }
        let coupon = self.usable_coupon(code).await?;
        if !coupon.applies_to(plan_tier) {
            return Err(BillingError::CouponNotApplicable);
        }

        let final_amount = discounted_amount(coupon.discount_type, coupon.discount_value, amount);
        Ok(DiscountPreview {
            code: coupon.code,
            original_amount: amount,
            discount_amount: amount - final_amount,
            final_amount,
        })
    }

    /// Record one redemption and consume one use of the coupon
    ///
    /// The use count and the redemption row are written together; a coupon that
    /// has reached `max_uses` fails with `CouponExhausted` and nothing is written.
    pub async fn track_coupon_usage(&self, usage: TrackUsage) -> BillingResult<Redemption> {
        if usage.original_amount < 0 || usage.discount_applied < 0 {
            return Err(BillingError::InvalidInput(
                "amounts must not be negative".into(),
            ));
        }
        if usage.discount_applied > usage.original_amount {
            return Err(BillingError::InvalidInput(
                "discount cannot exceed the original amount".into(),
            ));
        }

        let coupon = self
            .store
            .get_coupon_by_code(&Coupon::normalize_code(&usage.code))
            .await?
            .ok_or(BillingError::CouponNotFound)?;

        let redemption = Redemption {
            id: Uuid::new_v4(),
            coupon_id: coupon.id,
            user_id: usage.user_id,
            organization_id: usage.organization_id,
            subscription_id: usage.subscription_id,
            original_amount: usage.original_amount,
            discount_applied: usage.discount_applied,
            final_amount: usage.original_amount - usage.discount_applied,
            redeemed_at: OffsetDateTime::now_utc(),
        };

        if !self.store.record_redemption(&redemption).await? {
            tracing::info!(
                coupon_id = %coupon.id,
                code = %coupon.code,
                org_id = %usage.organization_id,
                "Coupon redemption refused, no uses left"
            );
            return Err(BillingError::CouponExhausted);
        }

        tracing::info!(
            coupon_id = %coupon.id,
            code = %coupon.code,
            org_id = %usage.organization_id,
            user_id = %usage.user_id,
            discount_applied = usage.discount_applied,
            "Coupon redeemed"
        );
        Ok(redemption)
    }

    /// Apply a coupon to a charge and record the redemption
    pub async fn redeem_coupon(
        &self,
        code: &str,
        user_id: Uuid,
        organization_id: Uuid,
        subscription_id: Option<Uuid>,
        amount: i64,
        plan_tier: PlanTier,
    ) -> BillingResult<Redemption> {
        let preview = self.preview_discount(code, amount, plan_tier).await?;
        self.track_coupon_usage(TrackUsage {
            code: preview.code,
            user_id,
            organization_id,
            subscription_id,
            original_amount: preview.original_amount,
            discount_applied: preview.discount_amount,
        })
        .await
    }

    pub async fn create_coupon(&self, new: NewCoupon) -> BillingResult<Coupon> {
        let code = Coupon::normalize_code(&new.code);
        validate_code(&code)?;
        validate_discount(new.discount_type, new.discount_value)?;
        validate_max_uses(new.max_uses, 0)?;

        let now = OffsetDateTime::now_utc();
        let coupon = Coupon {
            id: Uuid::new_v4(),
            code,
            description: new.description,
            discount_type: new.discount_type,
            discount_value: new.discount_value,
            currency: new
                .currency
                .map(|c| c.trim().to_lowercase())
                .unwrap_or_else(|| self.config.currency.clone()),
            active: true,
            max_uses: new.max_uses,
            current_uses: 0,
            expires_at: new.expires_at,
            applicable_plans: non_empty_plans(new.applicable_plans),
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_coupon(&coupon).await?;

        tracing::info!(
            coupon_id = %coupon.id,
            code = %coupon.code,
            discount_type = %coupon.discount_type,
            "Coupon created"
        );
        Ok(coupon)
    }

    pub async fn get_coupon(&self, coupon_id: Uuid) -> BillingResult<Coupon> {
        self.store
            .get_coupon(coupon_id)
            .await?
            .ok_or(BillingError::CouponNotFound)
    }

    pub async fn get_coupon_by_code(&self, code: &str) -> BillingResult<Coupon> {
        self.store
            .get_coupon_by_code(&Coupon::normalize_code(code))
            .await?
            .ok_or(BillingError::CouponNotFound)
    }

    pub async fn update_coupon(
        &self,
        coupon_id: Uuid,
        update: CouponUpdate,
    ) -> BillingResult<Coupon> {
        if update.clear_max_uses && update.max_uses.is_some() {
            return Err(BillingError::InvalidInput(
                "max_uses and clear_max_uses cannot both be set".to_string(),
            ));
        }
        if update.clear_expires_at && update.expires_at.is_some() {
            return Err(BillingError::InvalidInput(
                "expires_at and clear_expires_at cannot both be set".to_string(),
            ));
        }
        let mut coupon = self.get_coupon(coupon_id).await?;

        if let Some(description) = update.description {
            coupon.description = Some(description);
        }
        if let Some(discount_type) = update.discount_type {
            coupon.discount_type = discount_type;
        }
        if let Some(value) = update.discount_value {
            coupon.discount_value = value;
        }
        if let Some(active) = update.active {
            coupon.active = active;
        }
        if update.clear_max_uses {
            coupon.max_uses = None;
        } else if let Some(max_uses) = update.max_uses {
            coupon.max_uses = Some(max_uses);
        }
        if update.clear_expires_at {
            coupon.expires_at = None;
        } else if let Some(expires_at) = update.expires_at {
            coupon.expires_at = Some(expires_at);
        }
        if let Some(plans) = update.applicable_plans {
            coupon.applicable_plans = non_empty_plans(Some(plans));
        }
        validate_discount(coupon.discount_type, coupon.discount_value)?;
        validate_max_uses(coupon.max_uses, coupon.current_uses)?;
        coupon.updated_at = OffsetDateTime::now_utc();

        if !self.store.update_coupon(&coupon).await? {
            return Err(BillingError::CouponNotFound);
        }
        tracing::info!(coupon_id = %coupon.id, code = %coupon.code, "Coupon updated");
        Ok(coupon)
    }

    pub async fn deactivate_coupon(&self, coupon_id: Uuid) -> BillingResult<Coupon> {
        self.update_coupon(
            coupon_id,
            CouponUpdate {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn list_coupons(&self, include_inactive: bool) -> BillingResult<Vec<Coupon>> {
        self.store.list_coupons(include_inactive).await
    }

    /// Redemption statistics for one coupon, or across all coupons
    pub async fn get_coupon_analytics(
        &self,
        coupon_id: Option<Uuid>,
    ) -> BillingResult<CouponAnalytics> {
        if let Some(id) = coupon_id {
            self.get_coupon(id).await?;
        }
        let redemptions = self.store.list_redemptions(coupon_id).await?;
        Ok(summarize_redemptions(coupon_id, &redemptions))
    }
}

fn summarize_redemptions(coupon_id: Option<Uuid>, redemptions: &[Redemption]) -> CouponAnalytics {
    let total_redemptions = redemptions.len() as i64;
    let total_discount: i64 = redemptions.iter().map(|r| r.discount_applied).sum();
    let distinct_coupons = redemptions
        .iter()
        .map(|r| r.coupon_id)
        .collect::<HashSet<_>>()
        .len();

    let (average_discount, redemption_rate) = if total_redemptions == 0 {
        (0.0, 0.0)
    } else {
        (
            total_discount as f64 / total_redemptions as f64,
            total_redemptions as f64 / distinct_coupons as f64,
        )
    };

    let mut per_user: HashMap<Uuid, (i64, i64)> = HashMap::new();
    for r in redemptions {
        let entry = per_user.entry(r.user_id).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += r.discount_applied;
    }
    let mut top_users: Vec<TopCouponUser> = per_user
        .into_iter()
        .map(|(user_id, (redemptions, total_discount))| TopCouponUser {
            user_id,
            redemptions,
            total_discount,
        })
        .collect();
    top_users.sort_by(|a, b| {
        b.redemptions
            .cmp(&a.redemptions)
            .then(b.total_discount.cmp(&a.total_discount))
            .then(a.user_id.cmp(&b.user_id))
    });
    top_users.truncate(TOP_USERS_LIMIT);

    CouponAnalytics {
        coupon_id,
        total_redemptions,
        total_discount,
        average_discount,
        redemption_rate,
        top_users,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CouponStore, InMemoryBillingStore};
    use time::Duration;

    fn engine() -> (InMemoryBillingStore, CouponEngine) {
        let store = InMemoryBillingStore::new();
        let engine = CouponEngine::new(
            Arc::new(store.clone()),
            Arc::new(BillingConfig::default()),
        );
        (store, engine)
    }

    fn new_coupon(code: &str, discount_type: DiscountType, value: i64) -> NewCoupon {
        NewCoupon {
            code: code.to_string(),
            description: None,
            discount_type,
            discount_value: Decimal::from(value),
            currency: None,
            max_uses: None,
            expires_at: None,
            applicable_plans: None,
            created_by: None,
        }
    }

    fn usage(code: &str, user_id: Uuid, original: i64, discount: i64) -> TrackUsage {
        TrackUsage {
            code: code.to_string(),
            user_id,
            organization_id: Uuid::new_v4(),
            subscription_id: None,
            original_amount: original,
            discount_applied: discount,
        }
    }

    #[test]
    fn test_discount_examples() {
        let pct = DiscountType::Percentage;
        let fixed = DiscountType::Fixed;
        assert_eq!(discounted_amount(pct, Decimal::from(25), 10_000), 7_500);
        assert_eq!(discounted_amount(fixed, Decimal::from(500), 2_000), 1_500);
        assert_eq!(discounted_amount(pct, Decimal::from(100), 2_999), 0);
    }

    #[test]
    fn test_partial_discount_floor_is_one_dollar() {
        assert_eq!(
            discounted_amount(DiscountType::Percentage, Decimal::from(99), 1_000),
            100
        );
        assert_eq!(
            discounted_amount(DiscountType::Fixed, Decimal::from(50), 120),
            100
        );
    }

    /// Known quirk: the 0 floor keys off the raw value, so a fixed discount of
    /// 100 cents or more can take a charge to 0 instead of the one-dollar floor.
    #[test]
    fn test_large_fixed_discount_uses_zero_floor() {
        assert_eq!(
            discounted_amount(DiscountType::Fixed, Decimal::from(5_000), 3_000),
            0
        );
        assert_eq!(
            discounted_amount(DiscountType::Fixed, Decimal::from(100), 150),
            50
        );
        assert_eq!(
            discounted_amount(DiscountType::Fixed, Decimal::from(99), 150),
            100
        );
    }

    #[test]
    fn test_result_never_exceeds_original() {
        assert_eq!(
            discounted_amount(DiscountType::Fixed, Decimal::from(10), 50),
            50
        );
        assert_eq!(
            discounted_amount(DiscountType::Percentage, Decimal::ZERO, 0),
            0
        );
    }

    #[test]
    fn test_fractional_results_round_half_away_from_zero() {
        // 33% of 1005 leaves 673.35
        assert_eq!(
            discounted_amount(DiscountType::Percentage, Decimal::from(33), 1_005),
            673
        );
        // 12.5% of 1004 leaves 878.5
        assert_eq!(
            discounted_amount(DiscountType::Percentage, Decimal::new(125, 1), 1_004),
            879
        );
    }

    #[tokio::test]
    async fn test_validate_messages() {
        let (store, engine) = engine();

        let missing = engine.validate_coupon("nope").await.unwrap();
        assert!(!missing.valid);
        assert_eq!(missing.error.as_deref(), Some("Coupon not found"));

        let coupon = engine
            .create_coupon(new_coupon(" spring25 ", DiscountType::Percentage, 25))
            .await
            .unwrap();
        assert_eq!(coupon.code, "SPRING25");
        let ok = engine.validate_coupon("Spring25").await.unwrap();
        assert!(ok.valid);
        assert_eq!(ok.discount.unwrap().discount_value, Decimal::from(25));

        let mut expired = coupon.clone();
        expired.expires_at = Some(OffsetDateTime::now_utc() - Duration::hours(1));
        store.update_coupon(&expired).await.unwrap();
        let result = engine.validate_coupon("SPRING25").await.unwrap();
        assert_eq!(result.error.as_deref(), Some("Coupon has expired"));

        engine.deactivate_coupon(coupon.id).await.unwrap();
        let result = engine.validate_coupon("SPRING25").await.unwrap();
        assert_eq!(result.error.as_deref(), Some("Coupon is inactive"));
    }

    #[tokio::test]
    async fn test_exhausted_coupon() {
        let (_, engine) = engine();
        let mut new = new_coupon("ONCE", DiscountType::Fixed, 500);
        new.max_uses = Some(1);
        engine.create_coupon(new).await.unwrap();

        engine
            .track_coupon_usage(usage("once", Uuid::new_v4(), 2_000, 500))
            .await
            .unwrap();

        let result = engine.validate_coupon("ONCE").await.unwrap();
        assert_eq!(
            result.error.as_deref(),
            Some("Coupon has reached maximum uses")
        );
        let err = engine
            .track_coupon_usage(usage("ONCE", Uuid::new_v4(), 2_000, 500))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::CouponExhausted));
    }

    #[tokio::test]
    async fn test_apply_checks_plan_restriction() {
        let (_, engine) = engine();
        let mut new = new_coupon("TEAMS", DiscountType::Percentage, 25);
        new.applicable_plans = Some(vec![PlanTier::Enterprise]);
        engine.create_coupon(new).await.unwrap();

        let err = engine
            .apply_coupon("teams", 1_900, PlanTier::Standard)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Coupon not applicable to this plan");

        let amount = engine
            .apply_coupon("teams", 10_000, PlanTier::Enterprise)
            .await
            .unwrap();
        assert_eq!(amount, 7_500);
    }

    #[tokio::test]
    async fn test_apply_unknown_coupon_errors() {
        let (_, engine) = engine();
        let err = engine
            .apply_coupon("GHOST", 1_000, PlanTier::Standard)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Coupon not found");
    }

    #[tokio::test]
    async fn test_track_usage_increments_once_and_records_once() {
        let (store, engine) = engine();
        let coupon = engine
            .create_coupon(new_coupon("SAVE5", DiscountType::Fixed, 500))
            .await
            .unwrap();

        let redemption = engine
            .track_coupon_usage(usage("save5", Uuid::new_v4(), 2_000, 500))
            .await
            .unwrap();
        assert_eq!(redemption.final_amount, 1_500);
        assert_eq!(redemption.coupon_id, coupon.id);

        let stored = engine.get_coupon(coupon.id).await.unwrap();
        assert_eq!(stored.current_uses, 1);
        assert_eq!(store.list_redemptions(Some(coupon.id)).await.unwrap().len(), 1);

        let err = engine
            .track_coupon_usage(usage("MISSING", Uuid::new_v4(), 2_000, 500))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::CouponNotFound));
    }

    #[tokio::test]
    async fn test_redeem_applies_and_tracks() {
        let (_, engine) = engine();
        engine
            .create_coupon(new_coupon("QUARTER", DiscountType::Percentage, 25))
            .await
            .unwrap();

        let redemption = engine
            .redeem_coupon(
                "quarter",
                Uuid::new_v4(),
                Uuid::new_v4(),
                None,
                1_900,
                PlanTier::Standard,
            )
            .await
            .unwrap();
        assert_eq!(redemption.original_amount, 1_900);
        assert_eq!(redemption.final_amount, 1_425);
        assert_eq!(redemption.discount_applied, 475);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_definitions() {
        let (_, engine) = engine();

        let err = engine
            .create_coupon(new_coupon("BIG", DiscountType::Percentage, 150))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));

        let err = engine
            .create_coupon(new_coupon("   ", DiscountType::Fixed, 100))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));

        let mut zero_uses = new_coupon("ZERO", DiscountType::Fixed, 100);
        zero_uses.max_uses = Some(0);
        assert!(engine.create_coupon(zero_uses).await.is_err());

        engine
            .create_coupon(new_coupon("DUP", DiscountType::Fixed, 100))
            .await
            .unwrap();
        let err = engine
            .create_coupon(new_coupon("dup", DiscountType::Fixed, 200))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_update_cannot_lower_max_uses_below_current() {
        let (_, engine) = engine();
        let mut new = new_coupon("CAP", DiscountType::Fixed, 100);
        new.max_uses = Some(5);
        let coupon = engine.create_coupon(new).await.unwrap();
        for _ in 0..3 {
            engine
                .track_coupon_usage(usage("CAP", Uuid::new_v4(), 1_000, 100))
                .await
                .unwrap();
        }

        let err = engine
            .update_coupon(
                coupon.id,
                CouponUpdate {
                    max_uses: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));

        let updated = engine
            .update_coupon(
                coupon.id,
                CouponUpdate {
                    max_uses: Some(3),
                    applicable_plans: Some(vec![]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.current_uses, 3);
        assert_eq!(updated.applicable_plans, None);
    }

    #[tokio::test]
    async fn test_update_clears_max_uses_and_expiry() {
        let (_, engine) = engine();
        let mut new = new_coupon("LIMITED", DiscountType::Percentage, 10);
        new.max_uses = Some(5);
        new.expires_at = Some(OffsetDateTime::now_utc() + Duration::days(7));
        let coupon = engine.create_coupon(new).await.unwrap();

        let err = engine
            .update_coupon(
                coupon.id,
                CouponUpdate {
                    max_uses: Some(10),
                    clear_max_uses: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));

        let cleared = engine
            .update_coupon(
                coupon.id,
                CouponUpdate {
                    clear_max_uses: true,
                    clear_expires_at: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(cleared.max_uses, None);
        assert_eq!(cleared.expires_at, None);

        let stored = engine.get_coupon(coupon.id).await.unwrap();
        assert_eq!(stored.max_uses, None);
        assert_eq!(stored.expires_at, None);
    }

    #[tokio::test]
    async fn test_list_hides_inactive_by_default() {
        let (_, engine) = engine();
        let keep = engine
            .create_coupon(new_coupon("KEEP", DiscountType::Fixed, 100))
            .await
            .unwrap();
        let gone = engine
            .create_coupon(new_coupon("GONE", DiscountType::Fixed, 100))
            .await
            .unwrap();
        engine.deactivate_coupon(gone.id).await.unwrap();

        let active = engine.list_coupons(false).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, keep.id);
        assert_eq!(engine.list_coupons(true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_analytics() {
        let (_, engine) = engine();
        let a = engine
            .create_coupon(new_coupon("AAA", DiscountType::Fixed, 500))
            .await
            .unwrap();
        engine
            .create_coupon(new_coupon("BBB", DiscountType::Fixed, 300))
            .await
            .unwrap();

        let heavy = Uuid::new_v4();
        let light = Uuid::new_v4();
        engine.track_coupon_usage(usage("AAA", heavy, 2_000, 500)).await.unwrap();
        engine.track_coupon_usage(usage("AAA", heavy, 2_000, 500)).await.unwrap();
        engine.track_coupon_usage(usage("BBB", light, 2_000, 300)).await.unwrap();
        engine.track_coupon_usage(usage("BBB", heavy, 2_000, 300)).await.unwrap();

        let all = engine.get_coupon_analytics(None).await.unwrap();
        assert_eq!(all.total_redemptions, 4);
        assert_eq!(all.total_discount, 1_600);
        assert_eq!(all.average_discount, 400.0);
        assert_eq!(all.redemption_rate, 2.0);
        assert_eq!(all.top_users[0].user_id, heavy);
        assert_eq!(all.top_users[0].redemptions, 3);
        assert_eq!(all.top_users[0].total_discount, 1_300);
        assert_eq!(all.top_users[1].user_id, light);

        let one = engine.get_coupon_analytics(Some(a.id)).await.unwrap();
        assert_eq!(one.total_redemptions, 2);
        assert_eq!(one.redemption_rate, 2.0);
        assert_eq!(one.top_users.len(), 1);

        let err = engine
            .get_coupon_analytics(Some(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::CouponNotFound));
    }

    #[test]
    fn test_empty_analytics() {
        let analytics = summarize_redemptions(None, &[]);
        assert_eq!(analytics.total_redemptions, 0);
        assert_eq!(analytics.average_discount, 0.0);
        assert_eq!(analytics.redemption_rate, 0.0);
        assert!(analytics.top_users.is_empty());
    }
}
