//! Postgres implementation of the billing store

use async_trait::async_trait;
use regdesk_shared::{PlanTier, SubscriptionStatus};
use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{CouponStore, SubscriptionStore};
use crate::error::{BillingError, BillingResult};
use crate::models::{Coupon, DiscountType, Redemption, Subscription};

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, organization_id, plan_tier, status, registration_limit,
    current_registration_count, amount, currency, period_start, period_end,
    cancel_reason, canceled_at, version, created_at, updated_at
"#;

const COUPON_COLUMNS: &str = r#"
    id, code, description, discount_type, discount_value, currency, active,
    max_uses, current_uses, expires_at, applicable_plans, created_by,
    created_at, updated_at
"#;

/// Row type for subscriptions
#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    organization_id: Uuid,
    plan_tier: String,
    status: String,
    registration_limit: i64,
    current_registration_count: Option<i64>,
    amount: i64,
    currency: String,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    cancel_reason: Option<String>,
    canceled_at: Option<OffsetDateTime>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(Subscription {
            id: row.id,
            organization_id: row.organization_id,
            plan_tier: parse_column(&row.plan_tier)?,
            status: parse_column(&row.status)?,
            registration_limit: row.registration_limit,
            // A missing counter is treated as zero usage
            current_registration_count: row.current_registration_count.unwrap_or(0),
            amount: row.amount,
            currency: row.currency,
            period_start: row.period_start,
            period_end: row.period_end,
            cancel_reason: row.cancel_reason,
            canceled_at: row.canceled_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Row type for coupons
#[derive(Debug, sqlx::FromRow)]
struct CouponRow {
    id: Uuid,
    code: String,
    description: Option<String>,
    discount_type: String,
    discount_value: Decimal,
    currency: String,
    active: bool,
    max_uses: Option<i64>,
    current_uses: i64,
    expires_at: Option<OffsetDateTime>,
    applicable_plans: Option<Vec<String>>,
    created_by: Option<Uuid>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<CouponRow> for Coupon {
    type Error = BillingError;

    fn try_from(row: CouponRow) -> BillingResult<Self> {
        let discount_type = match row.discount_type.as_str() {
            "percentage" => DiscountType::Percentage,
            "fixed" => DiscountType::Fixed,
            other => {
                return Err(BillingError::Database(format!(
                    "unknown discount type '{}' on coupon {}",
                    other, row.id
                )))
            }
        };
        let applicable_plans = row
            .applicable_plans
            .map(|plans| {
                plans
                    .iter()
                    .map(|p| parse_column::<PlanTier>(p))
                    .collect::<BillingResult<Vec<_>>>()
            })
            .transpose()?;

        Ok(Coupon {
            id: row.id,
            code: row.code,
            description: row.description,
            discount_type,
            discount_value: row.discount_value,
            currency: row.currency,
            active: row.active,
            max_uses: row.max_uses,
            current_uses: row.current_uses,
            expires_at: row.expires_at,
            applicable_plans,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Row type for coupon redemptions
#[derive(Debug, sqlx::FromRow)]
struct RedemptionRow {
    id: Uuid,
    coupon_id: Uuid,
    user_id: Uuid,
    organization_id: Uuid,
    subscription_id: Option<Uuid>,
    original_amount: i64,
    discount_applied: i64,
    final_amount: i64,
    redeemed_at: OffsetDateTime,
}

impl From<RedemptionRow> for Redemption {
    fn from(row: RedemptionRow) -> Self {
        Redemption {
            id: row.id,
            coupon_id: row.coupon_id,
            user_id: row.user_id,
            organization_id: row.organization_id,
            subscription_id: row.subscription_id,
            original_amount: row.original_amount,
            discount_applied: row.discount_applied,
            final_amount: row.final_amount,
            redeemed_at: row.redeemed_at,
        }
    }
}

fn parse_column<T>(raw: &str) -> BillingResult<T>
where
    T: std::str::FromStr<Err = regdesk_shared::ParseEnumError>,
{
    raw.parse()
        .map_err(|e: regdesk_shared::ParseEnumError| BillingError::Database(e.to_string()))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn plan_names(plans: &Option<Vec<PlanTier>>) -> Option<Vec<String>> {
    plans
        .as_ref()
        .map(|plans| plans.iter().map(|p| p.as_str().to_string()).collect())
}

/// Billing store backed by the shared Postgres database
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SubscriptionStore for PgBillingStore {
    async fn current_subscription(&self, org_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE organization_id = $1
            ORDER BY period_start DESC, created_at DESC
            LIMIT 1
            "#
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn count_registrations(&self, org_id: Uuid) -> BillingResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM registrations WHERE organization_id = $1")
                .bind(org_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, organization_id, plan_tier, status, registration_limit,
                current_registration_count, amount, currency, period_start, period_end,
                cancel_reason, canceled_at, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.organization_id)
        .bind(subscription.plan_tier.as_str())
        .bind(subscription.status.as_str())
        .bind(subscription.registration_limit)
        .bind(subscription.current_registration_count)
        .bind(subscription.amount)
        .bind(&subscription.currency)
        .bind(subscription.period_start)
        .bind(subscription.period_end)
        .bind(&subscription.cancel_reason)
        .bind(subscription.canceled_at)
        .bind(subscription.version)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(BillingError::ConcurrentModification(
                format!(
                    "organization {} already has a current subscription",
                    subscription.organization_id
                ),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> BillingResult<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE subscriptions SET
                plan_tier = $2,
                status = $3,
                registration_limit = $4,
                current_registration_count = $5,
                amount = $6,
                currency = $7,
                period_start = $8,
                period_end = $9,
                cancel_reason = $10,
                canceled_at = $11,
                updated_at = $12,
                version = version + 1
            WHERE id = $1 AND version = $13
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.plan_tier.as_str())
        .bind(subscription.status.as_str())
        .bind(subscription.registration_limit)
        .bind(subscription.current_registration_count)
        .bind(subscription.amount)
        .bind(&subscription.currency)
        .bind(subscription.period_start)
        .bind(subscription.period_end)
        .bind(&subscription.cancel_reason)
        .bind(subscription.canceled_at)
        .bind(subscription.updated_at)
        .bind(expected_version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn try_increment_registration_count(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<i64>> {
        let new_count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE subscriptions SET
                current_registration_count = COALESCE(current_registration_count, 0) + 1,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
              AND status IN ('active', 'canceling')
              AND COALESCE(current_registration_count, 0) < registration_limit
            RETURNING current_registration_count
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(new_count)
    }

    async fn find_expired_cancellations(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE status = 'canceling' AND period_end < $1
            ORDER BY period_end ASC
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn finalize_cancellation(
        &self,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = 'canceled',
                version = version + 1,
                updated_at = $2
            WHERE id = $1 AND status = 'canceling' AND period_end < $2
            "#,
        )
        .bind(subscription_id)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }
}

#[async_trait]
impl CouponStore for PgBillingStore {
    async fn insert_coupon(&self, coupon: &Coupon) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO coupons (
                id, code, description, discount_type, discount_value, currency, active,
                max_uses, current_uses, expires_at, applicable_plans, created_by,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(coupon.id)
        .bind(&coupon.code)
        .bind(&coupon.description)
        .bind(coupon.discount_type.as_str())
        .bind(coupon.discount_value)
        .bind(&coupon.currency)
        .bind(coupon.active)
        .bind(coupon.max_uses)
        .bind(coupon.current_uses)
        .bind(coupon.expires_at)
        .bind(plan_names(&coupon.applicable_plans))
        .bind(coupon.created_by)
        .bind(coupon.created_at)
        .bind(coupon.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(BillingError::AlreadyExists(format!(
                "coupon code {}",
                coupon.code
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_coupon(&self, coupon_id: Uuid) -> BillingResult<Option<Coupon>> {
        let row: Option<CouponRow> =
            sqlx::query_as(&format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE id = $1"))
                .bind(coupon_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Coupon::try_from).transpose()
    }

    async fn get_coupon_by_code(&self, code: &str) -> BillingResult<Option<Coupon>> {
        let row: Option<CouponRow> =
            sqlx::query_as(&format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE code = $1"))
                .bind(code)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Coupon::try_from).transpose()
    }

    async fn update_coupon(&self, coupon: &Coupon) -> BillingResult<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE coupons SET
                description = $2,
                discount_type = $3,
                discount_value = $4,
                currency = $5,
                active = $6,
                max_uses = $7,
                expires_at = $8,
                applicable_plans = $9,
                updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(coupon.id)
        .bind(&coupon.description)
        .bind(coupon.discount_type.as_str())
        .bind(coupon.discount_value)
        .bind(&coupon.currency)
        .bind(coupon.active)
        .bind(coupon.max_uses)
        .bind(coupon.expires_at)
        .bind(plan_names(&coupon.applicable_plans))
        .bind(coupon.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn list_coupons(&self, include_inactive: bool) -> BillingResult<Vec<Coupon>> {
        let rows: Vec<CouponRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COUPON_COLUMNS}
            FROM coupons
            WHERE active OR $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Coupon::try_from).collect()
    }

    async fn record_redemption(&self, redemption: &Redemption) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE coupons SET
                current_uses = current_uses + 1,
                updated_at = NOW()
            WHERE id = $1 AND (max_uses IS NULL OR current_uses < max_uses)
            "#,
        )
        .bind(redemption.coupon_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO coupon_redemptions (
                id, coupon_id, user_id, organization_id, subscription_id,
                original_amount, discount_applied, final_amount, redeemed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(redemption.id)
        .bind(redemption.coupon_id)
        .bind(redemption.user_id)
        .bind(redemption.organization_id)
        .bind(redemption.subscription_id)
        .bind(redemption.original_amount)
        .bind(redemption.discount_applied)
        .bind(redemption.final_amount)
        .bind(redemption.redeemed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_redemptions(&self, coupon_id: Option<Uuid>) -> BillingResult<Vec<Redemption>> {
        let rows: Vec<RedemptionRow> = sqlx::query_as(
            r#"
            SELECT id, coupon_id, user_id, organization_id, subscription_id,
                   original_amount, discount_applied, final_amount, redeemed_at
            FROM coupon_redemptions
            WHERE $1::UUID IS NULL OR coupon_id = $1
            ORDER BY redeemed_at ASC
            "#,
        )
        .bind(coupon_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Redemption::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_row_defaults_missing_count_to_zero() {
        let now = OffsetDateTime::now_utc();
        let row = SubscriptionRow {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            plan_tier: "standard".to_string(),
            status: "canceling".to_string(),
            registration_limit: 5_000,
            current_registration_count: None,
            amount: 1_900,
            currency: "usd".to_string(),
            period_start: now,
            period_end: now,
            cancel_reason: None,
            canceled_at: Some(now),
            version: 3,
            created_at: now,
            updated_at: now,
        };

        let sub = Subscription::try_from(row).unwrap();
        assert_eq!(sub.current_registration_count, 0);
        assert_eq!(sub.plan_tier, PlanTier::Standard);
        assert_eq!(sub.status, SubscriptionStatus::Canceling);
    }

    #[test]
    fn test_subscription_row_rejects_unknown_tier() {
        let now = OffsetDateTime::now_utc();
        let row = SubscriptionRow {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            plan_tier: "platinum".to_string(),
            status: "active".to_string(),
            registration_limit: 1,
            current_registration_count: Some(0),
            amount: 0,
            currency: "usd".to_string(),
            period_start: now,
            period_end: now,
            cancel_reason: None,
            canceled_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        assert!(matches!(
            Subscription::try_from(row),
            Err(BillingError::Database(_))
        ));
    }

    #[test]
    fn test_coupon_row_parses_plan_restrictions() {
        let now = OffsetDateTime::now_utc();
        let row = CouponRow {
            id: Uuid::new_v4(),
            code: "LAUNCH".to_string(),
            description: None,
            discount_type: "fixed".to_string(),
            discount_value: Decimal::from(500),
            currency: "usd".to_string(),
            active: true,
            max_uses: Some(10),
            current_uses: 2,
            expires_at: None,
            applicable_plans: Some(vec!["standard".to_string(), "enterprise".to_string()]),
            created_by: None,
            created_at: now,
            updated_at: now,
        };

        let coupon = Coupon::try_from(row).unwrap();
        assert_eq!(coupon.discount_type, DiscountType::Fixed);
        assert_eq!(
            coupon.applicable_plans,
            Some(vec![PlanTier::Standard, PlanTier::Enterprise])
        );
    }
}
