//! In-memory billing store for tests and local development
//!
//! One mutex guards all tables, so every trait method is atomic with respect to
//! every other, matching the guarantees of the Postgres statements.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{CouponStore, SubscriptionStore};
use crate::error::{BillingError, BillingResult};
use crate::models::{Coupon, Redemption, Subscription};
use regdesk_shared::SubscriptionStatus;

/// Cheap to clone; clones share the same tables
#[derive(Debug, Default, Clone)]
pub struct InMemoryBillingStore {
    inner: Arc<Mutex<Tables>>,
}

#[derive(Debug, Default)]
struct Tables {
    subscriptions: HashMap<Uuid, Subscription>,
    registrations: HashMap<Uuid, i64>,
    coupons: HashMap<Uuid, Coupon>,
    redemptions: Vec<Redemption>,
}

impl Tables {
    fn current_for(&self, org_id: Uuid) -> Option<&Subscription> {
        self.subscriptions
            .values()
            .filter(|s| s.organization_id == org_id)
            .max_by_key(|s| (s.period_start, s.created_at))
    }
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `count` live registrations for an organization
    pub async fn add_registrations(&self, org_id: Uuid, count: i64) {
        let mut tables = self.inner.lock().await;
        *tables.registrations.entry(org_id).or_insert(0) += count;
    }

    /// Insert a subscription row as-is, skipping the one-current-row check.
    /// Used to stage historical or legacy data.
    pub async fn seed_subscription(&self, subscription: Subscription) {
        let mut tables = self.inner.lock().await;
        tables.subscriptions.insert(subscription.id, subscription);
    }

    /// Every subscription row for an organization, oldest period first
    pub async fn subscriptions_for(&self, org_id: Uuid) -> Vec<Subscription> {
        let tables = self.inner.lock().await;
        let mut rows: Vec<Subscription> = tables
            .subscriptions
            .values()
            .filter(|s| s.organization_id == org_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.period_start);
        rows
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryBillingStore {
    async fn current_subscription(&self, org_id: Uuid) -> BillingResult<Option<Subscription>> {
        let tables = self.inner.lock().await;
        Ok(tables.current_for(org_id).cloned())
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>> {
        let tables = self.inner.lock().await;
        Ok(tables.subscriptions.get(&subscription_id).cloned())
    }

    async fn count_registrations(&self, org_id: Uuid) -> BillingResult<i64> {
        let tables = self.inner.lock().await;
        Ok(tables.registrations.get(&org_id).copied().unwrap_or(0))
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut tables = self.inner.lock().await;
        let has_current = tables.subscriptions.values().any(|s| {
            s.organization_id == subscription.organization_id && s.status.is_entitled()
        });
        if has_current && subscription.status.is_entitled() {
            return Err(BillingError::ConcurrentModification(format!(
                "organization {} already has a current subscription",
                subscription.organization_id
            )));
        }
        tables
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn save_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> BillingResult<bool> {
        let mut tables = self.inner.lock().await;
        match tables.subscriptions.get_mut(&subscription.id) {
            Some(stored) if stored.version == expected_version => {
                let mut next = subscription.clone();
                next.version = expected_version + 1;
                *stored = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_increment_registration_count(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<i64>> {
        let mut tables = self.inner.lock().await;
        let Some(sub) = tables.subscriptions.get_mut(&subscription_id) else {
            return Ok(None);
        };
        if !sub.status.is_entitled() || sub.current_registration_count >= sub.registration_limit {
            return Ok(None);
        }
        sub.current_registration_count += 1;
        sub.version += 1;
        sub.updated_at = OffsetDateTime::now_utc();
        Ok(Some(sub.current_registration_count))
    }

    async fn find_expired_cancellations(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let tables = self.inner.lock().await;
        let mut expired: Vec<Subscription> = tables
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Canceling && s.period_end < now)
            .cloned()
            .collect();
        expired.sort_by_key(|s| s.period_end);
        Ok(expired)
    }

    async fn finalize_cancellation(
        &self,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut tables = self.inner.lock().await;
        match tables.subscriptions.get_mut(&subscription_id) {
            Some(sub) if sub.status == SubscriptionStatus::Canceling && sub.period_end < now => {
                sub.status = SubscriptionStatus::Canceled;
                sub.version += 1;
                sub.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl CouponStore for InMemoryBillingStore {
    async fn insert_coupon(&self, coupon: &Coupon) -> BillingResult<()> {
        let mut tables = self.inner.lock().await;
        if tables.coupons.values().any(|c| c.code == coupon.code) {
            return Err(BillingError::AlreadyExists(format!(
                "coupon code {}",
                coupon.code
            )));
        }
        tables.coupons.insert(coupon.id, coupon.clone());
        Ok(())
    }

    async fn get_coupon(&self, coupon_id: Uuid) -> BillingResult<Option<Coupon>> {
        let tables = self.inner.lock().await;
        Ok(tables.coupons.get(&coupon_id).cloned())
    }

    async fn get_coupon_by_code(&self, code: &str) -> BillingResult<Option<Coupon>> {
        let tables = self.inner.lock().await;
        Ok(tables.coupons.values().find(|c| c.code == code).cloned())
    }

    async fn update_coupon(&self, coupon: &Coupon) -> BillingResult<bool> {
        let mut tables = self.inner.lock().await;
        let Some(stored) = tables.coupons.get_mut(&coupon.id) else {
            return Ok(false);
        };
        let current_uses = stored.current_uses;
        *stored = coupon.clone();
        stored.current_uses = current_uses;
        Ok(true)
    }

    async fn list_coupons(&self, include_inactive: bool) -> BillingResult<Vec<Coupon>> {
        let tables = self.inner.lock().await;
        let mut coupons: Vec<Coupon> = tables
            .coupons
            .values()
            .filter(|c| include_inactive || c.active)
            .cloned()
            .collect();
        coupons.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(coupons)
    }

    async fn record_redemption(&self, redemption: &Redemption) -> BillingResult<bool> {
        let mut tables = self.inner.lock().await;
        let Some(coupon) = tables.coupons.get_mut(&redemption.coupon_id) else {
            return Ok(false);
        };
        if coupon.is_exhausted() {
            return Ok(false);
        }
        coupon.current_uses += 1;
        coupon.updated_at = OffsetDateTime::now_utc();
        tables.redemptions.push(redemption.clone());
        Ok(true)
    }

    async fn list_redemptions(&self, coupon_id: Option<Uuid>) -> BillingResult<Vec<Redemption>> {
        let tables = self.inner.lock().await;
        Ok(tables
            .redemptions
            .iter()
            .filter(|r| coupon_id.map_or(true, |id| r.coupon_id == id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regdesk_shared::PlanTier;

    fn standard(org_id: Uuid) -> Subscription {
        Subscription::new_period(
            org_id,
            PlanTier::Standard,
            2,
            1_900,
            "usd",
            OffsetDateTime::now_utc(),
            30,
        )
    }

    #[tokio::test]
    async fn test_second_current_subscription_is_rejected() {
        let store = InMemoryBillingStore::new();
        let org_id = Uuid::new_v4();
        store.insert_subscription(&standard(org_id)).await.unwrap();

        let err = store
            .insert_subscription(&standard(org_id))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_stale_version_is_not_saved() {
        let store = InMemoryBillingStore::new();
        let mut sub = standard(Uuid::new_v4());
        store.insert_subscription(&sub).await.unwrap();

        assert!(store.save_subscription(&sub, 0).await.unwrap());
        sub.plan_tier = PlanTier::Enterprise;
        assert!(!store.save_subscription(&sub, 0).await.unwrap());

        let stored = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.plan_tier, PlanTier::Standard);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_increment_stops_at_limit() {
        let store = InMemoryBillingStore::new();
        let sub = standard(Uuid::new_v4());
        store.insert_subscription(&sub).await.unwrap();

        assert_eq!(
            store.try_increment_registration_count(sub.id).await.unwrap(),
            Some(1)
        );
        assert_eq!(
            store.try_increment_registration_count(sub.id).await.unwrap(),
            Some(2)
        );
        assert_eq!(
            store.try_increment_registration_count(sub.id).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_current_subscription_prefers_latest_period() {
        let store = InMemoryBillingStore::new();
        let org_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        let mut old = standard(org_id);
        old.period_start = now - time::Duration::days(60);
        old.status = SubscriptionStatus::Canceled;
        let new = standard(org_id);
        store.seed_subscription(old).await;
        store.seed_subscription(new.clone()).await;

        let current = store.current_subscription(org_id).await.unwrap().unwrap();
        assert_eq!(current.id, new.id);
    }
}
