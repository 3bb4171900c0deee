//! Storage traits for billing data
//!
//! Every write that the lifecycle relies on for correctness is a single atomic
//! operation at this seam: conditional increments, version-guarded whole-row
//! updates, and the coupon redemption (use count + redemption row together).

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{Coupon, Redemption, Subscription};

#[cfg(any(test, feature = "in-memory"))]
pub mod memory;
pub mod postgres;

#[cfg(any(test, feature = "in-memory"))]
pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// The authoritative subscription: the organization's row with the latest `period_start`
    async fn current_subscription(&self, org_id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Live count of registration records, used for the implicit free tier
    async fn count_registrations(&self, org_id: Uuid) -> BillingResult<i64>;

    /// Insert a new period row
    ///
    /// Fails with `ConcurrentModification` if the organization already has an
    /// `active` or `canceling` row.
    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()>;

    /// Write every field of `subscription` if the stored version still equals
    /// `expected_version`. Returns `Ok(false)` on a version mismatch.
    async fn save_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> BillingResult<bool>;

    /// Increment the registration counter only while it is below the limit and the
    /// subscription is entitled. Returns the new count, or `None` if refused.
    async fn try_increment_registration_count(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<i64>>;

    /// `canceling` rows whose `period_end` is before `now`, oldest first
    async fn find_expired_cancellations(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>>;

    /// Move an expired `canceling` row to `canceled`. Returns whether a row changed.
    async fn finalize_cancellation(
        &self,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;
}

#[async_trait]
pub trait CouponStore: Send + Sync {
    /// Fails with `AlreadyExists` when the code is taken
    async fn insert_coupon(&self, coupon: &Coupon) -> BillingResult<()>;

    async fn get_coupon(&self, coupon_id: Uuid) -> BillingResult<Option<Coupon>>;

    /// `code` must already be normalized
    async fn get_coupon_by_code(&self, code: &str) -> BillingResult<Option<Coupon>>;

    /// Update the definition of a coupon. `current_uses` is never written here; only
    /// [`CouponStore::record_redemption`] moves it. Returns whether the coupon exists.
    async fn update_coupon(&self, coupon: &Coupon) -> BillingResult<bool>;

    /// Newest first
    async fn list_coupons(&self, include_inactive: bool) -> BillingResult<Vec<Coupon>>;

    /// Atomically increment the coupon's `current_uses` (only while below `max_uses`)
    /// and insert the redemption. Returns `Ok(false)` and writes nothing when the
    /// coupon is exhausted or missing.
    async fn record_redemption(&self, redemption: &Redemption) -> BillingResult<bool>;

    /// Redemptions for one coupon, or all when `coupon_id` is `None`
    async fn list_redemptions(&self, coupon_id: Option<Uuid>) -> BillingResult<Vec<Redemption>>;
}

/// Everything the billing core persists
pub trait BillingStore: SubscriptionStore + CouponStore {}

impl<T: SubscriptionStore + CouponStore> BillingStore for T {}
