//! Finalizer for expired cancellations
//!
//! The only writer that moves a subscription from `canceling` to `canceled`.
//! Safe to run repeatedly and concurrently with itself: each row is claimed by a
//! conditional update, so a row already finalized is skipped.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::Subscription;
use crate::store::BillingStore;

/// Counts from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FinalizerReport {
    /// Expired `canceling` rows found at the start of the sweep
    pub found: usize,
    pub finalized: usize,
    /// Rows another writer moved first
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct SubscriptionFinalizer {
    store: Arc<dyn BillingStore>,
}

impl SubscriptionFinalizer {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// `canceling` rows with `period_end < now`, oldest first
    pub async fn find_expired_cancellations(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        self.store.find_expired_cancellations(now).await
    }

    /// Returns `false` when the row was not `canceling` or its period has not ended
    pub async fn finalize_cancellation(
        &self,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        self.store.finalize_cancellation(subscription_id, now).await
    }

    /// Finalize every expired cancellation
    ///
    /// Per-row failures are logged and counted; a failure to list rows is returned.
    pub async fn run(&self, now: OffsetDateTime) -> BillingResult<FinalizerReport> {
        let expired = self.find_expired_cancellations(now).await?;
        let mut report = FinalizerReport {
            found: expired.len(),
            ..Default::default()
        };

        for sub in expired {
            match self.finalize_cancellation(sub.id, now).await {
                Ok(true) => {
                    report.finalized += 1;
                    tracing::info!(
                        org_id = %sub.organization_id,
                        subscription_id = %sub.id,
                        plan_tier = %sub.plan_tier,
                        period_end = %sub.period_end,
                        "Subscription canceled at period end"
                    );
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        org_id = %sub.organization_id,
                        subscription_id = %sub.id,
                        error = %e,
                        "Failed to finalize cancellation"
                    );
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryBillingStore, SubscriptionStore};
    use regdesk_shared::{PlanTier, SubscriptionStatus};
    use time::Duration;

    fn canceling(period_end: OffsetDateTime) -> Subscription {
        let mut sub = Subscription::new_period(
            Uuid::new_v4(),
            PlanTier::Standard,
            5_000,
            1_900,
            "usd",
            period_end - Duration::days(30),
            30,
        );
        sub.status = SubscriptionStatus::Canceling;
        sub.canceled_at = Some(sub.period_start);
        sub
    }

    #[tokio::test]
    async fn test_only_expired_rows_are_found_in_order() {
        let store = InMemoryBillingStore::new();
        let finalizer = SubscriptionFinalizer::new(Arc::new(store.clone()));
        let now = OffsetDateTime::now_utc();

        let older = canceling(now - Duration::days(3));
        let newer = canceling(now - Duration::hours(1));
        let future = canceling(now + Duration::days(5));
        let mut active = canceling(now - Duration::days(10));
        active.status = SubscriptionStatus::Active;
        for sub in [newer.clone(), future, older.clone(), active] {
            store.seed_subscription(sub).await;
        }

        let found = finalizer.find_expired_cancellations(now).await.unwrap();
        let ids: Vec<Uuid> = found.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
    }

    #[tokio::test]
    async fn test_run_finalizes_and_is_idempotent() {
        let store = InMemoryBillingStore::new();
        let finalizer = SubscriptionFinalizer::new(Arc::new(store.clone()));
        let now = OffsetDateTime::now_utc();

        let expired = canceling(now - Duration::days(1));
        let pending = canceling(now + Duration::days(1));
        store.seed_subscription(expired.clone()).await;
        store.seed_subscription(pending.clone()).await;

        let report = finalizer.run(now).await.unwrap();
        assert_eq!(
            report,
            FinalizerReport {
                found: 1,
                finalized: 1,
                skipped: 0,
                errors: 0
            }
        );

        let stored = store.get_subscription(expired.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Canceled);
        let untouched = store.get_subscription(pending.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, SubscriptionStatus::Canceling);

        let again = finalizer.run(now).await.unwrap();
        assert_eq!(again, FinalizerReport::default());
        assert!(!finalizer.finalize_cancellation(expired.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_unexpired_row_is_not_finalized_directly() {
        let store = InMemoryBillingStore::new();
        let finalizer = SubscriptionFinalizer::new(Arc::new(store.clone()));
        let now = OffsetDateTime::now_utc();
        let pending = canceling(now + Duration::hours(2));
        store.seed_subscription(pending.clone()).await;

        assert!(!finalizer.finalize_cancellation(pending.id, now).await.unwrap());
    }
}
