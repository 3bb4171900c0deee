//! Subscription cancellation
//!
//! Canceling never ends access early: the subscription moves to `canceling` and
//! keeps its plan until `period_end`, after which the finalizer marks it `canceled`.

use std::sync::Arc;

use regdesk_shared::{PlanTier, SubscriptionStatus};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult, ErrorKind};
use crate::models::Subscription;
use crate::store::BillingStore;

/// Longest cancellation reason kept on the row
const MAX_REASON_LEN: usize = 1_000;

/// Whole days left until `period_end`, rounded up and never negative
pub fn days_remaining(period_end: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let remaining = period_end - now;
    if remaining <= Duration::ZERO {
        return 0;
    }
    let day = Duration::DAY.whole_nanoseconds();
    let nanos = remaining.whole_nanoseconds();
    ((nanos + day - 1) / day) as i64
}

fn format_date(at: OffsetDateTime) -> String {
    format!("{} {}, {}", at.month(), at.day(), at.year())
}

fn normalize_reason(reason: Option<String>) -> Option<String> {
    reason
        .map(|r| r.trim().chars().take(MAX_REASON_LEN).collect::<String>())
        .filter(|r| !r.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelPreview {
    #[serde(with = "time::serde::rfc3339")]
    pub access_until: OffsetDateTime,
    pub days_remaining: i64,
    pub will_exceed_free_limit: bool,
    pub registrations_over_free_limit: i64,
    /// Always 0; cancellations are not refunded
    pub refund_amount: i64,
    pub current_plan: PlanTier,
    pub current_registration_count: i64,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelResult {
    pub success: bool,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub access_until: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl CancelResult {
    fn failed(error: &BillingError) -> Self {
        Self {
            success: false,
            access_until: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionCancel {
    store: Arc<dyn BillingStore>,
    config: Arc<BillingConfig>,
}

impl SubscriptionCancel {
    pub fn new(store: Arc<dyn BillingStore>, config: Arc<BillingConfig>) -> Self {
        Self { store, config }
    }

    /// True iff the current subscription is active and paid
    pub async fn can_cancel(&self, org_id: Uuid) -> BillingResult<bool> {
        Ok(self
            .store
            .current_subscription(org_id)
            .await?
            .is_some_and(|sub| sub.is_active() && sub.plan_tier.is_paid()))
    }

    pub async fn preview_cancel(&self, org_id: Uuid) -> BillingResult<CancelPreview> {
        self.preview_cancel_at(org_id, OffsetDateTime::now_utc()).await
    }

    /// Preview evaluated at a fixed instant
    pub async fn preview_cancel_at(
        &self,
        org_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<CancelPreview> {
        let sub = match self.store.current_subscription(org_id).await? {
            Some(sub) if sub.status != SubscriptionStatus::Canceled => sub,
            _ => return Err(BillingError::NoActiveSubscription),
        };
        if !sub.plan_tier.is_paid() {
            return Err(BillingError::CannotCancelFree);
        }

        Ok(self.build_preview(&sub, now))
    }

    fn build_preview(&self, sub: &Subscription, now: OffsetDateTime) -> CancelPreview {
        let catalog = &self.config.catalog;
        let free_limit = catalog.registration_limit(PlanTier::Free);
        let count = sub.current_registration_count;
        let over = (count - free_limit).max(0);

        let mut summary = format!(
            "Your {} plan stays active until {}. After that your organization moves to the \
             Free plan with a limit of {} registrations.",
            catalog.display_name(sub.plan_tier),
            format_date(sub.period_end),
            free_limit,
        );
        if over > 0 {
            summary.push_str(&format!(
                " You currently have {} registrations, {} more than the Free plan allows. \
                 Existing registrations are kept, but new registrations will be blocked.",
                count, over
            ));
        }

        CancelPreview {
            access_until: sub.period_end,
            days_remaining: days_remaining(sub.period_end, now),
            will_exceed_free_limit: count > free_limit,
            registrations_over_free_limit: over,
            refund_amount: 0,
            current_plan: sub.plan_tier,
            current_registration_count: count,
            summary,
        }
    }

    /// Request cancellation at period end
    ///
    /// Validation and conflict failures come back as `success: false`; only
    /// infrastructure errors are returned as `Err`.
    pub async fn execute_cancel(
        &self,
        org_id: Uuid,
        reason: Option<String>,
    ) -> BillingResult<CancelResult> {
        let reason = normalize_reason(reason);
        let attempts = self.config.max_write_retries;

        for attempt in 1..=attempts {
            match self.try_cancel(org_id, reason.clone()).await {
                Ok(access_until) => {
                    tracing::info!(
                        org_id = %org_id,
                        access_until = %access_until,
                        has_reason = reason.is_some(),
                        "Subscription set to cancel at period end"
                    );
                    return Ok(CancelResult {
                        success: true,
                        access_until: Some(access_until),
                        error: None,
                        error_kind: None,
                    });
                }
                Err(BillingError::ConcurrentModification(detail)) => {
                    tracing::debug!(
                        org_id = %org_id,
                        attempt,
                        detail = %detail,
                        "Cancel lost a write race, retrying"
                    );
                }
                Err(e) if e.is_infrastructure() => return Err(e),
                Err(e) => {
                    tracing::info!(org_id = %org_id, error = %e, "Cancel rejected");
                    return Ok(CancelResult::failed(&e));
                }
            }
        }

        tracing::warn!(
            org_id = %org_id,
            attempts,
            "Cancel gave up after repeated concurrent modifications"
        );
        Ok(CancelResult::failed(&BillingError::ConcurrentModification(
            "the subscription changed while canceling, please retry".to_string(),
        )))
    }

    async fn try_cancel(
        &self,
        org_id: Uuid,
        reason: Option<String>,
    ) -> BillingResult<OffsetDateTime> {
        let sub = self
            .store
            .current_subscription(org_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription)?;

        if matches!(
            sub.status,
            SubscriptionStatus::Canceling | SubscriptionStatus::Canceled
        ) {
            return Err(BillingError::AlreadyCanceling);
        }
        if !sub.plan_tier.is_paid() {
            return Err(BillingError::CannotCancelFree);
        }

        let now = OffsetDateTime::now_utc();
        let expected_version = sub.version;
        let mut next = sub;
        next.status = SubscriptionStatus::Canceling;
        next.cancel_reason = reason;
        next.canceled_at = Some(now);
        next.updated_at = now;

        if !self.store.save_subscription(&next, expected_version).await? {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} version {}",
                next.id, expected_version
            )));
        }
        Ok(next.period_end)
    }
}
