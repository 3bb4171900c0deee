//! Plan upgrades
//!
//! Upgrades only ever move to a strictly higher tier and take effect immediately.
//! A full month at the target price is due on upgrade; nothing is prorated.

use std::sync::Arc;

use regdesk_shared::{PlanTier, SubscriptionStatus};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult, ErrorKind};
use crate::models::Subscription;
use crate::plans::format_cents;
use crate::store::BillingStore;

/// True iff `target` ranks strictly above `current`
pub fn is_valid_upgrade(current: PlanTier, target: PlanTier) -> bool {
    target.rank() > current.rank()
}

fn validate_transition(current: PlanTier, target: PlanTier) -> BillingResult<()> {
    if current == target {
        return Err(BillingError::SamePlan(target));
    }
    if !is_valid_upgrade(current, target) {
        return Err(BillingError::InvalidUpgrade {
            from: current,
            to: target,
        });
    }
    Ok(())
}

/// Tier used as the starting point of an upgrade
///
/// A `canceling` row inside its period still grants its plan, so moving off it
/// must rank above that plan too. Lapsed or `canceled` rows count as free.
fn upgrade_base_tier(current: Option<&Subscription>, now: OffsetDateTime) -> PlanTier {
    match current {
        Some(sub) if sub.grants_access(now) => sub.plan_tier,
        _ => PlanTier::Free,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradePreview {
    pub current_plan: PlanTier,
    pub target_plan: PlanTier,
    pub current_monthly_price: i64,
    pub new_monthly_price: i64,
    pub current_limit: i64,
    pub target_limit: i64,
    pub price_difference: i64,
    pub amount_due_now: i64,
    pub effective_immediately: bool,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_plan: Option<PlanTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl UpgradeResult {
    fn succeeded(new_plan: PlanTier, new_limit: i64) -> Self {
        Self {
            success: true,
            new_plan: Some(new_plan),
            new_limit: Some(new_limit),
            error: None,
            error_kind: None,
        }
    }

    fn failed(error: &BillingError) -> Self {
        Self {
            success: false,
            new_plan: None,
            new_limit: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }
}

/// Previews and executes moves to a higher plan tier
#[derive(Clone)]
pub struct PlanUpgrade {
    store: Arc<dyn BillingStore>,
    config: Arc<BillingConfig>,
}

impl PlanUpgrade {
    pub fn new(store: Arc<dyn BillingStore>, config: Arc<BillingConfig>) -> Self {
        Self { store, config }
    }

    /// Fails with `SamePlan` or `InvalidUpgrade` when `target` is not above the current tier
    pub async fn preview_upgrade(
        &self,
        org_id: Uuid,
        target: PlanTier,
    ) -> BillingResult<UpgradePreview> {
        let current_sub = self.store.current_subscription(org_id).await?;
        let current = upgrade_base_tier(current_sub.as_ref(), OffsetDateTime::now_utc());
        validate_transition(current, target)?;

        let catalog = &self.config.catalog;
        let current_price = catalog.monthly_price(current);
        let target_price = catalog.monthly_price(target);
        let target_limit = catalog.registration_limit(target);

        let summary = if current.is_paid() {
            format!(
                "Upgrade from {} ({}/month) to {} ({}/month). Your limit increases to {} \
                 registrations immediately and {} is due today.",
                catalog.display_name(current),
                format_cents(current_price),
                catalog.display_name(target),
                format_cents(target_price),
                target_limit,
                format_cents(target_price),
            )
        } else {
            format!(
                "Upgrade from {} to {} for {}/month. Your limit increases to {} \
                 registrations immediately and {} is due today.",
                catalog.display_name(current),
                catalog.display_name(target),
                format_cents(target_price),
                target_limit,
                format_cents(target_price),
            )
        };

        Ok(UpgradePreview {
            current_plan: current,
            target_plan: target,
            current_monthly_price: current_price,
            new_monthly_price: target_price,
            current_limit: catalog.registration_limit(current),
            target_limit,
            price_difference: target_price - current_price,
            amount_due_now: target_price,
            effective_immediately: true,
            summary,
        })
    }

    /// Apply an upgrade
    ///
    /// Validation and conflict failures come back as `success: false`; only
    /// infrastructure errors are returned as `Err`.
    pub async fn execute_upgrade(
        &self,
        org_id: Uuid,
        target: PlanTier,
    ) -> BillingResult<UpgradeResult> {
        let attempts = self.config.max_write_retries;

        for attempt in 1..=attempts {
            match self.try_upgrade(org_id, target).await {
                Ok(result) => {
                    tracing::info!(
                        org_id = %org_id,
                        new_plan = %target,
                        new_limit = result.new_limit,
                        "Subscription upgraded"
                    );
                    return Ok(result);
                }
                Err(BillingError::ConcurrentModification(detail)) => {
                    tracing::debug!(
                        org_id = %org_id,
                        attempt,
                        detail = %detail,
                        "Upgrade lost a write race, retrying"
                    );
                }
                Err(e) if e.is_infrastructure() => return Err(e),
                Err(e) => {
                    tracing::info!(
                        org_id = %org_id,
                        target = %target,
                        error = %e,
                        "Upgrade rejected"
                    );
                    return Ok(UpgradeResult::failed(&e));
                }
            }
        }

        tracing::warn!(
            org_id = %org_id,
            target = %target,
            attempts,
            "Upgrade gave up after repeated concurrent modifications"
        );
        Ok(UpgradeResult::failed(&BillingError::ConcurrentModification(
            "the subscription changed while upgrading, please retry".to_string(),
        )))
    }

    /// One read-modify-write attempt. A lost race surfaces as `ConcurrentModification`.
    async fn try_upgrade(&self, org_id: Uuid, target: PlanTier) -> BillingResult<UpgradeResult> {
        let now = OffsetDateTime::now_utc();
        let current_sub = self.store.current_subscription(org_id).await?;
        validate_transition(upgrade_base_tier(current_sub.as_ref(), now), target)?;

        let catalog = &self.config.catalog;
        let new_limit = catalog.registration_limit(target);
        let new_amount = catalog.monthly_price(target);

        match current_sub {
            // Period already over but not yet swept: close it out, then start fresh
            Some(sub)
                if sub.status == SubscriptionStatus::Canceling && sub.period_end < now =>
            {
                if !self.store.finalize_cancellation(sub.id, now).await? {
                    return Err(BillingError::ConcurrentModification(format!(
                        "subscription {} changed before it could be finalized",
                        sub.id
                    )));
                }
                self.insert_period(org_id, target, new_limit, new_amount, now)
                    .await?;
            }
            // Update in place: the registration count carries over
            Some(sub) if sub.status.is_entitled() => {
                let expected_version = sub.version;
                let mut next = sub;
                next.plan_tier = target;
                next.registration_limit = new_limit;
                next.amount = new_amount;
                next.updated_at = now;
                if next.status == SubscriptionStatus::Canceling {
                    // Upgrading out of a pending cancellation reactivates the period
                    next.status = SubscriptionStatus::Active;
                    next.cancel_reason = None;
                    next.canceled_at = None;
                }

                if !self.store.save_subscription(&next, expected_version).await? {
                    return Err(BillingError::ConcurrentModification(format!(
                        "subscription {} version {}",
                        next.id, expected_version
                    )));
                }
            }
            _ => {
                self.insert_period(org_id, target, new_limit, new_amount, now)
                    .await?;
            }
        }

        Ok(UpgradeResult::succeeded(target, new_limit))
    }

    async fn insert_period(
        &self,
        org_id: Uuid,
        tier: PlanTier,
        limit: i64,
        amount: i64,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let sub = Subscription::new_period(
            org_id,
            tier,
            limit,
            amount,
            &self.config.currency,
            now,
            self.config.period_days,
        );
        self.store.insert_subscription(&sub).await
    }
}
