//! Registration limits and usage display
//!
//! Both components resolve the same data source: the organization's current
//! subscription when it still grants access, otherwise the implicit free tier with
//! usage derived from live registration records.

use std::sync::Arc;

use regdesk_shared::{PlanTier, SubscriptionStatus};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::models::Subscription;
use crate::store::{BillingStore, SubscriptionStore};

/// Where an organization's metered usage is counted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metered {
    /// A subscription row that still grants access (`active` or `canceling`)
    Tracked(Subscription),
    /// No entitled row: free tier, counted from registration records
    ImplicitFree { live_count: i64 },
}

impl Metered {
    /// Resolve the metering source for an organization
    ///
    /// A `canceling` row keeps full plan access until its period ends (see "Entitlement of
    /// `canceling` rows" in DESIGN.md), so it resolves to `Tracked`
    /// like an `active` one. Once the period has ended it no longer grants access,
    /// even before the finalizer has marked it `canceled`.
    pub async fn resolve(store: &dyn SubscriptionStore, org_id: Uuid) -> BillingResult<Self> {
        let now = OffsetDateTime::now_utc();
        match store.current_subscription(org_id).await? {
            Some(sub) if sub.grants_access(now) => Ok(Metered::Tracked(sub)),
            _ => {
                let live_count = store.count_registrations(org_id).await?;
                Ok(Metered::ImplicitFree { live_count })
            }
        }
    }

    pub fn plan_tier(&self) -> PlanTier {
        match self {
            Metered::Tracked(sub) => sub.plan_tier,
            Metered::ImplicitFree { .. } => PlanTier::Free,
        }
    }

    pub fn current_count(&self) -> i64 {
        match self {
            Metered::Tracked(sub) => sub.current_registration_count,
            Metered::ImplicitFree { live_count } => *live_count,
        }
    }

    /// Stored limit for tracked rows, catalog free limit otherwise
    pub fn limit(&self, config: &BillingConfig) -> i64 {
        match self {
            Metered::Tracked(sub) => sub.registration_limit,
            Metered::ImplicitFree { .. } => config.catalog.registration_limit(PlanTier::Free),
        }
    }
}

/// Outcome of a registration limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationCheck {
    pub allowed: bool,
    pub current_count: i64,
    pub limit: i64,
    pub remaining: i64,
    pub plan_tier: PlanTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_url: Option<String>,
}

impl RegistrationCheck {
    /// Allowed iff `current_count < limit`
    pub fn evaluate(
        config: &BillingConfig,
        plan_tier: PlanTier,
        current_count: i64,
        limit: i64,
    ) -> Self {
        let allowed = current_count < limit;
        let (message, upgrade_url) = if allowed {
            (None, None)
        } else {
            (
                Some(format!(
                    "Your organization has reached the {} plan limit of {} registrations. \
                     Upgrade your plan to accept more registrations.",
                    config.catalog.display_name(plan_tier),
                    limit
                )),
                Some(config.upgrade_url.clone()),
            )
        };

        Self {
            allowed,
            current_count,
            limit,
            remaining: (limit - current_count).max(0),
            plan_tier,
            message,
            upgrade_url,
        }
    }
}

/// Decides whether an organization may accept one more registration
#[derive(Clone)]
pub struct UsageLimitChecker {
    store: Arc<dyn BillingStore>,
    config: Arc<BillingConfig>,
}

impl UsageLimitChecker {
    pub fn new(store: Arc<dyn BillingStore>, config: Arc<BillingConfig>) -> Self {
        Self { store, config }
    }

    /// Read-only check. Callers that go on to persist a registration should use
    /// [`UsageLimitChecker::reserve_registration`] instead.
    pub async fn can_register(&self, org_id: Uuid) -> BillingResult<RegistrationCheck> {
        let metered = Metered::resolve(self.store.as_ref(), org_id).await?;
        let check = RegistrationCheck::evaluate(
            &self.config,
            metered.plan_tier(),
            metered.current_count(),
            metered.limit(&self.config),
        );

        if !check.allowed {
            tracing::info!(
                org_id = %org_id,
                plan_tier = %check.plan_tier,
                current_count = check.current_count,
                limit = check.limit,
                "Registration limit reached"
            );
        }
        Ok(check)
    }

    /// Check and claim one registration slot in a single step
    ///
    /// The counter is incremented only if it is still below the limit, so
    /// concurrent callers can never overshoot. An organization on the implicit free
    /// tier first gets a free-tier subscription row seeded with its live count, and
    /// the claim goes through that row's counter.
    pub async fn reserve_registration(&self, org_id: Uuid) -> BillingResult<RegistrationCheck> {
        let metered = Metered::resolve(self.store.as_ref(), org_id).await?;

        let sub = match metered {
            Metered::Tracked(sub) => sub,
            Metered::ImplicitFree { live_count } => {
                let limit = self.config.catalog.registration_limit(PlanTier::Free);
                if live_count >= limit {
                    return Ok(RegistrationCheck::evaluate(
                        &self.config,
                        PlanTier::Free,
                        live_count,
                        limit,
                    ));
                }
                match self.materialize_free_tier(org_id, live_count).await {
                    Ok(sub) => sub,
                    Err(BillingError::ConcurrentModification(detail)) => {
                        tracing::warn!(
                            org_id = %org_id,
                            detail = %detail,
                            "Free tier reservation raced with a subscription change"
                        );
                        return Ok(Self::raced(RegistrationCheck::evaluate(
                            &self.config,
                            PlanTier::Free,
                            live_count,
                            limit,
                        )));
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        match self.store.try_increment_registration_count(sub.id).await? {
            Some(new_count) => {
                tracing::debug!(
                    org_id = %org_id,
                    subscription_id = %sub.id,
                    new_count,
                    "Reserved registration slot"
                );
                let mut check = RegistrationCheck::evaluate(
                    &self.config,
                    sub.plan_tier,
                    new_count - 1,
                    sub.registration_limit,
                );
                check.current_count = new_count;
                check.remaining = (sub.registration_limit - new_count).max(0);
                Ok(check)
            }
            None => {
                // Refused: report against the latest state
                let check = self.can_register(org_id).await?;
                if check.allowed {
                    // Row changed between the read and the increment (upgrade, finalize)
                    tracing::warn!(
                        org_id = %org_id,
                        subscription_id = %sub.id,
                        "Registration reservation raced with a subscription change"
                    );
                    return Ok(Self::raced(check));
                }
                Ok(check)
            }
        }
    }

    /// Insert the free-tier row that meters an organization from now on
    ///
    /// If a concurrent reservation inserted it first, that row is used instead.
    async fn materialize_free_tier(
        &self,
        org_id: Uuid,
        live_count: i64,
    ) -> BillingResult<Subscription> {
        let now = OffsetDateTime::now_utc();

        // A lapsed `canceling` row still holds the one-current-row slot
        if let Some(current) = self.store.current_subscription(org_id).await? {
            if current.status == SubscriptionStatus::Canceling && !current.grants_access(now) {
                self.store.finalize_cancellation(current.id, now).await?;
            }
        }

        let mut sub = Subscription::new_period(
            org_id,
            PlanTier::Free,
            self.config.catalog.registration_limit(PlanTier::Free),
            self.config.catalog.monthly_price(PlanTier::Free),
            &self.config.currency,
            now,
            self.config.period_days,
        );
        sub.current_registration_count = live_count;

        match self.store.insert_subscription(&sub).await {
            Ok(()) => {
                tracing::info!(
                    org_id = %org_id,
                    subscription_id = %sub.id,
                    live_count,
                    "Started metering free tier organization"
                );
                Ok(sub)
            }
            Err(BillingError::ConcurrentModification(detail)) => {
                match self.store.current_subscription(org_id).await? {
                    Some(current) if current.grants_access(now) => Ok(current),
                    _ => Err(BillingError::ConcurrentModification(detail)),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn raced(check: RegistrationCheck) -> RegistrationCheck {
        RegistrationCheck {
            allowed: false,
            message: Some(
                "Your subscription changed while reserving a registration. Please retry."
                    .to_string(),
            ),
            ..check
        }
    }
}

/// Severity bucket for a usage percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Ok,
    Warning,
    Critical,
}

/// `< 80` ok, `80..95` warning, `>= 95` critical
pub fn calculate_usage_status(percentage: i64) -> UsageStatus {
    if percentage >= 95 {
        UsageStatus::Critical
    } else if percentage >= 80 {
        UsageStatus::Warning
    } else {
        UsageStatus::Ok
    }
}

/// `round(count / limit * 100)`, uncapped; 0 when the limit is 0
pub fn usage_percentage(current_count: i64, limit: i64) -> i64 {
    if limit <= 0 {
        return 0;
    }
    ((current_count as f64 / limit as f64) * 100.0).round() as i64
}

/// UI-ready usage metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageDisplayInfo {
    pub current_count: i64,
    pub limit: i64,
    pub percentage: i64,
    pub plan_tier: PlanTier,
    pub status: UsageStatus,
    pub remaining: i64,
}

impl UsageDisplayInfo {
    pub fn from_counts(plan_tier: PlanTier, current_count: i64, limit: i64) -> Self {
        let percentage = usage_percentage(current_count, limit);
        Self {
            current_count,
            limit,
            percentage,
            plan_tier,
            status: calculate_usage_status(percentage),
            remaining: (limit - current_count).max(0),
        }
    }
}

#[derive(Clone)]
pub struct UsageDisplay {
    store: Arc<dyn BillingStore>,
    config: Arc<BillingConfig>,
}

impl UsageDisplay {
    pub fn new(store: Arc<dyn BillingStore>, config: Arc<BillingConfig>) -> Self {
        Self { store, config }
    }

    pub async fn get_usage_display(&self, org_id: Uuid) -> BillingResult<UsageDisplayInfo> {
        let metered = Metered::resolve(self.store.as_ref(), org_id).await?;
        Ok(UsageDisplayInfo::from_counts(
            metered.plan_tier(),
            metered.current_count(),
            metered.limit(&self.config),
        ))
    }
}
