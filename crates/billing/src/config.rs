//! Billing configuration
//!
//! Constructed once at startup and passed explicitly to each component.

use regdesk_shared::PlanTier;

use crate::error::{BillingError, BillingResult};
use crate::plans::{PlanCatalog, PlanDefinition};

/// Longest billing period a deployment may configure
pub const MAX_PERIOD_DAYS: i64 = 366;

/// Where users are sent when a limit blocks them
pub const DEFAULT_UPGRADE_URL: &str = "/dashboard/billing/upgrade";

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub catalog: PlanCatalog,
    /// ISO currency code for subscription charges (lowercase, e.g. `usd`)
    pub currency: String,
    /// Length of a billing period created by an upgrade
    pub period_days: i64,
    pub upgrade_url: String,
    /// Attempts for an optimistic subscription write before giving up
    pub max_write_retries: u32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            catalog: PlanCatalog::default(),
            currency: "usd".to_string(),
            period_days: 30,
            upgrade_url: DEFAULT_UPGRADE_URL.to_string(),
            max_write_retries: 3,
        }
    }
}

impl BillingConfig {
    /// Load configuration from environment variables, falling back to defaults
    ///
    /// Per-tier overrides: `PLAN_<TIER>_PRICE_CENTS`, `PLAN_<TIER>_REGISTRATION_LIMIT`.
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let catalog = PlanCatalog::new(
            plan_from_env(PlanDefinition::free())?,
            plan_from_env(PlanDefinition::standard())?,
            plan_from_env(PlanDefinition::enterprise())?,
        );

        let config = Self {
            catalog,
            currency: std::env::var("BILLING_CURRENCY")
                .map(|c| c.trim().to_lowercase())
                .unwrap_or(defaults.currency),
            period_days: env_parse("BILLING_PERIOD_DAYS")?.unwrap_or(defaults.period_days),
            upgrade_url: std::env::var("BILLING_UPGRADE_URL").unwrap_or(defaults.upgrade_url),
            max_write_retries: env_parse("BILLING_MAX_WRITE_RETRIES")?
                .unwrap_or(defaults.max_write_retries),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BillingResult<()> {
        if !(1..=MAX_PERIOD_DAYS).contains(&self.period_days) {
            return Err(BillingError::Config(format!(
                "BILLING_PERIOD_DAYS must be between 1 and {}",
                MAX_PERIOD_DAYS
            )));
        }
        if self.max_write_retries == 0 {
            return Err(BillingError::Config(
                "BILLING_MAX_WRITE_RETRIES must be at least 1".to_string(),
            ));
        }
        for plan in self.catalog.plans() {
            if plan.monthly_price_cents < 0 || plan.registration_limit < 0 {
                return Err(BillingError::Config(format!(
                    "plan '{}' has a negative price or limit",
                    plan.tier
                )));
            }
        }
        if self.catalog.monthly_price(PlanTier::Free) != 0 {
            return Err(BillingError::Config(
                "the free plan must not carry a price".to_string(),
            ));
        }
        Ok(())
    }
}

fn plan_from_env(mut plan: PlanDefinition) -> BillingResult<PlanDefinition> {
    let prefix = format!("PLAN_{}", plan.tier.as_str().to_uppercase());
    if let Some(price) = env_parse(&format!("{}_PRICE_CENTS", prefix))? {
        plan.monthly_price_cents = price;
    }
    if let Some(limit) = env_parse(&format!("{}_REGISTRATION_LIMIT", prefix))? {
        plan.registration_limit = limit;
    }
    Ok(plan)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> BillingResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| BillingError::Config(format!("{} has an invalid value '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}
