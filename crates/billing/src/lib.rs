// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError variants carry tier pairs and messages
#![allow(clippy::too_many_arguments)] // Redemption entry points take the full charge context
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::float_cmp))]

//! RegDesk Billing Module
//!
//! Subscription lifecycle and usage governance for registration desks.
//!
//! ## Features
//!
//! - **Plan Catalog**: Price, registration limit and rank per tier
//! - **Usage Limits**: Decide and reserve registrations against the current plan
//! - **Usage Display**: Percentage and status buckets for dashboards
//! - **Upgrades**: Preview and apply moves to a higher tier
//! - **Cancellation**: Cancel at period end, keeping access until then
//! - **Finalizer**: Periodic sweep from `canceling` to `canceled`
//! - **Coupons**: Validation, discount math, redemptions and analytics
//! - **Invariants**: Read-only consistency checks over billing tables

pub mod cancel;
pub mod config;
pub mod coupons;
pub mod error;
pub mod finalizer;
pub mod invariants;
pub mod models;
pub mod plans;
pub mod store;
pub mod upgrade;
pub mod usage;


use std::sync::Arc;

// Cancellation
pub use cancel::{days_remaining, CancelPreview, CancelResult, SubscriptionCancel};

// Config
pub use config::{BillingConfig, DEFAULT_UPGRADE_URL, MAX_PERIOD_DAYS};

// Coupons
pub use coupons::{
    discounted_amount, CouponAnalytics, CouponDiscount, CouponEngine, CouponUpdate,
    CouponValidation, DiscountPreview, NewCoupon, TopCouponUser, TrackUsage,
};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Finalizer
pub use finalizer::{FinalizerReport, SubscriptionFinalizer};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Models
pub use models::{Coupon, DiscountType, Redemption, Subscription};

// Plans
pub use plans::{format_cents, PlanCatalog, PlanDefinition};

// Store
#[cfg(any(test, feature = "in-memory"))]
pub use store::InMemoryBillingStore;
pub use store::{BillingStore, CouponStore, PgBillingStore, SubscriptionStore};

// Upgrades
pub use upgrade::{is_valid_upgrade, PlanUpgrade, UpgradePreview, UpgradeResult};

// Usage
pub use usage::{
    calculate_usage_status, usage_percentage, Metered, RegistrationCheck, UsageDisplay,
    UsageDisplayInfo, UsageLimitChecker, UsageStatus,
};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub config: Arc<BillingConfig>,
    pub usage: UsageLimitChecker,
    pub display: UsageDisplay,
    pub upgrades: PlanUpgrade,
    pub cancellations: SubscriptionCancel,
    pub finalizer: SubscriptionFinalizer,
    pub coupons: CouponEngine,
}

impl BillingService {
    /// Create a new billing service from environment variables, backed by Postgres
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Ok(Self::new(Arc::new(PgBillingStore::new(pool)), config))
    }

    /// Create a new billing service with an explicit store and config
    pub fn new(store: Arc<dyn BillingStore>, config: BillingConfig) -> Self {
        let config = Arc::new(config);

        Self {
            usage: UsageLimitChecker::new(store.clone(), config.clone()),
            display: UsageDisplay::new(store.clone(), config.clone()),
            upgrades: PlanUpgrade::new(store.clone(), config.clone()),
            cancellations: SubscriptionCancel::new(store.clone(), config.clone()),
            finalizer: SubscriptionFinalizer::new(store.clone()),
            coupons: CouponEngine::new(store, config.clone()),
            config,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.config.catalog
    }
}
