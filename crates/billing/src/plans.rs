//! Plan catalog
//!
//! Static table of plan tiers: monthly price, registration limit and display name.
//! Pure lookups, no I/O. Built once at startup (see [`crate::config::BillingConfig`])
//! and shared read-only by every component.

use regdesk_shared::PlanTier;
use serde::Serialize;

/// Pricing and limits for a single tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanDefinition {
    pub tier: PlanTier,
    pub display_name: String,
    /// Monthly price in minor currency units (cents)
    pub monthly_price_cents: i64,
    /// Registrations allowed per billing period
    pub registration_limit: i64,
}

impl PlanDefinition {
    /// Free tier: 100 registrations, no charge
    pub fn free() -> Self {
        Self {
            tier: PlanTier::Free,
            display_name: "Free".to_string(),
            monthly_price_cents: 0,
            registration_limit: 100,
        }
    }

    /// Standard tier: 5,000 registrations for $19/month
    pub fn standard() -> Self {
        Self {
            tier: PlanTier::Standard,
            display_name: "Standard".to_string(),
            monthly_price_cents: 1_900,
            registration_limit: 5_000,
        }
    }

    /// Enterprise tier: 50,000 registrations for $99/month
    pub fn enterprise() -> Self {
        Self {
            tier: PlanTier::Enterprise,
            display_name: "Enterprise".to_string(),
            monthly_price_cents: 9_900,
            registration_limit: 50_000,
        }
    }
}

/// Immutable lookup table over all plan tiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanCatalog {
    free: PlanDefinition,
    standard: PlanDefinition,
    enterprise: PlanDefinition,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self {
            free: PlanDefinition::free(),
            standard: PlanDefinition::standard(),
            enterprise: PlanDefinition::enterprise(),
        }
    }
}

impl PlanCatalog {
    /// Build a catalog from explicit definitions, one per tier
    pub fn new(free: PlanDefinition, standard: PlanDefinition, enterprise: PlanDefinition) -> Self {
        Self {
            free,
            standard,
            enterprise,
        }
    }

    pub fn plan(&self, tier: PlanTier) -> &PlanDefinition {
        match tier {
            PlanTier::Free => &self.free,
            PlanTier::Standard => &self.standard,
            PlanTier::Enterprise => &self.enterprise,
        }
    }

    pub fn monthly_price(&self, tier: PlanTier) -> i64 {
        self.plan(tier).monthly_price_cents
    }

    pub fn registration_limit(&self, tier: PlanTier) -> i64 {
        self.plan(tier).registration_limit
    }

    pub fn display_name(&self, tier: PlanTier) -> &str {
        &self.plan(tier).display_name
    }

    pub fn rank(&self, tier: PlanTier) -> u8 {
        tier.rank()
    }

    /// All plans, lowest rank first
    pub fn plans(&self) -> [&PlanDefinition; 3] {
        [&self.free, &self.standard, &self.enterprise]
    }
}

/// Render a cent amount as dollars, e.g. `1900` -> `$19.00`
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}${}.{:02}", sign, abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_values() {
        let catalog = PlanCatalog::default();
        assert_eq!(catalog.monthly_price(PlanTier::Free), 0);
        assert_eq!(catalog.registration_limit(PlanTier::Free), 100);
        assert_eq!(catalog.monthly_price(PlanTier::Standard), 1_900);
        assert_eq!(catalog.registration_limit(PlanTier::Standard), 5_000);
        assert_eq!(catalog.monthly_price(PlanTier::Enterprise), 9_900);
        assert_eq!(catalog.registration_limit(PlanTier::Enterprise), 50_000);
    }

    #[test]
    fn test_display_names() {
        let catalog = PlanCatalog::default();
        assert_eq!(catalog.display_name(PlanTier::Free), "Free");
        assert_eq!(catalog.display_name(PlanTier::Standard), "Standard");
        assert_eq!(catalog.display_name(PlanTier::Enterprise), "Enterprise");
    }

    #[test]
    fn test_plans_sorted_by_rank() {
        let catalog = PlanCatalog::default();
        let ranks: Vec<u8> = catalog.plans().iter().map(|p| catalog.rank(p.tier)).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
    }

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(1_900), "$19.00");
        assert_eq!(format_cents(0), "$0.00");
        assert_eq!(format_cents(5), "$0.05");
        assert_eq!(format_cents(-250), "-$2.50");
    }
}
