//! Common types used across RegDesk

use serde::{Deserialize, Serialize};

// =============================================================================
// Errors
// =============================================================================

/// Returned when a string does not name a known enum variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

// =============================================================================
// Enums
// =============================================================================

/// Plan tier for billing
///
/// Tiers are totally ordered by [`PlanTier::rank`]; an upgrade is any move to a
/// strictly higher rank.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Standard,
    Enterprise,
}

impl PlanTier {
    /// Every tier, lowest rank first
    pub const ALL: [PlanTier; 3] = [PlanTier::Free, PlanTier::Standard, PlanTier::Enterprise];

    /// Ordinal position in the plan hierarchy: free=0 < standard=1 < enterprise=2
    pub fn rank(&self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Standard => 1,
            Self::Enterprise => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Standard => "standard",
            Self::Enterprise => "enterprise",
        }
    }

    /// Whether this tier carries a monthly charge
    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "standard" => Ok(Self::Standard),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(ParseEnumError {
                kind: "plan tier",
                value: s.to_string(),
            }),
        }
    }
}

/// Lifecycle status of a subscription row
///
/// `active -> canceling -> canceled`. Only the finalizer moves a row to `canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Canceling,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
        }
    }

    /// Plan access is retained while active and through the paid period of a cancellation
    pub fn is_entitled(&self) -> bool {
        matches!(self, Self::Active | Self::Canceling)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "canceling" => Ok(Self::Canceling),
            "canceled" => Ok(Self::Canceled),
            _ => Err(ParseEnumError {
                kind: "subscription status",
                value: s.to_string(),
            }),
        }
    }
}
