//! Billing errors

use regdesk_shared::PlanTier;
use serde::Serialize;

pub type BillingResult<T> = Result<T, BillingError>;

/// Broad category of a billing failure
///
/// Callers use this to decide how to surface an error: not-found and validation
/// failures are expected and shown to end users verbatim, conflicts name the state
/// that blocked the action, infrastructure failures are retried by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Validation,
    Conflict,
    Infrastructure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::Infrastructure => write!(f, "infrastructure"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Coupon not found")]
    CouponNotFound,

    #[error("Coupon is inactive")]
    CouponInactive,

    #[error("Coupon has expired")]
    CouponExpired,

    #[error("Coupon has reached maximum uses")]
    CouponExhausted,

    #[error("Coupon not applicable to this plan")]
    CouponNotApplicable,

    #[error("No active subscription")]
    NoActiveSubscription,

    #[error("Cannot cancel free plan")]
    CannotCancelFree,

    #[error("Subscription is already cancelled or canceling")]
    AlreadyCanceling,

    #[error("Already on the {0} plan")]
    SamePlan(PlanTier),

    #[error("Cannot downgrade from {from} to {to} through the upgrade flow")]
    InvalidUpgrade { from: PlanTier, to: PlanTier },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::CouponNotFound
            | BillingError::NoActiveSubscription
            | BillingError::NotFound(_) => ErrorKind::NotFound,
            BillingError::CouponInactive
            | BillingError::CouponExpired
            | BillingError::CouponExhausted
            | BillingError::CouponNotApplicable
            | BillingError::CannotCancelFree
            | BillingError::InvalidUpgrade { .. }
            | BillingError::InvalidInput(_) => ErrorKind::Validation,
            BillingError::AlreadyCanceling
            | BillingError::SamePlan(_)
            | BillingError::AlreadyExists(_)
            | BillingError::ConcurrentModification(_) => ErrorKind::Conflict,
            BillingError::Database(_) | BillingError::Config(_) => ErrorKind::Infrastructure,
        }
    }

    /// Infrastructure failures must propagate; everything else is an expected outcome
    pub fn is_infrastructure(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coupon_messages_are_user_facing() {
        assert_eq!(BillingError::CouponNotFound.to_string(), "Coupon not found");
        assert_eq!(BillingError::CouponInactive.to_string(), "Coupon is inactive");
        assert_eq!(BillingError::CouponExpired.to_string(), "Coupon has expired");
        assert_eq!(
            BillingError::CouponExhausted.to_string(),
            "Coupon has reached maximum uses"
        );
        assert_eq!(
            BillingError::CouponNotApplicable.to_string(),
            "Coupon not applicable to this plan"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(BillingError::CouponNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(BillingError::CouponExpired.kind(), ErrorKind::Validation);
        assert_eq!(
            BillingError::SamePlan(PlanTier::Standard).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(BillingError::AlreadyCanceling.kind(), ErrorKind::Conflict);
        assert!(BillingError::Database("timeout".into()).is_infrastructure());
        assert!(!BillingError::CannotCancelFree.is_infrastructure());
    }

    #[test]
    fn test_upgrade_messages_name_tiers() {
        let err = BillingError::InvalidUpgrade {
            from: PlanTier::Enterprise,
            to: PlanTier::Standard,
        };
        assert_eq!(
            err.to_string(),
            "Cannot downgrade from enterprise to standard through the upgrade flow"
        );
        assert_eq!(
            BillingError::SamePlan(PlanTier::Free).to_string(),
            "Already on the free plan"
        );
    }
}
