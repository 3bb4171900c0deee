//! HTTP error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use regdesk_billing::{BillingError, ErrorKind};
use serde::Serialize;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Machine-readable category for programmatic handling
    pub code: String,
}

/// Status for a billing error category
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Infrastructure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Billing(e) => status_for(e.kind()),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn body(&self) -> ErrorResponse {
        match self {
            ApiError::Billing(e) if e.is_infrastructure() => ErrorResponse {
                error: "Internal server error".to_string(),
                code: ErrorKind::Infrastructure.to_string(),
            },
            ApiError::Billing(e) => ErrorResponse {
                error: e.to_string(),
                code: e.kind().to_string(),
            },
            ApiError::BadRequest(msg) => ErrorResponse {
                error: msg.clone(),
                code: "bad_request".to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Billing(e) if e.is_infrastructure() => {
                tracing::error!(error = %e, error_debug = ?e, "Billing operation failed");
            }
            other => {
                tracing::debug!(error = %other, "Request rejected");
            }
        }

        (self.status(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regdesk_shared::PlanTier;

    #[test]
    fn test_billing_error_statuses() {
        assert_eq!(
            ApiError::from(BillingError::CouponNotFound).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(BillingError::CouponExpired).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::from(BillingError::SamePlan(PlanTier::Standard)).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(BillingError::Database("pool timed out".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::BadRequest("code is required".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_infrastructure_message_not_leaked() {
        let body = ApiError::from(BillingError::Database("password authentication failed".into()))
            .body();
        assert_eq!(body.error, "Internal server error");
        assert_eq!(body.code, "infrastructure");
    }

    #[test]
    fn test_expected_errors_keep_message() {
        let body = ApiError::from(BillingError::CannotCancelFree).body();
        assert_eq!(body.error, "Cannot cancel free plan");
        assert_eq!(body.code, "validation");
    }
}
