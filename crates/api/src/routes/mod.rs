//! API routes

mod billing;
mod coupons;
mod usage;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;

pub use billing::{
    cancel_subscription, cancel_subscription_preview, preview_upgrade, upgrade_subscription,
    CancelOverview, CancelRequest, UpgradePreviewQuery, UpgradeRequest,
};
pub use coupons::{
    apply_coupon, coupon_analytics, create_coupon, deactivate_coupon, get_coupon, list_coupons,
    redeem_coupon, update_coupon, validate_coupon, AnalyticsQuery, ApplyCouponRequest,
    ListCouponsQuery, ValidateCouponRequest,
};
pub use usage::{check_registration, get_usage, reserve_registration};

/// Create the main router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Usage governance (registration-submission path and dashboard)
        .route("/v1/orgs/{org_id}/usage", get(get_usage))
        .route(
            "/v1/orgs/{org_id}/registrations/check",
            get(check_registration),
        )
        .route(
            "/v1/orgs/{org_id}/registrations/reserve",
            post(reserve_registration),
        )
        // Plan changes
        .route(
            "/v1/orgs/{org_id}/billing/upgrade/preview",
            get(preview_upgrade),
        )
        .route("/v1/orgs/{org_id}/billing/upgrade", post(upgrade_subscription))
        .route(
            "/v1/orgs/{org_id}/billing/cancel",
            get(cancel_subscription_preview).post(cancel_subscription),
        )
        // Coupons at checkout
        .route("/v1/coupons/validate", post(validate_coupon))
        .route("/v1/coupons/apply", post(apply_coupon))
        .route("/v1/coupons/redeem", post(redeem_coupon))
        // Coupon administration
        .route("/v1/admin/coupons", get(list_coupons).post(create_coupon))
        .route("/v1/admin/coupons/analytics", get(coupon_analytics))
        .route(
            "/v1/admin/coupons/{coupon_id}",
            get(get_coupon).patch(update_coupon).delete(deactivate_coupon),
        )
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}


#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::test_support::memory_state;
    use super::*;

    #[tokio::test]
    async fn test_health() {
        let (state, _) = memory_state();
        let response = create_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_org_routes_are_wired() {
        let (state, _) = memory_state();
        let uri = format!("/v1/orgs/{}/usage", Uuid::new_v4());
        let response = create_router(state)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_coupon_is_404() {
        let (state, _) = memory_state();
        let uri = format!("/v1/admin/coupons/{}", Uuid::new_v4());
        let response = create_router(state)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
