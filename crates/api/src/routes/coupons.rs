//! Coupon routes
//!
//! Checkout endpoints (validate, apply, redeem) and the admin CRUD + analytics surface.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use regdesk_billing::{
    Coupon, CouponAnalytics, CouponUpdate, CouponValidation, DiscountPreview, NewCoupon,
    Redemption, TrackUsage,
};
use regdesk_shared::PlanTier;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct ValidateCouponRequest {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ApplyCouponRequest {
    pub code: String,
    /// Charge in minor currency units
    pub amount: i64,
    pub tier: PlanTier,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListCouponsQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalyticsQuery {
    pub coupon_id: Option<Uuid>,
}

fn require_code(code: &str) -> ApiResult<()> {
    if code.trim().is_empty() {
        return Err(ApiError::BadRequest("code is required".to_string()));
    }
    Ok(())
}

/// Always 200; an unusable code is reported in the body
pub async fn validate_coupon(
    State(state): State<AppState>,
    Json(req): Json<ValidateCouponRequest>,
) -> ApiResult<Json<CouponValidation>> {
    require_code(&req.code)?;
    let validation = state.billing.coupons.validate_coupon(&req.code).await?;
    Ok(Json(validation))
}

pub async fn apply_coupon(
    State(state): State<AppState>,
    Json(req): Json<ApplyCouponRequest>,
) -> ApiResult<Json<DiscountPreview>> {
    require_code(&req.code)?;
    let preview = state
        .billing
        .coupons
        .preview_discount(&req.code, req.amount, req.tier)
        .await?;
    Ok(Json(preview))
}

/// Record a redemption after the discounted charge went through
pub async fn redeem_coupon(
    State(state): State<AppState>,
    Json(req): Json<TrackUsage>,
) -> ApiResult<(StatusCode, Json<Redemption>)> {
    require_code(&req.code)?;
    let redemption = state.billing.coupons.track_coupon_usage(req).await?;
    Ok((StatusCode::CREATED, Json(redemption)))
}

pub async fn list_coupons(
    State(state): State<AppState>,
    Query(query): Query<ListCouponsQuery>,
) -> ApiResult<Json<Vec<Coupon>>> {
    let coupons = state
        .billing
        .coupons
        .list_coupons(query.include_inactive)
        .await?;
    Ok(Json(coupons))
}

pub async fn create_coupon(
    State(state): State<AppState>,
    Json(req): Json<NewCoupon>,
) -> ApiResult<(StatusCode, Json<Coupon>)> {
    let coupon = state.billing.coupons.create_coupon(req).await?;
    Ok((StatusCode::CREATED, Json(coupon)))
}

pub async fn get_coupon(
    State(state): State<AppState>,
    Path(coupon_id): Path<Uuid>,
) -> ApiResult<Json<Coupon>> {
    let coupon = state.billing.coupons.get_coupon(coupon_id).await?;
    Ok(Json(coupon))
}

pub async fn update_coupon(
    State(state): State<AppState>,
    Path(coupon_id): Path<Uuid>,
    Json(req): Json<CouponUpdate>,
) -> ApiResult<Json<Coupon>> {
    let coupon = state.billing.coupons.update_coupon(coupon_id, req).await?;
    Ok(Json(coupon))
}

/// Coupons are never deleted; redemptions keep referencing them
pub async fn deactivate_coupon(
    State(state): State<AppState>,
    Path(coupon_id): Path<Uuid>,
) -> ApiResult<Json<Coupon>> {
    let coupon = state.billing.coupons.deactivate_coupon(coupon_id).await?;
    Ok(Json(coupon))
}

pub async fn coupon_analytics(
    State(state): State<AppState>,
    Query(query): Query<AnalyticsQuery>,
) -> ApiResult<Json<CouponAnalytics>> {
    let analytics = state
        .billing
        .coupons
        .get_coupon_analytics(query.coupon_id)
        .await?;
    Ok(Json(analytics))
}
