//! Registration usage routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use regdesk_billing::{RegistrationCheck, UsageDisplayInfo};
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

/// Usage summary for the dashboard
pub async fn get_usage(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<UsageDisplayInfo>> {
    let info = state.billing.display.get_usage_display(org_id).await?;
    Ok(Json(info))
}

/// Read-only check before showing a registration form
pub async fn check_registration(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<RegistrationCheck>> {
    let check = state.billing.usage.can_register(org_id).await?;
    Ok(Json(check))
}

/// Claim one registration slot before persisting a registration
///
/// Refusals come back as 403 with the limit message and upgrade URL.
pub async fn reserve_registration(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<RegistrationCheck>)> {
    let check = state.billing.usage.reserve_registration(org_id).await?;

    let status = if check.allowed {
        StatusCode::OK
    } else {
        tracing::debug!(
            org_id = %org_id,
            plan_tier = %check.plan_tier,
            current_count = check.current_count,
            limit = check.limit,
            "Registration refused at plan limit"
        );
        StatusCode::FORBIDDEN
    };

    Ok((status, Json(check)))
}
