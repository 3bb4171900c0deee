//! Plan upgrade and cancellation routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use regdesk_billing::{CancelPreview, CancelResult, UpgradePreview, UpgradeResult};
use regdesk_shared::PlanTier;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{status_for, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct UpgradePreviewQuery {
    pub tier: PlanTier,
}

#[derive(Debug, Deserialize)]
pub struct UpgradeRequest {
    pub tier: PlanTier,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

/// What the cancel dialog shows before the user confirms
#[derive(Debug, Serialize)]
pub struct CancelOverview {
    pub can_cancel: bool,
    /// Absent when there is nothing cancelable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<CancelPreview>,
}

pub async fn preview_upgrade(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
    Query(query): Query<UpgradePreviewQuery>,
) -> ApiResult<Json<UpgradePreview>> {
    let preview = state
        .billing
        .upgrades
        .preview_upgrade(org_id, query.tier)
        .await?;
    Ok(Json(preview))
}

/// Failed upgrades keep the result body and take the status of their error category
pub async fn upgrade_subscription(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<UpgradeRequest>,
) -> ApiResult<(StatusCode, Json<UpgradeResult>)> {
    let result = state
        .billing
        .upgrades
        .execute_upgrade(org_id, req.tier)
        .await?;

    let status = result.error_kind.map_or(StatusCode::OK, status_for);
    Ok((status, Json(result)))
}

pub async fn cancel_subscription_preview(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<CancelOverview>> {
    let cancellations = &state.billing.cancellations;
    let can_cancel = cancellations.can_cancel(org_id).await?;

    let preview = match cancellations.preview_cancel(org_id).await {
        Ok(preview) => Some(preview),
        Err(e) if e.is_infrastructure() => return Err(e.into()),
        Err(_) => None,
    };

    Ok(Json(CancelOverview {
        can_cancel,
        preview,
    }))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<(StatusCode, Json<CancelResult>)> {
    let result = state
        .billing
        .cancellations
        .execute_cancel(org_id, req.reason)
        .await?;

    let status = result.error_kind.map_or(StatusCode::OK, status_for);
    Ok((status, Json(result)))
}
