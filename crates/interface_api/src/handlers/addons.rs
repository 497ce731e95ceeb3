//! Ticket add-on handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use core_kernel::TicketAddonId;
use domain_billing::TicketAddon;

use crate::dto::{CreateAddonRequest, DecisionRequest};
use crate::{error::ApiError, AppState};

pub async fn create_addon(
    State(state): State<AppState>,
    Json(request): Json<CreateAddonRequest>,
) -> Result<(StatusCode, Json<TicketAddon>), ApiError> {
    request.validate()?;
    let addon = state.approvals.create_addon(request.into()).await?;
    Ok((StatusCode::CREATED, Json(addon)))
}

pub async fn get_addon(
    State(state): State<AppState>,
    Path(id): Path<TicketAddonId>,
) -> Result<Json<TicketAddon>, ApiError> {
    Ok(Json(state.approvals.get_addon(id).await?))
}

pub async fn approve_addon(
    State(state): State<AppState>,
    Path(id): Path<TicketAddonId>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<TicketAddon>, ApiError> {
    request.validate()?;
    let addon = state
        .approvals
        .approve_addon(id, request.approver_id, request.notes)
        .await?;
    Ok(Json(addon))
}

pub async fn reject_addon(
    State(state): State<AppState>,
    Path(id): Path<TicketAddonId>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<TicketAddon>, ApiError> {
    request.validate()?;
    let addon = state
        .approvals
        .reject_addon(id, request.approver_id, request.notes)
        .await?;
    Ok(Json(addon))
}

pub async fn reopen_addon(
    State(state): State<AppState>,
    Path(id): Path<TicketAddonId>,
) -> Result<Json<TicketAddon>, ApiError> {
    Ok(Json(state.approvals.reopen_addon(id).await?))
}
