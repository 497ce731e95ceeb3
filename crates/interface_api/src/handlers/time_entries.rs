//! Time entry handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use core_kernel::TimeEntryId;
use domain_billing::{TimeEntry, TimeEntryChanges};

use crate::dto::{CreateTimeEntryRequest, DecisionRequest, EditTimeEntryRequest};
use crate::{error::ApiError, AppState};

pub async fn create_time_entry(
    State(state): State<AppState>,
    Json(request): Json<CreateTimeEntryRequest>,
) -> Result<(StatusCode, Json<TimeEntry>), ApiError> {
    request.validate()?;
    let entry = state.approvals.create_entry(request.into()).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn get_time_entry(
    State(state): State<AppState>,
    Path(id): Path<TimeEntryId>,
) -> Result<Json<TimeEntry>, ApiError> {
    Ok(Json(state.approvals.get_entry(id).await?))
}

/// Edits a pending, unbilled entry
pub async fn edit_time_entry(
    State(state): State<AppState>,
    Path(id): Path<TimeEntryId>,
    Json(request): Json<EditTimeEntryRequest>,
) -> Result<Json<TimeEntry>, ApiError> {
    request.validate()?;
    let changes = TimeEntryChanges::from(request);
    Ok(Json(state.approvals.edit(id, changes).await?))
}

/// Soft-deletes an unbilled entry
pub async fn delete_time_entry(
    State(state): State<AppState>,
    Path(id): Path<TimeEntryId>,
) -> Result<StatusCode, ApiError> {
    state.approvals.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn approve_time_entry(
    State(state): State<AppState>,
    Path(id): Path<TimeEntryId>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<TimeEntry>, ApiError> {
    request.validate()?;
    let entry = state
        .approvals
        .approve(id, request.approver_id, request.notes)
        .await?;
    Ok(Json(entry))
}

pub async fn reject_time_entry(
    State(state): State<AppState>,
    Path(id): Path<TimeEntryId>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<TimeEntry>, ApiError> {
    request.validate()?;
    let entry = state
        .approvals
        .reject(id, request.approver_id, request.notes)
        .await?;
    Ok(Json(entry))
}

pub async fn reopen_time_entry(
    State(state): State<AppState>,
    Path(id): Path<TimeEntryId>,
) -> Result<Json<TimeEntry>, ApiError> {
    Ok(Json(state.approvals.reopen(id).await?))
}
