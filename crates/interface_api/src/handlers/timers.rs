//! Timer handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use core_kernel::{TimerId, UserId};
use domain_billing::{TimeEntry, Timer};

use crate::dto::{CommitTimerRequest, ElapsedResponse, StartTimerRequest};
use crate::{error::ApiError, AppState};

/// Starts a timer, or returns the caller's active one on the same ticket
pub async fn start_timer(
    State(state): State<AppState>,
    Json(request): Json<StartTimerRequest>,
) -> Result<(StatusCode, Json<Timer>), ApiError> {
    request.validate()?;
    let timer = state.timers.start(request.into()).await?;
    Ok((StatusCode::CREATED, Json(timer)))
}

pub async fn get_timer(
    State(state): State<AppState>,
    Path(id): Path<TimerId>,
) -> Result<Json<Timer>, ApiError> {
    Ok(Json(state.timers.get(id).await?))
}

/// Running and paused timers of a user
pub async fn list_active_timers(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<Vec<Timer>>, ApiError> {
    Ok(Json(state.timers.active_timers(user_id).await?))
}

pub async fn elapsed(
    State(state): State<AppState>,
    Path(id): Path<TimerId>,
) -> Result<Json<ElapsedResponse>, ApiError> {
    let elapsed_seconds = state.timers.elapsed_seconds(id).await?;
    Ok(Json(ElapsedResponse { elapsed_seconds }))
}

pub async fn pause_timer(
    State(state): State<AppState>,
    Path(id): Path<TimerId>,
) -> Result<Json<Timer>, ApiError> {
    Ok(Json(state.timers.pause(id).await?))
}

pub async fn resume_timer(
    State(state): State<AppState>,
    Path(id): Path<TimerId>,
) -> Result<Json<Timer>, ApiError> {
    Ok(Json(state.timers.resume(id).await?))
}

pub async fn stop_timer(
    State(state): State<AppState>,
    Path(id): Path<TimerId>,
) -> Result<Json<Timer>, ApiError> {
    Ok(Json(state.timers.stop(id).await?))
}

pub async fn cancel_timer(
    State(state): State<AppState>,
    Path(id): Path<TimerId>,
) -> Result<Json<Timer>, ApiError> {
    Ok(Json(state.timers.cancel(id).await?))
}

/// Commits the timer to a time entry; the body is optional
pub async fn commit_timer(
    State(state): State<AppState>,
    Path(id): Path<TimerId>,
    request: Option<Json<CommitTimerRequest>>,
) -> Result<Json<TimeEntry>, ApiError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    request.validate()?;
    Ok(Json(state.timers.commit(id, request.into()).await?))
}
