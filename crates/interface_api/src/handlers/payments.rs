//! Payment handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use core_kernel::{InvoiceId, PaymentId};
use domain_billing::{Payment, SettledPayment};

use crate::dto::RecordPaymentRequest;
use crate::{error::ApiError, AppState};

/// Records a pending payment against an invoice
pub async fn record_payment(
    State(state): State<AppState>,
    Path(invoice_id): Path<InvoiceId>,
    Json(request): Json<RecordPaymentRequest>,
) -> Result<(StatusCode, Json<Payment>), ApiError> {
    request.validate()?;
    let payment = state.reconciler.apply_payment(invoice_id, request.into()).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

pub async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<PaymentId>,
) -> Result<Json<Payment>, ApiError> {
    Ok(Json(state.reconciler.get_payment(id).await?))
}

pub async fn complete_payment(
    State(state): State<AppState>,
    Path(id): Path<PaymentId>,
) -> Result<Json<SettledPayment>, ApiError> {
    Ok(Json(state.reconciler.mark_completed(id).await?))
}

pub async fn fail_payment(
    State(state): State<AppState>,
    Path(id): Path<PaymentId>,
) -> Result<Json<SettledPayment>, ApiError> {
    Ok(Json(state.reconciler.mark_failed(id).await?))
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    Path(id): Path<PaymentId>,
) -> Result<Json<SettledPayment>, ApiError> {
    Ok(Json(state.reconciler.cancel_payment(id).await?))
}

pub async fn refund_payment(
    State(state): State<AppState>,
    Path(id): Path<PaymentId>,
) -> Result<Json<SettledPayment>, ApiError> {
    Ok(Json(state.reconciler.refund_payment(id).await?))
}
