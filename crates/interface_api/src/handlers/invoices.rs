//! Invoice handlers: consolidation and status transitions

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use core_kernel::{AccountId, InvoiceId};
use domain_billing::{Invoice, InvoiceDraft};

use crate::dto::{BalanceResponse, ConsolidateRequest};
use crate::{error::ApiError, AppState};

/// Consolidates the account's unbilled work into a draft invoice
pub async fn consolidate(
    State(state): State<AppState>,
    Path(account_id): Path<AccountId>,
    request: Option<Json<ConsolidateRequest>>,
) -> Result<(StatusCode, Json<Invoice>), ApiError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    request.validate()?;
    let request = request.into_request(state.today())?;

    let invoice = state
        .engine
        .consolidate_with_retry(account_id, request, state.consolidation_attempts)
        .await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

/// The invoice `consolidate` would create, without side effects
pub async fn preview(
    State(state): State<AppState>,
    Path(account_id): Path<AccountId>,
    request: Option<Json<ConsolidateRequest>>,
) -> Result<Json<InvoiceDraft>, ApiError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    request.validate()?;
    let request = request.into_request(state.today())?;

    Ok(Json(state.engine.preview(account_id, &request).await?))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<InvoiceId>,
) -> Result<Json<Invoice>, ApiError> {
    Ok(Json(state.engine.get_invoice(id).await?))
}

/// Deletes a draft and releases its items
pub async fn discard_invoice(
    State(state): State<AppState>,
    Path(id): Path<InvoiceId>,
) -> Result<StatusCode, ApiError> {
    state.engine.discard_draft(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn finalize_invoice(
    State(state): State<AppState>,
    Path(id): Path<InvoiceId>,
) -> Result<Json<Invoice>, ApiError> {
    Ok(Json(state.engine.finalize(id).await?))
}

pub async fn send_invoice(
    State(state): State<AppState>,
    Path(id): Path<InvoiceId>,
) -> Result<Json<Invoice>, ApiError> {
    Ok(Json(state.engine.send(id).await?))
}

pub async fn cancel_invoice(
    State(state): State<AppState>,
    Path(id): Path<InvoiceId>,
) -> Result<Json<Invoice>, ApiError> {
    Ok(Json(state.engine.cancel(id).await?))
}

pub async fn get_balance(
    State(state): State<AppState>,
    Path(id): Path<InvoiceId>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let invoice = state.engine.get_invoice(id).await?;
    let total_paid = state.reconciler.total_paid(id).await?;
    let outstanding = state.reconciler.outstanding_balance(id).await?;

    Ok(Json(BalanceResponse {
        invoice_id: invoice.id,
        invoice_number: invoice.invoice_number,
        status: invoice.status,
        total: invoice.total,
        total_paid,
        outstanding,
    }))
}

/// Flags sent invoices past their due date as overdue
pub async fn refresh_overdue(
    State(state): State<AppState>,
) -> Result<Json<Vec<InvoiceId>>, ApiError> {
    Ok(Json(state.reconciler.refresh_overdue(state.today()).await?))
}
