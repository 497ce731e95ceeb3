//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use core_kernel::PortError;
use domain_billing::BillingError;

/// API error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unprocessable: {0}")]
    Unprocessable(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),
            ApiError::Internal(msg) => {
                error!(message = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone())
            }
            ApiError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error", msg.clone()),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable", msg.clone()),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message,
            details: None,
        };

        (status, Json(body)).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        let message = err.to_string();
        match err {
            BillingError::NotFound { .. } => ApiError::NotFound(message),
            BillingError::InvalidState(_) | BillingError::ConcurrentBillingConflict(_) => {
                ApiError::Conflict(message)
            }
            BillingError::Validation(_) | BillingError::Money(_) => ApiError::Validation(message),
            BillingError::NoUnbilledItems(_)
            | BillingError::MissingBillingSettings(_)
            | BillingError::CrossAccountReference { .. } => ApiError::Unprocessable(message),
            BillingError::Store(PortError::Conflict { .. }) => ApiError::Conflict(message),
            BillingError::Store(_) => ApiError::Internal(message),
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_kernel::AccountId;

    fn status(err: BillingError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_billing_errors_map_to_status_codes() {
        assert_eq!(status(BillingError::not_found("Invoice", "x")), StatusCode::NOT_FOUND);
        assert_eq!(status(BillingError::invalid_state("frozen")), StatusCode::CONFLICT);
        assert_eq!(
            status(BillingError::ConcurrentBillingConflict("lost".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(BillingError::NoUnbilledItems(AccountId::new())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status(BillingError::Store(PortError::internal("boom"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
