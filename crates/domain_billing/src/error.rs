//! Billing domain errors

use thiserror::Error;

use core_kernel::{AccountId, MoneyError, PortError, TicketId};

/// Errors that can occur in the billing domain
#[derive(Debug, Error)]
pub enum BillingError {
    /// Illegal state transition, e.g. approving an already-invoiced entry
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Lost the race on at-most-once billing; the caller may retry with a fresh snapshot
    #[error("Concurrent billing conflict: {0}")]
    ConcurrentBillingConflict(String),

    /// Nothing approved and unbilled to consolidate
    #[error("No unbilled items for account {0}")]
    NoUnbilledItems(AccountId),

    /// Neither an account-specific nor a global billing setting exists
    #[error("No billing settings for account {0} and no global default")]
    MissingBillingSettings(AccountId),

    /// A ticket was referenced from a different account
    #[error("Ticket {ticket_id} belongs to account {ticket_account}, not {account_id}")]
    CrossAccountReference {
        ticket_id: TicketId,
        ticket_account: AccountId,
        account_id: AccountId,
    },

    /// Entity not found
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: String,
        id: String,
    },

    /// Input rejected before any state change
    #[error("Validation error: {0}")]
    Validation(String),

    /// Monetary arithmetic error
    #[error("Money error: {0}")]
    Money(#[from] MoneyError),

    /// Storage adapter failure
    #[error("Store error: {0}")]
    Store(PortError),
}

impl BillingError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        BillingError::InvalidState(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        BillingError::Validation(message.into())
    }

    pub fn not_found(entity: impl Into<String>, id: impl std::fmt::Display) -> Self {
        BillingError::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Only a lost billing race is worth retrying automatically
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::ConcurrentBillingConflict(_))
    }
}

impl From<PortError> for BillingError {
    fn from(error: PortError) -> Self {
        match error {
            PortError::NotFound { entity_type, id } => BillingError::NotFound {
                entity: entity_type,
                id,
            },
            PortError::Validation { message, .. } => BillingError::Validation(message),
            other => BillingError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_not_found_maps_to_not_found() {
        let err: BillingError = PortError::not_found("Invoice", "INV-1").into();
        assert!(matches!(err, BillingError::NotFound { ref entity, .. } if entity == "Invoice"));
    }

    #[test]
    fn test_only_conflict_is_retryable() {
        assert!(BillingError::ConcurrentBillingConflict("lost".into()).is_retryable());
        assert!(!BillingError::NoUnbilledItems(AccountId::new()).is_retryable());
        assert!(!BillingError::invalid_state("approved").is_retryable());
    }
}
