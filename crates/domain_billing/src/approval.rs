//! Approval workflow and billing state shared by billable items
//!
//! Time entries and ticket add-ons go through the same `pending → approved |
//! rejected` workflow and carry the same [`BillingState`]. Once an item is
//! billed it is frozen: no decision, reopen or edit is accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use core_kernel::{InvoiceId, UserId};
use crate::error::BillingError;

/// Approval status of a billable item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            _ => None,
        }
    }
}

/// Whether an item has been consumed by an invoice
///
/// `Billed` can only ever point at one invoice. Re-pointing it at a different
/// invoice is rejected; assigning the same invoice again is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "invoice_id", rename_all = "snake_case")]
pub enum BillingState {
    Unbilled,
    Billed(InvoiceId),
}

impl BillingState {
    pub fn from_invoice(invoice_id: Option<InvoiceId>) -> Self {
        match invoice_id {
            Some(id) => BillingState::Billed(id),
            None => BillingState::Unbilled,
        }
    }

    pub fn invoice_id(&self) -> Option<InvoiceId> {
        match self {
            BillingState::Billed(id) => Some(*id),
            BillingState::Unbilled => None,
        }
    }

    pub fn is_billed(&self) -> bool {
        matches!(self, BillingState::Billed(_))
    }

    /// Moves to `Billed(invoice_id)`
    ///
    /// # Errors
    ///
    /// `InvalidState` if already billed on a different invoice.
    pub fn assign(&mut self, invoice_id: InvoiceId) -> Result<(), BillingError> {
        match *self {
            BillingState::Unbilled => {
                *self = BillingState::Billed(invoice_id);
                Ok(())
            }
            BillingState::Billed(current) if current == invoice_id => Ok(()),
            BillingState::Billed(current) => Err(BillingError::invalid_state(format!(
                "item already billed on {}, cannot move to {}",
                current, invoice_id
            ))),
        }
    }

    /// Releases the item when its (draft) invoice is discarded
    ///
    /// Only the invoice that holds the item may release it.
    pub fn release(&mut self, invoice_id: InvoiceId) -> Result<(), BillingError> {
        match *self {
            BillingState::Billed(current) if current == invoice_id => {
                *self = BillingState::Unbilled;
                Ok(())
            }
            BillingState::Billed(current) => Err(BillingError::invalid_state(format!(
                "item is billed on {}, not {}",
                current, invoice_id
            ))),
            BillingState::Unbilled => Ok(()),
        }
    }
}

impl Default for BillingState {
    fn default() -> Self {
        BillingState::Unbilled
    }
}

/// Approval decision record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub status: ApprovalStatus,
    pub decided_by: Option<UserId>,
    pub decided_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl Approval {
    pub fn pending() -> Self {
        Self {
            status: ApprovalStatus::Pending,
            decided_by: None,
            decided_at: None,
            notes: None,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status == ApprovalStatus::Approved
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    /// Records a decision on a pending, unbilled item
    pub fn decide(
        &mut self,
        billing: &BillingState,
        decision: ApprovalStatus,
        approver: UserId,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        if decision == ApprovalStatus::Pending {
            return Err(BillingError::validation("a decision must approve or reject"));
        }
        ensure_unbilled(billing)?;
        if self.status != ApprovalStatus::Pending {
            return Err(BillingError::invalid_state(format!(
                "cannot move from {} to {}; reopen first",
                self.status.as_str(),
                decision.as_str()
            )));
        }

        self.status = decision;
        self.decided_by = Some(approver);
        self.decided_at = Some(now);
        self.notes = notes;
        Ok(())
    }

    /// Returns a decided, unbilled item to pending
    pub fn reopen(&mut self, billing: &BillingState) -> Result<(), BillingError> {
        ensure_unbilled(billing)?;
        if self.status == ApprovalStatus::Pending {
            return Ok(());
        }
        *self = Approval::pending();
        Ok(())
    }
}

impl Default for Approval {
    fn default() -> Self {
        Approval::pending()
    }
}

/// Fails with `InvalidState` once an item is invoiced
pub fn ensure_unbilled(billing: &BillingState) -> Result<(), BillingError> {
    match billing {
        BillingState::Unbilled => Ok(()),
        BillingState::Billed(invoice_id) => Err(BillingError::invalid_state(format!(
            "item is frozen: already invoiced on {}",
            invoice_id
        ))),
    }
}
