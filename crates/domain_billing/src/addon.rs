//! Ticket add-ons: billable non-time charges against a ticket

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use core_kernel::{AccountId, Money, TicketAddonId, TicketId, UserId};
use crate::approval::{Approval, ApprovalStatus, BillingState};
use crate::error::BillingError;
use crate::invoice::{ItemCategory, LineDraft, LineSource};
use crate::ports::TicketRef;

/// Kind of charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddonKind {
    Product,
    License,
    Expense,
    Service,
}

impl AddonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddonKind::Product => "product",
            AddonKind::License => "license",
            AddonKind::Expense => "expense",
            AddonKind::Service => "service",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "product" => Some(AddonKind::Product),
            "license" => Some(AddonKind::License),
            "expense" => Some(AddonKind::Expense),
            "service" => Some(AddonKind::Service),
            _ => None,
        }
    }

    pub fn category(&self) -> ItemCategory {
        match self {
            AddonKind::Product => ItemCategory::Product,
            AddonKind::License => ItemCategory::License,
            AddonKind::Expense => ItemCategory::Expense,
            AddonKind::Service => ItemCategory::Service,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTicketAddon {
    pub ticket_id: TicketId,
    pub name: String,
    pub description: Option<String>,
    pub kind: AddonKind,
    pub unit_price: Money,
    pub quantity: Decimal,
    pub discount: Option<Money>,
    pub billable: bool,
    pub taxable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketAddon {
    pub id: TicketAddonId,
    pub ticket_id: TicketId,
    /// Copied from the ticket at creation
    pub account_id: AccountId,
    pub name: String,
    pub description: Option<String>,
    pub kind: AddonKind,
    pub unit_price: Money,
    pub quantity: Decimal,
    pub discount: Money,
    /// `unit_price × quantity − discount`, never including tax
    pub total: Money,
    pub billable: bool,
    pub taxable: bool,
    pub approval: Approval,
    pub billing: BillingState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TicketAddon {
    /// Creates a pending add-on on `ticket`, inheriting its account
    pub fn create(
        ticket: &TicketRef,
        input: NewTicketAddon,
        now: DateTime<Utc>,
    ) -> Result<Self, BillingError> {
        if input.ticket_id != ticket.id {
            return Err(BillingError::validation("ticket reference does not match the add-on"));
        }
        if input.name.trim().is_empty() {
            return Err(BillingError::validation("add-on name is required"));
        }
        let discount = input
            .discount
            .unwrap_or_else(|| Money::zero(input.unit_price.currency()));

        let mut addon = Self {
            id: TicketAddonId::new_v7(),
            ticket_id: ticket.id,
            account_id: ticket.account_id,
            name: input.name,
            description: input.description,
            kind: input.kind,
            unit_price: input.unit_price,
            quantity: input.quantity,
            discount,
            total: Money::zero(input.unit_price.currency()),
            billable: input.billable,
            taxable: input.taxable,
            approval: Approval::pending(),
            billing: BillingState::Unbilled,
            created_at: now,
            updated_at: now,
        };
        addon.recompute_total()?;
        Ok(addon)
    }

    /// Recomputes `total` from price, quantity and discount
    fn recompute_total(&mut self) -> Result<(), BillingError> {
        if self.quantity <= Decimal::ZERO {
            return Err(BillingError::validation("quantity must be positive"));
        }
        if self.unit_price.is_negative() || self.discount.is_negative() {
            return Err(BillingError::validation("price and discount must not be negative"));
        }
        let gross = self.unit_price.multiply(self.quantity);
        let total = gross.checked_sub(&self.discount)?;
        if total.is_negative() {
            return Err(BillingError::validation("discount exceeds the add-on amount"));
        }
        self.total = total;
        Ok(())
    }

    pub fn approve(
        &mut self,
        approver: UserId,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        self.approval
            .decide(&self.billing, ApprovalStatus::Approved, approver, notes, now)?;
        self.updated_at = now;
        Ok(())
    }

    pub fn reject(
        &mut self,
        approver: UserId,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        self.approval
            .decide(&self.billing, ApprovalStatus::Rejected, approver, notes, now)?;
        self.updated_at = now;
        Ok(())
    }

    pub fn reopen(&mut self, now: DateTime<Utc>) -> Result<(), BillingError> {
        self.approval.reopen(&self.billing)?;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_consolidation_candidate(&self) -> bool {
        self.billable && self.approval.is_approved() && !self.billing.is_billed()
    }

    /// Invoice line for this add-on; carries its own taxable flag
    pub fn to_line(&self) -> LineDraft {
        LineDraft {
            source: LineSource::TicketAddon(self.id),
            description: match &self.description {
                Some(d) => format!("{}: {}", self.name, d),
                None => self.name.clone(),
            },
            quantity: self.quantity,
            unit_price: self.unit_price,
            discount: self.discount,
            billable: self.billable,
            taxable: Some(self.taxable),
            category: self.kind.category(),
        }
    }
}
