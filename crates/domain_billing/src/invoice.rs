//! Invoices and invoice line items
//!
//! Pricing is tax-exclusive: each line's tax is added on top of its base
//! (`quantity × unit_price − discount`). Invoice totals are always derived from
//! the lines, never edited directly.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use core_kernel::{
    AccountId, Currency, InvoiceId, LineItemId, Money, MoneyError, Rate, TicketAddonId,
    TimeEntryId,
};
use crate::error::BillingError;
use crate::tax::{InvoiceTaxPolicy, TaxDecision};

/// Invoice status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Being assembled; may still be discarded
    Draft,
    /// Finalized, awaiting dispatch
    Pending,
    /// Sent to the customer
    Sent,
    /// Fully covered by completed payments
    Paid,
    /// Sent and past its due date
    Overdue,
    /// Voided; items stay billed
    Canceled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(InvoiceStatus::Draft),
            "pending" => Some(InvoiceStatus::Pending),
            "sent" => Some(InvoiceStatus::Sent),
            "paid" => Some(InvoiceStatus::Paid),
            "overdue" => Some(InvoiceStatus::Overdue),
            "canceled" => Some(InvoiceStatus::Canceled),
            _ => None,
        }
    }
}

/// Category of a billed item, used for tax-configuration matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemCategory {
    Service,
    Product,
    License,
    Expense,
    Other,
}

impl ItemCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemCategory::Service => "service",
            ItemCategory::Product => "product",
            ItemCategory::License => "license",
            ItemCategory::Expense => "expense",
            ItemCategory::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "service" => Some(ItemCategory::Service),
            "product" => Some(ItemCategory::Product),
            "license" => Some(ItemCategory::License),
            "expense" => Some(ItemCategory::Expense),
            "other" => Some(ItemCategory::Other),
            _ => None,
        }
    }
}

/// Where a line item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum LineSource {
    TimeEntry(TimeEntryId),
    TicketAddon(TicketAddonId),
    Manual,
    Separator,
}

impl LineSource {
    pub fn line_type(&self) -> &'static str {
        match self {
            LineSource::TimeEntry(_) => "time_entry",
            LineSource::TicketAddon(_) => "ticket_addon",
            LineSource::Manual => "manual",
            LineSource::Separator => "separator",
        }
    }

    /// Id of the billed item, if the line references one
    pub fn source_id(&self) -> Option<Uuid> {
        match self {
            LineSource::TimeEntry(id) => Some(*id.as_uuid()),
            LineSource::TicketAddon(id) => Some(*id.as_uuid()),
            LineSource::Manual | LineSource::Separator => None,
        }
    }

    /// Rebuilds a source from its stored `(line_type, source_id)` pair
    pub fn from_parts(line_type: &str, source_id: Option<Uuid>) -> Option<Self> {
        match (line_type, source_id) {
            ("time_entry", Some(id)) => Some(LineSource::TimeEntry(TimeEntryId::from_uuid(id))),
            ("ticket_addon", Some(id)) => Some(LineSource::TicketAddon(TicketAddonId::from_uuid(id))),
            ("manual", None) => Some(LineSource::Manual),
            ("separator", None) => Some(LineSource::Separator),
            _ => None,
        }
    }

    pub fn is_time_entry(&self) -> bool {
        matches!(self, LineSource::TimeEntry(_))
    }
}

/// A line before tax has been resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineDraft {
    pub source: LineSource,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Money,
    pub discount: Money,
    pub billable: bool,
    /// Explicit taxability; `None` inherits the invoice mode
    pub taxable: Option<bool>,
    pub category: ItemCategory,
}

impl LineDraft {
    /// A section heading with no monetary effect
    pub fn separator(description: impl Into<String>, currency: Currency) -> Self {
        Self {
            source: LineSource::Separator,
            description: description.into(),
            quantity: Decimal::ZERO,
            unit_price: Money::zero(currency),
            discount: Money::zero(currency),
            billable: false,
            taxable: Some(false),
            category: ItemCategory::Other,
        }
    }

    /// A free-form charge not backed by a billable item
    pub fn manual(
        description: impl Into<String>,
        quantity: Decimal,
        unit_price: Money,
        taxable: Option<bool>,
    ) -> Self {
        Self {
            source: LineSource::Manual,
            description: description.into(),
            quantity,
            unit_price,
            discount: Money::zero(unit_price.currency()),
            billable: true,
            taxable,
            category: ItemCategory::Other,
        }
    }

    pub fn is_separator(&self) -> bool {
        matches!(self.source, LineSource::Separator)
    }

    /// `round2(quantity × unit_price − discount)`
    pub fn base_amount(&self) -> Money {
        if self.is_separator() {
            return Money::zero(self.unit_price.currency());
        }
        Money::new(
            self.quantity * self.unit_price.amount() - self.discount.amount(),
            self.unit_price.currency(),
        )
    }
}

/// A priced line on an invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub id: LineItemId,
    pub invoice_id: InvoiceId,
    pub source: LineSource,
    pub sort_order: i32,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Money,
    pub discount: Money,
    pub tax_rate: Rate,
    pub tax_amount: Money,
    /// Base plus tax
    pub total_amount: Money,
    pub billable: bool,
    pub taxable: Option<bool>,
    pub category: ItemCategory,
    /// Set when taxability fell through to the `custom` default
    pub tax_unresolved: bool,
}

impl InvoiceLineItem {
    /// Materializes a draft with its resolved tax
    pub fn priced(
        invoice_id: InvoiceId,
        sort_order: i32,
        draft: LineDraft,
        decision: &TaxDecision,
    ) -> Result<Self, MoneyError> {
        let base = draft.base_amount();
        let total_amount = base.checked_add(&decision.tax_amount)?;

        Ok(Self {
            id: LineItemId::new_v7(),
            invoice_id,
            source: draft.source,
            sort_order,
            description: draft.description,
            quantity: draft.quantity,
            unit_price: draft.unit_price,
            discount: draft.discount,
            tax_rate: decision.rate,
            tax_amount: decision.tax_amount,
            total_amount,
            billable: draft.billable,
            taxable: draft.taxable,
            category: draft.category,
            tax_unresolved: decision.unresolved,
        })
    }

    pub fn is_separator(&self) -> bool {
        matches!(self.source, LineSource::Separator)
    }

    /// `total_amount − tax_amount`
    pub fn pre_tax_amount(&self) -> Result<Money, MoneyError> {
        self.total_amount.checked_sub(&self.tax_amount)
    }
}

/// Derived invoice totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceTotals {
    pub subtotal: Money,
    pub tax_amount: Money,
    pub total: Money,
}

impl InvoiceTotals {
    /// Sums every non-separator line
    pub fn from_lines(currency: Currency, lines: &[InvoiceLineItem]) -> Result<Self, MoneyError> {
        let mut subtotal = Money::zero(currency);
        let mut tax_amount = Money::zero(currency);

        for line in lines.iter().filter(|l| !l.is_separator()) {
            subtotal = subtotal.checked_add(&line.pre_tax_amount()?)?;
            tax_amount = tax_amount.checked_add(&line.tax_amount)?;
        }

        Ok(Self {
            subtotal,
            tax_amount,
            total: subtotal.checked_add(&tax_amount)?,
        })
    }
}

/// A fully assembled invoice that has not been numbered or persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceDraft {
    pub id: InvoiceId,
    pub account_id: AccountId,
    pub invoice_date: NaiveDate,
    pub due_date: NaiveDate,
    pub currency: Currency,
    pub tax_policy: InvoiceTaxPolicy,
    pub notes: Option<String>,
    pub lines: Vec<InvoiceLineItem>,
    pub totals: InvoiceTotals,
    /// Items flipped to `Billed(id)` when the draft is committed
    pub time_entry_ids: Vec<TimeEntryId>,
    pub addon_ids: Vec<TicketAddonId>,
}

impl InvoiceDraft {
    /// Turns the draft into an invoice carrying `invoice_number`
    pub fn into_invoice(self, invoice_number: String, now: DateTime<Utc>) -> Invoice {
        Invoice {
            id: self.id,
            invoice_number,
            account_id: self.account_id,
            status: InvoiceStatus::Draft,
            invoice_date: self.invoice_date,
            due_date: self.due_date,
            currency: self.currency,
            subtotal: self.totals.subtotal,
            tax_amount: self.totals.tax_amount,
            total: self.totals.total,
            tax_policy: self.tax_policy,
            notes: self.notes,
            lines: self.lines,
            sent_at: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An invoice for an account's billable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub invoice_number: String,
    pub account_id: AccountId,
    pub status: InvoiceStatus,
    pub invoice_date: NaiveDate,
    pub due_date: NaiveDate,
    pub currency: Currency,
    pub subtotal: Money,
    pub tax_amount: Money,
    pub total: Money,
    pub tax_policy: InvoiceTaxPolicy,
    pub notes: Option<String>,
    pub lines: Vec<InvoiceLineItem>,
    pub sent_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Totals recomputed from the current lines
    pub fn computed_totals(&self) -> Result<InvoiceTotals, MoneyError> {
        InvoiceTotals::from_lines(self.currency, &self.lines)
    }

    /// True when the stored totals match the lines
    pub fn totals_reconcile(&self) -> bool {
        match self.computed_totals() {
            Ok(t) => {
                t.subtotal == self.subtotal
                    && t.tax_amount == self.tax_amount
                    && t.total == self.total
            }
            Err(_) => false,
        }
    }

    /// Moves `draft → pending`
    pub fn finalize(&mut self, now: DateTime<Utc>) -> Result<(), BillingError> {
        match self.status {
            InvoiceStatus::Draft => {
                self.status = InvoiceStatus::Pending;
                self.updated_at = now;
                Ok(())
            }
            InvoiceStatus::Pending => Ok(()),
            other => Err(self.transition_error(other, InvoiceStatus::Pending)),
        }
    }

    /// Moves `draft | pending → sent`; sending twice is a no-op
    pub fn send(&mut self, now: DateTime<Utc>) -> Result<(), BillingError> {
        match self.status {
            InvoiceStatus::Draft | InvoiceStatus::Pending => {
                self.status = InvoiceStatus::Sent;
                self.sent_at = Some(now);
                self.updated_at = now;
                Ok(())
            }
            InvoiceStatus::Sent => Ok(()),
            other => Err(self.transition_error(other, InvoiceStatus::Sent)),
        }
    }

    /// Voids the invoice; paid invoices must be refunded first
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), BillingError> {
        match self.status {
            InvoiceStatus::Canceled => Ok(()),
            InvoiceStatus::Paid => Err(self.transition_error(InvoiceStatus::Paid, InvoiceStatus::Canceled)),
            _ => {
                self.status = InvoiceStatus::Canceled;
                self.updated_at = now;
                Ok(())
            }
        }
    }

    /// Marks the invoice paid
    pub fn mark_paid(&mut self, now: DateTime<Utc>) -> Result<(), BillingError> {
        match self.status {
            InvoiceStatus::Paid => Ok(()),
            InvoiceStatus::Canceled => Err(self.transition_error(InvoiceStatus::Canceled, InvoiceStatus::Paid)),
            _ => {
                self.status = InvoiceStatus::Paid;
                self.paid_at = Some(now);
                self.updated_at = now;
                Ok(())
            }
        }
    }

    /// Re-opens a paid invoice whose payments no longer cover it
    ///
    /// A sent invoice goes back to `sent`, or `overdue` once `today` is past
    /// the due date. One never sent goes back to `draft`.
    pub fn reopen_unpaid(&mut self, today: NaiveDate, now: DateTime<Utc>) {
        if self.status != InvoiceStatus::Paid {
            return;
        }
        self.status = match self.sent_at {
            Some(_) if today > self.due_date => InvoiceStatus::Overdue,
            Some(_) => InvoiceStatus::Sent,
            None => InvoiceStatus::Draft,
        };
        self.paid_at = None;
        self.updated_at = now;
    }

    /// Flags a sent or pending invoice as overdue once `today` is past its due date
    ///
    /// Returns true if the status changed.
    pub fn refresh_overdue(&mut self, today: NaiveDate, now: DateTime<Utc>) -> bool {
        let eligible = matches!(self.status, InvoiceStatus::Sent | InvoiceStatus::Pending);
        if eligible && today > self.due_date {
            self.status = InvoiceStatus::Overdue;
            self.updated_at = now;
            return true;
        }
        false
    }

    /// Line for a given billed time entry, if any
    pub fn line_for_time_entry(&self, entry_id: TimeEntryId) -> Option<&InvoiceLineItem> {
        self.lines
            .iter()
            .find(|l| l.source == LineSource::TimeEntry(entry_id))
    }

    fn transition_error(&self, from: InvoiceStatus, to: InvoiceStatus) -> BillingError {
        BillingError::invalid_state(format!(
            "invoice {} cannot move from {} to {}",
            self.invoice_number,
            from.as_str(),
            to.as_str()
        ))
    }
}
