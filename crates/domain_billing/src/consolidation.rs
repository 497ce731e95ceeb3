//! Billing consolidation
//!
//! Gathers an account's approved, unbilled work into one draft invoice. The
//! engine builds the whole invoice in memory (lines, tax, totals) and hands it
//! to the store, which numbers it and marks every item billed in a single
//! transaction. If any item was billed by someone else in the meantime the
//! commit fails as a whole with `ConcurrentBillingConflict`.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use core_kernel::{AccountId, Clock, Currency, InvoiceId, Money, PortError};

use crate::addon::TicketAddon;
use crate::error::BillingError;
use crate::invoice::{Invoice, InvoiceDraft, InvoiceLineItem, InvoiceTotals, LineDraft};
use crate::ports::BillingStore;
use crate::tax::{InvoiceTaxPolicy, TaxContext, TaxResolver};
use crate::time_entry::TimeEntry;

/// Section heading placed before time entries
pub const LABOR_HEADING: &str = "Labor";
/// Section heading placed before ticket add-ons
pub const ADDON_HEADING: &str = "Products and services";
/// Section heading placed before manual charges
pub const MANUAL_HEADING: &str = "Other charges";

/// A free-form charge added at consolidation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualCharge {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Money,
    pub taxable: Option<bool>,
}

/// Parameters of one consolidation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationRequest {
    /// Invoice date; due date is derived from the payment terms
    pub as_of: NaiveDate,
    /// Defaults to the setting's tax mode without override
    pub tax_policy: Option<InvoiceTaxPolicy>,
    pub notes: Option<String>,
    pub manual_charges: Vec<ManualCharge>,
    /// Insert heading lines before each group
    pub section_headings: bool,
}

impl ConsolidationRequest {
    pub fn as_of(as_of: NaiveDate) -> Self {
        Self {
            as_of,
            tax_policy: None,
            notes: None,
            manual_charges: Vec::new(),
            section_headings: false,
        }
    }

    pub fn with_tax_policy(mut self, policy: InvoiceTaxPolicy) -> Self {
        self.tax_policy = Some(policy);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_manual_charge(mut self, charge: ManualCharge) -> Self {
        self.manual_charges.push(charge);
        self
    }

    pub fn with_section_headings(mut self) -> Self {
        self.section_headings = true;
        self
    }
}

/// Turns unbilled work into invoices
#[derive(Clone)]
pub struct BillingConsolidationEngine {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    tax: Arc<TaxResolver>,
}

impl BillingConsolidationEngine {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            tax: Arc::new(TaxResolver::standard()),
        }
    }

    /// Builds the invoice that `consolidate` would commit, without side effects
    ///
    /// # Errors
    ///
    /// - `NoUnbilledItems` when the account has nothing to bill
    /// - `MissingBillingSettings` when no setting applies
    /// - `Validation` when an item is priced in another currency
    #[instrument(skip(self, request), fields(account_id = %account_id, as_of = %request.as_of))]
    pub async fn preview(
        &self,
        account_id: AccountId,
        request: &ConsolidationRequest,
    ) -> Result<InvoiceDraft, BillingError> {
        let mut entries: Vec<_> = self
            .store
            .unbilled_time_entries(account_id)
            .await?
            .into_iter()
            .filter(|e| e.account_id == account_id && e.is_consolidation_candidate())
            .collect();
        let mut addons: Vec<_> = self
            .store
            .unbilled_addons(account_id)
            .await?
            .into_iter()
            .filter(|a| a.is_consolidation_candidate())
            .collect();
        if entries.is_empty() && addons.is_empty() {
            return Err(BillingError::NoUnbilledItems(account_id));
        }

        let setting = self
            .store
            .billing_setting(account_id)
            .await?
            .ok_or(BillingError::MissingBillingSettings(account_id))?;
        let jurisdiction = match self.store.get_account(account_id).await {
            Ok(account) => account.jurisdiction,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        let configurations = self.store.tax_configurations(account_id).await?;
        let policy = request
            .tax_policy
            .unwrap_or_else(|| InvoiceTaxPolicy::with_mode(setting.default_tax_mode));
        let currency = setting.currency;
        ensure_currency(&entries, &addons, &request.manual_charges, currency)?;

        entries.sort_by_key(|e| (e.started_at, e.id));
        addons.sort_by_key(|a| (a.created_at, a.id));

        let mut drafts: Vec<LineDraft> = Vec::new();
        if request.section_headings && !entries.is_empty() {
            drafts.push(LineDraft::separator(LABOR_HEADING, currency));
        }
        drafts.extend(entries.iter().map(|e| e.to_line(currency)));
        if request.section_headings && !addons.is_empty() {
            drafts.push(LineDraft::separator(ADDON_HEADING, currency));
        }
        drafts.extend(addons.iter().map(|a| a.to_line()));
        if request.section_headings && !request.manual_charges.is_empty() {
            drafts.push(LineDraft::separator(MANUAL_HEADING, currency));
        }
        for charge in &request.manual_charges {
            validate_charge(charge)?;
            drafts.push(LineDraft::manual(
                charge.description.clone(),
                charge.quantity,
                charge.unit_price,
                charge.taxable,
            ));
        }

        let ctx = TaxContext {
            account_id,
            jurisdiction: jurisdiction.as_deref(),
            as_of: request.as_of,
            policy: &policy,
            configurations: &configurations,
            setting: Some(&setting),
        };
        let invoice_id = InvoiceId::new_v7();
        let lines = drafts
            .into_iter()
            .zip(1..)
            .map(|(draft, sort_order)| {
                let decision = self.tax.resolve(&draft, &ctx);
                InvoiceLineItem::priced(invoice_id, sort_order, draft, &decision)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let totals = InvoiceTotals::from_lines(currency, &lines)?;

        Ok(InvoiceDraft {
            id: invoice_id,
            account_id,
            invoice_date: request.as_of,
            due_date: setting.due_date(request.as_of),
            currency,
            tax_policy: policy,
            notes: request.notes.clone(),
            lines,
            totals,
            time_entry_ids: entries.iter().map(|e| e.id).collect(),
            addon_ids: addons.iter().map(|a| a.id).collect(),
        })
    }

    /// Consolidates all unbilled work of `account_id` into a draft invoice
    ///
    /// # Errors
    ///
    /// As [`preview`](Self::preview), plus `ConcurrentBillingConflict` when an
    /// item was billed concurrently. Nothing is persisted on error.
    #[instrument(skip(self, request), fields(account_id = %account_id))]
    pub async fn consolidate(
        &self,
        account_id: AccountId,
        request: ConsolidationRequest,
    ) -> Result<Invoice, BillingError> {
        let draft = self.preview(account_id, &request).await?;
        let line_count = draft.lines.len();

        let invoice = self
            .store
            .commit_consolidation(&draft, self.clock.now())
            .await
            .map_err(|e| match e {
                PortError::Conflict { message } => {
                    warn!(%message, "Consolidation lost a billing race");
                    BillingError::ConcurrentBillingConflict(message)
                }
                PortError::NotFound { ref entity_type, .. } if entity_type == "BillingSetting" => {
                    BillingError::MissingBillingSettings(account_id)
                }
                other => other.into(),
            })?;

        info!(
            invoice_id = %invoice.id,
            invoice_number = %invoice.invoice_number,
            lines = line_count,
            total = %invoice.total,
            "Invoice consolidated"
        );
        Ok(invoice)
    }

    /// Retries `consolidate` on `ConcurrentBillingConflict` with a fresh snapshot
    ///
    /// A retry after a lost race may legitimately end in `NoUnbilledItems`.
    pub async fn consolidate_with_retry(
        &self,
        account_id: AccountId,
        request: ConsolidationRequest,
        max_attempts: u32,
    ) -> Result<Invoice, BillingError> {
        let mut attempt = 1;
        loop {
            match self.consolidate(account_id, request.clone()).await {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    attempt += 1;
                    warn!(attempt, "Retrying consolidation");
                }
                result => return result,
            }
        }
    }

    pub async fn get_invoice(&self, invoice_id: InvoiceId) -> Result<Invoice, BillingError> {
        Ok(self.store.get_invoice(invoice_id).await?)
    }

    /// Deletes a draft invoice and releases its items for re-billing
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn discard_draft(&self, invoice_id: InvoiceId) -> Result<(), BillingError> {
        self.store
            .discard_draft_invoice(invoice_id)
            .await
            .map_err(|e| match e {
                PortError::Conflict { message } => BillingError::InvalidState(message),
                other => other.into(),
            })?;
        info!("Draft invoice discarded");
        Ok(())
    }

    /// `draft → pending`
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn finalize(&self, invoice_id: InvoiceId) -> Result<Invoice, BillingError> {
        self.transition(invoice_id, Invoice::finalize).await
    }

    /// `draft | pending → sent`
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn send(&self, invoice_id: InvoiceId) -> Result<Invoice, BillingError> {
        let invoice = self.transition(invoice_id, Invoice::send).await?;
        info!(invoice_number = %invoice.invoice_number, "Invoice sent");
        Ok(invoice)
    }

    /// Voids an unpaid invoice; its items stay billed
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn cancel(&self, invoice_id: InvoiceId) -> Result<Invoice, BillingError> {
        let invoice = self.transition(invoice_id, Invoice::cancel).await?;
        info!(invoice_number = %invoice.invoice_number, "Invoice canceled");
        Ok(invoice)
    }

    /// Applies a status change and writes it only if nobody else moved the
    /// invoice since it was read
    async fn transition<F>(&self, invoice_id: InvoiceId, apply: F) -> Result<Invoice, BillingError>
    where
        F: FnOnce(&mut Invoice, DateTime<Utc>) -> Result<(), BillingError>,
    {
        let mut invoice = self.store.get_invoice(invoice_id).await?;
        let expected = invoice.status;
        apply(&mut invoice, self.clock.now())?;
        if invoice.status == expected {
            return Ok(invoice);
        }

        self.store
            .update_invoice_status(&invoice, expected)
            .await
            .map_err(|e| match e {
                PortError::Conflict { message } => {
                    warn!(%message, "Invoice changed concurrently");
                    BillingError::InvalidState(message)
                }
                other => other.into(),
            })?;
        Ok(invoice)
    }
}

/// Every priced item must already be in the invoice currency
fn ensure_currency(
    entries: &[TimeEntry],
    addons: &[TicketAddon],
    charges: &[ManualCharge],
    currency: Currency,
) -> Result<(), BillingError> {
    let mismatch = |what: String, found: Currency| {
        BillingError::validation(format!(
            "{} is priced in {}, invoice currency is {}",
            what, found, currency
        ))
    };
    for entry in entries {
        if let Some(rate) = entry.effective_rate().filter(|r| r.currency() != currency) {
            return Err(mismatch(format!("time entry {}", entry.id), rate.currency()));
        }
    }
    if let Some(addon) = addons.iter().find(|a| a.unit_price.currency() != currency) {
        return Err(mismatch(format!("add-on {}", addon.id), addon.unit_price.currency()));
    }
    if let Some(charge) = charges.iter().find(|c| c.unit_price.currency() != currency) {
        return Err(mismatch(
            format!("manual charge '{}'", charge.description),
            charge.unit_price.currency(),
        ));
    }
    Ok(())
}

fn validate_charge(charge: &ManualCharge) -> Result<(), BillingError> {
    if charge.description.trim().is_empty() {
        return Err(BillingError::validation("manual charge needs a description"));
    }
    if charge.quantity <= Decimal::ZERO {
        return Err(BillingError::validation("manual charge quantity must be positive"));
    }
    if charge.unit_price.is_negative() {
        return Err(BillingError::validation("manual charge price must not be negative"));
    }
    Ok(())
}
