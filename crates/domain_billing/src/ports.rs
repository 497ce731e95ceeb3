//! Billing Store Port
//!
//! This module defines the storage port the billing components depend on,
//! so persistence can be swapped (PostgreSQL in `infra_db`, the in-memory
//! adapter in [`crate::adapters`], test doubles).
//!
//! # Atomicity
//!
//! The port is shaped around the invariants the components cannot enforce on
//! their own:
//!
//! - [`BillingStore::insert_timer`] refuses a second active timer for the
//!   same (user, ticket) pair.
//! - [`BillingStore::commit_timer`] inserts the time entry and links it to
//!   the timer in one step, at most once.
//! - [`BillingStore::commit_consolidation`] reserves the invoice number,
//!   inserts the invoice and its lines, and flips every item from `Unbilled`
//!   to `Billed(invoice)` in one transaction. Any item already billed fails
//!   the whole commit with `PortError::Conflict`. Items that were reopened,
//!   rejected, made non-billable or deleted since the snapshot fail it too.
//! - [`BillingStore::update_timer`] and [`BillingStore::update_invoice_status`]
//!   are compare-and-swap on the status the caller read.
//! - [`BillingStore::settle_payment`] updates a payment and reconciles its
//!   invoice under one lock.
//!
//! # Usage
//!
//! ```rust,ignore
//! let store: Arc<dyn BillingStore> = Arc::new(InMemoryBillingStore::new());
//! let engine = BillingConsolidationEngine::new(store.clone(), Arc::new(SystemClock));
//! let invoice = engine.consolidate(account_id, ConsolidationRequest::as_of(today)).await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use core_kernel::{
    AccountId, DomainPort, HealthCheckable, InvoiceId, PaymentId, PortError, TicketAddonId,
    TicketId, TimeEntryId, TimerId, UserId,
};

use crate::addon::TicketAddon;
use crate::invoice::{Invoice, InvoiceDraft, InvoiceStatus};
use crate::payment::{Payment, PaymentStatus, Reconciliation};
use crate::rate::{BillingRate, RateQuery};
use crate::settings::{BillingSetting, TaxConfiguration};
use crate::time_entry::TimeEntry;
use crate::timer::{Timer, TimerStatus};

/// Ticket as seen by billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRef {
    pub id: TicketId,
    pub account_id: AccountId,
}

/// Account as seen by billing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRef {
    pub id: AccountId,
    pub name: String,
    /// Jurisdiction code used for tax-configuration matching
    pub jurisdiction: Option<String>,
}

/// A payment after settlement, with its invoice reconciled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettledPayment {
    pub payment: Payment,
    pub invoice: Invoice,
    pub reconciliation: Reconciliation,
}

/// Persistence port for the billing components
#[async_trait]
pub trait BillingStore: DomainPort + HealthCheckable {
    // ========================================================================
    // Collaborators and configuration (read-only)
    // ========================================================================

    async fn get_ticket(&self, id: TicketId) -> Result<TicketRef, PortError>;

    async fn get_account(&self, id: AccountId) -> Result<AccountRef, PortError>;

    /// Rates that may apply to `query`; the cascade picks among them
    async fn billing_rates(&self, query: &RateQuery) -> Result<Vec<BillingRate>, PortError>;

    /// Account-scoped and global tax configurations
    async fn tax_configurations(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<TaxConfiguration>, PortError>;

    /// The account's own setting, else the global one
    async fn billing_setting(
        &self,
        account_id: AccountId,
    ) -> Result<Option<BillingSetting>, PortError>;

    /// Reserves the next invoice number in its own transaction
    ///
    /// Returns `None` when neither an account nor a global setting exists.
    async fn reserve_invoice_number(
        &self,
        account_id: AccountId,
    ) -> Result<Option<String>, PortError>;

    // ========================================================================
    // Timers
    // ========================================================================

    /// Inserts a new active timer
    ///
    /// `PortError::Conflict` if the user already has an active timer on the
    /// same ticket (or on no ticket, when `ticket_id` is `None`).
    async fn insert_timer(&self, timer: &Timer) -> Result<(), PortError>;

    async fn get_timer(&self, id: TimerId) -> Result<Timer, PortError>;

    async fn find_active_timer(
        &self,
        user_id: UserId,
        ticket_id: Option<TicketId>,
    ) -> Result<Option<Timer>, PortError>;

    async fn active_timers(&self, user_id: UserId) -> Result<Vec<Timer>, PortError>;

    /// Persists timer state if the stored status is still `expected`
    ///
    /// `PortError::Conflict` when another writer moved the timer first.
    async fn update_timer(&self, timer: &Timer, expected: TimerStatus) -> Result<(), PortError>;

    /// Inserts `entry` and stores its id on `timer` atomically
    ///
    /// `PortError::Conflict` if the stored timer already holds a time entry
    /// or has been canceled.
    async fn commit_timer(&self, timer: &Timer, entry: &TimeEntry) -> Result<(), PortError>;

    // ========================================================================
    // Time entries and add-ons
    // ========================================================================

    async fn insert_time_entry(&self, entry: &TimeEntry) -> Result<(), PortError>;

    async fn get_time_entry(&self, id: TimeEntryId) -> Result<TimeEntry, PortError>;

    /// Persists an unbilled entry
    ///
    /// `PortError::Conflict` if the stored entry has been invoiced meanwhile.
    async fn update_time_entry(&self, entry: &TimeEntry) -> Result<(), PortError>;

    /// Billable, approved, unbilled, non-deleted entries of the account
    async fn unbilled_time_entries(&self, account_id: AccountId)
        -> Result<Vec<TimeEntry>, PortError>;

    async fn insert_addon(&self, addon: &TicketAddon) -> Result<(), PortError>;

    async fn get_addon(&self, id: TicketAddonId) -> Result<TicketAddon, PortError>;

    /// Persists an unbilled add-on; same guard as `update_time_entry`
    async fn update_addon(&self, addon: &TicketAddon) -> Result<(), PortError>;

    /// Billable, approved, unbilled add-ons on the account's tickets
    async fn unbilled_addons(&self, account_id: AccountId) -> Result<Vec<TicketAddon>, PortError>;

    // ========================================================================
    // Invoices
    // ========================================================================

    /// Numbers and persists a consolidated invoice, billing its items
    ///
    /// `PortError::NotFound` for `BillingSetting` when no setting exists;
    /// `PortError::Conflict` when any item is no longer unbilled.
    async fn commit_consolidation(
        &self,
        draft: &InvoiceDraft,
        now: DateTime<Utc>,
    ) -> Result<Invoice, PortError>;

    async fn get_invoice(&self, id: InvoiceId) -> Result<Invoice, PortError>;

    /// Persists status fields (`status`, `sent_at`, `paid_at`, `updated_at`)
    /// if the stored status is still `expected`
    ///
    /// `PortError::Conflict` when the invoice changed status meanwhile.
    async fn update_invoice_status(
        &self,
        invoice: &Invoice,
        expected: InvoiceStatus,
    ) -> Result<(), PortError>;

    /// Deletes a draft invoice and its lines, releasing its items
    ///
    /// `PortError::Conflict` if the invoice is no longer a draft.
    async fn discard_draft_invoice(&self, id: InvoiceId) -> Result<(), PortError>;

    /// Sent or pending invoices with a due date before `date`
    async fn invoices_due_before(&self, date: NaiveDate) -> Result<Vec<Invoice>, PortError>;

    // ========================================================================
    // Payments
    // ========================================================================

    async fn insert_payment(&self, payment: &Payment) -> Result<(), PortError>;

    async fn get_payment(&self, id: PaymentId) -> Result<Payment, PortError>;

    async fn payments_for_invoice(&self, invoice_id: InvoiceId) -> Result<Vec<Payment>, PortError>;

    /// Stores `payment` if its stored status is still `expected`, then
    /// reconciles the invoice against all its payments
    async fn settle_payment(
        &self,
        payment: &Payment,
        expected: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<SettledPayment, PortError>;
}
