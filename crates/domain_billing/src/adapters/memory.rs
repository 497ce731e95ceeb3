//! In-memory billing store
//!
//! Holds all state behind one async mutex, so every port call is a single
//! serialized transaction. Used by tests and by the API server when it runs
//! without a database.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use core_kernel::{
    AccountId, AdapterHealth, DomainPort, HealthCheckResult, HealthCheckable, InvoiceId,
    PaymentId, PortError, TicketAddonId, TicketId, TimeEntryId, TimerId, UserId,
};

use crate::addon::TicketAddon;
use crate::approval::BillingState;
use crate::invoice::{Invoice, InvoiceDraft, InvoiceStatus, LineSource};
use crate::numbering::reserve_number;
use crate::payment::{reconcile_invoice, Payment, PaymentStatus};
use crate::ports::{AccountRef, BillingStore, SettledPayment, TicketRef};
use crate::rate::{BillingRate, RateQuery};
use crate::settings::{BillingSetting, TaxConfiguration};
use crate::time_entry::TimeEntry;
use crate::timer::{Timer, TimerStatus};

#[derive(Default)]
struct State {
    tickets: HashMap<TicketId, TicketRef>,
    accounts: HashMap<AccountId, AccountRef>,
    rates: Vec<BillingRate>,
    tax_configurations: Vec<TaxConfiguration>,
    settings: Vec<BillingSetting>,
    timers: HashMap<TimerId, Timer>,
    time_entries: HashMap<TimeEntryId, TimeEntry>,
    addons: HashMap<TicketAddonId, TicketAddon>,
    invoices: HashMap<InvoiceId, Invoice>,
    payments: HashMap<PaymentId, Payment>,
    /// `(line_type, source_id)` of every stored line
    line_sources: HashSet<(&'static str, Uuid)>,
}

impl State {
    fn billing_of(&mut self, source: LineSource) -> Option<&mut BillingState> {
        match source {
            LineSource::TimeEntry(id) => self.time_entries.get_mut(&id).map(|e| &mut e.billing),
            LineSource::TicketAddon(id) => self.addons.get_mut(&id).map(|a| &mut a.billing),
            LineSource::Manual | LineSource::Separator => None,
        }
    }

    fn setting_index(&self, account_id: AccountId) -> Option<usize> {
        self.settings
            .iter()
            .position(|s| s.account_id == Some(account_id))
            .or_else(|| self.settings.iter().position(|s| s.is_global()))
    }

    fn reserve(&mut self, account_id: AccountId, now: DateTime<Utc>) -> Option<String> {
        let index = self.setting_index(account_id)?;
        let setting = &mut self.settings[index];
        setting.updated_at = now;
        Some(reserve_number(setting))
    }
}

/// Billing store backed by process memory
#[derive(Clone, Default)]
pub struct InMemoryBillingStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_ticket(&self, ticket: TicketRef) {
        self.state.lock().await.tickets.insert(ticket.id, ticket);
    }

    pub async fn add_account(&self, account: AccountRef) {
        self.state.lock().await.accounts.insert(account.id, account);
    }

    pub async fn add_billing_rate(&self, rate: BillingRate) {
        self.state.lock().await.rates.push(rate);
    }

    pub async fn add_tax_configuration(&self, configuration: TaxConfiguration) {
        self.state.lock().await.tax_configurations.push(configuration);
    }

    /// Inserts a setting, replacing any existing one with the same scope
    pub async fn put_billing_setting(&self, setting: BillingSetting) {
        let mut state = self.state.lock().await;
        state.settings.retain(|s| s.account_id != setting.account_id);
        state.settings.push(setting);
    }

    /// Stored setting for exactly this scope (`None` = global)
    pub async fn stored_billing_setting(&self, account_id: Option<AccountId>) -> Option<BillingSetting> {
        self.state
            .lock()
            .await
            .settings
            .iter()
            .find(|s| s.account_id == account_id)
            .cloned()
    }

    /// Number of stored invoices
    pub async fn invoice_count(&self) -> usize {
        self.state.lock().await.invoices.len()
    }
}

fn conflict_unless_unbilled(billing: &BillingState, what: &str, id: impl std::fmt::Display) -> Result<(), PortError> {
    match billing {
        BillingState::Unbilled => Ok(()),
        BillingState::Billed(invoice) => Err(PortError::conflict(format!(
            "{} {} is already billed on {}",
            what, id, invoice
        ))),
    }
}

impl DomainPort for InMemoryBillingStore {}

#[async_trait]
impl HealthCheckable for InMemoryBillingStore {
    async fn health_check(&self) -> HealthCheckResult {
        HealthCheckResult {
            adapter_id: "billing-memory".to_string(),
            status: AdapterHealth::Healthy,
            latency_ms: 0,
            message: None,
            checked_at: Utc::now(),
        }
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_ticket(&self, id: TicketId) -> Result<TicketRef, PortError> {
        self.state
            .lock()
            .await
            .tickets
            .get(&id)
            .copied()
            .ok_or_else(|| PortError::not_found("Ticket", id))
    }

    async fn get_account(&self, id: AccountId) -> Result<AccountRef, PortError> {
        self.state
            .lock()
            .await
            .accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::not_found("Account", id))
    }

    async fn billing_rates(&self, _query: &RateQuery) -> Result<Vec<BillingRate>, PortError> {
        Ok(self.state.lock().await.rates.clone())
    }

    async fn tax_configurations(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<TaxConfiguration>, PortError> {
        Ok(self
            .state
            .lock()
            .await
            .tax_configurations
            .iter()
            .filter(|c| c.account_id.map_or(true, |a| a == account_id))
            .cloned()
            .collect())
    }

    async fn billing_setting(
        &self,
        account_id: AccountId,
    ) -> Result<Option<BillingSetting>, PortError> {
        let state = self.state.lock().await;
        Ok(state.setting_index(account_id).map(|i| state.settings[i].clone()))
    }

    async fn reserve_invoice_number(
        &self,
        account_id: AccountId,
    ) -> Result<Option<String>, PortError> {
        Ok(self.state.lock().await.reserve(account_id, Utc::now()))
    }

    async fn insert_timer(&self, timer: &Timer) -> Result<(), PortError> {
        let mut state = self.state.lock().await;
        let duplicate = state.timers.values().any(|t| {
            t.is_active() && t.user_id == timer.user_id && t.ticket_id == timer.ticket_id
        });
        if duplicate {
            return Err(PortError::conflict(format!(
                "user {} already has an active timer on this ticket",
                timer.user_id
            )));
        }
        state.timers.insert(timer.id, timer.clone());
        Ok(())
    }

    async fn get_timer(&self, id: TimerId) -> Result<Timer, PortError> {
        self.state
            .lock()
            .await
            .timers
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::not_found("Timer", id))
    }

    async fn find_active_timer(
        &self,
        user_id: UserId,
        ticket_id: Option<TicketId>,
    ) -> Result<Option<Timer>, PortError> {
        Ok(self
            .state
            .lock()
            .await
            .timers
            .values()
            .find(|t| t.is_active() && t.user_id == user_id && t.ticket_id == ticket_id)
            .cloned())
    }

    async fn active_timers(&self, user_id: UserId) -> Result<Vec<Timer>, PortError> {
        let mut timers: Vec<Timer> = self
            .state
            .lock()
            .await
            .timers
            .values()
            .filter(|t| t.is_active() && t.user_id == user_id)
            .cloned()
            .collect();
        timers.sort_by_key(|t| (t.started_at, t.id));
        Ok(timers)
    }

    async fn update_timer(&self, timer: &Timer, expected: TimerStatus) -> Result<(), PortError> {
        let mut state = self.state.lock().await;
        let stored = state
            .timers
            .get_mut(&timer.id)
            .ok_or_else(|| PortError::not_found("Timer", timer.id))?;
        if stored.status != expected {
            return Err(PortError::conflict(format!(
                "timer {} is {}, not {}",
                timer.id,
                stored.status.as_str(),
                expected.as_str()
            )));
        }
        *stored = timer.clone();
        Ok(())
    }

    async fn commit_timer(&self, timer: &Timer, entry: &TimeEntry) -> Result<(), PortError> {
        let mut state = self.state.lock().await;
        let stored = state
            .timers
            .get(&timer.id)
            .ok_or_else(|| PortError::not_found("Timer", timer.id))?;
        if stored.time_entry_id.is_some() || stored.status == TimerStatus::Canceled {
            return Err(PortError::conflict(format!(
                "timer {} is already committed or canceled",
                timer.id
            )));
        }
        state.time_entries.insert(entry.id, entry.clone());
        state.timers.insert(timer.id, timer.clone());
        Ok(())
    }

    async fn insert_time_entry(&self, entry: &TimeEntry) -> Result<(), PortError> {
        self.state
            .lock()
            .await
            .time_entries
            .insert(entry.id, entry.clone());
        Ok(())
    }

    async fn get_time_entry(&self, id: TimeEntryId) -> Result<TimeEntry, PortError> {
        self.state
            .lock()
            .await
            .time_entries
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::not_found("TimeEntry", id))
    }

    async fn update_time_entry(&self, entry: &TimeEntry) -> Result<(), PortError> {
        let mut state = self.state.lock().await;
        let stored = state
            .time_entries
            .get_mut(&entry.id)
            .ok_or_else(|| PortError::not_found("TimeEntry", entry.id))?;
        conflict_unless_unbilled(&stored.billing, "time entry", entry.id)?;
        conflict_unless_unbilled(&entry.billing, "time entry", entry.id)?;
        *stored = entry.clone();
        Ok(())
    }

    async fn unbilled_time_entries(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<TimeEntry>, PortError> {
        Ok(self
            .state
            .lock()
            .await
            .time_entries
            .values()
            .filter(|e| e.account_id == account_id && e.is_consolidation_candidate())
            .cloned()
            .collect())
    }

    async fn insert_addon(&self, addon: &TicketAddon) -> Result<(), PortError> {
        self.state.lock().await.addons.insert(addon.id, addon.clone());
        Ok(())
    }

    async fn get_addon(&self, id: TicketAddonId) -> Result<TicketAddon, PortError> {
        self.state
            .lock()
            .await
            .addons
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::not_found("TicketAddon", id))
    }

    async fn update_addon(&self, addon: &TicketAddon) -> Result<(), PortError> {
        let mut state = self.state.lock().await;
        let stored = state
            .addons
            .get_mut(&addon.id)
            .ok_or_else(|| PortError::not_found("TicketAddon", addon.id))?;
        conflict_unless_unbilled(&stored.billing, "add-on", addon.id)?;
        conflict_unless_unbilled(&addon.billing, "add-on", addon.id)?;
        *stored = addon.clone();
        Ok(())
    }

    async fn unbilled_addons(&self, account_id: AccountId) -> Result<Vec<TicketAddon>, PortError> {
        let state = self.state.lock().await;
        Ok(state
            .addons
            .values()
            .filter(|a| {
                state
                    .tickets
                    .get(&a.ticket_id)
                    .map_or(a.account_id, |t| t.account_id)
                    == account_id
            })
            .filter(|a| a.is_consolidation_candidate())
            .cloned()
            .collect())
    }

    async fn commit_consolidation(
        &self,
        draft: &InvoiceDraft,
        now: DateTime<Utc>,
    ) -> Result<Invoice, PortError> {
        let mut state = self.state.lock().await;

        // Validate everything before touching state
        for id in &draft.time_entry_ids {
            let entry = state
                .time_entries
                .get(id)
                .ok_or_else(|| PortError::not_found("TimeEntry", id))?;
            conflict_unless_unbilled(&entry.billing, "time entry", id)?;
            if !entry.is_consolidation_candidate() {
                return Err(PortError::conflict(format!(
                    "time entry {} is no longer billable",
                    id
                )));
            }
        }
        for id in &draft.addon_ids {
            let addon = state
                .addons
                .get(id)
                .ok_or_else(|| PortError::not_found("TicketAddon", id))?;
            conflict_unless_unbilled(&addon.billing, "add-on", id)?;
            if !addon.is_consolidation_candidate() {
                return Err(PortError::conflict(format!("add-on {} is no longer billable", id)));
            }
        }
        let sources: Vec<(&'static str, Uuid)> = draft
            .lines
            .iter()
            .filter_map(|l| l.source.source_id().map(|id| (l.source.line_type(), id)))
            .collect();
        if let Some(taken) = sources.iter().find(|s| state.line_sources.contains(*s)) {
            return Err(PortError::conflict(format!(
                "{} {} already appears on an invoice line",
                taken.0, taken.1
            )));
        }

        let number = state
            .reserve(draft.account_id, now)
            .ok_or_else(|| PortError::not_found("BillingSetting", draft.account_id))?;

        for id in &draft.time_entry_ids {
            if let Some(entry) = state.time_entries.get_mut(id) {
                entry.billing = BillingState::Billed(draft.id);
                entry.updated_at = now;
            }
        }
        for id in &draft.addon_ids {
            if let Some(addon) = state.addons.get_mut(id) {
                addon.billing = BillingState::Billed(draft.id);
                addon.updated_at = now;
            }
        }
        state.line_sources.extend(sources);

        let invoice = draft.clone().into_invoice(number, now);
        state.invoices.insert(invoice.id, invoice.clone());
        Ok(invoice)
    }

    async fn get_invoice(&self, id: InvoiceId) -> Result<Invoice, PortError> {
        self.state
            .lock()
            .await
            .invoices
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::not_found("Invoice", id))
    }

    async fn update_invoice_status(
        &self,
        invoice: &Invoice,
        expected: InvoiceStatus,
    ) -> Result<(), PortError> {
        let mut state = self.state.lock().await;
        let stored = state
            .invoices
            .get_mut(&invoice.id)
            .ok_or_else(|| PortError::not_found("Invoice", invoice.id))?;
        if stored.status != expected {
            return Err(PortError::conflict(format!(
                "invoice {} is {}, not {}",
                stored.invoice_number,
                stored.status.as_str(),
                expected.as_str()
            )));
        }
        stored.status = invoice.status;
        stored.sent_at = invoice.sent_at;
        stored.paid_at = invoice.paid_at;
        stored.updated_at = invoice.updated_at;
        Ok(())
    }

    async fn discard_draft_invoice(&self, id: InvoiceId) -> Result<(), PortError> {
        let mut state = self.state.lock().await;
        let invoice = state
            .invoices
            .get(&id)
            .ok_or_else(|| PortError::not_found("Invoice", id))?;
        if invoice.status != InvoiceStatus::Draft {
            return Err(PortError::conflict(format!(
                "invoice {} is {}, only drafts can be discarded",
                invoice.invoice_number,
                invoice.status.as_str()
            )));
        }
        if state.payments.values().any(|p| p.invoice_id == id) {
            return Err(PortError::conflict(format!(
                "invoice {} has payments",
                invoice.invoice_number
            )));
        }

        // Check every release first so a refusal leaves nothing half undone
        let sources: Vec<LineSource> = invoice.lines.iter().map(|l| l.source).collect();
        for source in &sources {
            if let Some(billing) = state.billing_of(*source) {
                let mut check = *billing;
                check.release(id).map_err(|e| PortError::conflict(e.to_string()))?;
            }
        }
        for source in sources {
            if let Some(billing) = state.billing_of(source) {
                billing.release(id).map_err(|e| PortError::conflict(e.to_string()))?;
            }
            if let Some(source_id) = source.source_id() {
                state.line_sources.remove(&(source.line_type(), source_id));
            }
        }
        state.invoices.remove(&id);
        Ok(())
    }

    async fn invoices_due_before(&self, date: NaiveDate) -> Result<Vec<Invoice>, PortError> {
        Ok(self
            .state
            .lock()
            .await
            .invoices
            .values()
            .filter(|i| matches!(i.status, InvoiceStatus::Sent | InvoiceStatus::Pending))
            .filter(|i| i.due_date < date)
            .cloned()
            .collect())
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<(), PortError> {
        let mut state = self.state.lock().await;
        if !state.invoices.contains_key(&payment.invoice_id) {
            return Err(PortError::not_found("Invoice", payment.invoice_id));
        }
        state.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn get_payment(&self, id: PaymentId) -> Result<Payment, PortError> {
        self.state
            .lock()
            .await
            .payments
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::not_found("Payment", id))
    }

    async fn payments_for_invoice(&self, invoice_id: InvoiceId) -> Result<Vec<Payment>, PortError> {
        let mut payments: Vec<Payment> = self
            .state
            .lock()
            .await
            .payments
            .values()
            .filter(|p| p.invoice_id == invoice_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| (p.created_at, p.id));
        Ok(payments)
    }

    async fn settle_payment(
        &self,
        payment: &Payment,
        expected: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<SettledPayment, PortError> {
        let mut state = self.state.lock().await;
        let stored = state
            .payments
            .get(&payment.id)
            .ok_or_else(|| PortError::not_found("Payment", payment.id))?;
        if stored.status != expected {
            return Err(PortError::conflict(format!(
                "payment {} is {}, expected {}",
                payment.id,
                stored.status.as_str(),
                expected.as_str()
            )));
        }

        let mut invoice = state
            .invoices
            .get(&payment.invoice_id)
            .cloned()
            .ok_or_else(|| PortError::not_found("Invoice", payment.invoice_id))?;
        let payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.invoice_id == invoice.id && p.id != payment.id)
            .cloned()
            .chain(std::iter::once(payment.clone()))
            .collect();
        let reconciliation = reconcile_invoice(&mut invoice, &payments, now)
            .map_err(|e| PortError::internal(e.to_string()))?;

        state.payments.insert(payment.id, payment.clone());
        state.invoices.insert(invoice.id, invoice.clone());
        Ok(SettledPayment {
            payment: payment.clone(),
            invoice,
            reconciliation,
        })
    }
}
