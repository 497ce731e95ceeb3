//! PostgreSQL Billing Store
//!
//! Implements the `BillingStore` port on PostgreSQL. Reads run on a pooled
//! connection; every write that must be atomic runs in one transaction.
//!
//! # Concurrency
//!
//! - Invoice numbers: the effective `billing_settings` row is locked
//!   `FOR UPDATE` for the rest of the transaction, so concurrent reservations
//!   against the same counter queue up and never share a number. A rolled
//!   back consolidation also rolls back its counter increment.
//! - Billing: items are flipped with `WHERE invoice_id IS NULL` plus the
//!   approval and billable checks, and the affected row count must match, so
//!   a lost race aborts the whole commit.
//!   `UNIQUE (line_type, source_id)` on line items backs this up.
//! - Timers: a partial unique index allows one running or paused timer per
//!   user and ticket. Updates carry `status = <expected>` in their WHERE.
//! - Invoice status: same compare-and-swap on the status the caller read.
//!
//! # Example
//!
//! ```rust,ignore
//! use infra_db::{create_pool, DatabaseConfig, PostgresBillingStore};
//!
//! let pool = create_pool(DatabaseConfig::new(url).with_migrations()).await?;
//! let store: Arc<dyn BillingStore> = Arc::new(PostgresBillingStore::new(pool));
//! ```

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument, warn};

use core_kernel::{
    AccountId, AdapterHealth, DomainPort, HealthCheckResult, HealthCheckable, InvoiceId,
    PaymentId, PortError, TicketAddonId, TicketId, TimeEntryId, TimerId, UserId,
};
use domain_billing::numbering::reserve_number;
use domain_billing::payment::reconcile_invoice;
use domain_billing::{
    AccountRef, BillingRate, BillingSetting, BillingStore, Invoice, InvoiceDraft, InvoiceStatus,
    Payment, PaymentStatus, RateQuery, SettledPayment, TaxConfiguration, TicketAddon, TicketRef,
    TimeEntry, Timer, TimerStatus,
};

use crate::error::DatabaseError;
use crate::repositories::billing::{self as repo, TimerGuard};

/// PostgreSQL-backed implementation of the `BillingStore` port
#[derive(Debug, Clone)]
pub struct PostgresBillingStore {
    pool: PgPool,
}

impl PostgresBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ========================================================================
    // Collaborator and configuration seeding
    // ========================================================================

    pub async fn upsert_account(&self, account: &AccountRef) -> Result<(), DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        repo::upsert_account(&mut conn, account).await
    }

    pub async fn upsert_ticket(&self, ticket: &TicketRef) -> Result<(), DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        repo::upsert_ticket(&mut conn, ticket).await
    }

    pub async fn add_billing_rate(&self, rate: &BillingRate) -> Result<(), DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        repo::insert_rate(&mut conn, rate).await
    }

    pub async fn add_tax_configuration(
        &self,
        configuration: &TaxConfiguration,
    ) -> Result<(), DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        repo::insert_tax_configuration(&mut conn, configuration).await
    }

    /// Inserts a setting, replacing any existing one with the same scope
    pub async fn put_billing_setting(&self, setting: &BillingSetting) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        repo::replace_setting(&mut tx, setting).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Stored setting for exactly this scope (`None` = global)
    pub async fn stored_billing_setting(
        &self,
        account_id: Option<AccountId>,
    ) -> Result<Option<BillingSetting>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        repo::fetch_scoped_setting(&mut conn, account_id).await
    }
}

/// Distinguishes a missing row from a guard that did not match
fn guard_failed<T>(
    found: Result<Option<T>, DatabaseError>,
    entity: &'static str,
    id: impl std::fmt::Display,
    conflict: impl FnOnce() -> String,
) -> PortError {
    match found {
        Ok(Some(_)) => PortError::conflict(conflict()),
        Ok(None) => PortError::not_found(entity, id),
        Err(e) => e.into(),
    }
}

impl DomainPort for PostgresBillingStore {}

#[async_trait]
impl HealthCheckable for PostgresBillingStore {
    async fn health_check(&self) -> HealthCheckResult {
        let start = std::time::Instant::now();

        let result = sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await;

        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(_) => HealthCheckResult {
                adapter_id: "billing-postgres".to_string(),
                status: AdapterHealth::Healthy,
                latency_ms,
                message: None,
                checked_at: Utc::now(),
            },
            Err(e) => HealthCheckResult {
                adapter_id: "billing-postgres".to_string(),
                status: AdapterHealth::Unhealthy,
                latency_ms,
                message: Some(format!("Database error: {}", e)),
                checked_at: Utc::now(),
            },
        }
    }
}

#[async_trait]
impl BillingStore for PostgresBillingStore {
    async fn get_ticket(&self, id: TicketId) -> Result<TicketRef, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        repo::fetch_ticket(&mut conn, id)
            .await?
            .ok_or_else(|| PortError::not_found("Ticket", id))
    }

    async fn get_account(&self, id: AccountId) -> Result<AccountRef, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        repo::fetch_account(&mut conn, id)
            .await?
            .ok_or_else(|| PortError::not_found("Account", id))
    }

    async fn billing_rates(&self, query: &RateQuery) -> Result<Vec<BillingRate>, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        Ok(repo::fetch_rates(&mut conn, query).await?)
    }

    async fn tax_configurations(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<TaxConfiguration>, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        Ok(repo::fetch_tax_configurations(&mut conn, account_id).await?)
    }

    async fn billing_setting(
        &self,
        account_id: AccountId,
    ) -> Result<Option<BillingSetting>, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        Ok(repo::fetch_effective_setting(&mut conn, account_id, false).await?)
    }

    #[instrument(skip(self), fields(account_id = %account_id))]
    async fn reserve_invoice_number(
        &self,
        account_id: AccountId,
    ) -> Result<Option<String>, PortError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from)?;
        let Some(mut setting) = repo::fetch_effective_setting(&mut tx, account_id, true).await?
        else {
            return Ok(None);
        };
        let number = reserve_number(&mut setting);
        setting.updated_at = Utc::now();
        repo::store_counter(&mut tx, &setting).await?;
        tx.commit().await.map_err(DatabaseError::from)?;
        debug!(%number, "Invoice number reserved");
        Ok(Some(number))
    }

    // ========================================================================
    // Timers
    // ========================================================================

    async fn insert_timer(&self, timer: &Timer) -> Result<(), PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        repo::insert_timer(&mut conn, timer).await.map_err(|e| match e {
            DatabaseError::DuplicateEntry(_) => PortError::conflict(format!(
                "user {} already has an active timer on this ticket",
                timer.user_id
            )),
            other => other.into(),
        })
    }

    async fn get_timer(&self, id: TimerId) -> Result<Timer, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        repo::fetch_timer(&mut conn, id)
            .await?
            .ok_or_else(|| PortError::not_found("Timer", id))
    }

    async fn find_active_timer(
        &self,
        user_id: UserId,
        ticket_id: Option<TicketId>,
    ) -> Result<Option<Timer>, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        Ok(repo::fetch_active_timer(&mut conn, user_id, ticket_id).await?)
    }

    async fn active_timers(&self, user_id: UserId) -> Result<Vec<Timer>, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        Ok(repo::fetch_active_timers(&mut conn, user_id).await?)
    }

    async fn update_timer(&self, timer: &Timer, expected: TimerStatus) -> Result<(), PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        if repo::update_timer(&mut conn, timer, TimerGuard::Status(expected)).await? == 0 {
            let found = repo::fetch_timer(&mut conn, timer.id).await;
            return Err(guard_failed(found, "Timer", timer.id, || {
                format!("timer {} is no longer {}", timer.id, expected.as_str())
            }));
        }
        Ok(())
    }

    #[instrument(skip(self, timer, entry), fields(timer_id = %timer.id, time_entry_id = %entry.id))]
    async fn commit_timer(&self, timer: &Timer, entry: &TimeEntry) -> Result<(), PortError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from)?;
        repo::insert_time_entry(&mut tx, entry).await?;
        if repo::update_timer(&mut tx, timer, TimerGuard::NoEntry).await? == 0 {
            let found = repo::fetch_timer(&mut tx, timer.id).await;
            return Err(guard_failed(found, "Timer", timer.id, || {
                format!("timer {} is already committed or canceled", timer.id)
            }));
        }
        tx.commit().await.map_err(DatabaseError::from)?;
        Ok(())
    }

    // ========================================================================
    // Time entries and add-ons
    // ========================================================================

    async fn insert_time_entry(&self, entry: &TimeEntry) -> Result<(), PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        Ok(repo::insert_time_entry(&mut conn, entry).await?)
    }

    async fn get_time_entry(&self, id: TimeEntryId) -> Result<TimeEntry, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        repo::fetch_time_entry(&mut conn, id)
            .await?
            .ok_or_else(|| PortError::not_found("TimeEntry", id))
    }

    async fn update_time_entry(&self, entry: &TimeEntry) -> Result<(), PortError> {
        if entry.billing.is_billed() {
            return Err(PortError::conflict(format!(
                "time entry {} is already billed",
                entry.id
            )));
        }
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        if repo::update_unbilled_time_entry(&mut conn, entry).await? == 0 {
            let found = repo::fetch_time_entry(&mut conn, entry.id).await;
            return Err(guard_failed(found, "TimeEntry", entry.id, || {
                format!("time entry {} is already billed", entry.id)
            }));
        }
        Ok(())
    }

    async fn unbilled_time_entries(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<TimeEntry>, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        Ok(repo::fetch_unbilled_time_entries(&mut conn, account_id).await?)
    }

    async fn insert_addon(&self, addon: &TicketAddon) -> Result<(), PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        Ok(repo::insert_addon(&mut conn, addon).await?)
    }

    async fn get_addon(&self, id: TicketAddonId) -> Result<TicketAddon, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        repo::fetch_addon(&mut conn, id)
            .await?
            .ok_or_else(|| PortError::not_found("TicketAddon", id))
    }

    async fn update_addon(&self, addon: &TicketAddon) -> Result<(), PortError> {
        if addon.billing.is_billed() {
            return Err(PortError::conflict(format!("add-on {} is already billed", addon.id)));
        }
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        if repo::update_unbilled_addon(&mut conn, addon).await? == 0 {
            let found = repo::fetch_addon(&mut conn, addon.id).await;
            return Err(guard_failed(found, "TicketAddon", addon.id, || {
                format!("add-on {} is already billed", addon.id)
            }));
        }
        Ok(())
    }

    async fn unbilled_addons(&self, account_id: AccountId) -> Result<Vec<TicketAddon>, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        Ok(repo::fetch_unbilled_addons(&mut conn, account_id).await?)
    }

    // ========================================================================
    // Invoices
    // ========================================================================

    #[instrument(skip(self, draft), fields(invoice_id = %draft.id, account_id = %draft.account_id))]
    async fn commit_consolidation(
        &self,
        draft: &InvoiceDraft,
        now: DateTime<Utc>,
    ) -> Result<Invoice, PortError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from)?;

        let mut setting = repo::fetch_effective_setting(&mut tx, draft.account_id, true)
            .await?
            .ok_or_else(|| PortError::not_found("BillingSetting", draft.account_id))?;
        let number = reserve_number(&mut setting);
        setting.updated_at = now;
        repo::store_counter(&mut tx, &setting).await?;

        let invoice = draft.clone().into_invoice(number, now);
        repo::insert_invoice(&mut tx, &invoice)
            .await
            .map_err(|e| match e {
                DatabaseError::DuplicateEntry(message) => PortError::conflict(format!(
                    "an item already appears on an invoice line: {}",
                    message
                )),
                other => other.into(),
            })?;

        let entries = repo::bill_time_entries(&mut tx, &draft.time_entry_ids, invoice.id, now).await?;
        if entries != draft.time_entry_ids.len() as u64 {
            warn!(
                expected = draft.time_entry_ids.len(),
                billed = entries,
                "Time entries billed concurrently or no longer billable"
            );
            return Err(PortError::conflict(
                "a time entry was billed concurrently or is no longer billable",
            ));
        }
        let addons = repo::bill_addons(&mut tx, &draft.addon_ids, invoice.id, now).await?;
        if addons != draft.addon_ids.len() as u64 {
            warn!(
                expected = draft.addon_ids.len(),
                billed = addons,
                "Add-ons billed concurrently or no longer billable"
            );
            return Err(PortError::conflict(
                "an add-on was billed concurrently or is no longer billable",
            ));
        }

        tx.commit().await.map_err(DatabaseError::from)?;
        Ok(invoice)
    }

    async fn get_invoice(&self, id: InvoiceId) -> Result<Invoice, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        repo::fetch_invoice(&mut conn, id, false)
            .await?
            .ok_or_else(|| PortError::not_found("Invoice", id))
    }

    async fn update_invoice_status(
        &self,
        invoice: &Invoice,
        expected: InvoiceStatus,
    ) -> Result<(), PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        if repo::update_invoice_status(&mut conn, invoice, expected).await? == 0 {
            let found = repo::fetch_invoice(&mut conn, invoice.id, false).await;
            return Err(guard_failed(found, "Invoice", invoice.id, || {
                format!(
                    "invoice {} is no longer {}",
                    invoice.invoice_number,
                    expected.as_str()
                )
            }));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(invoice_id = %id))]
    async fn discard_draft_invoice(&self, id: InvoiceId) -> Result<(), PortError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from)?;
        let invoice = repo::fetch_invoice(&mut tx, id, true)
            .await?
            .ok_or_else(|| PortError::not_found("Invoice", id))?;
        if invoice.status != InvoiceStatus::Draft {
            return Err(PortError::conflict(format!(
                "invoice {} is {}, only drafts can be discarded",
                invoice.invoice_number,
                invoice.status.as_str()
            )));
        }
        if repo::invoice_has_payments(&mut tx, id).await? {
            return Err(PortError::conflict(format!(
                "invoice {} has payments",
                invoice.invoice_number
            )));
        }

        let now = Utc::now();
        let entries = repo::release_time_entries(&mut tx, id, now).await?;
        let addons = repo::release_addons(&mut tx, id, now).await?;
        repo::delete_invoice(&mut tx, id).await?;
        tx.commit().await.map_err(DatabaseError::from)?;
        debug!(entries, addons, "Items released from discarded draft");
        Ok(())
    }

    async fn invoices_due_before(&self, date: NaiveDate) -> Result<Vec<Invoice>, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        let mut invoices = Vec::new();
        for id in repo::fetch_due_invoice_ids(&mut conn, date).await? {
            if let Some(invoice) = repo::fetch_invoice(&mut conn, id, false).await? {
                invoices.push(invoice);
            }
        }
        Ok(invoices)
    }

    // ========================================================================
    // Payments
    // ========================================================================

    async fn insert_payment(&self, payment: &Payment) -> Result<(), PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        repo::insert_payment(&mut conn, payment)
            .await
            .map_err(|e| match e {
                DatabaseError::ForeignKeyViolation(_) => {
                    PortError::not_found("Invoice", payment.invoice_id)
                }
                other => other.into(),
            })
    }

    async fn get_payment(&self, id: PaymentId) -> Result<Payment, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        repo::fetch_payment(&mut conn, id, false)
            .await?
            .ok_or_else(|| PortError::not_found("Payment", id))
    }

    async fn payments_for_invoice(&self, invoice_id: InvoiceId) -> Result<Vec<Payment>, PortError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from)?;
        Ok(repo::fetch_payments_for_invoice(&mut conn, invoice_id).await?)
    }

    #[instrument(skip(self, payment), fields(payment_id = %payment.id, expected = expected.as_str()))]
    async fn settle_payment(
        &self,
        payment: &Payment,
        expected: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<SettledPayment, PortError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from)?;

        // Invoice first, then payment: the same order as every other writer
        let mut invoice = repo::fetch_invoice(&mut tx, payment.invoice_id, true)
            .await?
            .ok_or_else(|| PortError::not_found("Invoice", payment.invoice_id))?;
        let stored = repo::fetch_payment(&mut tx, payment.id, true)
            .await?
            .ok_or_else(|| PortError::not_found("Payment", payment.id))?;
        if stored.status != expected {
            return Err(PortError::conflict(format!(
                "payment {} is {}, expected {}",
                payment.id,
                stored.status.as_str(),
                expected.as_str()
            )));
        }

        let payments: Vec<Payment> = repo::fetch_payments_for_invoice(&mut tx, invoice.id)
            .await?
            .into_iter()
            .filter(|p| p.id != payment.id)
            .chain(std::iter::once(payment.clone()))
            .collect();
        let prior = invoice.status;
        let reconciliation = reconcile_invoice(&mut invoice, &payments, now)
            .map_err(|e| PortError::internal(e.to_string()))?;

        repo::update_payment(&mut tx, payment).await?;
        repo::update_invoice_status(&mut tx, &invoice, prior).await?;
        tx.commit().await.map_err(DatabaseError::from)?;

        Ok(SettledPayment {
            payment: payment.clone(),
            invoice,
            reconciliation,
        })
    }
}
