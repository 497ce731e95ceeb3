//! Billing repository
//!
//! SQL for the billing tables. Every function runs on a plain
//! `&mut PgConnection`, so the adapter can call it on a pooled connection or
//! compose several calls into one transaction. Guarded writes return the
//! number of affected rows and leave the decision to the caller.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use core_kernel::{
    AccountId, InvoiceId, PaymentId, TicketAddonId, TicketId, TimeEntryId, TimerId, UserId,
};
use domain_billing::{
    AccountRef, BillingRate, BillingSetting, Invoice, Payment, RateQuery, TaxConfiguration,
    InvoiceStatus, TicketAddon, TicketRef, TimeEntry, Timer, TimerStatus,
};

use crate::error::DatabaseError;
use crate::repositories::rows::{
    scope_id, time_entry_currency, AccountRow, AddonRow, BillingRateRow, BillingSettingRow,
    InvoiceRow, LineItemRow, PaymentRow, TaxConfigurationRow, TicketRow, TimeEntryRow, TimerRow,
    ADDON_COLUMNS, INVOICE_COLUMNS, LINE_COLUMNS, PAYMENT_COLUMNS, RATE_COLUMNS,
    SETTING_COLUMNS, TAX_COLUMNS, TIMER_COLUMNS, TIME_ENTRY_COLUMNS,
};

type DbResult<T> = Result<T, DatabaseError>;

fn ids<T: Copy + Into<Uuid>>(ids: &[T]) -> Vec<Uuid> {
    ids.iter().map(|id| (*id).into()).collect()
}

fn lock_clause(lock: bool) -> &'static str {
    if lock {
        " FOR UPDATE"
    } else {
        ""
    }
}

// ============================================================================
// Collaborators
// ============================================================================

pub async fn fetch_ticket(conn: &mut PgConnection, id: TicketId) -> DbResult<Option<TicketRef>> {
    let row = sqlx::query_as::<_, TicketRow>("SELECT id, account_id FROM tickets WHERE id = $1")
        .bind(Uuid::from(id))
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(Into::into))
}

pub async fn fetch_account(conn: &mut PgConnection, id: AccountId) -> DbResult<Option<AccountRef>> {
    let row = sqlx::query_as::<_, AccountRow>(
        "SELECT id, name, jurisdiction FROM accounts WHERE id = $1",
    )
    .bind(Uuid::from(id))
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(Into::into))
}

pub async fn upsert_ticket(conn: &mut PgConnection, ticket: &TicketRef) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO tickets (id, account_id) VALUES ($1, $2)
         ON CONFLICT (id) DO UPDATE SET account_id = EXCLUDED.account_id",
    )
    .bind(Uuid::from(ticket.id))
    .bind(Uuid::from(ticket.account_id))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn upsert_account(conn: &mut PgConnection, account: &AccountRef) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO accounts (id, name, jurisdiction) VALUES ($1, $2, $3)
         ON CONFLICT (id) DO UPDATE
         SET name = EXCLUDED.name, jurisdiction = EXCLUDED.jurisdiction",
    )
    .bind(Uuid::from(account.id))
    .bind(&account.name)
    .bind(&account.jurisdiction)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ============================================================================
// Configuration
// ============================================================================

/// Every rate the cascade could pick for `query`
pub async fn fetch_rates(conn: &mut PgConnection, query: &RateQuery) -> DbResult<Vec<BillingRate>> {
    let sql = format!(
        "SELECT {RATE_COLUMNS} FROM billing_rates
         WHERE id = $1
            OR (scope = 'ticket' AND scope_id = $2)
            OR (scope = 'user' AND scope_id = $3)
            OR (scope = 'account' AND scope_id = $4)
            OR scope = 'system'
         ORDER BY id"
    );
    sqlx::query_as::<_, BillingRateRow>(&sql)
        .bind(query.explicit.map(Uuid::from))
        .bind(query.ticket_id.map(Uuid::from))
        .bind(query.user_id.map(Uuid::from))
        .bind(query.account_id.map(Uuid::from))
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(BillingRate::try_from)
        .collect()
}

pub async fn insert_rate(conn: &mut PgConnection, rate: &BillingRate) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO billing_rates (id, scope, scope_id, name, hourly_rate, currency, is_active)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(Uuid::from(rate.id))
    .bind(rate.scope.as_str())
    .bind(scope_id(&rate.scope))
    .bind(&rate.name)
    .bind(rate.hourly_rate.amount())
    .bind(rate.hourly_rate.currency().code())
    .bind(rate.is_active)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Global configurations plus those of `account_id`
pub async fn fetch_tax_configurations(
    conn: &mut PgConnection,
    account_id: AccountId,
) -> DbResult<Vec<TaxConfiguration>> {
    let sql = format!(
        "SELECT {TAX_COLUMNS} FROM tax_configurations
         WHERE account_id IS NULL OR account_id = $1
         ORDER BY id"
    );
    sqlx::query_as::<_, TaxConfigurationRow>(&sql)
        .bind(Uuid::from(account_id))
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(TaxConfiguration::try_from)
        .collect()
}

pub async fn insert_tax_configuration(
    conn: &mut PgConnection,
    configuration: &TaxConfiguration,
) -> DbResult<()> {
    let categories: Vec<String> = configuration
        .categories
        .iter()
        .map(|c| c.as_str().to_string())
        .collect();
    sqlx::query(
        "INSERT INTO tax_configurations
            (id, account_id, name, tax_type, rate, jurisdiction, categories,
             effective_from, expires_on, is_active)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(Uuid::from(configuration.id))
    .bind(configuration.account_id.map(Uuid::from))
    .bind(&configuration.name)
    .bind(&configuration.tax_type)
    .bind(configuration.rate.as_percentage())
    .bind(&configuration.jurisdiction)
    .bind(categories)
    .bind(configuration.effective_from)
    .bind(configuration.expires_on)
    .bind(configuration.is_active)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// The account's own setting, else the global one
///
/// With `lock`, the returned row stays locked until the transaction ends,
/// which serializes every reservation against the same counter.
pub async fn fetch_effective_setting(
    conn: &mut PgConnection,
    account_id: AccountId,
    lock: bool,
) -> DbResult<Option<BillingSetting>> {
    let sql = format!(
        "SELECT {SETTING_COLUMNS} FROM billing_settings
         WHERE account_id = $1 OR account_id IS NULL
         ORDER BY account_id IS NULL
         LIMIT 1{}",
        lock_clause(lock)
    );
    sqlx::query_as::<_, BillingSettingRow>(&sql)
        .bind(Uuid::from(account_id))
        .fetch_optional(&mut *conn)
        .await?
        .map(BillingSetting::try_from)
        .transpose()
}

/// The setting stored for exactly this scope (`None` = global)
pub async fn fetch_scoped_setting(
    conn: &mut PgConnection,
    account_id: Option<AccountId>,
) -> DbResult<Option<BillingSetting>> {
    let sql = format!(
        "SELECT {SETTING_COLUMNS} FROM billing_settings WHERE account_id IS NOT DISTINCT FROM $1"
    );
    sqlx::query_as::<_, BillingSettingRow>(&sql)
        .bind(account_id.map(Uuid::from))
        .fetch_optional(&mut *conn)
        .await?
        .map(BillingSetting::try_from)
        .transpose()
}

/// Replaces the setting of the same scope
pub async fn replace_setting(conn: &mut PgConnection, setting: &BillingSetting) -> DbResult<()> {
    sqlx::query("DELETE FROM billing_settings WHERE account_id IS NOT DISTINCT FROM $1")
        .bind(setting.account_id.map(Uuid::from))
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "INSERT INTO billing_settings
            (id, account_id, invoice_prefix, next_invoice_number, number_padding,
             payment_terms_days, currency, master_tax_rate, default_tax_mode, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(Uuid::from(setting.id))
    .bind(setting.account_id.map(Uuid::from))
    .bind(&setting.invoice_prefix)
    .bind(setting.next_invoice_number)
    .bind(i32::try_from(setting.number_padding).unwrap_or(i32::MAX))
    .bind(i32::try_from(setting.payment_terms_days).unwrap_or(i32::MAX))
    .bind(setting.currency.code())
    .bind(setting.master_tax_rate.map(|r| r.as_percentage()))
    .bind(setting.default_tax_mode.as_str())
    .bind(setting.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn store_counter(conn: &mut PgConnection, setting: &BillingSetting) -> DbResult<()> {
    sqlx::query(
        "UPDATE billing_settings SET next_invoice_number = $2, updated_at = $3 WHERE id = $1",
    )
    .bind(Uuid::from(setting.id))
    .bind(setting.next_invoice_number)
    .bind(setting.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ============================================================================
// Timers
// ============================================================================

pub async fn insert_timer(conn: &mut PgConnection, timer: &Timer) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO timers
            (id, user_id, account_id, ticket_id, description, status, started_at, paused_at,
             stopped_at, paused_seconds, billing_rate_id, time_entry_id, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    )
    .bind(Uuid::from(timer.id))
    .bind(Uuid::from(timer.user_id))
    .bind(timer.account_id.map(Uuid::from))
    .bind(timer.ticket_id.map(Uuid::from))
    .bind(&timer.description)
    .bind(timer.status.as_str())
    .bind(timer.started_at)
    .bind(timer.paused_at)
    .bind(timer.stopped_at)
    .bind(timer.paused_seconds)
    .bind(timer.billing_rate_id.map(Uuid::from))
    .bind(timer.time_entry_id.map(Uuid::from))
    .bind(timer.created_at)
    .bind(timer.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn fetch_timer(conn: &mut PgConnection, id: TimerId) -> DbResult<Option<Timer>> {
    let sql = format!("SELECT {TIMER_COLUMNS} FROM timers WHERE id = $1");
    sqlx::query_as::<_, TimerRow>(&sql)
        .bind(Uuid::from(id))
        .fetch_optional(&mut *conn)
        .await?
        .map(Timer::try_from)
        .transpose()
}

pub async fn fetch_active_timer(
    conn: &mut PgConnection,
    user_id: UserId,
    ticket_id: Option<TicketId>,
) -> DbResult<Option<Timer>> {
    let sql = format!(
        "SELECT {TIMER_COLUMNS} FROM timers
         WHERE user_id = $1
           AND ticket_id IS NOT DISTINCT FROM $2
           AND status IN ('running', 'paused')"
    );
    sqlx::query_as::<_, TimerRow>(&sql)
        .bind(Uuid::from(user_id))
        .bind(ticket_id.map(Uuid::from))
        .fetch_optional(&mut *conn)
        .await?
        .map(Timer::try_from)
        .transpose()
}

pub async fn fetch_active_timers(conn: &mut PgConnection, user_id: UserId) -> DbResult<Vec<Timer>> {
    let sql = format!(
        "SELECT {TIMER_COLUMNS} FROM timers
         WHERE user_id = $1 AND status IN ('running', 'paused')
         ORDER BY started_at, id"
    );
    sqlx::query_as::<_, TimerRow>(&sql)
        .bind(Uuid::from(user_id))
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(Timer::try_from)
        .collect()
}

/// Which stored timers an update may overwrite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerGuard {
    /// The stored timer still has this status
    Status(TimerStatus),
    /// The stored timer holds no time entry yet and was not canceled
    NoEntry,
}

pub async fn update_timer(
    conn: &mut PgConnection,
    timer: &Timer,
    guard: TimerGuard,
) -> DbResult<u64> {
    let condition = match guard {
        TimerGuard::Status(_) => "status = $12",
        TimerGuard::NoEntry => "time_entry_id IS NULL AND status <> 'canceled'",
    };
    let sql = format!(
        "UPDATE timers
         SET account_id = $2, ticket_id = $3, description = $4, status = $5, paused_at = $6,
             stopped_at = $7, paused_seconds = $8, billing_rate_id = $9, time_entry_id = $10,
             updated_at = $11
         WHERE id = $1 AND {condition}"
    );
    let mut query = sqlx::query(&sql)
        .bind(Uuid::from(timer.id))
        .bind(timer.account_id.map(Uuid::from))
        .bind(timer.ticket_id.map(Uuid::from))
        .bind(&timer.description)
        .bind(timer.status.as_str())
        .bind(timer.paused_at)
        .bind(timer.stopped_at)
        .bind(timer.paused_seconds)
        .bind(timer.billing_rate_id.map(Uuid::from))
        .bind(timer.time_entry_id.map(Uuid::from))
        .bind(timer.updated_at);
    if let TimerGuard::Status(expected) = guard {
        query = query.bind(expected.as_str());
    }
    let result = query.execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

// ============================================================================
// Time entries
// ============================================================================

pub async fn insert_time_entry(conn: &mut PgConnection, entry: &TimeEntry) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO time_entries
            (id, user_id, account_id, ticket_id, timer_id, description, started_at, ended_at,
             duration_seconds, billable, billing_rate_id, currency, rate_at_time, rate_override,
             approval_status, decided_by, decided_at, approval_notes, invoice_id, deleted_at,
             created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                 $18, $19, $20, $21, $22)",
    )
    .bind(Uuid::from(entry.id))
    .bind(Uuid::from(entry.user_id))
    .bind(Uuid::from(entry.account_id))
    .bind(entry.ticket_id.map(Uuid::from))
    .bind(entry.timer_id.map(Uuid::from))
    .bind(&entry.description)
    .bind(entry.started_at)
    .bind(entry.ended_at)
    .bind(entry.duration_seconds)
    .bind(entry.billable)
    .bind(entry.billing_rate_id.map(Uuid::from))
    .bind(time_entry_currency(entry))
    .bind(entry.rate_at_time.map(|m| m.amount()))
    .bind(entry.rate_override.map(|m| m.amount()))
    .bind(entry.approval.status.as_str())
    .bind(entry.approval.decided_by.map(Uuid::from))
    .bind(entry.approval.decided_at)
    .bind(&entry.approval.notes)
    .bind(entry.billing.invoice_id().map(Uuid::from))
    .bind(entry.deleted_at)
    .bind(entry.created_at)
    .bind(entry.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn fetch_time_entry(
    conn: &mut PgConnection,
    id: TimeEntryId,
) -> DbResult<Option<TimeEntry>> {
    let sql = format!("SELECT {TIME_ENTRY_COLUMNS} FROM time_entries WHERE id = $1");
    sqlx::query_as::<_, TimeEntryRow>(&sql)
        .bind(Uuid::from(id))
        .fetch_optional(&mut *conn)
        .await?
        .map(TimeEntry::try_from)
        .transpose()
}

/// Writes an entry that is still unbilled; returns 0 when it is not
pub async fn update_unbilled_time_entry(
    conn: &mut PgConnection,
    entry: &TimeEntry,
) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE time_entries
         SET description = $2, ended_at = $3, duration_seconds = $4, billable = $5,
             billing_rate_id = $6, currency = $7, rate_at_time = $8, rate_override = $9,
             approval_status = $10, decided_by = $11, decided_at = $12, approval_notes = $13,
             deleted_at = $14, updated_at = $15
         WHERE id = $1 AND invoice_id IS NULL",
    )
    .bind(Uuid::from(entry.id))
    .bind(&entry.description)
    .bind(entry.ended_at)
    .bind(entry.duration_seconds)
    .bind(entry.billable)
    .bind(entry.billing_rate_id.map(Uuid::from))
    .bind(time_entry_currency(entry))
    .bind(entry.rate_at_time.map(|m| m.amount()))
    .bind(entry.rate_override.map(|m| m.amount()))
    .bind(entry.approval.status.as_str())
    .bind(entry.approval.decided_by.map(Uuid::from))
    .bind(entry.approval.decided_at)
    .bind(&entry.approval.notes)
    .bind(entry.deleted_at)
    .bind(entry.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn fetch_unbilled_time_entries(
    conn: &mut PgConnection,
    account_id: AccountId,
) -> DbResult<Vec<TimeEntry>> {
    let sql = format!(
        "SELECT {TIME_ENTRY_COLUMNS} FROM time_entries
         WHERE account_id = $1
           AND invoice_id IS NULL
           AND deleted_at IS NULL
           AND billable
           AND approval_status = 'approved'
         ORDER BY started_at, id"
    );
    sqlx::query_as::<_, TimeEntryRow>(&sql)
        .bind(Uuid::from(account_id))
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(TimeEntry::try_from)
        .collect()
}

/// Points unbilled, approved, billable entries at `invoice_id`; returns how
/// many were flipped
pub async fn bill_time_entries(
    conn: &mut PgConnection,
    entry_ids: &[TimeEntryId],
    invoice_id: InvoiceId,
    now: DateTime<Utc>,
) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE time_entries SET invoice_id = $1, updated_at = $2
         WHERE id = ANY($3) AND invoice_id IS NULL AND deleted_at IS NULL
           AND approval_status = 'approved' AND billable",
    )
    .bind(Uuid::from(invoice_id))
    .bind(now)
    .bind(ids(entry_ids))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn release_time_entries(
    conn: &mut PgConnection,
    invoice_id: InvoiceId,
    now: DateTime<Utc>,
) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE time_entries SET invoice_id = NULL, updated_at = $2 WHERE invoice_id = $1",
    )
    .bind(Uuid::from(invoice_id))
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

// ============================================================================
// Ticket add-ons
// ============================================================================

pub async fn insert_addon(conn: &mut PgConnection, addon: &TicketAddon) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO ticket_addons
            (id, ticket_id, account_id, name, description, kind, currency, unit_price, quantity,
             discount, total, billable, taxable, approval_status, decided_by, decided_at,
             approval_notes, invoice_id, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                 $18, $19, $20)",
    )
    .bind(Uuid::from(addon.id))
    .bind(Uuid::from(addon.ticket_id))
    .bind(Uuid::from(addon.account_id))
    .bind(&addon.name)
    .bind(&addon.description)
    .bind(addon.kind.as_str())
    .bind(addon.unit_price.currency().code())
    .bind(addon.unit_price.amount())
    .bind(addon.quantity)
    .bind(addon.discount.amount())
    .bind(addon.total.amount())
    .bind(addon.billable)
    .bind(addon.taxable)
    .bind(addon.approval.status.as_str())
    .bind(addon.approval.decided_by.map(Uuid::from))
    .bind(addon.approval.decided_at)
    .bind(&addon.approval.notes)
    .bind(addon.billing.invoice_id().map(Uuid::from))
    .bind(addon.created_at)
    .bind(addon.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn fetch_addon(
    conn: &mut PgConnection,
    id: TicketAddonId,
) -> DbResult<Option<TicketAddon>> {
    let sql = format!("SELECT {ADDON_COLUMNS} FROM ticket_addons WHERE id = $1");
    sqlx::query_as::<_, AddonRow>(&sql)
        .bind(Uuid::from(id))
        .fetch_optional(&mut *conn)
        .await?
        .map(TicketAddon::try_from)
        .transpose()
}

/// Writes an add-on that is still unbilled; returns 0 when it is not
pub async fn update_unbilled_addon(conn: &mut PgConnection, addon: &TicketAddon) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE ticket_addons
         SET name = $2, description = $3, unit_price = $4, quantity = $5, discount = $6,
             total = $7, billable = $8, taxable = $9, approval_status = $10, decided_by = $11,
             decided_at = $12, approval_notes = $13, updated_at = $14
         WHERE id = $1 AND invoice_id IS NULL",
    )
    .bind(Uuid::from(addon.id))
    .bind(&addon.name)
    .bind(&addon.description)
    .bind(addon.unit_price.amount())
    .bind(addon.quantity)
    .bind(addon.discount.amount())
    .bind(addon.total.amount())
    .bind(addon.billable)
    .bind(addon.taxable)
    .bind(addon.approval.status.as_str())
    .bind(addon.approval.decided_by.map(Uuid::from))
    .bind(addon.approval.decided_at)
    .bind(&addon.approval.notes)
    .bind(addon.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Candidates on the account's tickets; the ticket's current account wins
pub async fn fetch_unbilled_addons(
    conn: &mut PgConnection,
    account_id: AccountId,
) -> DbResult<Vec<TicketAddon>> {
    let sql = format!(
        "SELECT {ADDON_COLUMNS} FROM ticket_addons a
         WHERE COALESCE((SELECT t.account_id FROM tickets t WHERE t.id = a.ticket_id),
                        a.account_id) = $1
           AND invoice_id IS NULL
           AND billable
           AND approval_status = 'approved'
         ORDER BY created_at, id"
    );
    sqlx::query_as::<_, AddonRow>(&sql)
        .bind(Uuid::from(account_id))
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(TicketAddon::try_from)
        .collect()
}

pub async fn bill_addons(
    conn: &mut PgConnection,
    addon_ids: &[TicketAddonId],
    invoice_id: InvoiceId,
    now: DateTime<Utc>,
) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE ticket_addons SET invoice_id = $1, updated_at = $2
         WHERE id = ANY($3) AND invoice_id IS NULL
           AND approval_status = 'approved' AND billable",
    )
    .bind(Uuid::from(invoice_id))
    .bind(now)
    .bind(ids(addon_ids))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn release_addons(
    conn: &mut PgConnection,
    invoice_id: InvoiceId,
    now: DateTime<Utc>,
) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE ticket_addons SET invoice_id = NULL, updated_at = $2 WHERE invoice_id = $1",
    )
    .bind(Uuid::from(invoice_id))
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

// ============================================================================
// Invoices
// ============================================================================

/// Inserts the invoice header and all of its lines
pub async fn insert_invoice(conn: &mut PgConnection, invoice: &Invoice) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO invoices
            (id, invoice_number, account_id, status, invoice_date, due_date, currency,
             subtotal, tax_amount, total, tax_mode, override_tax, override_rate, notes,
             sent_at, paid_at, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
    )
    .bind(Uuid::from(invoice.id))
    .bind(&invoice.invoice_number)
    .bind(Uuid::from(invoice.account_id))
    .bind(invoice.status.as_str())
    .bind(invoice.invoice_date)
    .bind(invoice.due_date)
    .bind(invoice.currency.code())
    .bind(invoice.subtotal.amount())
    .bind(invoice.tax_amount.amount())
    .bind(invoice.total.amount())
    .bind(invoice.tax_policy.mode.as_str())
    .bind(invoice.tax_policy.override_tax)
    .bind(invoice.tax_policy.override_rate.map(|r| r.as_percentage()))
    .bind(&invoice.notes)
    .bind(invoice.sent_at)
    .bind(invoice.paid_at)
    .bind(invoice.created_at)
    .bind(invoice.updated_at)
    .execute(&mut *conn)
    .await?;

    for line in &invoice.lines {
        sqlx::query(
            "INSERT INTO invoice_line_items
                (id, invoice_id, line_type, source_id, sort_order, description, quantity,
                 unit_price, discount, tax_rate, tax_amount, total_amount, billable, taxable,
                 category, tax_unresolved)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(Uuid::from(line.id))
        .bind(Uuid::from(line.invoice_id))
        .bind(line.source.line_type())
        .bind(line.source.source_id())
        .bind(line.sort_order)
        .bind(&line.description)
        .bind(line.quantity)
        .bind(line.unit_price.amount())
        .bind(line.discount.amount())
        .bind(line.tax_rate.as_percentage())
        .bind(line.tax_amount.amount())
        .bind(line.total_amount.amount())
        .bind(line.billable)
        .bind(line.taxable)
        .bind(line.category.as_str())
        .bind(line.tax_unresolved)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn fetch_invoice(
    conn: &mut PgConnection,
    id: InvoiceId,
    lock: bool,
) -> DbResult<Option<Invoice>> {
    let sql = format!(
        "SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1{}",
        lock_clause(lock)
    );
    let Some(row) = sqlx::query_as::<_, InvoiceRow>(&sql)
        .bind(Uuid::from(id))
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Ok(None);
    };

    let sql = format!(
        "SELECT {LINE_COLUMNS} FROM invoice_line_items WHERE invoice_id = $1 ORDER BY sort_order"
    );
    let lines = sqlx::query_as::<_, LineItemRow>(&sql)
        .bind(Uuid::from(id))
        .fetch_all(&mut *conn)
        .await?;
    row.into_invoice(lines).map(Some)
}

/// Writes the status fields if the stored status is still `expected`
pub async fn update_invoice_status(
    conn: &mut PgConnection,
    invoice: &Invoice,
    expected: InvoiceStatus,
) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE invoices SET status = $2, sent_at = $3, paid_at = $4, updated_at = $5
         WHERE id = $1 AND status = $6",
    )
    .bind(Uuid::from(invoice.id))
    .bind(invoice.status.as_str())
    .bind(invoice.sent_at)
    .bind(invoice.paid_at)
    .bind(invoice.updated_at)
    .bind(expected.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Deletes the invoice; its lines go with it
pub async fn delete_invoice(conn: &mut PgConnection, id: InvoiceId) -> DbResult<u64> {
    let result = sqlx::query("DELETE FROM invoices WHERE id = $1")
        .bind(Uuid::from(id))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn invoice_has_payments(conn: &mut PgConnection, id: InvoiceId) -> DbResult<bool> {
    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM payments WHERE invoice_id = $1)",
    )
    .bind(Uuid::from(id))
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

/// Ids of sent or pending invoices due before `date`
pub async fn fetch_due_invoice_ids(
    conn: &mut PgConnection,
    date: NaiveDate,
) -> DbResult<Vec<InvoiceId>> {
    let rows = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM invoices
         WHERE status IN ('sent', 'pending') AND due_date < $1
         ORDER BY due_date, id",
    )
    .bind(date)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(InvoiceId::from).collect())
}

// ============================================================================
// Payments
// ============================================================================

pub async fn insert_payment(conn: &mut PgConnection, payment: &Payment) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO payments
            (id, invoice_id, account_id, method, currency, amount, fees, net_amount, status,
             external_reference, payment_date, processed_at, notes, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
    )
    .bind(Uuid::from(payment.id))
    .bind(Uuid::from(payment.invoice_id))
    .bind(Uuid::from(payment.account_id))
    .bind(payment.method.as_str())
    .bind(payment.currency.code())
    .bind(payment.amount.amount())
    .bind(payment.fees.amount())
    .bind(payment.net_amount.amount())
    .bind(payment.status.as_str())
    .bind(&payment.external_reference)
    .bind(payment.payment_date)
    .bind(payment.processed_at)
    .bind(&payment.notes)
    .bind(payment.created_at)
    .bind(payment.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn fetch_payment(
    conn: &mut PgConnection,
    id: PaymentId,
    lock: bool,
) -> DbResult<Option<Payment>> {
    let sql = format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1{}",
        lock_clause(lock)
    );
    sqlx::query_as::<_, PaymentRow>(&sql)
        .bind(Uuid::from(id))
        .fetch_optional(&mut *conn)
        .await?
        .map(Payment::try_from)
        .transpose()
}

pub async fn fetch_payments_for_invoice(
    conn: &mut PgConnection,
    invoice_id: InvoiceId,
) -> DbResult<Vec<Payment>> {
    let sql = format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE invoice_id = $1 ORDER BY created_at, id"
    );
    sqlx::query_as::<_, PaymentRow>(&sql)
        .bind(Uuid::from(invoice_id))
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(Payment::try_from)
        .collect()
}

pub async fn update_payment(conn: &mut PgConnection, payment: &Payment) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE payments SET status = $2, processed_at = $3, notes = $4, updated_at = $5
         WHERE id = $1",
    )
    .bind(Uuid::from(payment.id))
    .bind(payment.status.as_str())
    .bind(payment.processed_at)
    .bind(&payment.notes)
    .bind(payment.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}
