//! Row types for the billing tables and their mapping onto domain models
//!
//! Enumerations are stored as TEXT and money as `NUMERIC` next to a currency
//! code. A value that does not parse back is reported as
//! [`DatabaseError::CorruptRow`] rather than silently defaulted.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use core_kernel::{Currency, Money, Rate};
use domain_billing::{
    AccountRef, AddonKind, Approval, ApprovalStatus, BillingRate, BillingSetting, BillingState,
    Invoice, InvoiceLineItem, InvoiceStatus, InvoiceTaxPolicy, ItemCategory, LineSource, Payment,
    PaymentMethod, PaymentStatus, RateScope, TaxApplication, TaxConfiguration, TicketAddon,
    TicketRef, TimeEntry, Timer, TimerStatus,
};

use crate::error::DatabaseError;

// ============================================================================
// Column lists
// ============================================================================

pub const TIMER_COLUMNS: &str = "id, user_id, account_id, ticket_id, description, status, \
    started_at, paused_at, stopped_at, paused_seconds, billing_rate_id, time_entry_id, \
    created_at, updated_at";

pub const TIME_ENTRY_COLUMNS: &str = "id, user_id, account_id, ticket_id, timer_id, description, \
    started_at, ended_at, duration_seconds, billable, billing_rate_id, currency, rate_at_time, \
    rate_override, approval_status, decided_by, decided_at, approval_notes, invoice_id, \
    deleted_at, created_at, updated_at";

pub const ADDON_COLUMNS: &str = "id, ticket_id, account_id, name, description, kind, currency, \
    unit_price, quantity, discount, total, billable, taxable, approval_status, decided_by, \
    decided_at, approval_notes, invoice_id, created_at, updated_at";

pub const INVOICE_COLUMNS: &str = "id, invoice_number, account_id, status, invoice_date, \
    due_date, currency, subtotal, tax_amount, total, tax_mode, override_tax, override_rate, \
    notes, sent_at, paid_at, created_at, updated_at";

pub const LINE_COLUMNS: &str = "id, invoice_id, line_type, source_id, sort_order, description, \
    quantity, unit_price, discount, tax_rate, tax_amount, total_amount, billable, taxable, \
    category, tax_unresolved";

pub const PAYMENT_COLUMNS: &str = "id, invoice_id, account_id, method, currency, amount, fees, \
    net_amount, status, external_reference, payment_date, processed_at, notes, created_at, \
    updated_at";

pub const SETTING_COLUMNS: &str = "id, account_id, invoice_prefix, next_invoice_number, \
    number_padding, payment_terms_days, currency, master_tax_rate, default_tax_mode, updated_at";

pub const TAX_COLUMNS: &str = "id, account_id, name, tax_type, rate, jurisdiction, categories, \
    effective_from, expires_on, is_active";

pub const RATE_COLUMNS: &str = "id, scope, scope_id, name, hourly_rate, currency, is_active";

// ============================================================================
// Parsing helpers
// ============================================================================

pub(crate) fn currency(code: &str) -> Result<Currency, DatabaseError> {
    Currency::from_code(code).map_err(|e| DatabaseError::corrupt(e.to_string()))
}

fn parsed<T>(value: &str, parse: fn(&str) -> Option<T>, what: &str) -> Result<T, DatabaseError> {
    parse(value).ok_or_else(|| DatabaseError::corrupt(format!("unknown {} '{}'", what, value)))
}

fn unsigned(value: i32, column: &str) -> Result<u32, DatabaseError> {
    u32::try_from(value).map_err(|_| DatabaseError::corrupt(format!("negative {}", column)))
}

fn approval(
    status: &str,
    decided_by: Option<Uuid>,
    decided_at: Option<DateTime<Utc>>,
    notes: Option<String>,
) -> Result<Approval, DatabaseError> {
    Ok(Approval {
        status: parsed(status, ApprovalStatus::parse, "approval status")?,
        decided_by: decided_by.map(Into::into),
        decided_at,
        notes,
    })
}

// ============================================================================
// Collaborators
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct TicketRow {
    pub id: Uuid,
    pub account_id: Uuid,
}

impl From<TicketRow> for TicketRef {
    fn from(row: TicketRow) -> Self {
        TicketRef {
            id: row.id.into(),
            account_id: row.account_id.into(),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub id: Uuid,
    pub name: String,
    pub jurisdiction: Option<String>,
}

impl From<AccountRow> for AccountRef {
    fn from(row: AccountRow) -> Self {
        AccountRef {
            id: row.id.into(),
            name: row.name,
            jurisdiction: row.jurisdiction,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct BillingRateRow {
    pub id: Uuid,
    pub scope: String,
    pub scope_id: Option<Uuid>,
    pub name: String,
    pub hourly_rate: Decimal,
    pub currency: String,
    pub is_active: bool,
}

impl TryFrom<BillingRateRow> for BillingRate {
    type Error = DatabaseError;

    fn try_from(row: BillingRateRow) -> Result<Self, Self::Error> {
        let scope = match (row.scope.as_str(), row.scope_id) {
            ("ticket", Some(id)) => RateScope::Ticket(id.into()),
            ("user", Some(id)) => RateScope::User(id.into()),
            ("account", Some(id)) => RateScope::Account(id.into()),
            ("system", None) => RateScope::System,
            (scope, _) => {
                return Err(DatabaseError::corrupt(format!(
                    "billing rate {} has invalid scope '{}'",
                    row.id, scope
                )))
            }
        };
        Ok(BillingRate {
            id: row.id.into(),
            scope,
            name: row.name,
            hourly_rate: Money::new(row.hourly_rate, currency(&row.currency)?),
            is_active: row.is_active,
        })
    }
}

/// Scope id column value for a rate scope
pub fn scope_id(scope: &RateScope) -> Option<Uuid> {
    match scope {
        RateScope::Ticket(id) => Some((*id).into()),
        RateScope::User(id) => Some((*id).into()),
        RateScope::Account(id) => Some((*id).into()),
        RateScope::System => None,
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TaxConfigurationRow {
    pub id: Uuid,
    pub account_id: Option<Uuid>,
    pub name: String,
    pub tax_type: String,
    pub rate: Decimal,
    pub jurisdiction: Option<String>,
    pub categories: Vec<String>,
    pub effective_from: NaiveDate,
    pub expires_on: Option<NaiveDate>,
    pub is_active: bool,
}

impl TryFrom<TaxConfigurationRow> for TaxConfiguration {
    type Error = DatabaseError;

    fn try_from(row: TaxConfigurationRow) -> Result<Self, Self::Error> {
        let categories = row
            .categories
            .iter()
            .map(|c| parsed(c, ItemCategory::parse, "item category"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TaxConfiguration {
            id: row.id.into(),
            account_id: row.account_id.map(Into::into),
            name: row.name,
            tax_type: row.tax_type,
            rate: Rate::from_percentage(row.rate),
            jurisdiction: row.jurisdiction,
            categories,
            effective_from: row.effective_from,
            expires_on: row.expires_on,
            is_active: row.is_active,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BillingSettingRow {
    pub id: Uuid,
    pub account_id: Option<Uuid>,
    pub invoice_prefix: String,
    pub next_invoice_number: i64,
    pub number_padding: i32,
    pub payment_terms_days: i32,
    pub currency: String,
    pub master_tax_rate: Option<Decimal>,
    pub default_tax_mode: String,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<BillingSettingRow> for BillingSetting {
    type Error = DatabaseError;

    fn try_from(row: BillingSettingRow) -> Result<Self, Self::Error> {
        Ok(BillingSetting {
            id: row.id.into(),
            account_id: row.account_id.map(Into::into),
            invoice_prefix: row.invoice_prefix,
            next_invoice_number: row.next_invoice_number,
            number_padding: unsigned(row.number_padding, "number_padding")?,
            payment_terms_days: unsigned(row.payment_terms_days, "payment_terms_days")?,
            currency: currency(&row.currency)?,
            master_tax_rate: row.master_tax_rate.map(Rate::from_percentage),
            default_tax_mode: parsed(&row.default_tax_mode, TaxApplication::parse, "tax mode")?,
            updated_at: row.updated_at,
        })
    }
}

// ============================================================================
// Work
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct TimerRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub account_id: Option<Uuid>,
    pub ticket_id: Option<Uuid>,
    pub description: Option<String>,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub paused_seconds: i64,
    pub billing_rate_id: Option<Uuid>,
    pub time_entry_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TimerRow> for Timer {
    type Error = DatabaseError;

    fn try_from(row: TimerRow) -> Result<Self, Self::Error> {
        Ok(Timer {
            id: row.id.into(),
            user_id: row.user_id.into(),
            account_id: row.account_id.map(Into::into),
            ticket_id: row.ticket_id.map(Into::into),
            description: row.description,
            status: parsed(&row.status, TimerStatus::parse, "timer status")?,
            started_at: row.started_at,
            paused_at: row.paused_at,
            stopped_at: row.stopped_at,
            paused_seconds: row.paused_seconds,
            billing_rate_id: row.billing_rate_id.map(Into::into),
            time_entry_id: row.time_entry_id.map(Into::into),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TimeEntryRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub ticket_id: Option<Uuid>,
    pub timer_id: Option<Uuid>,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub billable: bool,
    pub billing_rate_id: Option<Uuid>,
    pub currency: Option<String>,
    pub rate_at_time: Option<Decimal>,
    pub rate_override: Option<Decimal>,
    pub approval_status: String,
    pub decided_by: Option<Uuid>,
    pub decided_at: Option<DateTime<Utc>>,
    pub approval_notes: Option<String>,
    pub invoice_id: Option<Uuid>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Currency code stored alongside a time entry's rates
pub fn time_entry_currency(entry: &TimeEntry) -> Option<&'static str> {
    entry
        .rate_at_time
        .or(entry.rate_override)
        .map(|m| m.currency().code())
}

impl TryFrom<TimeEntryRow> for TimeEntry {
    type Error = DatabaseError;

    fn try_from(row: TimeEntryRow) -> Result<Self, Self::Error> {
        let money = |amount: Option<Decimal>| -> Result<Option<Money>, DatabaseError> {
            match (amount, row.currency.as_deref()) {
                (None, _) => Ok(None),
                (Some(amount), Some(code)) => Ok(Some(Money::new(amount, currency(code)?))),
                (Some(_), None) => Err(DatabaseError::corrupt(format!(
                    "time entry {} has a rate without a currency",
                    row.id
                ))),
            }
        };
        let rate_at_time = money(row.rate_at_time)?;
        let rate_override = money(row.rate_override)?;

        Ok(TimeEntry {
            id: row.id.into(),
            user_id: row.user_id.into(),
            account_id: row.account_id.into(),
            ticket_id: row.ticket_id.map(Into::into),
            timer_id: row.timer_id.map(Into::into),
            description: row.description,
            started_at: row.started_at,
            ended_at: row.ended_at,
            duration_seconds: row.duration_seconds,
            billable: row.billable,
            billing_rate_id: row.billing_rate_id.map(Into::into),
            rate_at_time,
            rate_override,
            approval: approval(
                &row.approval_status,
                row.decided_by,
                row.decided_at,
                row.approval_notes,
            )?,
            billing: BillingState::from_invoice(row.invoice_id.map(Into::into)),
            deleted_at: row.deleted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AddonRow {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub kind: String,
    pub currency: String,
    pub unit_price: Decimal,
    pub quantity: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub billable: bool,
    pub taxable: bool,
    pub approval_status: String,
    pub decided_by: Option<Uuid>,
    pub decided_at: Option<DateTime<Utc>>,
    pub approval_notes: Option<String>,
    pub invoice_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<AddonRow> for TicketAddon {
    type Error = DatabaseError;

    fn try_from(row: AddonRow) -> Result<Self, Self::Error> {
        let currency = currency(&row.currency)?;
        Ok(TicketAddon {
            id: row.id.into(),
            ticket_id: row.ticket_id.into(),
            account_id: row.account_id.into(),
            name: row.name,
            description: row.description,
            kind: parsed(&row.kind, AddonKind::parse, "add-on kind")?,
            unit_price: Money::new(row.unit_price, currency),
            quantity: row.quantity,
            discount: Money::new(row.discount, currency),
            total: Money::new(row.total, currency),
            billable: row.billable,
            taxable: row.taxable,
            approval: approval(
                &row.approval_status,
                row.decided_by,
                row.decided_at,
                row.approval_notes,
            )?,
            billing: BillingState::from_invoice(row.invoice_id.map(Into::into)),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ============================================================================
// Invoices and payments
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct InvoiceRow {
    pub id: Uuid,
    pub invoice_number: String,
    pub account_id: Uuid,
    pub status: String,
    pub invoice_date: NaiveDate,
    pub due_date: NaiveDate,
    pub currency: String,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub tax_mode: String,
    pub override_tax: bool,
    pub override_rate: Option<Decimal>,
    pub notes: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct LineItemRow {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub line_type: String,
    pub source_id: Option<Uuid>,
    pub sort_order: i32,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub discount: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub billable: bool,
    pub taxable: Option<bool>,
    pub category: String,
    pub tax_unresolved: bool,
}

impl LineItemRow {
    fn into_line(self, currency: Currency) -> Result<InvoiceLineItem, DatabaseError> {
        let source = LineSource::from_parts(&self.line_type, self.source_id).ok_or_else(|| {
            DatabaseError::corrupt(format!(
                "line {} has invalid source '{}'",
                self.id, self.line_type
            ))
        })?;
        Ok(InvoiceLineItem {
            id: self.id.into(),
            invoice_id: self.invoice_id.into(),
            source,
            sort_order: self.sort_order,
            description: self.description,
            quantity: self.quantity,
            unit_price: Money::new(self.unit_price, currency),
            discount: Money::new(self.discount, currency),
            tax_rate: Rate::from_percentage(self.tax_rate),
            tax_amount: Money::new(self.tax_amount, currency),
            total_amount: Money::new(self.total_amount, currency),
            billable: self.billable,
            taxable: self.taxable,
            category: parsed(&self.category, ItemCategory::parse, "item category")?,
            tax_unresolved: self.tax_unresolved,
        })
    }
}

impl InvoiceRow {
    /// Assembles the invoice with its lines (already in sort order)
    pub fn into_invoice(self, lines: Vec<LineItemRow>) -> Result<Invoice, DatabaseError> {
        let currency = currency(&self.currency)?;
        let lines = lines
            .into_iter()
            .map(|line| line.into_line(currency))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Invoice {
            id: self.id.into(),
            invoice_number: self.invoice_number,
            account_id: self.account_id.into(),
            status: parsed(&self.status, InvoiceStatus::parse, "invoice status")?,
            invoice_date: self.invoice_date,
            due_date: self.due_date,
            currency,
            subtotal: Money::new(self.subtotal, currency),
            tax_amount: Money::new(self.tax_amount, currency),
            total: Money::new(self.total, currency),
            tax_policy: InvoiceTaxPolicy {
                mode: parsed(&self.tax_mode, TaxApplication::parse, "tax mode")?,
                override_tax: self.override_tax,
                override_rate: self.override_rate.map(Rate::from_percentage),
            },
            notes: self.notes,
            lines,
            sent_at: self.sent_at,
            paid_at: self.paid_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PaymentRow {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub account_id: Uuid,
    pub method: String,
    pub currency: String,
    pub amount: Decimal,
    pub fees: Decimal,
    pub net_amount: Decimal,
    pub status: String,
    pub external_reference: Option<String>,
    pub payment_date: NaiveDate,
    pub processed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = DatabaseError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let currency = currency(&row.currency)?;
        Ok(Payment {
            id: row.id.into(),
            invoice_id: row.invoice_id.into(),
            account_id: row.account_id.into(),
            method: parsed(&row.method, PaymentMethod::parse, "payment method")?,
            amount: Money::new(row.amount, currency),
            fees: Money::new(row.fees, currency),
            net_amount: Money::new(row.net_amount, currency),
            currency,
            status: parsed(&row.status, PaymentStatus::parse, "payment status")?,
            external_reference: row.external_reference,
            payment_date: row.payment_date,
            processed_at: row.processed_at,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn timer_row(status: &str) -> TimerRow {
        let now = Utc::now();
        TimerRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            account_id: None,
            ticket_id: None,
            description: None,
            status: status.to_string(),
            started_at: now,
            paused_at: None,
            stopped_at: None,
            paused_seconds: 0,
            billing_rate_id: None,
            time_entry_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_timer_row_maps_status() {
        let timer = Timer::try_from(timer_row("paused")).unwrap();
        assert_eq!(timer.status, TimerStatus::Paused);
    }

    #[test]
    fn test_unknown_status_is_corrupt() {
        let err = Timer::try_from(timer_row("sleeping")).unwrap_err();
        assert!(matches!(err, DatabaseError::CorruptRow(_)));
    }

    #[test]
    fn test_rate_scope_requires_id() {
        let row = BillingRateRow {
            id: Uuid::new_v4(),
            scope: "user".to_string(),
            scope_id: None,
            name: "Senior".to_string(),
            hourly_rate: dec!(150),
            currency: "USD".to_string(),
            is_active: true,
        };
        assert!(BillingRate::try_from(row).is_err());
    }

    #[test]
    fn test_scope_id_round_trips_through_row() {
        let user = Uuid::new_v4();
        let rate = BillingRate::try_from(BillingRateRow {
            id: Uuid::new_v4(),
            scope: "user".to_string(),
            scope_id: Some(user),
            name: "Senior".to_string(),
            hourly_rate: dec!(150),
            currency: "USD".to_string(),
            is_active: true,
        })
        .unwrap();
        assert_eq!(scope_id(&rate.scope), Some(user));
        assert_eq!(rate.hourly_rate, Money::new(dec!(150), Currency::USD));
    }

    #[test]
    fn test_line_source_must_match_type() {
        let row = LineItemRow {
            id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            line_type: "time_entry".to_string(),
            source_id: None,
            sort_order: 1,
            description: "Support".to_string(),
            quantity: dec!(1),
            unit_price: dec!(10),
            discount: dec!(0),
            tax_rate: dec!(0),
            tax_amount: dec!(0),
            total_amount: dec!(10),
            billable: true,
            taxable: None,
            category: "service".to_string(),
            tax_unresolved: false,
        };
        assert!(row.into_line(Currency::USD).is_err());
    }
}
