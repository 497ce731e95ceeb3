//! Request and response DTOs
//!
//! Requests carry raw UUIDs and decimals and are checked with `validator`
//! before they become domain inputs. Responses mostly reuse the serializable
//! domain types directly.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use core_kernel::{
    AccountId, BillingRateId, Currency, InvoiceId, Money, Rate, TicketId, UserId,
};
use domain_billing::{
    AddonKind, CommitOverrides, ConsolidationRequest, InvoiceStatus, InvoiceTaxPolicy,
    ManualCharge, NewPayment, NewTicketAddon, NewTimeEntry, PaymentMethod, StartTimer,
    TaxApplication, TimeEntryChanges,
};

use crate::error::ApiError;

fn default_true() -> bool {
    true
}

/// An amount as sent by clients; rounded to the currency on conversion
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MoneyDto {
    pub amount: Decimal,
    pub currency: Currency,
}

impl From<MoneyDto> for Money {
    fn from(dto: MoneyDto) -> Self {
        Money::new(dto.amount, dto.currency)
    }
}

// ============================================================================
// Timers
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct StartTimerRequest {
    pub user_id: UserId,
    pub account_id: Option<AccountId>,
    pub ticket_id: Option<TicketId>,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    pub billing_rate_id: Option<BillingRateId>,
}

impl From<StartTimerRequest> for StartTimer {
    fn from(req: StartTimerRequest) -> Self {
        StartTimer {
            user_id: req.user_id,
            account_id: req.account_id,
            ticket_id: req.ticket_id,
            description: req.description,
            billing_rate_id: req.billing_rate_id,
        }
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CommitTimerRequest {
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    pub account_id: Option<AccountId>,
    pub ticket_id: Option<TicketId>,
    pub billable: Option<bool>,
    pub rate_override: Option<MoneyDto>,
}

impl From<CommitTimerRequest> for CommitOverrides {
    fn from(req: CommitTimerRequest) -> Self {
        CommitOverrides {
            description: req.description,
            account_id: req.account_id,
            ticket_id: req.ticket_id,
            billable: req.billable,
            rate_override: req.rate_override.map(Money::from),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ElapsedResponse {
    pub elapsed_seconds: i64,
}

// ============================================================================
// Time entries and add-ons
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct CreateTimeEntryRequest {
    pub user_id: UserId,
    pub account_id: AccountId,
    pub ticket_id: Option<TicketId>,
    #[validate(length(min = 1, max = 2000))]
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[validate(range(min = 0))]
    pub duration_seconds: Option<i64>,
    #[serde(default = "default_true")]
    pub billable: bool,
    pub billing_rate_id: Option<BillingRateId>,
    pub rate_override: Option<MoneyDto>,
}

impl From<CreateTimeEntryRequest> for NewTimeEntry {
    fn from(req: CreateTimeEntryRequest) -> Self {
        NewTimeEntry {
            user_id: req.user_id,
            account_id: req.account_id,
            ticket_id: req.ticket_id,
            description: req.description,
            started_at: req.started_at,
            ended_at: req.ended_at,
            duration_seconds: req.duration_seconds,
            billable: req.billable,
            billing_rate_id: req.billing_rate_id,
            rate_override: req.rate_override.map(Money::from),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct EditTimeEntryRequest {
    #[validate(length(min = 1, max = 2000))]
    pub description: Option<String>,
    #[validate(range(min = 0))]
    pub duration_seconds: Option<i64>,
    pub billable: Option<bool>,
    pub rate_override: Option<MoneyDto>,
    /// Drops an existing override; wins over `rate_override`
    #[serde(default)]
    pub clear_rate_override: bool,
}

impl From<EditTimeEntryRequest> for TimeEntryChanges {
    fn from(req: EditTimeEntryRequest) -> Self {
        let rate_override = if req.clear_rate_override {
            Some(None)
        } else {
            req.rate_override.map(|rate| Some(Money::from(rate)))
        };
        TimeEntryChanges {
            description: req.description,
            duration_seconds: req.duration_seconds,
            billable: req.billable,
            rate_override,
        }
    }
}

/// Approve or reject
#[derive(Debug, Deserialize, Validate)]
pub struct DecisionRequest {
    pub approver_id: UserId,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateAddonRequest {
    pub ticket_id: TicketId,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    pub kind: AddonKind,
    pub unit_price: MoneyDto,
    pub quantity: Decimal,
    pub discount: Option<MoneyDto>,
    #[serde(default = "default_true")]
    pub billable: bool,
    #[serde(default = "default_true")]
    pub taxable: bool,
}

impl From<CreateAddonRequest> for NewTicketAddon {
    fn from(req: CreateAddonRequest) -> Self {
        NewTicketAddon {
            ticket_id: req.ticket_id,
            name: req.name,
            description: req.description,
            kind: req.kind,
            unit_price: req.unit_price.into(),
            quantity: req.quantity,
            discount: req.discount.map(Money::from),
            billable: req.billable,
            taxable: req.taxable,
        }
    }
}

// ============================================================================
// Invoices
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ManualChargeDto {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: MoneyDto,
    pub taxable: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct ConsolidateRequest {
    /// Defaults to today
    pub as_of: Option<NaiveDate>,
    /// Defaults to the billing setting's mode
    pub tax_mode: Option<TaxApplication>,
    /// Percentage replacing every configured rate; requires `tax_mode`
    pub override_rate: Option<Decimal>,
    #[validate(length(max = 4000))]
    pub notes: Option<String>,
    #[serde(default)]
    pub section_headings: bool,
    #[serde(default)]
    pub manual_charges: Vec<ManualChargeDto>,
}

impl ConsolidateRequest {
    /// Builds the engine request, dating it `today` unless `as_of` is given
    pub fn into_request(self, today: NaiveDate) -> Result<ConsolidationRequest, ApiError> {
        let mut request = ConsolidationRequest::as_of(self.as_of.unwrap_or(today));

        match (self.tax_mode, self.override_rate) {
            (Some(mode), Some(rate)) => {
                request = request.with_tax_policy(InvoiceTaxPolicy::overridden(
                    mode,
                    Rate::from_percentage(rate),
                ));
            }
            (Some(mode), None) => {
                request = request.with_tax_policy(InvoiceTaxPolicy::with_mode(mode));
            }
            (None, Some(_)) => {
                return Err(ApiError::Validation(
                    "override_rate requires tax_mode".to_string(),
                ))
            }
            (None, None) => {}
        }
        if let Some(notes) = self.notes {
            request = request.with_notes(notes);
        }
        if self.section_headings {
            request = request.with_section_headings();
        }
        for charge in self.manual_charges {
            request = request.with_manual_charge(ManualCharge {
                description: charge.description,
                quantity: charge.quantity,
                unit_price: charge.unit_price.into(),
                taxable: charge.taxable,
            });
        }
        Ok(request)
    }
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub invoice_id: InvoiceId,
    pub invoice_number: String,
    pub status: InvoiceStatus,
    pub total: Money,
    pub total_paid: Money,
    pub outstanding: Money,
}

// ============================================================================
// Payments
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct RecordPaymentRequest {
    pub method: PaymentMethod,
    pub amount: MoneyDto,
    pub fees: Option<MoneyDto>,
    pub payment_date: NaiveDate,
    #[validate(length(max = 255))]
    pub external_reference: Option<String>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

impl From<RecordPaymentRequest> for NewPayment {
    fn from(req: RecordPaymentRequest) -> Self {
        NewPayment {
            method: req.method,
            amount: req.amount.into(),
            fees: req.fees.map(Money::from),
            payment_date: req.payment_date,
            external_reference: req.external_reference,
            notes: req.notes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_override_rate_without_mode_is_rejected() {
        let req = ConsolidateRequest {
            override_rate: Some(dec!(5)),
            ..Default::default()
        };
        let today = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();

        assert!(matches!(req.into_request(today), Err(ApiError::Validation(_))));
    }

    #[test]
    fn test_consolidate_request_defaults_to_today() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let request = ConsolidateRequest::default().into_request(today).unwrap();

        assert_eq!(request.as_of, today);
        assert!(request.tax_policy.is_none());
    }

    #[test]
    fn test_money_dto_rounds_to_currency() {
        let money: Money = MoneyDto {
            amount: dec!(10.005),
            currency: Currency::USD,
        }
        .into();

        assert_eq!(money.amount(), dec!(10.01));
    }

    #[test]
    fn test_blank_description_fails_validation() {
        let req: CreateTimeEntryRequest = serde_json::from_value(serde_json::json!({
            "user_id": uuid::Uuid::new_v4(),
            "account_id": uuid::Uuid::new_v4(),
            "description": "",
            "started_at": "2024-03-04T09:00:00Z",
            "duration_seconds": 3600
        }))
        .unwrap();

        assert!(req.validate().is_err());
        assert!(req.billable);
    }

    #[test]
    fn test_clear_rate_override_wins() {
        let req: EditTimeEntryRequest = serde_json::from_value(serde_json::json!({
            "rate_override": {"amount": "90.00", "currency": "USD"},
            "clear_rate_override": true
        }))
        .unwrap();

        let changes = TimeEntryChanges::from(req);
        assert_eq!(changes.rate_override, Some(None));
    }
}
