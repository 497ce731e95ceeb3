//! Payments against invoices
//!
//! Payments are created pending and settled later. Only completed payments
//! count toward an invoice; [`reconcile_invoice`] recomputes the paid total
//! and moves the invoice between `paid` and unpaid accordingly.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use core_kernel::{AccountId, Currency, InvoiceId, Money, PaymentId};
use crate::error::BillingError;
use crate::invoice::{Invoice, InvoiceStatus};

/// Payment method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Check,
    CreditCard,
    BankTransfer,
    Ach,
    Other,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Check => "check",
            PaymentMethod::CreditCard => "credit_card",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Ach => "ach",
            PaymentMethod::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cash" => Some(PaymentMethod::Cash),
            "check" => Some(PaymentMethod::Check),
            "credit_card" => Some(PaymentMethod::CreditCard),
            "bank_transfer" => Some(PaymentMethod::BankTransfer),
            "ach" => Some(PaymentMethod::Ach),
            "other" => Some(PaymentMethod::Other),
            _ => None,
        }
    }
}

/// Payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PaymentStatus::Pending),
            "completed" => Some(PaymentStatus::Completed),
            "failed" => Some(PaymentStatus::Failed),
            "refunded" => Some(PaymentStatus::Refunded),
            "cancelled" => Some(PaymentStatus::Cancelled),
            _ => None,
        }
    }
}

/// Input for recording a payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPayment {
    pub method: PaymentMethod,
    pub amount: Money,
    pub fees: Option<Money>,
    pub payment_date: NaiveDate,
    pub external_reference: Option<String>,
    pub notes: Option<String>,
}

/// A payment record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub invoice_id: InvoiceId,
    pub account_id: AccountId,
    pub method: PaymentMethod,
    pub amount: Money,
    pub fees: Money,
    /// `amount − fees`
    pub net_amount: Money,
    pub currency: Currency,
    pub status: PaymentStatus,
    pub external_reference: Option<String>,
    pub payment_date: NaiveDate,
    /// When the payment was completed
    pub processed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Creates a pending payment against `invoice`
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the invoice is canceled
    /// - `Validation` for non-positive amounts or fees above the amount
    /// - `Money` on a currency mismatch with the invoice
    pub fn record(
        invoice: &Invoice,
        input: NewPayment,
        now: DateTime<Utc>,
    ) -> Result<Self, BillingError> {
        if invoice.status == InvoiceStatus::Canceled {
            return Err(BillingError::invalid_state(format!(
                "invoice {} is canceled",
                invoice.invoice_number
            )));
        }
        if !input.amount.is_positive() {
            return Err(BillingError::validation("payment amount must be positive"));
        }
        if input.amount.currency() != invoice.currency {
            return Err(core_kernel::MoneyError::CurrencyMismatch(
                input.amount.currency().to_string(),
                invoice.currency.to_string(),
            )
            .into());
        }

        let fees = input.fees.unwrap_or_else(|| Money::zero(invoice.currency));
        if fees.is_negative() {
            return Err(BillingError::validation("fees must not be negative"));
        }
        let net_amount = input.amount.checked_sub(&fees)?;
        if net_amount.is_negative() {
            return Err(BillingError::validation("fees exceed the payment amount"));
        }

        Ok(Self {
            id: PaymentId::new_v7(),
            invoice_id: invoice.id,
            account_id: invoice.account_id,
            method: input.method,
            amount: input.amount,
            fees,
            net_amount,
            currency: invoice.currency,
            status: PaymentStatus::Pending,
            external_reference: input.external_reference,
            payment_date: input.payment_date,
            processed_at: None,
            notes: input.notes,
            created_at: now,
            updated_at: now,
        })
    }

    /// `pending → completed`; completing twice is a no-op returning false
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<bool, BillingError> {
        match self.status {
            PaymentStatus::Pending => {
                self.status = PaymentStatus::Completed;
                self.processed_at = Some(now);
                self.updated_at = now;
                Ok(true)
            }
            PaymentStatus::Completed => Ok(false),
            other => Err(self.transition_error(other, PaymentStatus::Completed)),
        }
    }

    /// `pending → failed`
    pub fn fail(&mut self, now: DateTime<Utc>) -> Result<bool, BillingError> {
        self.from_pending(PaymentStatus::Failed, now)
    }

    /// `pending → cancelled`
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<bool, BillingError> {
        self.from_pending(PaymentStatus::Cancelled, now)
    }

    /// `completed → refunded`
    pub fn refund(&mut self, now: DateTime<Utc>) -> Result<bool, BillingError> {
        match self.status {
            PaymentStatus::Completed => {
                self.status = PaymentStatus::Refunded;
                self.updated_at = now;
                Ok(true)
            }
            PaymentStatus::Refunded => Ok(false),
            other => Err(self.transition_error(other, PaymentStatus::Refunded)),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == PaymentStatus::Completed
    }

    fn from_pending(&mut self, target: PaymentStatus, now: DateTime<Utc>) -> Result<bool, BillingError> {
        match self.status {
            PaymentStatus::Pending => {
                self.status = target;
                self.updated_at = now;
                Ok(true)
            }
            current if current == target => Ok(false),
            other => Err(self.transition_error(other, target)),
        }
    }

    fn transition_error(&self, from: PaymentStatus, to: PaymentStatus) -> BillingError {
        BillingError::invalid_state(format!(
            "payment {} cannot move from {} to {}",
            self.id,
            from.as_str(),
            to.as_str()
        ))
    }
}

/// Sum of completed payment amounts
pub fn total_paid(currency: Currency, payments: &[Payment]) -> Result<Money, BillingError> {
    let completed: Vec<&Money> = payments
        .iter()
        .filter(|p| p.is_completed())
        .map(|p| &p.amount)
        .collect();
    Ok(Money::sum(currency, completed)?)
}

/// `max(total − total_paid, 0)`
pub fn outstanding_balance(invoice: &Invoice, payments: &[Payment]) -> Result<Money, BillingError> {
    let paid = total_paid(invoice.currency, payments)?;
    Ok(invoice.total.checked_sub(&paid)?.clamp_non_negative())
}

/// Result of reconciling an invoice against its payments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub total_paid: Money,
    pub outstanding: Money,
    pub status: InvoiceStatus,
    /// True when the invoice status changed
    pub status_changed: bool,
}

/// Brings the invoice status in line with its completed payments
///
/// Marks the invoice paid once completed payments cover the total, and moves a
/// paid invoice back when they no longer do (to `overdue` once past due).
/// Canceled invoices are left as is.
pub fn reconcile_invoice(
    invoice: &mut Invoice,
    payments: &[Payment],
    now: DateTime<Utc>,
) -> Result<Reconciliation, BillingError> {
    let paid = total_paid(invoice.currency, payments)?;
    let covered = paid.amount() >= invoice.total.amount();
    let any_completed = payments.iter().any(Payment::is_completed);
    let before = invoice.status;

    match invoice.status {
        InvoiceStatus::Canceled => {}
        InvoiceStatus::Paid if !covered || !any_completed => {
            invoice.reopen_unpaid(now.date_naive(), now)
        }
        InvoiceStatus::Paid => {}
        _ if covered && any_completed => invoice.mark_paid(now)?,
        _ => {}
    }

    Ok(Reconciliation {
        total_paid: paid,
        outstanding: invoice.total.checked_sub(&paid)?.clamp_non_negative(),
        status: invoice.status,
        status_changed: invoice.status != before,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::{InvoiceDraft, InvoiceTotals};
    use crate::tax::InvoiceTaxPolicy;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn usd(v: Decimal) -> Money {
        Money::new(v, Currency::USD)
    }

    fn invoice(total: Decimal) -> Invoice {
        let draft = InvoiceDraft {
            id: InvoiceId::new(),
            account_id: AccountId::new(),
            invoice_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            currency: Currency::USD,
            tax_policy: InvoiceTaxPolicy::default(),
            notes: None,
            lines: Vec::new(),
            totals: InvoiceTotals {
                subtotal: usd(total),
                tax_amount: usd(dec!(0)),
                total: usd(total),
            },
            time_entry_ids: Vec::new(),
            addon_ids: Vec::new(),
        };
        draft.into_invoice("INV-000001".into(), Utc::now())
    }

    fn new_payment(amount: Decimal) -> NewPayment {
        NewPayment {
            method: PaymentMethod::BankTransfer,
            amount: usd(amount),
            fees: None,
            payment_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            external_reference: None,
            notes: None,
        }
    }

    #[test]
    fn test_net_amount_subtracts_fees() {
        let inv = invoice(dec!(100));
        let mut input = new_payment(dec!(100));
        input.fees = Some(usd(dec!(2.90)));

        let payment = Payment::record(&inv, input, Utc::now()).unwrap();
        assert_eq!(payment.net_amount.amount(), dec!(97.10));
        assert_eq!(payment.status, PaymentStatus::Pending);
    }

    #[test]
    fn test_record_validation() {
        let inv = invoice(dec!(100));
        assert!(Payment::record(&inv, new_payment(dec!(0)), Utc::now()).is_err());

        let mut fees = new_payment(dec!(10));
        fees.fees = Some(usd(dec!(11)));
        assert!(Payment::record(&inv, fees, Utc::now()).is_err());

        let mut euros = new_payment(dec!(10));
        euros.amount = Money::new(dec!(10), Currency::EUR);
        assert!(matches!(
            Payment::record(&inv, euros, Utc::now()),
            Err(BillingError::Money(_))
        ));

        let mut canceled = invoice(dec!(100));
        canceled.cancel(Utc::now()).unwrap();
        assert!(matches!(
            Payment::record(&canceled, new_payment(dec!(10)), Utc::now()),
            Err(BillingError::InvalidState(_))
        ));
    }

    #[test]
    fn test_full_payment_marks_paid() {
        let mut inv = invoice(dec!(313.93));
        let mut payment = Payment::record(&inv, new_payment(dec!(313.93)), Utc::now()).unwrap();
        payment.complete(Utc::now()).unwrap();

        let outcome = reconcile_invoice(&mut inv, &[payment], Utc::now()).unwrap();

        assert_eq!(outcome.status, InvoiceStatus::Paid);
        assert!(outcome.outstanding.is_zero());
        assert!(inv.paid_at.is_some());
    }

    #[test]
    fn test_partial_then_refund() {
        let mut inv = invoice(dec!(100));
        inv.send(Utc::now()).unwrap();
        let mut first = Payment::record(&inv, new_payment(dec!(60)), Utc::now()).unwrap();
        let mut second = Payment::record(&inv, new_payment(dec!(40)), Utc::now()).unwrap();
        first.complete(Utc::now()).unwrap();

        let partial = reconcile_invoice(&mut inv, &[first.clone(), second.clone()], Utc::now()).unwrap();
        assert_eq!(partial.status, InvoiceStatus::Sent);
        assert_eq!(partial.outstanding.amount(), dec!(40));

        second.complete(Utc::now()).unwrap();
        let paid = reconcile_invoice(&mut inv, &[first.clone(), second.clone()], Utc::now()).unwrap();
        assert_eq!(paid.status, InvoiceStatus::Paid);

        let before_due = inv.due_date.and_hms_opt(12, 0, 0).unwrap().and_utc();
        second.refund(before_due).unwrap();
        let reopened = reconcile_invoice(&mut inv, &[first, second], before_due).unwrap();
        assert_eq!(reopened.status, InvoiceStatus::Sent);
        assert!(reopened.status_changed);
    }

    #[test]
    fn test_refund_after_due_date_reopens_overdue() {
        let mut inv = invoice(dec!(100));
        inv.send(Utc::now()).unwrap();
        let mut payment = Payment::record(&inv, new_payment(dec!(100)), Utc::now()).unwrap();
        payment.complete(Utc::now()).unwrap();
        reconcile_invoice(&mut inv, &[payment.clone()], Utc::now()).unwrap();

        let after_due = inv.due_date.succ_opt().unwrap().and_hms_opt(9, 0, 0).unwrap().and_utc();
        payment.refund(after_due).unwrap();
        let reopened = reconcile_invoice(&mut inv, &[payment], after_due).unwrap();

        assert_eq!(reopened.status, InvoiceStatus::Overdue);
        assert_eq!(reopened.outstanding.amount(), dec!(100));
    }

    #[test]
    fn test_overpayment_clamps_balance() {
        let inv = invoice(dec!(50));
        let mut payment = Payment::record(&inv, new_payment(dec!(80)), Utc::now()).unwrap();
        payment.complete(Utc::now()).unwrap();
        assert!(outstanding_balance(&inv, &[payment]).unwrap().is_zero());
    }

    #[test]
    fn test_payment_transitions() {
        let inv = invoice(dec!(50));
        let mut payment = Payment::record(&inv, new_payment(dec!(50)), Utc::now()).unwrap();

        assert!(payment.refund(Utc::now()).is_err());
        assert!(payment.complete(Utc::now()).unwrap());
        assert!(!payment.complete(Utc::now()).unwrap());
        assert!(payment.fail(Utc::now()).is_err());
    }
}
