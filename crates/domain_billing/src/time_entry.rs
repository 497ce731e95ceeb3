//! Time entries
//!
//! A time entry is the billable record of work, created from a committed
//! timer or entered directly. Its rate is snapshotted once and never
//! recomputed; once invoiced the entry is frozen.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use core_kernel::{
    AccountId, BillingRateId, Currency, InvoiceId, Money, TicketId, TimeEntryId, TimerId, UserId,
};
use crate::approval::{ensure_unbilled, Approval, ApprovalStatus, BillingState};
use crate::error::BillingError;
use crate::invoice::{ItemCategory, LineDraft, LineSource};

const SECONDS_PER_HOUR: Decimal = dec!(3600);

/// Billable hours for a duration, rounded half-up to 4 places
pub fn hours_from_seconds(seconds: i64) -> Decimal {
    (Decimal::from(seconds) / SECONDS_PER_HOUR)
        .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: TimeEntryId,
    pub user_id: UserId,
    pub account_id: AccountId,
    pub ticket_id: Option<TicketId>,
    pub timer_id: Option<TimerId>,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub billable: bool,
    pub billing_rate_id: Option<BillingRateId>,
    /// Hourly rate captured from the cascade
    pub rate_at_time: Option<Money>,
    /// Manual hourly rate; wins over the snapshot
    pub rate_override: Option<Money>,
    pub approval: Approval,
    pub billing: BillingState,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for a directly entered time entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTimeEntry {
    pub user_id: UserId,
    pub account_id: AccountId,
    pub ticket_id: Option<TicketId>,
    pub description: String,
    pub started_at: DateTime<Utc>,
    /// Defaults to `started_at + duration_seconds`
    pub ended_at: Option<DateTime<Utc>>,
    /// Defaults to `ended_at − started_at`
    pub duration_seconds: Option<i64>,
    pub billable: bool,
    pub billing_rate_id: Option<BillingRateId>,
    pub rate_override: Option<Money>,
}

/// Edits accepted while an entry is pending and unbilled
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntryChanges {
    pub description: Option<String>,
    pub duration_seconds: Option<i64>,
    pub billable: Option<bool>,
    /// `Some(None)` clears the override
    pub rate_override: Option<Option<Money>>,
}

impl TimeEntry {
    /// Builds a pending entry from direct input
    pub fn create(input: NewTimeEntry, now: DateTime<Utc>) -> Result<Self, BillingError> {
        let (ended_at, duration_seconds) = match (input.ended_at, input.duration_seconds) {
            (Some(end), Some(duration)) => (end, duration),
            (Some(end), None) => (end, (end - input.started_at).num_seconds()),
            (None, Some(duration)) => (input.started_at + Duration::seconds(duration), duration),
            (None, None) => {
                return Err(BillingError::validation(
                    "either ended_at or duration_seconds is required",
                ))
            }
        };
        if ended_at < input.started_at {
            return Err(BillingError::validation("ended_at is before started_at"));
        }
        validate_duration(duration_seconds)?;
        validate_rate(input.rate_override.as_ref())?;

        Ok(Self {
            id: TimeEntryId::new_v7(),
            user_id: input.user_id,
            account_id: input.account_id,
            ticket_id: input.ticket_id,
            timer_id: None,
            description: input.description,
            started_at: input.started_at,
            ended_at,
            duration_seconds,
            billable: input.billable,
            billing_rate_id: input.billing_rate_id,
            rate_at_time: None,
            rate_override: input.rate_override,
            approval: Approval::pending(),
            billing: BillingState::Unbilled,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// `round4(duration / 3600)`
    pub fn hours(&self) -> Decimal {
        hours_from_seconds(self.duration_seconds)
    }

    /// `rate_override ?? rate_at_time`
    pub fn effective_rate(&self) -> Option<Money> {
        self.rate_override.or(self.rate_at_time)
    }

    /// `round2(hours × effective_rate)`; no rate bills at zero
    pub fn calculated_amount(&self, currency: Currency) -> Money {
        match self.effective_rate() {
            Some(rate) => Money::new(self.hours() * rate.amount(), rate.currency()),
            None => Money::zero(currency),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn invoice_id(&self) -> Option<InvoiceId> {
        self.billing.invoice_id()
    }

    /// Billable, approved, unbilled and not deleted
    pub fn is_consolidation_candidate(&self) -> bool {
        self.billable && self.approval.is_approved() && !self.billing.is_billed() && !self.is_deleted()
    }

    /// Captures the rate unless one was captured already
    pub fn snapshot_rate(&mut self, rate: Option<Money>) {
        if self.rate_at_time.is_none() {
            self.rate_at_time = rate;
        }
    }

    pub fn approve(
        &mut self,
        approver: UserId,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        self.ensure_not_deleted()?;
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
        self.ensure_not_deleted()?;
        self.approval
            .decide(&self.billing, ApprovalStatus::Rejected, approver, notes, now)?;
        self.updated_at = now;
        Ok(())
    }

    pub fn reopen(&mut self, now: DateTime<Utc>) -> Result<(), BillingError> {
        self.ensure_not_deleted()?;
        self.approval.reopen(&self.billing)?;
        self.updated_at = now;
        Ok(())
    }

    /// Applies edits to a pending, unbilled entry
    pub fn apply_changes(
        &mut self,
        changes: TimeEntryChanges,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        self.ensure_not_deleted()?;
        ensure_unbilled(&self.billing)?;
        if !self.approval.is_pending() {
            return Err(BillingError::invalid_state(format!(
                "time entry {} is {}; reopen it before editing",
                self.id,
                self.approval.status.as_str()
            )));
        }

        if let Some(duration) = changes.duration_seconds {
            validate_duration(duration)?;
            self.duration_seconds = duration;
            self.ended_at = self.started_at + Duration::seconds(duration);
        }
        if let Some(rate_override) = changes.rate_override {
            validate_rate(rate_override.as_ref())?;
            self.rate_override = rate_override;
        }
        if let Some(description) = changes.description {
            self.description = description;
        }
        if let Some(billable) = changes.billable {
            self.billable = billable;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Soft delete; refused once invoiced
    pub fn soft_delete(&mut self, now: DateTime<Utc>) -> Result<(), BillingError> {
        ensure_unbilled(&self.billing)?;
        if self.deleted_at.is_none() {
            self.deleted_at = Some(now);
            self.updated_at = now;
        }
        Ok(())
    }

    /// Invoice line for this entry
    pub fn to_line(&self, currency: Currency) -> LineDraft {
        let unit_price = self.effective_rate().unwrap_or_else(|| Money::zero(currency));
        LineDraft {
            source: LineSource::TimeEntry(self.id),
            description: format!("{} ({})", self.description, self.started_at.format("%Y-%m-%d")),
            quantity: self.hours(),
            unit_price,
            discount: Money::zero(unit_price.currency()),
            billable: self.billable,
            taxable: None,
            category: ItemCategory::Service,
        }
    }

    fn ensure_not_deleted(&self) -> Result<(), BillingError> {
        if self.is_deleted() {
            return Err(BillingError::invalid_state(format!("time entry {} is deleted", self.id)));
        }
        Ok(())
    }
}

fn validate_duration(seconds: i64) -> Result<(), BillingError> {
    if seconds < 0 {
        return Err(BillingError::validation("duration_seconds must not be negative"));
    }
    Ok(())
}

fn validate_rate(rate: Option<&Money>) -> Result<(), BillingError> {
    if rate.is_some_and(|r| r.is_negative()) {
        return Err(BillingError::validation("rate must not be negative"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn usd(v: Decimal) -> Money {
        Money::new(v, Currency::USD)
    }

    fn entry(duration: i64) -> TimeEntry {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        TimeEntry::create(
            NewTimeEntry {
                user_id: UserId::new(),
                account_id: AccountId::new(),
                ticket_id: None,
                description: "Printer repair".into(),
                started_at: start,
                ended_at: None,
                duration_seconds: Some(duration),
                billable: true,
                billing_rate_id: None,
                rate_override: None,
            },
            start,
        )
        .unwrap()
    }

    #[test]
    fn test_one_hour_at_hundred() {
        let mut e = entry(3600);
        e.snapshot_rate(Some(usd(dec!(100.00))));
        assert_eq!(e.calculated_amount(Currency::USD).amount(), dec!(100.00));
    }

    #[test]
    fn test_hours_round_to_four_places() {
        assert_eq!(hours_from_seconds(1000), dec!(0.2778));
        assert_eq!(hours_from_seconds(0), dec!(0));
    }

    #[test]
    fn test_override_wins_and_snapshot_is_once() {
        let mut e = entry(1800);
        e.snapshot_rate(Some(usd(dec!(80))));
        e.snapshot_rate(Some(usd(dec!(999))));
        assert_eq!(e.rate_at_time, Some(usd(dec!(80))));

        e.rate_override = Some(usd(dec!(120)));
        assert_eq!(e.calculated_amount(Currency::USD).amount(), dec!(60.00));
    }

    #[test]
    fn test_no_rate_bills_zero() {
        let e = entry(7200);
        assert!(e.calculated_amount(Currency::USD).is_zero());
    }

    #[test]
    fn test_edit_requires_pending() {
        let mut e = entry(600);
        let now = Utc::now();
        e.approve(UserId::new(), None, now).unwrap();

        let changes = TimeEntryChanges {
            duration_seconds: Some(900),
            ..Default::default()
        };
        assert!(matches!(e.apply_changes(changes.clone(), now), Err(BillingError::InvalidState(_))));

        e.reopen(now).unwrap();
        e.apply_changes(changes, now).unwrap();
        assert_eq!(e.duration_seconds, 900);
    }

    #[test]
    fn test_invoiced_entry_is_frozen() {
        let mut e = entry(600);
        let now = Utc::now();
        e.approve(UserId::new(), None, now).unwrap();
        e.billing.assign(InvoiceId::new()).unwrap();

        assert!(e.reopen(now).is_err());
        assert!(e.soft_delete(now).is_err());
        assert!(!e.is_consolidation_candidate());
    }

    #[test]
    fn test_create_rejects_inverted_range() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let result = TimeEntry::create(
            NewTimeEntry {
                user_id: UserId::new(),
                account_id: AccountId::new(),
                ticket_id: None,
                description: "Backwards".into(),
                started_at: start,
                ended_at: Some(start - Duration::minutes(5)),
                duration_seconds: None,
                billable: true,
                billing_rate_id: None,
                rate_override: None,
            },
            start,
        );
        assert!(matches!(result, Err(BillingError::Validation(_))));
    }
}
