//! Pre-built Test Fixtures
//!
//! Ready-to-use billing test data. Fixed values are predictable for unit
//! tests; the `fake_*` helpers produce throwaway names and descriptions.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use fake::faker::company::en::CompanyName;
use fake::faker::lorem::en::Sentence;
use fake::Fake;
use rust_decimal_macros::dec;

use core_kernel::{AccountId, Currency, Money, Rate, TicketId, UserId};
use domain_billing::{AccountRef, BillingSetting, TaxConfiguration, TicketRef};

/// Fixture for Money test data
pub struct MoneyFixtures;

impl MoneyFixtures {
    pub fn usd(amount: rust_decimal::Decimal) -> Money {
        Money::new(amount, Currency::USD)
    }

    /// Standard hourly rate used across scenarios
    pub fn usd_100_hourly() -> Money {
        Money::new(dec!(100.00), Currency::USD)
    }

    pub fn usd_150_hourly() -> Money {
        Money::new(dec!(150.00), Currency::USD)
    }

    pub fn usd_zero() -> Money {
        Money::zero(Currency::USD)
    }

    /// A EUR amount for currency mismatch tests
    pub fn eur_100() -> Money {
        Money::new(dec!(100.00), Currency::EUR)
    }
}

/// Fixture for tax rates
pub struct RateFixtures;

impl RateFixtures {
    /// 8.25 %
    pub fn sales_tax() -> Rate {
        Rate::from_percentage(dec!(8.25))
    }

    /// 10 %
    pub fn master_rate() -> Rate {
        Rate::from_percentage(dec!(10))
    }

    /// 5 %
    pub fn override_rate() -> Rate {
        Rate::from_percentage(dec!(5))
    }
}

/// Fixture for temporal test data
pub struct TemporalFixtures;

impl TemporalFixtures {
    /// Monday 2024-03-04 09:00 UTC, the start of the working week in scenarios
    pub fn work_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
    }

    /// `work_start` plus whole hours
    pub fn hours_after_start(hours: i64) -> DateTime<Utc> {
        Self::work_start() + Duration::hours(hours)
    }

    /// Invoice date used by consolidation scenarios
    pub fn invoice_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 31).unwrap()
    }

    /// Thirty days after `invoice_date`
    pub fn due_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, 30).unwrap()
    }

    /// Start of the tax year the fixture configurations take effect
    pub fn tax_year_start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }
}

/// Fixture for collaborator records and configuration
pub struct BillingFixtures;

impl BillingFixtures {
    pub fn account(jurisdiction: Option<&str>) -> AccountRef {
        AccountRef {
            id: AccountId::new(),
            name: fake_company_name(),
            jurisdiction: jurisdiction.map(str::to_string),
        }
    }

    pub fn ticket(account_id: AccountId) -> TicketRef {
        TicketRef {
            id: TicketId::new(),
            account_id,
        }
    }

    pub fn user() -> UserId {
        UserId::new()
    }

    /// Global USD setting with prefix `INV-` and 30-day terms
    pub fn global_setting() -> BillingSetting {
        BillingSetting::global("INV-", Currency::USD)
    }

    /// Global sales tax of 8.25 % effective from the start of the tax year
    pub fn global_sales_tax() -> TaxConfiguration {
        TaxConfiguration::new(
            None,
            "Sales tax",
            RateFixtures::sales_tax(),
            TemporalFixtures::tax_year_start(),
        )
    }
}

pub fn fake_company_name() -> String {
    CompanyName().fake()
}

pub fn fake_description() -> String {
    Sentence(3..7).fake()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_date_matches_default_terms() {
        let setting = BillingFixtures::global_setting();
        assert_eq!(
            setting.due_date(TemporalFixtures::invoice_date()),
            TemporalFixtures::due_date()
        );
    }

    #[test]
    fn test_fake_text_is_not_empty() {
        assert!(!fake_company_name().is_empty());
        assert!(!fake_description().is_empty());
    }
}
