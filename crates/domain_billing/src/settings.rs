//! Billing configuration records
//!
//! `BillingSetting` and `TaxConfiguration` are read-only inputs to tax
//! resolution and invoice numbering. Both can be scoped to an account or be
//! global (no account), in which case they act as the fallback.

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use core_kernel::{AccountId, BillingSettingId, Currency, Rate, TaxConfigurationId};
use crate::invoice::ItemCategory;
use crate::tax::TaxApplication;

/// Invoice numbering, payment terms and tax defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingSetting {
    pub id: BillingSettingId,
    /// Owning account; `None` marks the global default
    pub account_id: Option<AccountId>,
    pub invoice_prefix: String,
    /// Counter value the next reserved number will use
    pub next_invoice_number: i64,
    /// Minimum digits of the counter part (zero padded)
    pub number_padding: u32,
    pub payment_terms_days: u32,
    pub currency: Currency,
    pub master_tax_rate: Option<Rate>,
    pub default_tax_mode: TaxApplication,
    pub updated_at: DateTime<Utc>,
}

impl BillingSetting {
    /// Creates the global default setting
    pub fn global(invoice_prefix: impl Into<String>, currency: Currency) -> Self {
        Self {
            id: BillingSettingId::new_v7(),
            account_id: None,
            invoice_prefix: invoice_prefix.into(),
            next_invoice_number: 1,
            number_padding: 6,
            payment_terms_days: 30,
            currency,
            master_tax_rate: None,
            default_tax_mode: TaxApplication::AllItems,
            updated_at: Utc::now(),
        }
    }

    /// Creates an account-specific setting
    pub fn for_account(
        account_id: AccountId,
        invoice_prefix: impl Into<String>,
        currency: Currency,
    ) -> Self {
        Self {
            account_id: Some(account_id),
            ..Self::global(invoice_prefix, currency)
        }
    }

    pub fn with_payment_terms(mut self, days: u32) -> Self {
        self.payment_terms_days = days;
        self
    }

    pub fn with_master_tax_rate(mut self, rate: Rate) -> Self {
        self.master_tax_rate = Some(rate);
        self
    }

    pub fn with_number_padding(mut self, padding: u32) -> Self {
        self.number_padding = padding;
        self
    }

    pub fn with_next_number(mut self, next: i64) -> Self {
        self.next_invoice_number = next;
        self
    }

    pub fn with_default_tax_mode(mut self, mode: TaxApplication) -> Self {
        self.default_tax_mode = mode;
        self
    }

    pub fn is_global(&self) -> bool {
        self.account_id.is_none()
    }

    /// Due date for an invoice dated `invoice_date`
    pub fn due_date(&self, invoice_date: NaiveDate) -> NaiveDate {
        invoice_date
            .checked_add_days(Days::new(u64::from(self.payment_terms_days)))
            .unwrap_or(NaiveDate::MAX)
    }
}

/// A tax rate applicable to an account (or globally)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxConfiguration {
    pub id: TaxConfigurationId,
    /// Owning account; `None` marks a global configuration
    pub account_id: Option<AccountId>,
    pub name: String,
    pub tax_type: String,
    pub rate: Rate,
    /// Jurisdiction code this rate is restricted to, if any
    pub jurisdiction: Option<String>,
    /// Categories this rate applies to; empty means every category
    pub categories: Vec<ItemCategory>,
    pub effective_from: NaiveDate,
    pub expires_on: Option<NaiveDate>,
    pub is_active: bool,
}

impl TaxConfiguration {
    pub fn new(
        account_id: Option<AccountId>,
        name: impl Into<String>,
        rate: Rate,
        effective_from: NaiveDate,
    ) -> Self {
        Self {
            id: TaxConfigurationId::new_v7(),
            account_id,
            name: name.into(),
            tax_type: "sales".to_string(),
            rate,
            jurisdiction: None,
            categories: Vec::new(),
            effective_from,
            expires_on: None,
            is_active: true,
        }
    }

    pub fn with_jurisdiction(mut self, jurisdiction: impl Into<String>) -> Self {
        self.jurisdiction = Some(jurisdiction.into());
        self
    }

    pub fn with_categories(mut self, categories: Vec<ItemCategory>) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_expiry(mut self, expires_on: NaiveDate) -> Self {
        self.expires_on = Some(expires_on);
        self
    }

    pub fn with_tax_type(mut self, tax_type: impl Into<String>) -> Self {
        self.tax_type = tax_type.into();
        self
    }

    /// Active and within `[effective_from, expires_on)` on `date`
    pub fn is_effective_on(&self, date: NaiveDate) -> bool {
        self.is_active
            && self.effective_from <= date
            && self.expires_on.map_or(true, |end| date < end)
    }

    pub fn applies_to(&self, category: ItemCategory) -> bool {
        self.categories.is_empty() || self.categories.contains(&category)
    }

    /// Unrestricted configurations match any jurisdiction
    pub fn matches_jurisdiction(&self, jurisdiction: Option<&str>) -> bool {
        match (&self.jurisdiction, jurisdiction) {
            (None, _) => true,
            (Some(own), Some(requested)) => own.eq_ignore_ascii_case(requested),
            (Some(_), None) => false,
        }
    }

    /// Ordering key: account-scoped, then jurisdiction-specific, then category-specific
    pub fn specificity(&self) -> (bool, bool, bool) {
        (
            self.account_id.is_some(),
            self.jurisdiction.is_some(),
            !self.categories.is_empty(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_due_date_uses_payment_terms() {
        let setting = BillingSetting::global("INV-", Currency::USD).with_payment_terms(15);
        assert_eq!(setting.due_date(date(2024, 1, 20)), date(2024, 2, 4));
    }

    #[test]
    fn test_tax_configuration_effective_window() {
        let config = TaxConfiguration::new(None, "State", Rate::from_percentage(dec!(6)), date(2024, 1, 1))
            .with_expiry(date(2025, 1, 1));

        assert!(!config.is_effective_on(date(2023, 12, 31)));
        assert!(config.is_effective_on(date(2024, 6, 1)));
        assert!(!config.is_effective_on(date(2025, 1, 1)));
    }

    #[test]
    fn test_jurisdiction_matching() {
        let open = TaxConfiguration::new(None, "Any", Rate::ZERO, date(2024, 1, 1));
        let texas = open.clone().with_jurisdiction("TX");

        assert!(open.matches_jurisdiction(None));
        assert!(texas.matches_jurisdiction(Some("tx")));
        assert!(!texas.matches_jurisdiction(Some("CA")));
        assert!(!texas.matches_jurisdiction(None));
    }
}
