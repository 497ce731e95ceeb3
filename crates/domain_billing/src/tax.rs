//! Tax resolution for invoice lines
//!
//! Resolution runs two ordered chains. Taxability rules are tried in order
//! until one returns a verdict, and rate sources are tried in order until one
//! returns a rate. Each link is a small type so precedence can be tested link
//! by link. The resolver is pure: the same line and context always give the
//! same [`TaxDecision`].

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use core_kernel::{AccountId, Currency, Money, Rate};
use crate::invoice::LineDraft;
use crate::settings::{BillingSetting, TaxConfiguration};

/// How taxability is decided for lines without an explicit flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxApplication {
    /// Every billable line is taxable
    AllItems,
    /// Only lines that are not time entries are taxable
    NonServiceItems,
    /// Each line must carry its own flag
    Custom,
}

impl TaxApplication {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxApplication::AllItems => "all_items",
            TaxApplication::NonServiceItems => "non_service_items",
            TaxApplication::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all_items" => Some(TaxApplication::AllItems),
            "non_service_items" => Some(TaxApplication::NonServiceItems),
            "custom" => Some(TaxApplication::Custom),
            _ => None,
        }
    }
}

/// Invoice-level tax settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceTaxPolicy {
    pub mode: TaxApplication,
    /// When set, `override_rate` replaces every configured rate
    pub override_tax: bool,
    pub override_rate: Option<Rate>,
}

impl InvoiceTaxPolicy {
    pub fn with_mode(mode: TaxApplication) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn overridden(mode: TaxApplication, rate: Rate) -> Self {
        Self {
            mode,
            override_tax: true,
            override_rate: Some(rate),
        }
    }
}

impl Default for InvoiceTaxPolicy {
    fn default() -> Self {
        Self {
            mode: TaxApplication::AllItems,
            override_tax: false,
            override_rate: None,
        }
    }
}

/// Outcome of resolving one line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxDecision {
    pub taxable: bool,
    pub rate: Rate,
    pub tax_amount: Money,
    /// Taxability could not be decided and defaulted to "not taxable"
    pub unresolved: bool,
}

impl TaxDecision {
    /// Not taxable, zero rate
    pub fn none(currency: Currency) -> Self {
        Self {
            taxable: false,
            rate: Rate::ZERO,
            tax_amount: Money::zero(currency),
            unresolved: false,
        }
    }
}

/// Everything a rule may look at besides the line itself
#[derive(Debug, Clone, Copy)]
pub struct TaxContext<'a> {
    pub account_id: AccountId,
    pub jurisdiction: Option<&'a str>,
    pub as_of: NaiveDate,
    pub policy: &'a InvoiceTaxPolicy,
    /// Account-scoped and global configurations; filtering happens here
    pub configurations: &'a [TaxConfiguration],
    pub setting: Option<&'a BillingSetting>,
}

/// Verdict of a taxability rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Taxability {
    Taxable,
    Exempt,
    /// No rule could decide; treated as exempt and flagged
    Unresolved,
}

/// One link of the taxability chain
pub trait TaxabilityRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, line: &LineDraft, ctx: &TaxContext<'_>) -> Option<Taxability>;
}

/// One link of the rate chain
pub trait TaxRateSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn rate(&self, line: &LineDraft, ctx: &TaxContext<'_>) -> Option<Rate>;
}

/// Separators and non-billable lines are never taxed
#[derive(Debug, Default)]
pub struct ExcludedLines;

impl TaxabilityRule for ExcludedLines {
    fn name(&self) -> &'static str {
        "excluded_lines"
    }

    fn evaluate(&self, line: &LineDraft, _ctx: &TaxContext<'_>) -> Option<Taxability> {
        (line.is_separator() || !line.billable).then_some(Taxability::Exempt)
    }
}

/// The line's own taxable flag
#[derive(Debug, Default)]
pub struct ExplicitLineFlag;

impl TaxabilityRule for ExplicitLineFlag {
    fn name(&self) -> &'static str {
        "explicit_line_flag"
    }

    fn evaluate(&self, line: &LineDraft, _ctx: &TaxContext<'_>) -> Option<Taxability> {
        line.taxable.map(|taxable| {
            if taxable {
                Taxability::Taxable
            } else {
                Taxability::Exempt
            }
        })
    }
}

/// The invoice's tax-application mode
#[derive(Debug, Default)]
pub struct InvoiceMode;

impl TaxabilityRule for InvoiceMode {
    fn name(&self) -> &'static str {
        "invoice_mode"
    }

    fn evaluate(&self, line: &LineDraft, ctx: &TaxContext<'_>) -> Option<Taxability> {
        Some(match ctx.policy.mode {
            TaxApplication::AllItems => Taxability::Taxable,
            TaxApplication::NonServiceItems if line.source.is_time_entry() => Taxability::Exempt,
            TaxApplication::NonServiceItems => Taxability::Taxable,
            TaxApplication::Custom => Taxability::Unresolved,
        })
    }
}

/// Invoice override rate; a missing rate counts as zero
#[derive(Debug, Default)]
pub struct OverrideRate;

impl TaxRateSource for OverrideRate {
    fn name(&self) -> &'static str {
        "override_rate"
    }

    fn rate(&self, _line: &LineDraft, ctx: &TaxContext<'_>) -> Option<Rate> {
        ctx.policy
            .override_tax
            .then(|| ctx.policy.override_rate.unwrap_or(Rate::ZERO))
    }
}

/// Most specific active tax configuration
#[derive(Debug, Default)]
pub struct ConfiguredRate;

impl ConfiguredRate {
    /// Picks the configuration that governs `line` under `ctx`
    ///
    /// Account-scoped beats global, a jurisdiction match beats an unrestricted
    /// one, category-specific beats generic, then the latest effective date
    /// wins and the lowest id breaks remaining ties.
    pub fn best_match<'a>(
        line: &LineDraft,
        ctx: &TaxContext<'a>,
    ) -> Option<&'a TaxConfiguration> {
        ctx.configurations
            .iter()
            .filter(|c| c.account_id.map_or(true, |a| a == ctx.account_id))
            .filter(|c| c.is_effective_on(ctx.as_of))
            .filter(|c| c.matches_jurisdiction(ctx.jurisdiction))
            .filter(|c| c.applies_to(line.category))
            .max_by(|a, b| {
                a.specificity()
                    .cmp(&b.specificity())
                    .then(a.effective_from.cmp(&b.effective_from))
                    .then(b.id.cmp(&a.id))
            })
    }
}

impl TaxRateSource for ConfiguredRate {
    fn name(&self) -> &'static str {
        "tax_configuration"
    }

    fn rate(&self, line: &LineDraft, ctx: &TaxContext<'_>) -> Option<Rate> {
        Self::best_match(line, ctx).map(|c| c.rate)
    }
}

/// `BillingSetting.master_tax_rate`
#[derive(Debug, Default)]
pub struct MasterRate;

impl TaxRateSource for MasterRate {
    fn name(&self) -> &'static str {
        "master_rate"
    }

    fn rate(&self, _line: &LineDraft, ctx: &TaxContext<'_>) -> Option<Rate> {
        ctx.setting.and_then(|s| s.master_tax_rate)
    }
}

/// Resolves taxability, rate and amount for invoice lines
pub struct TaxResolver {
    taxability: Vec<Box<dyn TaxabilityRule>>,
    rates: Vec<Box<dyn TaxRateSource>>,
}

impl TaxResolver {
    /// Resolver with explicit chains
    pub fn new(
        taxability: Vec<Box<dyn TaxabilityRule>>,
        rates: Vec<Box<dyn TaxRateSource>>,
    ) -> Self {
        Self { taxability, rates }
    }

    /// Taxability: excluded lines, line flag, invoice mode.
    /// Rate: override, tax configuration, master rate.
    pub fn standard() -> Self {
        Self::new(
            vec![
                Box::new(ExcludedLines),
                Box::new(ExplicitLineFlag),
                Box::new(InvoiceMode),
            ],
            vec![
                Box::new(OverrideRate),
                Box::new(ConfiguredRate),
                Box::new(MasterRate),
            ],
        )
    }

    pub fn taxability(&self, line: &LineDraft, ctx: &TaxContext<'_>) -> Taxability {
        self.taxability
            .iter()
            .find_map(|rule| rule.evaluate(line, ctx))
            .unwrap_or(Taxability::Unresolved)
    }

    /// First rate any source provides, else zero
    pub fn effective_rate(&self, line: &LineDraft, ctx: &TaxContext<'_>) -> Rate {
        self.rates
            .iter()
            .find_map(|source| source.rate(line, ctx))
            .unwrap_or(Rate::ZERO)
    }

    /// Resolves one line; tax is computed on that line's base alone
    pub fn resolve(&self, line: &LineDraft, ctx: &TaxContext<'_>) -> TaxDecision {
        let currency = line.unit_price.currency();
        match self.taxability(line, ctx) {
            Taxability::Taxable => {
                let rate = self.effective_rate(line, ctx);
                TaxDecision {
                    taxable: true,
                    rate,
                    tax_amount: rate.apply(&line.base_amount()),
                    unresolved: false,
                }
            }
            Taxability::Exempt => TaxDecision::none(currency),
            Taxability::Unresolved => {
                tracing::warn!(
                    account_id = %ctx.account_id,
                    description = %line.description,
                    "taxability unresolved in custom mode; treating line as not taxable"
                );
                TaxDecision {
                    unresolved: true,
                    ..TaxDecision::none(currency)
                }
            }
        }
    }
}

impl Default for TaxResolver {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for TaxResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaxResolver")
            .field("taxability", &self.taxability.iter().map(|r| r.name()).collect::<Vec<_>>())
            .field("rates", &self.rates.iter().map(|r| r.name()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::{ItemCategory, LineSource};
    use core_kernel::{TicketAddonId, TimeEntryId};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn usd(amount: Decimal) -> Money {
        Money::new(amount, Currency::USD)
    }

    fn time_line(price: Decimal) -> LineDraft {
        LineDraft {
            source: LineSource::TimeEntry(TimeEntryId::new()),
            description: "Support".into(),
            quantity: dec!(1),
            unit_price: usd(price),
            discount: usd(dec!(0)),
            billable: true,
            taxable: None,
            category: ItemCategory::Service,
        }
    }

    fn addon_line(price: Decimal, qty: Decimal, discount: Decimal, taxable: bool) -> LineDraft {
        LineDraft {
            source: LineSource::TicketAddon(TicketAddonId::new()),
            description: "Router".into(),
            quantity: qty,
            unit_price: usd(price),
            discount: usd(discount),
            billable: true,
            taxable: Some(taxable),
            category: ItemCategory::Product,
        }
    }

    struct Fixture {
        account: AccountId,
        policy: InvoiceTaxPolicy,
        configurations: Vec<TaxConfiguration>,
        setting: Option<BillingSetting>,
    }

    impl Fixture {
        fn new(policy: InvoiceTaxPolicy) -> Self {
            Self {
                account: AccountId::new(),
                policy,
                configurations: Vec::new(),
                setting: None,
            }
        }

        fn ctx(&self) -> TaxContext<'_> {
            TaxContext {
                account_id: self.account,
                jurisdiction: None,
                as_of: date(2024, 6, 1),
                policy: &self.policy,
                configurations: &self.configurations,
                setting: self.setting.as_ref(),
            }
        }
    }

    #[test]
    fn test_all_items_with_account_rate() {
        let mut fx = Fixture::new(InvoiceTaxPolicy::default());
        fx.configurations.push(TaxConfiguration::new(
            Some(fx.account),
            "Sales",
            Rate::from_percentage(dec!(8.25)),
            date(2024, 1, 1),
        ));
        let resolver = TaxResolver::standard();

        let first = resolver.resolve(&time_line(dec!(200.00)), &fx.ctx());
        let second = resolver.resolve(&addon_line(dec!(50.00), dec!(2), dec!(10.00), true), &fx.ctx());

        assert_eq!(first.tax_amount.amount(), dec!(16.50));
        assert_eq!(second.tax_amount.amount(), dec!(7.43));
    }

    #[test]
    fn test_non_service_mode_exempts_time_entries() {
        let mut fx = Fixture::new(InvoiceTaxPolicy::with_mode(TaxApplication::NonServiceItems));
        fx.setting = Some(
            BillingSetting::global("INV-", Currency::USD)
                .with_master_tax_rate(Rate::from_percentage(dec!(5))),
        );
        let resolver = TaxResolver::standard();

        let time = resolver.resolve(&time_line(dec!(100)), &fx.ctx());
        let mut manual = LineDraft::manual("Setup", dec!(1), usd(dec!(100)), None);
        manual.category = ItemCategory::Other;
        let fee = resolver.resolve(&manual, &fx.ctx());

        assert!(!time.taxable);
        assert!(fee.taxable);
        assert_eq!(fee.tax_amount.amount(), dec!(5.00));
    }

    #[test]
    fn test_custom_mode_null_flag_is_flagged() {
        let fx = Fixture::new(InvoiceTaxPolicy::with_mode(TaxApplication::Custom));
        let decision = TaxResolver::standard().resolve(&time_line(dec!(100)), &fx.ctx());

        assert!(!decision.taxable);
        assert!(decision.unresolved);
        assert!(decision.tax_amount.is_zero());
    }

    #[test]
    fn test_explicit_flag_beats_mode() {
        let fx = Fixture::new(InvoiceTaxPolicy::default());
        let decision = TaxResolver::standard()
            .resolve(&addon_line(dec!(10), dec!(1), dec!(0), false), &fx.ctx());
        assert!(!decision.taxable);
    }

    #[test]
    fn test_override_ignores_configurations() {
        let mut fx = Fixture::new(InvoiceTaxPolicy::overridden(
            TaxApplication::AllItems,
            Rate::from_percentage(dec!(10)),
        ));
        fx.configurations.push(TaxConfiguration::new(
            None,
            "Global",
            Rate::from_percentage(dec!(20)),
            date(2020, 1, 1),
        ));

        let decision = TaxResolver::standard().resolve(&time_line(dec!(50)), &fx.ctx());
        assert_eq!(decision.rate, Rate::from_percentage(dec!(10)));
        assert_eq!(decision.tax_amount.amount(), dec!(5.00));
    }

    #[test]
    fn test_override_without_rate_is_zero() {
        let fx = Fixture::new(InvoiceTaxPolicy {
            mode: TaxApplication::AllItems,
            override_tax: true,
            override_rate: None,
        });
        let decision = TaxResolver::standard().resolve(&time_line(dec!(50)), &fx.ctx());
        assert!(decision.taxable);
        assert!(decision.tax_amount.is_zero());
    }

    #[test]
    fn test_configuration_precedence() {
        let mut fx = Fixture::new(InvoiceTaxPolicy::default());
        let global = TaxConfiguration::new(None, "Global", Rate::from_percentage(dec!(5)), date(2024, 1, 1));
        let account = TaxConfiguration::new(Some(fx.account), "Account", Rate::from_percentage(dec!(7)), date(2024, 1, 1));
        let products = TaxConfiguration::new(Some(fx.account), "Products", Rate::from_percentage(dec!(9)), date(2023, 1, 1))
            .with_categories(vec![ItemCategory::Product]);
        let other_account = TaxConfiguration::new(Some(AccountId::new()), "Other", Rate::from_percentage(dec!(30)), date(2024, 1, 1));
        fx.configurations = vec![global, account, products, other_account];

        let line = time_line(dec!(100));
        assert_eq!(ConfiguredRate::best_match(&line, &fx.ctx()).unwrap().name, "Account");

        let product = addon_line(dec!(100), dec!(1), dec!(0), true);
        assert_eq!(ConfiguredRate::best_match(&product, &fx.ctx()).unwrap().name, "Products");
    }

    #[test]
    fn test_later_effective_date_wins() {
        let mut fx = Fixture::new(InvoiceTaxPolicy::default());
        fx.configurations = vec![
            TaxConfiguration::new(None, "Old", Rate::from_percentage(dec!(6)), date(2022, 1, 1)),
            TaxConfiguration::new(None, "New", Rate::from_percentage(dec!(6.5)), date(2024, 1, 1)),
            TaxConfiguration::new(None, "Future", Rate::from_percentage(dec!(7)), date(2025, 1, 1)),
        ];
        let chosen = ConfiguredRate::best_match(&time_line(dec!(1)), &fx.ctx()).unwrap();
        assert_eq!(chosen.name, "New");
    }

    #[test]
    fn test_no_rate_anywhere_is_zero() {
        let fx = Fixture::new(InvoiceTaxPolicy::default());
        let decision = TaxResolver::standard().resolve(&time_line(dec!(100)), &fx.ctx());
        assert!(decision.taxable);
        assert_eq!(decision.rate, Rate::ZERO);
        assert!(decision.tax_amount.is_zero());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let mut fx = Fixture::new(InvoiceTaxPolicy::default());
        fx.configurations.push(TaxConfiguration::new(None, "A", Rate::from_percentage(dec!(4)), date(2024, 1, 1)));
        fx.configurations.push(TaxConfiguration::new(None, "B", Rate::from_percentage(dec!(6)), date(2024, 1, 1)));
        let resolver = TaxResolver::standard();
        let line = time_line(dec!(33.33));

        let first = resolver.resolve(&line, &fx.ctx());
        fx.configurations.reverse();
        let second = resolver.resolve(&line, &fx.ctx());

        assert_eq!(first, second);
    }
}
