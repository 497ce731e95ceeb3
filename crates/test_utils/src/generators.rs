//! Property-Based Test Generators
//!
//! Proptest strategies for billing inputs. Amounts stay within ranges where
//! cent rounding is the only source of error.

use core_kernel::{Currency, Money, Rate};
use domain_billing::{AddonKind, TaxApplication};
use proptest::prelude::*;
use rust_decimal::Decimal;

/// Strategy for work durations from zero up to twelve hours
pub fn duration_seconds_strategy() -> impl Strategy<Value = i64> {
    0i64..=43_200i64
}

/// Strategy for hourly rates from $1.00 to $500.00
pub fn hourly_rate_strategy() -> impl Strategy<Value = Money> {
    (100i64..=50_000i64).prop_map(|cents| Money::from_minor(cents, Currency::USD))
}

/// Strategy for add-on unit prices from $0.01 to $2,000.00
pub fn unit_price_strategy() -> impl Strategy<Value = Money> {
    (1i64..=200_000i64).prop_map(|cents| Money::from_minor(cents, Currency::USD))
}

/// Strategy for quantities with up to two decimal places
pub fn quantity_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..=10_000i64).prop_map(|n| Decimal::new(n, 2))
}

/// Strategy for tax rates between 0 % and 25 % with four decimal places
pub fn tax_rate_strategy() -> impl Strategy<Value = Rate> {
    (0i64..=250_000i64).prop_map(|n| Rate::from_percentage(Decimal::new(n, 4)))
}

pub fn tax_mode_strategy() -> impl Strategy<Value = TaxApplication> {
    prop_oneof![
        Just(TaxApplication::AllItems),
        Just(TaxApplication::NonServiceItems),
        Just(TaxApplication::Custom),
    ]
}

pub fn addon_kind_strategy() -> impl Strategy<Value = AddonKind> {
    prop_oneof![
        Just(AddonKind::Product),
        Just(AddonKind::License),
        Just(AddonKind::Expense),
        Just(AddonKind::Service),
    ]
}

/// Strategy for timer operation scripts: `(op, seconds to advance first)`
///
/// Ops are `0` pause, `1` resume, `2` no-op tick.
pub fn timer_script_strategy() -> impl Strategy<Value = Vec<(u8, i64)>> {
    prop::collection::vec((0u8..3u8, 0i64..600i64), 0..20)
}
