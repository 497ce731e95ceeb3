//! Custom Test Assertions
//!
//! Assertion helpers for billing types that give more meaningful failure
//! messages than plain `assert_eq!`.

use std::collections::HashMap;

use core_kernel::Money;
use domain_billing::Invoice;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Asserts that two Money values are approximately equal within a tolerance
///
/// # Panics
///
/// Panics if the currencies don't match or the amounts differ by more than tolerance
pub fn assert_money_approx_eq(actual: &Money, expected: &Money, tolerance: Decimal) {
    assert_eq!(
        actual.currency(),
        expected.currency(),
        "Currency mismatch: actual={}, expected={}",
        actual.currency(),
        expected.currency()
    );

    let diff = (actual.amount() - expected.amount()).abs();
    assert!(
        diff <= tolerance,
        "Money amounts differ by more than tolerance: actual={}, expected={}, diff={}, tolerance={}",
        actual.amount(),
        expected.amount(),
        diff,
        tolerance
    );
}

/// Asserts an exact amount, comparing decimals numerically
pub fn assert_money_eq(actual: &Money, expected: Decimal) {
    assert_eq!(
        actual.amount(),
        expected,
        "Expected {} {}, got {}",
        actual.currency().symbol(),
        expected,
        actual
    );
}

/// Asserts that a Money value is zero
pub fn assert_money_zero(money: &Money) {
    assert!(
        money.is_zero(),
        "Expected zero money, got {} {}",
        money.currency().symbol(),
        money.amount()
    );
}

/// Asserts `total = subtotal + tax_amount` and that both match the lines
pub fn assert_totals_reconcile(invoice: &Invoice) {
    assert_eq!(
        invoice.total.amount(),
        invoice.subtotal.amount() + invoice.tax_amount.amount(),
        "Invoice {}: total {} != subtotal {} + tax {}",
        invoice.invoice_number,
        invoice.total,
        invoice.subtotal,
        invoice.tax_amount
    );
    assert!(
        invoice.totals_reconcile(),
        "Invoice {}: header totals do not match its lines",
        invoice.invoice_number
    );
}

/// Asserts that no time entry or add-on appears on more than one invoice
pub fn assert_billed_once(invoices: &[Invoice]) {
    let mut seen: HashMap<(&'static str, Uuid), &str> = HashMap::new();

    for invoice in invoices {
        for line in &invoice.lines {
            let Some(source_id) = line.source.source_id() else {
                continue;
            };
            let key = (line.source.line_type(), source_id);
            if let Some(first) = seen.insert(key, &invoice.invoice_number) {
                panic!(
                    "{} {} billed on both {} and {}",
                    key.0, source_id, first, invoice.invoice_number
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_kernel::Currency;
    use rust_decimal_macros::dec;

    #[test]
    fn test_assert_money_approx_eq_passes() {
        let a = Money::new(dec!(100.00), Currency::USD);
        let b = Money::new(dec!(100.01), Currency::USD);
        assert_money_approx_eq(&a, &b, dec!(0.01));
    }

    #[test]
    #[should_panic(expected = "Currency mismatch")]
    fn test_assert_money_approx_eq_currency_mismatch() {
        let a = Money::new(dec!(100.00), Currency::USD);
        let b = Money::new(dec!(100.00), Currency::EUR);
        assert_money_approx_eq(&a, &b, dec!(0.01));
    }

    #[test]
    fn test_assert_money_eq_ignores_scale() {
        assert_money_eq(&Money::new(dec!(90), Currency::USD), dec!(90.00));
    }

    #[test]
    fn test_assert_billed_once_accepts_empty() {
        assert_billed_once(&[]);
    }
}
