//! Invoice numbering
//!
//! Numbers are `prefix + zero_pad(counter, padding)`. Reserving a number
//! returns the current counter and increments it; adapters call
//! [`reserve_number`] while holding the setting row exclusively, which makes
//! numbers unique and strictly increasing per setting.

use std::sync::Arc;

use tracing::{info, instrument};

use core_kernel::AccountId;
use crate::error::BillingError;
use crate::ports::BillingStore;
use crate::settings::BillingSetting;

/// Formats a counter value with the setting's prefix and padding
pub fn format_invoice_number(prefix: &str, counter: i64, padding: u32) -> String {
    format!("{}{:0width$}", prefix, counter, width = padding as usize)
}

/// Takes the next number from `setting`, advancing its counter
pub fn reserve_number(setting: &mut BillingSetting) -> String {
    let number = format_invoice_number(
        &setting.invoice_prefix,
        setting.next_invoice_number,
        setting.number_padding,
    );
    setting.next_invoice_number += 1;
    number
}

/// Issues invoice numbers outside of consolidation
#[derive(Clone)]
pub struct InvoiceNumberAllocator {
    store: Arc<dyn BillingStore>,
}

impl InvoiceNumberAllocator {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Reserves the next number for `account_id` (account setting, else global)
    ///
    /// # Errors
    ///
    /// `MissingBillingSettings` when no setting applies.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn next_number(&self, account_id: AccountId) -> Result<String, BillingError> {
        let number = self
            .store
            .reserve_invoice_number(account_id)
            .await?
            .ok_or(BillingError::MissingBillingSettings(account_id))?;
        info!(invoice_number = %number, "Reserved invoice number");
        Ok(number)
    }
}
