//! Payment reconciliation service

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, instrument};

use core_kernel::{Clock, InvoiceId, Money, PaymentId, PortError};

use crate::error::BillingError;
use crate::payment::{outstanding_balance, total_paid, NewPayment, Payment};
use crate::ports::{BillingStore, SettledPayment};

/// Records payments and keeps invoice status in line with them
#[derive(Clone)]
pub struct PaymentReconciler {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
}

impl PaymentReconciler {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Records a pending payment against `invoice_id`
    #[instrument(skip(self, input), fields(invoice_id = %invoice_id, amount = %input.amount))]
    pub async fn apply_payment(
        &self,
        invoice_id: InvoiceId,
        input: NewPayment,
    ) -> Result<Payment, BillingError> {
        let invoice = self.store.get_invoice(invoice_id).await?;
        let payment = Payment::record(&invoice, input, self.clock.now())?;
        self.store.insert_payment(&payment).await?;
        info!(payment_id = %payment.id, "Payment recorded");
        Ok(payment)
    }

    pub async fn get_payment(&self, payment_id: PaymentId) -> Result<Payment, BillingError> {
        Ok(self.store.get_payment(payment_id).await?)
    }

    /// Completes a payment and marks the invoice paid once covered
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn mark_completed(&self, payment_id: PaymentId) -> Result<SettledPayment, BillingError> {
        self.transition(payment_id, Payment::complete).await
    }

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn mark_failed(&self, payment_id: PaymentId) -> Result<SettledPayment, BillingError> {
        self.transition(payment_id, Payment::fail).await
    }

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn cancel_payment(&self, payment_id: PaymentId) -> Result<SettledPayment, BillingError> {
        self.transition(payment_id, Payment::cancel).await
    }

    /// Refunds a completed payment, re-opening the invoice if it is no longer covered
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn refund_payment(&self, payment_id: PaymentId) -> Result<SettledPayment, BillingError> {
        self.transition(payment_id, Payment::refund).await
    }

    /// Sum of completed payments on the invoice
    pub async fn total_paid(&self, invoice_id: InvoiceId) -> Result<Money, BillingError> {
        let invoice = self.store.get_invoice(invoice_id).await?;
        let payments = self.store.payments_for_invoice(invoice_id).await?;
        total_paid(invoice.currency, &payments)
    }

    /// `max(total − total_paid, 0)`
    pub async fn outstanding_balance(&self, invoice_id: InvoiceId) -> Result<Money, BillingError> {
        let invoice = self.store.get_invoice(invoice_id).await?;
        let payments = self.store.payments_for_invoice(invoice_id).await?;
        outstanding_balance(&invoice, &payments)
    }

    /// Flags sent or pending invoices past their due date as overdue
    ///
    /// Returns the ids of the invoices that changed.
    #[instrument(skip(self), fields(today = %today))]
    pub async fn refresh_overdue(&self, today: NaiveDate) -> Result<Vec<InvoiceId>, BillingError> {
        let now = self.clock.now();
        let mut changed = Vec::new();
        for mut invoice in self.store.invoices_due_before(today).await? {
            let expected = invoice.status;
            if !invoice.refresh_overdue(today, now) {
                continue;
            }
            match self.store.update_invoice_status(&invoice, expected).await {
                Ok(()) => changed.push(invoice.id),
                Err(PortError::Conflict { message }) => {
                    debug!(invoice_id = %invoice.id, %message, "Skipping invoice changed concurrently");
                }
                Err(e) => return Err(e.into()),
            }
        }
        if !changed.is_empty() {
            info!(count = changed.len(), "Invoices marked overdue");
        }
        Ok(changed)
    }

    async fn transition<F>(&self, payment_id: PaymentId, apply: F) -> Result<SettledPayment, BillingError>
    where
        F: FnOnce(&mut Payment, DateTime<Utc>) -> Result<bool, BillingError>,
    {
        let mut payment = self.store.get_payment(payment_id).await?;
        let expected = payment.status;
        let now = self.clock.now();
        apply(&mut payment, now)?;

        let settled = self
            .store
            .settle_payment(&payment, expected, now)
            .await
            .map_err(|e| match e {
                PortError::Conflict { message } => BillingError::InvalidState(message),
                other => other.into(),
            })?;
        info!(
            status = settled.payment.status.as_str(),
            invoice_status = settled.invoice.status.as_str(),
            total_paid = %settled.reconciliation.total_paid,
            "Payment settled"
        );
        Ok(settled)
    }
}
