//! Billing Domain - Service Billing Consolidation
//!
//! This crate turns tracked work into invoices for service accounts while
//! guaranteeing that no billable item is ever charged on more than one invoice
//! and that invoice totals always reconcile to their lines and payments.
//!
//! # Components
//!
//! - [`TimerLifecycle`]: start/pause/resume/stop/cancel/commit of timers
//! - [`TimeEntryApproval`]: approval workflow and rate snapshots for time
//!   entries and ticket add-ons
//! - [`TaxResolver`]: ordered taxability and tax-rate chains per line
//! - [`InvoiceNumberAllocator`]: prefix + zero-padded counter per setting
//! - [`BillingConsolidationEngine`]: unbilled work → draft invoice, at most once
//! - [`PaymentReconciler`]: payments ↔ invoice status
//!
//! Every component shares an `Arc<dyn BillingStore>` and reads time through
//! a [`core_kernel::Clock`].
//!
//! # Example
//!
//! ```rust,ignore
//! use domain_billing::{BillingConsolidationEngine, ConsolidationRequest};
//!
//! let engine = BillingConsolidationEngine::new(store, clock);
//! let invoice = engine
//!     .consolidate(account_id, ConsolidationRequest::as_of(today))
//!     .await?;
//! assert!(invoice.totals_reconcile());
//! ```

pub mod adapters;
pub mod addon;
pub mod approval;
pub mod consolidation;
pub mod error;
pub mod invoice;
pub mod lifecycle;
pub mod numbering;
pub mod payment;
pub mod ports;
pub mod rate;
pub mod reconciler;
pub mod settings;
pub mod tax;
pub mod time_entry;
pub mod timer;
pub mod workflow;

pub use adapters::InMemoryBillingStore;
pub use addon::{AddonKind, NewTicketAddon, TicketAddon};
pub use approval::{Approval, ApprovalStatus, BillingState};
pub use consolidation::{BillingConsolidationEngine, ConsolidationRequest, ManualCharge};
pub use error::BillingError;
pub use invoice::{
    Invoice, InvoiceDraft, InvoiceLineItem, InvoiceStatus, InvoiceTotals, ItemCategory,
    LineDraft, LineSource,
};
pub use lifecycle::{CommitOverrides, StartTimer, TimerLifecycle};
pub use numbering::{format_invoice_number, InvoiceNumberAllocator};
pub use payment::{NewPayment, Payment, PaymentMethod, PaymentStatus, Reconciliation};
pub use ports::{AccountRef, BillingStore, SettledPayment, TicketRef};
pub use rate::{BillingRate, RateCascade, RateQuery, RateScope};
pub use reconciler::PaymentReconciler;
pub use settings::{BillingSetting, TaxConfiguration};
pub use tax::{InvoiceTaxPolicy, TaxApplication, TaxContext, TaxDecision, TaxResolver};
pub use time_entry::{NewTimeEntry, TimeEntry, TimeEntryChanges};
pub use timer::{Timer, TimerStatus};
pub use workflow::TimeEntryApproval;
