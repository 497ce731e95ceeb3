//! HTTP API Layer
//!
//! REST surface over the billing services using Axum.
//!
//! # Architecture
//!
//! - **Handlers**: one module per resource (timers, time entries, add-ons,
//!   invoices, payments) plus health probes
//! - **DTOs**: request bodies validated with `validator` before they reach the domain
//! - **Error Handling**: `BillingError` mapped onto status codes in one place
//!
//! # Example
//!
//! ```rust,ignore
//! use interface_api::{create_router, AppState};
//!
//! let state = AppState::new(store, Arc::new(SystemClock));
//! axum::serve(listener, create_router(state)).await?;
//! ```

pub mod config;
pub mod dto;
pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use core_kernel::Clock;
use domain_billing::{
    BillingConsolidationEngine, BillingStore, PaymentReconciler, TimeEntryApproval,
    TimerLifecycle,
};

use crate::handlers::{addons, health, invoices, payments, time_entries, timers};

/// Attempts `POST /accounts/:id/invoices` makes before surfacing a conflict
pub const DEFAULT_CONSOLIDATION_ATTEMPTS: u32 = 3;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BillingStore>,
    pub clock: Arc<dyn Clock>,
    pub timers: TimerLifecycle,
    pub approvals: TimeEntryApproval,
    pub engine: BillingConsolidationEngine,
    pub reconciler: PaymentReconciler,
    pub consolidation_attempts: u32,
}

impl AppState {
    /// Wires every service onto one store and clock
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            timers: TimerLifecycle::new(store.clone(), clock.clone()),
            approvals: TimeEntryApproval::new(store.clone(), clock.clone()),
            engine: BillingConsolidationEngine::new(store.clone(), clock.clone()),
            reconciler: PaymentReconciler::new(store.clone(), clock.clone()),
            consolidation_attempts: DEFAULT_CONSOLIDATION_ATTEMPTS,
            store,
            clock,
        }
    }

    pub fn with_consolidation_attempts(mut self, attempts: u32) -> Self {
        self.consolidation_attempts = attempts.max(1);
        self
    }

    /// The clock's current UTC date
    pub fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }
}

/// Creates the main API router
pub fn create_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::readiness_check));

    let timer_routes = Router::new()
        .route("/", post(timers::start_timer))
        .route("/:id", get(timers::get_timer))
        .route("/:id/elapsed", get(timers::elapsed))
        .route("/:id/pause", post(timers::pause_timer))
        .route("/:id/resume", post(timers::resume_timer))
        .route("/:id/stop", post(timers::stop_timer))
        .route("/:id/cancel", post(timers::cancel_timer))
        .route("/:id/commit", post(timers::commit_timer));

    let time_entry_routes = Router::new()
        .route("/", post(time_entries::create_time_entry))
        .route(
            "/:id",
            get(time_entries::get_time_entry)
                .patch(time_entries::edit_time_entry)
                .delete(time_entries::delete_time_entry),
        )
        .route("/:id/approve", post(time_entries::approve_time_entry))
        .route("/:id/reject", post(time_entries::reject_time_entry))
        .route("/:id/reopen", post(time_entries::reopen_time_entry));

    let addon_routes = Router::new()
        .route("/", post(addons::create_addon))
        .route("/:id", get(addons::get_addon))
        .route("/:id/approve", post(addons::approve_addon))
        .route("/:id/reject", post(addons::reject_addon))
        .route("/:id/reopen", post(addons::reopen_addon));

    let account_routes = Router::new()
        .route("/:id/invoices", post(invoices::consolidate))
        .route("/:id/invoices/preview", post(invoices::preview));

    let invoice_routes = Router::new()
        .route(
            "/:id",
            get(invoices::get_invoice).delete(invoices::discard_invoice),
        )
        .route("/:id/finalize", post(invoices::finalize_invoice))
        .route("/:id/send", post(invoices::send_invoice))
        .route("/:id/cancel", post(invoices::cancel_invoice))
        .route("/:id/balance", get(invoices::get_balance))
        .route("/:id/payments", post(payments::record_payment));

    let payment_routes = Router::new()
        .route("/:id", get(payments::get_payment))
        .route("/:id/complete", post(payments::complete_payment))
        .route("/:id/fail", post(payments::fail_payment))
        .route("/:id/cancel", post(payments::cancel_payment))
        .route("/:id/refund", post(payments::refund_payment));

    let api_routes = Router::new()
        .nest("/timers", timer_routes)
        .route("/users/:id/timers", get(timers::list_active_timers))
        .nest("/time-entries", time_entry_routes)
        .nest("/addons", addon_routes)
        .nest("/accounts", account_routes)
        .nest("/invoices", invoice_routes)
        .nest("/payments", payment_routes)
        .route("/billing/refresh-overdue", post(invoices::refresh_overdue));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(public_routes)
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
