//! Request handlers, one module per resource

pub mod addons;
pub mod health;
pub mod invoices;
pub mod payments;
pub mod time_entries;
pub mod timers;
