//! Port adapters
//!
//! PostgreSQL implementations of domain ports. Each adapter translates
//! between domain models and the row types of [`crate::repositories`].

pub mod billing;

pub use billing::PostgresBillingStore;
