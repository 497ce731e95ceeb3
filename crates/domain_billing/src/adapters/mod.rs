//! Billing store adapters that live alongside the domain
//!
//! The PostgreSQL adapter lives in `infra_db`.

pub mod memory;

pub use memory::InMemoryBillingStore;
