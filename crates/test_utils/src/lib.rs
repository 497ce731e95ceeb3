//! Test Utilities Crate
//!
//! Provides shared test infrastructure, fixtures, and helpers for the
//! billing test suite.
//!
//! # Modules
//!
//! - `fixtures`: Pre-built test data for accounts, rates and dates
//! - `builders`: Input builders and the in-memory `BillingHarness`
//! - `database`: PostgreSQL container management
//! - `assertions`: Custom assertion helpers for money and invoices
//! - `generators`: Property-based test data generators

pub mod fixtures;
pub mod builders;
pub mod database;
pub mod assertions;
pub mod generators;

pub use fixtures::*;
pub use builders::*;
pub use database::*;
pub use assertions::*;
pub use generators::*;
