//! Repository implementations for the billing tables
//!
//! `rows` maps table rows onto domain models; `billing` holds the SQL. Queries
//! are built at runtime with `sqlx::query_as` and bound parameters.

pub mod billing;
pub mod rows;
