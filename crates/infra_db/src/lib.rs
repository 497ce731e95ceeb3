//! Infrastructure Database Layer
//!
//! PostgreSQL persistence for the service billing system using SQLx.
//!
//! # Architecture
//!
//! The crate follows the repository pattern: [`repositories`] holds the SQL
//! and row mapping, [`adapters`] implements the domain's `BillingStore` port
//! on top of it, composing repository calls into transactions where the
//! port requires atomicity.
//!
//! # Example
//!
//! ```rust,ignore
//! use infra_db::{create_pool, DatabaseConfig, PostgresBillingStore};
//!
//! let pool = create_pool(DatabaseConfig::new("postgres://localhost/billing").with_migrations()).await?;
//! let store = PostgresBillingStore::new(pool);
//! ```

pub mod adapters;
pub mod error;
pub mod pool;
pub mod repositories;

pub use adapters::PostgresBillingStore;
pub use error::DatabaseError;
pub use pool::{create_pool, create_pool_from_url, run_migrations, DatabaseConfig, DatabasePool, MIGRATOR};
