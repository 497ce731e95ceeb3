//! Billing API Server Binary
//!
//! # Usage
//!
//! ```bash
//! # In-memory store, default port
//! cargo run --bin billing-api
//!
//! # PostgreSQL store
//! BILLING_STORE_BACKEND=postgres BILLING_DATABASE_URL=postgres://... cargo run --bin billing-api
//! ```
//!
//! # Environment Variables
//!
//! * `BILLING_HOST` - Server host (default: 0.0.0.0)
//! * `BILLING_PORT` - Server port (default: 8080)
//! * `BILLING_STORE_BACKEND` - `memory` or `postgres` (default: memory)
//! * `BILLING_DATABASE_URL` - PostgreSQL connection string
//! * `BILLING_MAX_CONNECTIONS` / `BILLING_MIN_CONNECTIONS` - pool bounds
//! * `BILLING_LOG_LEVEL` - Log level: trace, debug, info, warn, error (default: info)

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use core_kernel::SystemClock;
use domain_billing::{BillingStore, InMemoryBillingStore};
use infra_db::{create_pool, DatabaseConfig, PostgresBillingStore};
use interface_api::{
    config::{ApiConfig, StoreBackend},
    create_router, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (useful for local development)
    dotenvy::dotenv().ok();

    let config = load_config();
    init_tracing(&config.log_level);

    tracing::info!(
        host = %config.host,
        port = %config.port,
        backend = ?config.store_backend,
        "Starting billing API server"
    );

    let store = build_store(&config).await?;
    let app = create_router(AppState::new(store, Arc::new(SystemClock)));

    let addr: SocketAddr = config
        .server_addr()
        .parse()
        .with_context(|| format!("invalid server address {}", config.server_addr()))?;

    tracing::info!(%addr, "Server listening");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Falls back to defaults when the environment cannot be parsed
fn load_config() -> ApiConfig {
    ApiConfig::from_env().unwrap_or_else(|err| {
        eprintln!("Ignoring invalid BILLING_* configuration: {err}");
        ApiConfig::default()
    })
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn build_store(config: &ApiConfig) -> anyhow::Result<Arc<dyn BillingStore>> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; data is lost on shutdown");
            Ok(Arc::new(InMemoryBillingStore::new()))
        }
        StoreBackend::Postgres => {
            let pool = create_pool(
                DatabaseConfig::new(&config.database_url)
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .with_migrations(),
            )
            .await
            .context("connecting to the billing database")?;
            Ok(Arc::new(PostgresBillingStore::new(pool)))
        }
    }
}

/// Waits for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
