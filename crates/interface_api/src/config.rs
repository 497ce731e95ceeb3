//! API configuration

use serde::Deserialize;

/// Which `BillingStore` the server runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process memory; state is lost on restart
    Memory,
    Postgres,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    pub store_backend: StoreBackend,
    /// Database URL, used by the postgres backend
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Log level
    pub log_level: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            store_backend: StoreBackend::Memory,
            database_url: "postgres://localhost/billing".to_string(),
            max_connections: 10,
            min_connections: 2,
            log_level: "info".to_string(),
        }
    }
}

impl ApiConfig {
    /// Loads configuration from `BILLING_*` environment variables
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("BILLING").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// Returns the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_memory_backend() {
        let config = ApiConfig::default();

        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.server_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_missing_keys_fall_back_to_defaults() {
        let config: ApiConfig = config::Config::builder()
            .set_override("port", 9090)
            .unwrap()
            .set_override("store_backend", "postgres")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.port, 9090);
        assert_eq!(config.store_backend, StoreBackend::Postgres);
        assert_eq!(config.host, "0.0.0.0");
    }
}
