//! Environment configuration for the storage server.
//!
//! # Configuration
//!
//! - `DATABASE_URL`: official Postgres database (required)
//! - `STORAGE_ENCRYPTION_KEY`: base64 AES-256 key sealing connection strings at rest (required)
//! - `STORAGE_PG_MAX_CONNECTIONS`: official pool size (default: 20)
//! - `STORAGE_SELF_HOSTED_MAX_CONNECTIONS`: pool size per self-hosted database (default: 5)
//! - `STORAGE_CACHE_TTL_SECS`: how long a routing decision may be cached (default: 5)
//! - `STORAGE_PROBE_TIMEOUT_SECS`: connection probe timeout (default: 10)
//! - `STORAGE_INIT_TIMEOUT_SECS`: schema initialization timeout (default: 60)
//! - `STORAGE_SWEEP_INTERVAL_SECS`: cache and pool sweep interval (default: 60)
//! - `HOST` / `PORT`: listen address (default: `0.0.0.0:8081`)
//!
//! Numeric values that are missing, unparsable or zero fall back to the default.

use std::time::Duration;

use secrecy::SecretString;
use storage::{
    ServiceSettings,
    backend::postgres::DEFAULT_SELF_HOSTED_MAX_CONNECTIONS,
    cache::DEFAULT_CACHE_TTL,
    maintenance::MaintenanceConfig,
    probe::DEFAULT_PROBE_TIMEOUT,
    schema::DEFAULT_INIT_TIMEOUT,
};
use thiserror::Error;

/// Default number of connections to the official database.
const DEFAULT_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8081;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: SecretString,
    pub encryption_key: SecretString,
    pub max_connections: u32,
    pub self_hosted_max_connections: u32,
    pub cache_ttl: Duration,
    pub probe_timeout: Duration,
    pub init_timeout: Duration,
    pub sweep_interval: Duration,
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            encryption_key: required("STORAGE_ENCRYPTION_KEY")?,
            max_connections: get_max_connections(),
            self_hosted_max_connections: positive("STORAGE_SELF_HOSTED_MAX_CONNECTIONS")
                .unwrap_or(DEFAULT_SELF_HOSTED_MAX_CONNECTIONS),
            cache_ttl: seconds("STORAGE_CACHE_TTL_SECS").unwrap_or(DEFAULT_CACHE_TTL),
            probe_timeout: seconds("STORAGE_PROBE_TIMEOUT_SECS").unwrap_or(DEFAULT_PROBE_TIMEOUT),
            init_timeout: seconds("STORAGE_INIT_TIMEOUT_SECS").unwrap_or(DEFAULT_INIT_TIMEOUT),
            sweep_interval: seconds("STORAGE_SWEEP_INTERVAL_SECS")
                .unwrap_or(DEFAULT_SWEEP_INTERVAL),
            host: std::env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|s| s.trim().parse::<u16>().ok())
                .unwrap_or(DEFAULT_PORT),
        })
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            cache_ttl: self.cache_ttl,
            probe_timeout: self.probe_timeout,
            init_timeout: self.init_timeout,
        }
    }

    pub fn maintenance(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            sweep_interval: self.sweep_interval,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Gets the maximum number of official database connections from the environment.
///
/// Reads `STORAGE_PG_MAX_CONNECTIONS`; if not set or invalid, returns the default of 20.
pub fn get_max_connections() -> u32 {
    positive("STORAGE_PG_MAX_CONNECTIONS").unwrap_or(DEFAULT_MAX_CONNECTIONS)
}

fn required(key: &'static str) -> Result<SecretString, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(SecretString::from)
        .ok_or(ConfigError::Missing(key))
}

fn positive(key: &str) -> Option<u32> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|&n| n > 0)
}

fn seconds(key: &str) -> Option<Duration> {
    positive(key).map(|secs| Duration::from_secs(u64::from(secs)))
}
