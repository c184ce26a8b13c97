//! Configuration for the ledger services and the operator CLI.
//!
//! Supports hierarchical configuration loading:
//! 1. Default values in code
//! 2. Configuration files (`config/<environment>.toml`, optional)
//! 3. Environment variable overrides (`STOCKSHIFT__SECTION__KEY`)

use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;

use stockshift_ledger::PageLimits;

use crate::idempotency::{DEFAULT_TTL_HOURS, IdempotencyPolicy, MIN_TTL_HOURS};
use crate::retry::RetryPolicy;

/// Main configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    /// Current environment (development, production, test)
    pub environment: String,

    pub database: DatabaseConfig,

    pub store: StoreConfig,

    pub retry: RetryConfig,

    pub idempotency: IdempotencyConfig,

    pub pagination: PaginationConfig,

    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Upper bound on any single row/key lock wait
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Total attempts for a unit of work hitting transient failures
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdempotencyConfig {
    pub ttl_hours: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaginationConfig {
    pub default_size: u32,
    pub max_size: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,

    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl LedgerConfig {
    /// Load configuration from files and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            std::env::var("STOCKSHIFT_ENVIRONMENT").unwrap_or_else(|_| "development".into());

        let builder = Self::defaults(&environment)?
            // Load environment-specific config file
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // Override with environment variables (STOCKSHIFT__ prefix)
            .add_source(
                Environment::with_prefix("STOCKSHIFT")
                    .separator("__")
                    .try_parsing(true),
            );

        Self::from_builder(builder)
    }

    /// Builder pre-populated with the code defaults.
    pub fn defaults(environment: &str) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        config::Config::builder()
            .set_default("environment", environment)?
            .set_default("database.url", "postgres://localhost:5432/stockshift")?
            .set_default("database.max_connections", 10)?
            .set_default("store.lock_timeout_ms", 2000)?
            .set_default("retry.max_attempts", 3)?
            .set_default("retry.base_delay_ms", 50)?
            .set_default("retry.max_delay_ms", 1000)?
            .set_default("idempotency.ttl_hours", i64::from(DEFAULT_TTL_HOURS))?
            .set_default("pagination.default_size", 20)?
            .set_default("pagination.max_size", 1000)?
            .set_default("logging.json", true)?
            .set_default("logging.level", "info")
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idempotency.ttl_hours < MIN_TTL_HOURS {
            return Err(ConfigError::Message(format!(
                "idempotency.ttl_hours must be at least {MIN_TTL_HOURS}, got {}",
                self.idempotency.ttl_hours
            )));
        }
        if self.store.lock_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "store.lock_timeout_ms must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Message(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Message(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        if self.pagination.default_size == 0
            || self.pagination.default_size > self.pagination.max_size
        {
            return Err(ConfigError::Message(format!(
                "pagination.default_size must be within 1..={}",
                self.pagination.max_size
            )));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.store.lock_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn idempotency_policy(&self) -> IdempotencyPolicy {
        IdempotencyPolicy::from_hours(self.idempotency.ttl_hours)
    }

    pub fn page_limits(&self) -> PageLimits {
        PageLimits {
            default_size: self.pagination.default_size,
            max_size: self.pagination.max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = LedgerConfig::from_builder(LedgerConfig::defaults("test").unwrap()).unwrap();

        assert_eq!(config.environment, "test");
        assert_eq!(config.lock_timeout(), Duration::from_millis(2000));
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.idempotency_policy(), IdempotencyPolicy::default());
        assert_eq!(config.page_limits(), PageLimits::default());
        assert!(config.logging.json);
    }

    #[test]
    fn overrides_replace_defaults() {
        let builder = LedgerConfig::defaults("test")
            .unwrap()
            .set_override("store.lock_timeout_ms", 250)
            .unwrap()
            .set_override("pagination.max_size", 50)
            .unwrap();
        let config = LedgerConfig::from_builder(builder).unwrap();

        assert_eq!(config.lock_timeout(), Duration::from_millis(250));
        assert_eq!(config.page_limits().max_size, 50);
    }

    #[test]
    fn ttl_below_the_floor_is_rejected() {
        let builder = LedgerConfig::defaults("test")
            .unwrap()
            .set_override("idempotency.ttl_hours", 12)
            .unwrap();

        let err = LedgerConfig::from_builder(builder).unwrap_err();
        assert!(err.to_string().contains("ttl_hours"));
    }

    #[test]
    fn default_page_size_must_fit_the_cap() {
        let builder = LedgerConfig::defaults("test")
            .unwrap()
            .set_override("pagination.default_size", 2000)
            .unwrap();

        assert!(LedgerConfig::from_builder(builder).is_err());
    }
}
