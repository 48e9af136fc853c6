//! Configuration module for time-billing-service.

use rust_decimal::Decimal;
use service_core::config::{self as core_config, parse_env};
use service_core::error::AppError;
use std::env;

/// Fallback hourly rate when neither the entry nor the developer carries one.
pub const DEFAULT_HOURLY_RATE: i64 = 75;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Tunables of the allowance engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_hourly_rate: Decimal,
    /// Retries after losing a usage compare-and-swap to another writer.
    pub conflict_retries: u32,
    /// Clients recalculated in parallel during a bulk pass.
    pub recalculation_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_hourly_rate: Decimal::from(DEFAULT_HOURLY_RATE),
            conflict_retries: 3,
            recalculation_concurrency: 4,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        let config = Self {
            default_hourly_rate: parse_env("DEFAULT_HOURLY_RATE", defaults.default_hourly_rate)?,
            conflict_retries: parse_env("USAGE_CONFLICT_MAX_RETRIES", defaults.conflict_retries)?,
            recalculation_concurrency: parse_env(
                "RECALCULATION_CONCURRENCY",
                defaults.recalculation_concurrency,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.default_hourly_rate.is_sign_negative() && !self.default_hourly_rate.is_zero() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DEFAULT_HOURLY_RATE must not be negative"
            )));
        }
        if self.recalculation_concurrency == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "RECALCULATION_CONCURRENCY must be at least 1"
            )));
        }
        Ok(())
    }
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "time-billing-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            engine: EngineConfig::from_env()?,
        })
    }
}
