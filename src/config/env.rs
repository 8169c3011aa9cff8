//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;

use crate::executor::PoolSize;
use crate::utils::LogLevel;

/// Environment variable prefix
const ENV_PREFIX: &str = "VERDANT";

/// Configuration from `VERDANT_*` environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// VERDANT_PROCESSES
    pub processes: Option<PoolSize>,
    /// VERDANT_FILTER
    pub filter: Option<String>,
    /// VERDANT_PASSTHROUGH
    pub passthrough: Option<bool>,
    /// VERDANT_COVERAGE
    pub coverage: Option<bool>,
    /// VERDANT_INITIALIZER
    pub initializer: Option<String>,
    /// VERDANT_FINALIZER
    pub finalizer: Option<String>,
    /// VERDANT_GRACE, in seconds
    pub grace: Option<u64>,
    /// VERDANT_CONFIG
    pub config_file: Option<String>,
    /// VERDANT_LOG
    pub log: Option<LogLevel>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            processes: get_env_parse("PROCESSES"),
            filter: get_env("FILTER"),
            passthrough: get_env_bool("PASSTHROUGH"),
            coverage: get_env_bool("COVERAGE"),
            initializer: get_env("INITIALIZER"),
            finalizer: get_env("FINALIZER"),
            grace: get_env_parse("GRACE"),
            config_file: get_env("CONFIG"),
            log: get_env("LOG").and_then(|v| LogLevel::from_str(&v)),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.processes.is_some()
            || self.filter.is_some()
            || self.passthrough.is_some()
            || self.coverage.is_some()
            || self.initializer.is_some()
            || self.finalizer.is_some()
            || self.grace.is_some()
            || self.config_file.is_some()
            || self.log.is_some()
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}"))
        .ok()
        .filter(|v| !v.is_empty())
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}
