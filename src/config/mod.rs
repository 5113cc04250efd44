use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Resolved pool configuration shared by every host pool and the circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of connections per host (idle + checked out)
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// How long a checkout waits for an idle connection, in milliseconds
    #[serde(default = "default_checkout_timeout_ms")]
    pub checkout_timeout_ms: u64,

    /// Upper bound on a single operation against a connection, in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Consecutive errors a host may accumulate before it is disabled
    #[serde(default = "default_auto_disable_error_limit")]
    pub auto_disable_error_limit: u32,

    /// How long a tripped host stays disabled, in seconds
    #[serde(default = "default_auto_disable_duration_secs")]
    pub auto_disable_duration_secs: u64,
}

fn default_max_pool_size() -> usize {
    8
}

fn default_checkout_timeout_ms() -> u64 {
    1_000
}

fn default_operation_timeout_ms() -> u64 {
    5_000
}

fn default_auto_disable_error_limit() -> u32 {
    10
}

fn default_auto_disable_duration_secs() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: default_max_pool_size(),
            checkout_timeout_ms: default_checkout_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            auto_disable_error_limit: default_auto_disable_error_limit(),
            auto_disable_duration_secs: default_auto_disable_duration_secs(),
        }
    }
}

impl PoolConfig {
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn auto_disable_duration(&self) -> Duration {
        Duration::from_secs(self.auto_disable_duration_secs)
    }

    /// Reject configurations no pool could operate under
    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            anyhow::bail!("max_pool_size must be greater than 0");
        }
        Ok(())
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<PoolConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: PoolConfig = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    config.validate()?;
    Ok(config)
}

/// Load configuration from environment variables
///
/// Every variable is optional; unset ones keep their defaults:
/// - KVPOOL_MAX_POOL_SIZE
/// - KVPOOL_CHECKOUT_TIMEOUT_MS
/// - KVPOOL_OPERATION_TIMEOUT_MS
/// - KVPOOL_AUTO_DISABLE_ERROR_LIMIT
/// - KVPOOL_AUTO_DISABLE_DURATION_SECS
pub fn load_from_env() -> Result<PoolConfig> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let mut config = PoolConfig::default();

    if let Some(val) = env_parse("KVPOOL_MAX_POOL_SIZE")? {
        config.max_pool_size = val;
    }
    if let Some(val) = env_parse("KVPOOL_CHECKOUT_TIMEOUT_MS")? {
        config.checkout_timeout_ms = val;
    }
    if let Some(val) = env_parse("KVPOOL_OPERATION_TIMEOUT_MS")? {
        config.operation_timeout_ms = val;
    }
    if let Some(val) = env_parse("KVPOOL_AUTO_DISABLE_ERROR_LIMIT")? {
        config.auto_disable_error_limit = val;
    }
    if let Some(val) = env_parse("KVPOOL_AUTO_DISABLE_DURATION_SECS")? {
        config.auto_disable_duration_secs = val;
    }

    config.validate()?;
    Ok(config)
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => {
            let val = raw
                .trim()
                .parse()
                .context(format!("Invalid value for {}: {:?}", name, raw))?;
            Ok(Some(val))
        }
        Err(_) => Ok(None),
    }
}

/// Load configuration from a YAML file if given, otherwise from the environment
pub fn load_config(config_path: Option<&str>) -> Result<PoolConfig> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}
