//! Runtime configuration for the messaging core
//!
//! `LinkConfig` covers the pool, pipeline, reconnect and detect tuning. It is
//! read from an optional TOML file, then `TABLELINK_*` environment variables
//! override individual values, then the result is validated. Per-game broker
//! lists live in JSON profiles (see `registry`).

use crate::connection::{ConnectionSettings, ReconnectPolicy};
use crate::errors::{ConfigurationError, LinkResult};
use crate::pipeline::PipelineConfig;
use crate::pool::{LoadBalancingStrategy, PoolConfig};
use serde::{Deserialize, Serialize};
use std::{env, path::Path, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Base backoff delay
    pub reconnect_delay_secs: u64,
    pub max_reconnect_delay_secs: u64,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 5,
            max_reconnect_delay_secs: 60,
            max_reconnect_attempts: 10,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DetectConfig {
    /// How often `detect` looks for a correlated response
    pub poll_interval_ms: u64,
    /// Publish through the pool; otherwise through one primary connection
    pub use_pool: bool,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            use_pool: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback `EnvFilter` directive when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    pub pool: PoolConfig,
    pub pipeline: PipelineConfig,
    pub reconnect: ReconnectConfig,
    pub detect: DetectConfig,
    pub logging: LoggingConfig,
}

impl LinkConfig {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            reconnect: ReconnectPolicy::from(&self.reconnect),
            connect_timeout: Duration::from_secs(self.reconnect.connect_timeout_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.detect.poll_interval_ms)
    }
}

/// Configuration loader with environment variable support
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the TOML file to read
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load file, apply environment overrides, validate
    pub fn load(&self) -> LinkResult<LinkConfig> {
        self.load_with(|key| env::var(key).ok())
    }

    /// Same as [`ConfigLoader::load`] with an explicit variable source
    pub fn load_with<F>(&self, lookup: F) -> LinkResult<LinkConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match self.config_path {
            Some(ref path) => Self::load_from_file(path)?,
            None => LinkConfig::default(),
        };

        Self::apply_overrides(&mut config, lookup)?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn load_from_file(path: &str) -> LinkResult<LinkConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;
        Ok(toml::from_str(&content)?)
    }

    fn apply_overrides<F>(config: &mut LinkConfig, lookup: F) -> LinkResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("TABLELINK_MAX_CONNECTIONS") {
            config.pool.max_connections = parse_var("TABLELINK_MAX_CONNECTIONS", value, "Invalid connection count")?;
        }
        if let Some(value) = lookup("TABLELINK_HEALTH_CHECK_INTERVAL") {
            config.pool.health_check_interval_secs =
                parse_var("TABLELINK_HEALTH_CHECK_INTERVAL", value, "Invalid interval in seconds")?;
        }
        if let Some(value) = lookup("TABLELINK_STRATEGY") {
            config.pool.strategy = value.parse::<LoadBalancingStrategy>()?;
        }
        if let Some(value) = lookup("TABLELINK_MAX_QUEUE_SIZE") {
            config.pipeline.max_queue_size = parse_var("TABLELINK_MAX_QUEUE_SIZE", value, "Invalid queue size")?;
        }
        if let Some(value) = lookup("TABLELINK_RECONNECT_DELAY") {
            config.reconnect.reconnect_delay_secs =
                parse_var("TABLELINK_RECONNECT_DELAY", value, "Invalid delay in seconds")?;
        }
        if let Some(value) = lookup("TABLELINK_POLL_INTERVAL_MS") {
            config.detect.poll_interval_ms =
                parse_var("TABLELINK_POLL_INTERVAL_MS", value, "Invalid interval in milliseconds")?;
        }
        if let Some(value) = lookup("TABLELINK_LOG_FILTER") {
            config.logging.filter = value;
        }
        Ok(())
    }

    fn validate(config: &LinkConfig) -> LinkResult<()> {
        let non_zero = [
            ("pool.max_connections", config.pool.max_connections as u64),
            ("pool.health_check_interval_secs", config.pool.health_check_interval_secs),
            ("pool.cleanup_interval_secs", config.pool.cleanup_interval_secs),
            ("pipeline.max_queue_size", config.pipeline.max_queue_size as u64),
            ("pipeline.max_history_size", config.pipeline.max_history_size as u64),
            ("pipeline.tick_interval_ms", config.pipeline.tick_interval_ms),
            ("reconnect.reconnect_delay_secs", config.reconnect.reconnect_delay_secs),
            ("reconnect.connect_timeout_secs", config.reconnect.connect_timeout_secs),
            ("detect.poll_interval_ms", config.detect.poll_interval_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigurationError::InvalidValue {
                    field: field.to_string(),
                    value: "0".to_string(),
                    reason: "Value cannot be zero".to_string(),
                }
                .into());
            }
        }

        if config.reconnect.reconnect_delay_secs > config.reconnect.max_reconnect_delay_secs {
            return Err(ConfigurationError::InvalidValue {
                field: "reconnect.max_reconnect_delay_secs".to_string(),
                value: config.reconnect.max_reconnect_delay_secs.to_string(),
                reason: "Max delay must not be below the base delay".to_string(),
            }
            .into());
        }

        if config.pool.health_topic_prefix.trim().is_empty() {
            return Err(ConfigurationError::MissingRequired("pool.health_topic_prefix".to_string()).into());
        }

        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(field: &str, value: String, reason: &str) -> Result<T, ConfigurationError> {
    value.trim().parse().map_err(|_| ConfigurationError::InvalidValue {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    })
}
