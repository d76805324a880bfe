//! RevFlow SDK configuration
//!
//! TOML-based configuration with environment variable overrides. Every knob
//! has a default so an SDK embedded with nothing but an API key still works.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Default ingestion endpoint.
pub const DEFAULT_SERVER_URL: &str = "https://cdp-api.revflow.dev";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// SDK options, persistent across launches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SdkConfig {
    /// Write key sent as `X-API-Key` on every batch upload.
    pub api_key: String,

    /// Ingestion base URL; batches go to `{server_url}/batch`.
    pub server_url: String,

    /// Batch timer window, seconds.
    pub flush_interval: f64,

    /// Messages per batch before the count trigger fires.
    pub flush_queue_size: usize,

    /// When false, every message is delivered on its own.
    pub use_batch: bool,

    /// When true, all emits are dropped silently.
    pub opt_out: bool,

    /// Drain the queue one final time on process shutdown.
    pub flush_events_on_close: bool,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            server_url: DEFAULT_SERVER_URL.to_string(),
            flush_interval: 30.0,
            flush_queue_size: 10,
            use_batch: true,
            opt_out: false,
            flush_events_on_close: true,
        }
    }
}

impl SdkConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: SdkConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "flushInterval must be positive, got {}",
                self.flush_interval
            )));
        }
        if self.flush_queue_size == 0 {
            return Err(ConfigError::ValidationError(
                "flushQueueSize must be at least 1".to_string(),
            ));
        }
        if self.server_url.is_empty() {
            return Err(ConfigError::ValidationError(
                "serverUrl must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The batch timer window as a `Duration`.
    pub fn flush_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.flush_interval)
    }
}
