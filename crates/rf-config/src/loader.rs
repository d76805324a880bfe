//! Configuration loader with file and environment variable support

use std::env;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::{ConfigError, SdkConfig};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "revflow.toml",
    "./config/revflow.toml",
    "/etc/revflow/revflow.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader pinned to a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides applied on top.
    pub fn load(&self) -> Result<SdkConfig, ConfigError> {
        let mut config = SdkConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = SdkConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("REVFLOW_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut SdkConfig) {
        if let Ok(val) = env::var("REVFLOW_API_KEY") {
            config.api_key = val;
        }
        if let Ok(val) = env::var("REVFLOW_SERVER_URL") {
            config.server_url = val;
        }
        if let Ok(val) = env::var("REVFLOW_FLUSH_INTERVAL") {
            match val.parse() {
                Ok(interval) => config.flush_interval = interval,
                Err(_) => warn!(value = %val, "Ignoring unparseable REVFLOW_FLUSH_INTERVAL"),
            }
        }
        if let Ok(val) = env::var("REVFLOW_FLUSH_QUEUE_SIZE") {
            match val.parse() {
                Ok(size) => config.flush_queue_size = size,
                Err(_) => warn!(value = %val, "Ignoring unparseable REVFLOW_FLUSH_QUEUE_SIZE"),
            }
        }
        if let Ok(val) = env::var("REVFLOW_USE_BATCH") {
            config.use_batch = parse_bool(&val).unwrap_or(config.use_batch);
        }
        if let Ok(val) = env::var("REVFLOW_OPT_OUT") {
            config.opt_out = parse_bool(&val).unwrap_or(config.opt_out);
        }
        if let Ok(val) = env::var("REVFLOW_FLUSH_EVENTS_ON_CLOSE") {
            config.flush_events_on_close = parse_bool(&val).unwrap_or(config.flush_events_on_close);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
