//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "surgegate.toml",
    "./config/config.toml",
    "./config/surgegate.toml",
    "/etc/surgegate/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides,
    /// then validate the result
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("SURGEGATE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        override_parsed("SURGEGATE_HTTP_PORT", &mut config.http.port);
        override_string("SURGEGATE_HTTP_HOST", &mut config.http.host);
        if let Ok(val) = env::var("SURGEGATE_CORS_ORIGINS") {
            config.http.cors_origins = val.split(',').map(|s| s.trim().to_string()).collect();
        }

        // Counter store
        override_string("SURGEGATE_STORE_BACKEND", &mut config.store.backend);
        // REDIS_URL is honoured for compatibility with container setups
        override_string("REDIS_URL", &mut config.store.redis_url);
        override_string("SURGEGATE_REDIS_URL", &mut config.store.redis_url);
        override_string("SURGEGATE_KEY_PREFIX", &mut config.store.key_prefix);

        // Record store
        override_string("SURGEGATE_DATABASE_URL", &mut config.database.url);

        // Queue
        override_string("SURGEGATE_QUEUE_BACKEND", &mut config.queue.backend);
        override_string("SURGEGATE_QUEUE_NAME", &mut config.queue.name);
        override_parsed("SURGEGATE_QUEUE_VISIBILITY_TIMEOUT", &mut config.queue.visibility_timeout_secs);
        override_parsed("SURGEGATE_QUEUE_MAX_DELIVERIES", &mut config.queue.max_deliveries);

        // Admission
        override_parsed("SURGEGATE_NORMAL_RPS", &mut config.admission.normal_rps);
        override_parsed("SURGEGATE_BUSY_RPS", &mut config.admission.busy_rps);
        override_parsed("SURGEGATE_OVERLOADED_RPS", &mut config.admission.overloaded_rps);
        override_parsed("SURGEGATE_CRITICAL_RPS", &mut config.admission.critical_rps);

        // Pacer
        override_parsed("SURGEGATE_OUTPUT_RPS", &mut config.pacer.output_rps);

        // Dispatch
        override_parsed("SURGEGATE_MAX_ATTEMPTS", &mut config.dispatch.max_attempts);
        override_parsed("SURGEGATE_CALL_TIMEOUT_MS", &mut config.dispatch.call_timeout_ms);
        override_parsed("SURGEGATE_MAX_IN_FLIGHT", &mut config.dispatch.max_in_flight);

        // Downstream
        override_string("SURGEGATE_DOWNSTREAM_MODE", &mut config.downstream.mode);
        override_string("SURGEGATE_DOWNSTREAM_URL", &mut config.downstream.url);
        override_parsed("SURGEGATE_MOCK_FAILURE_RATE", &mut config.downstream.mock_failure_rate);
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn override_string(var: &str, target: &mut String) {
    if let Ok(val) = env::var(var) {
        if !val.is_empty() {
            *target = val;
        }
    }
}

fn override_parsed<T: FromStr>(var: &str, target: &mut T) {
    if let Ok(val) = env::var(var) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(var = var, value = %val, "Ignoring unparseable environment override"),
        }
    }
}
