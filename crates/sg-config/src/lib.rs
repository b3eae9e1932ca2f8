//! Surgegate Configuration System
//!
//! TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

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

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub store: StoreConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub admission: AdmissionConfig,
    pub pacer: PacerConfig,
    pub dispatch: DispatchConfig,
    pub housekeeping: HousekeepingConfig,
    pub downstream: DownstreamConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "0.0.0.0".to_string(),
            cors_origins: vec!["*".to_string()],
        }
    }
}

/// Shared counter store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend type: redis, memory
    pub backend: String,
    pub redis_url: String,
    /// Prefix for every key written to the store
    pub key_prefix: String,
    /// First retry delay when Redis is unreachable at startup
    pub reconnect_initial_ms: u64,
    /// Upper bound of the doubling retry delay
    pub reconnect_max_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "redis".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "surgegate".to_string(),
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 30_000,
        }
    }
}

/// Persistent record store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite URL, or "memory" for the in-process store
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/surgegate.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Backend type: sqlite, memory
    pub backend: String,
    pub name: String,
    pub visibility_timeout_secs: u32,
    /// Deliveries after which a job is finalized as failed without another attempt
    pub max_deliveries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            name: "dispatch_requests".to_string(),
            visibility_timeout_secs: 60,
            max_deliveries: 3,
        }
    }
}

/// Adaptive input limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Depth at which the system becomes busy
    pub busy_threshold: u64,
    /// Depth at which the system becomes overloaded
    pub overloaded_threshold: u64,
    /// Depth at which the system becomes critical
    pub critical_threshold: u64,
    pub normal_rps: u32,
    pub busy_rps: u32,
    pub overloaded_rps: u32,
    pub critical_rps: u32,
    /// Length of the admission counting window
    pub window_secs: u64,
    /// Nominal queue capacity, used for utilization reporting only
    pub max_queue_size: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            busy_threshold: 100,
            overloaded_threshold: 500,
            critical_threshold: 1000,
            normal_rps: 1000,
            busy_rps: 200,
            overloaded_rps: 80,
            critical_rps: 60,
            window_secs: 1,
            max_queue_size: 3600,
        }
    }
}

/// Output pacer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    /// Maximum downstream dispatches per second, globally
    pub output_rps: u32,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self { output_rps: 60 }
    }
}

impl PacerConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.output_rps.max(1) as f64)
    }
}

/// Dispatch worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Downstream attempts per request before it is failed
    pub max_attempts: u32,
    /// Wall-clock limit for one downstream call
    pub call_timeout_ms: u64,
    /// Pause between attempts of the same request
    pub retry_delay_ms: u64,
    /// Jobs processed concurrently by one dispatcher
    pub max_in_flight: usize,
    /// Jobs fetched per queue poll
    pub poll_batch: u32,
    /// Sleep when a poll returns nothing
    pub idle_poll_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            call_timeout_ms: 30_000,
            retry_delay_ms: 250,
            max_in_flight: 64,
            poll_batch: 10,
            idle_poll_ms: 100,
        }
    }
}

/// Counter store housekeeping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    /// Sweep when the dispatched sequence number is a multiple of this
    pub every_n_sequences: i64,
    /// Window keys older than this are deleted
    pub retention_secs: u64,
    /// Minimum spacing between two sweeps
    pub min_interval_secs: u64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            every_n_sequences: 100,
            retention_secs: 60,
            min_interval_secs: 300,
        }
    }
}

/// Downstream service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownstreamConfig {
    /// mock or http
    pub mode: String,
    /// Target URL in http mode
    pub url: String,
    pub mock_min_latency_ms: u64,
    pub mock_max_latency_ms: u64,
    /// Fraction of mock calls that fail, 0.0 - 1.0
    pub mock_failure_rate: f64,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            mode: "mock".to_string(),
            url: String::new(),
            mock_min_latency_ms: 100,
            mock_max_latency_ms: 500,
            mock_failure_rate: 0.0,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Reject settings the core cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let a = &self.admission;
        if !(a.busy_threshold < a.overloaded_threshold && a.overloaded_threshold < a.critical_threshold) {
            return Err(ConfigError::ValidationError(format!(
                "state thresholds must be strictly increasing (busy={}, overloaded={}, critical={})",
                a.busy_threshold, a.overloaded_threshold, a.critical_threshold
            )));
        }
        if a.busy_threshold == 0 {
            return Err(ConfigError::ValidationError("busy_threshold must be positive".to_string()));
        }
        if [a.normal_rps, a.busy_rps, a.overloaded_rps, a.critical_rps].contains(&0) {
            return Err(ConfigError::ValidationError("admission rates must be positive".to_string()));
        }
        if a.window_secs == 0 {
            return Err(ConfigError::ValidationError("window_secs must be positive".to_string()));
        }
        if self.pacer.output_rps == 0 {
            return Err(ConfigError::ValidationError("pacer.output_rps must be positive".to_string()));
        }
        if self.store.reconnect_initial_ms == 0 || self.store.reconnect_max_ms < self.store.reconnect_initial_ms {
            return Err(ConfigError::ValidationError(
                "store.reconnect_initial_ms must be positive and not above store.reconnect_max_ms".to_string(),
            ));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(ConfigError::ValidationError("dispatch.max_attempts must be positive".to_string()));
        }
        if self.dispatch.max_in_flight == 0 {
            return Err(ConfigError::ValidationError("dispatch.max_in_flight must be positive".to_string()));
        }
        if self.housekeeping.every_n_sequences <= 0 {
            return Err(ConfigError::ValidationError("housekeeping.every_n_sequences must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.downstream.mock_failure_rate) {
            return Err(ConfigError::ValidationError("downstream.mock_failure_rate must be within 0.0 - 1.0".to_string()));
        }
        if self.downstream.mode == "http" && self.downstream.url.is_empty() {
            return Err(ConfigError::ValidationError("downstream.url is required in http mode".to_string()));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Surgegate Configuration
# Environment variables (SURGEGATE_*) override these settings

[http]
port = 8000
host = "0.0.0.0"
cors_origins = ["*"]

[store]
backend = "redis"  # redis or memory
redis_url = "redis://127.0.0.1:6379"
key_prefix = "surgegate"
reconnect_initial_ms = 1000
reconnect_max_ms = 30000

[database]
url = "sqlite://./data/surgegate.db?mode=rwc"  # or "memory"
max_connections = 5

[queue]
backend = "sqlite"  # sqlite or memory
name = "dispatch_requests"
visibility_timeout_secs = 60
max_deliveries = 3

[admission]
busy_threshold = 100
overloaded_threshold = 500
critical_threshold = 1000
normal_rps = 1000
busy_rps = 200
overloaded_rps = 80
critical_rps = 60
window_secs = 1
max_queue_size = 3600

[pacer]
output_rps = 60

[dispatch]
max_attempts = 3
call_timeout_ms = 30000
retry_delay_ms = 250
max_in_flight = 64
poll_batch = 10
idle_poll_ms = 100

[housekeeping]
every_n_sequences = 100
retention_secs = 60
min_interval_secs = 300

[downstream]
mode = "mock"  # mock or http
url = ""
mock_min_latency_ms = 100
mock_max_latency_ms = 500
mock_failure_rate = 0.0
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.admission.normal_rps, 1000);
        assert_eq!(config.admission.critical_rps, 60);
        assert_eq!(config.pacer.output_rps, 60);
        assert_eq!(config.dispatch.max_attempts, 3);
    }

    #[test]
    fn test_example_toml_parses_to_defaults() {
        let parsed: AppConfig = toml::from_str(&AppConfig::example_toml()).unwrap();
        let defaults = AppConfig::default();

        assert_eq!(parsed.http.port, defaults.http.port);
        assert_eq!(parsed.store.key_prefix, defaults.store.key_prefix);
        assert_eq!(parsed.admission.overloaded_rps, defaults.admission.overloaded_rps);
        assert_eq!(parsed.housekeeping.retention_secs, defaults.housekeeping.retention_secs);
        parsed.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pacer]\noutput_rps = 10\n\n[store]\nbackend = \"memory\"").unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pacer.output_rps, 10);
        assert_eq!(config.store.backend, "memory");
        assert_eq!(config.store.key_prefix, "surgegate");
        assert_eq!(config.admission.busy_rps, 200);
    }

    #[test]
    fn test_min_interval() {
        let pacer = PacerConfig { output_rps: 4 };
        assert_eq!(pacer.min_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = AppConfig::default();
        config.admission.overloaded_threshold = 50;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validate_rejects_zero_rates() {
        let mut config = AppConfig::default();
        config.pacer.output_rps = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.admission.busy_rps = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dispatch.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_reconnect_backoff() {
        let mut config = AppConfig::default();
        config.store.reconnect_initial_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.store.reconnect_max_ms = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_downstream_requires_url() {
        let mut config = AppConfig::default();
        config.downstream.mode = "http".to_string();
        assert!(config.validate().is_err());

        config.downstream.url = "http://localhost:9000/invoke".to_string();
        config.validate().unwrap();
    }
}
