//! Configuration management for Rategate.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RategateError, Result};
use crate::ratelimit::clock::check_interval;
use crate::ratelimit::{ConflictBackoff, DistributedConfig};

/// Prefix for environment overrides, e.g. `RATEGATE__SERVER__UPSTREAM`.
const ENV_PREFIX: &str = "RATEGATE";

/// Main configuration for the Rategate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RategateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Coordination store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the proxy listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Base URL admitted requests are forwarded to
    #[serde(default)]
    pub upstream: Option<String>,

    /// Metrics server port, on the listen address's IP (disabled when unset)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream: None,
            metrics_port: default_metrics_port(),
        }
    }
}

impl ServerConfig {
    /// Address of the metrics server, if enabled.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_port.map(|port| SocketAddr::new(self.listen_addr.ip(), port))
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 4040))
}

fn default_metrics_port() -> Option<u16> {
    Some(9090)
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests admitted per path per interval
    #[serde(default = "default_requests_per_interval")]
    pub requests_per_interval: u64,

    /// Interval length in seconds
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            requests_per_interval: default_requests_per_interval(),
            interval_secs: default_interval_secs(),
        }
    }
}

impl RateLimitingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_requests_per_interval() -> u64 {
    100
}

fn default_interval_secs() -> u64 {
    60
}

/// Coordination store configuration.
///
/// An empty endpoint list keeps all counting in process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub etcd_endpoints: Vec<String>,

    /// Attach a lease to each interval record
    #[serde(default)]
    pub use_lease: bool,

    /// Smallest lease TTL the store accepts
    #[serde(default = "default_min_lease_ttl_secs")]
    pub min_lease_ttl_secs: u64,

    #[serde(default = "default_store_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_store_timeout_ms")]
    pub write_timeout_ms: u64,

    #[serde(default = "default_conflict_backoff_base_ms")]
    pub conflict_backoff_base_ms: u64,

    #[serde(default = "default_conflict_backoff_max_ms")]
    pub conflict_backoff_max_ms: u64,

    /// Give up after this many lost write races (unbounded when unset)
    #[serde(default)]
    pub max_conflict_retries: Option<u32>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            etcd_endpoints: Vec::new(),
            use_lease: false,
            min_lease_ttl_secs: default_min_lease_ttl_secs(),
            read_timeout_ms: default_store_timeout_ms(),
            write_timeout_ms: default_store_timeout_ms(),
            conflict_backoff_base_ms: default_conflict_backoff_base_ms(),
            conflict_backoff_max_ms: default_conflict_backoff_max_ms(),
            max_conflict_retries: None,
        }
    }
}

impl StoreConfig {
    pub fn min_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.min_lease_ttl_secs)
    }
}

fn default_min_lease_ttl_secs() -> u64 {
    5
}

fn default_store_timeout_ms() -> u64 {
    1000
}

fn default_conflict_backoff_base_ms() -> u64 {
    2
}

fn default_conflict_backoff_max_ms() -> u64 {
    100
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "debug".to_string()
}

impl RategateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RategateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load defaults, then the optional YAML file, then `RATEGATE__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Yaml)
                    .required(true),
            );
        }

        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("store.etcd_endpoints"),
            )
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| RategateError::Config(e.to_string()))
    }

    /// Reject settings the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        check_interval(self.rate_limiting.interval())?;

        match self.server.upstream.as_deref() {
            Some(upstream) if !upstream.trim().is_empty() => Ok(()),
            _ => Err(RategateError::Config("no upstream URL configured".to_string())),
        }
    }

    /// Settings for the store-backed admitter.
    pub fn distributed(&self) -> DistributedConfig {
        let store = &self.store;
        let mut config = DistributedConfig::new(
            self.rate_limiting.requests_per_interval,
            self.rate_limiting.interval(),
        )
        .with_lease(store.use_lease)
        .with_timeouts(
            Duration::from_millis(store.read_timeout_ms),
            Duration::from_millis(store.write_timeout_ms),
        )
        .with_conflict_backoff(ConflictBackoff::new(
            Duration::from_millis(store.conflict_backoff_base_ms),
            Duration::from_millis(store.conflict_backoff_max_ms),
        ));

        if let Some(retries) = store.max_conflict_retries {
            config = config.with_max_conflict_retries(retries);
        }
        config
    }
}
