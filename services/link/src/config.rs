//! Configuration blocks shared by every camlink service.
//!
//! Each service embeds these in its own top-level configuration and loads the
//! whole tree through the `config` crate (files first, then prefixed
//! environment variables).

use serde::Deserialize;
use std::time::Duration;

/// UDP port both beacon roles broadcast on.
pub const DEFAULT_DISCOVERY_PORT: u16 = 50001;

/// HTTP port of the capture node (`/capture`, `/health`).
pub const DEFAULT_CAPTURE_PORT: u16 = 8088;

/// TCP port of the receiver's frame stream listener.
pub const DEFAULT_FRAME_PORT: u16 = 5001;

/// HTTP port of the receiver (`/upload`, `/health`).
pub const DEFAULT_UPLOAD_PORT: u16 = 5000;

/// Beacon and registry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP port for beacons
    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// Seconds between two beacons
    #[serde(default = "default_beacon_interval_secs")]
    pub beacon_interval_secs: u64,

    /// Interfaces tried, in order, for the advertised IPv4 address
    #[serde(default = "default_beacon_ifaces")]
    pub beacon_ifaces: Vec<String>,

    /// Receive poll in milliseconds; bounds how long a stop request goes unnoticed
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Forget peers not heard from for this many seconds (unset = never)
    #[serde(default)]
    pub stale_after_secs: Option<u64>,
}

/// Active subnet probing used when no beacon arrives in time.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Per-host HTTP timeout in milliseconds
    #[serde(default = "default_scan_timeout_ms")]
    pub timeout_ms: u64,

    /// Hosts probed at once (1 = sequential)
    #[serde(default = "default_scan_concurrency")]
    pub concurrency: usize,

    /// Prefix length assumed when the interface's own cannot be read
    #[serde(default = "default_prefix")]
    pub default_prefix: u8,

    /// Upper bound on probed addresses
    #[serde(default = "default_max_hosts")]
    pub max_hosts: usize,

    /// Path probed on each host
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}
fn default_beacon_interval_secs() -> u64 {
    5
}
fn default_beacon_ifaces() -> Vec<String> {
    vec!["wlan0".to_string(), "eth0".to_string()]
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_scan_timeout_ms() -> u64 {
    300
}
fn default_scan_concurrency() -> usize {
    1
}
fn default_prefix() -> u8 {
    24
}
fn default_max_hosts() -> usize {
    1024
}
fn default_health_path() -> String {
    "/health".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: default_discovery_port(),
            beacon_interval_secs: default_beacon_interval_secs(),
            beacon_ifaces: default_beacon_ifaces(),
            poll_interval_ms: default_poll_interval_ms(),
            stale_after_secs: None,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_scan_timeout_ms(),
            concurrency: default_scan_concurrency(),
            default_prefix: default_prefix(),
            max_hosts: default_max_hosts(),
            health_path: default_health_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl DiscoveryConfig {
    /// Get the beacon interval as Duration.
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_secs(self.beacon_interval_secs)
    }

    /// Get the receive poll as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get the staleness threshold, if pruning is enabled.
    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_secs.map(Duration::from_secs)
    }

    /// Validate the discovery settings.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.port == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "discovery.port".to_string(),
                message: "Port must be greater than 0".to_string(),
            });
        }
        if self.beacon_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "discovery.beacon_interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "discovery.poll_interval_ms".to_string(),
                message: "Poll interval must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

impl ScanConfig {
    /// Get the per-host timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validate the scan settings.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "scan.concurrency".to_string(),
                message: "Concurrency must be at least 1".to_string(),
            });
        }
        if self.default_prefix > 32 {
            return Err(ConfigValidationError::InvalidValue {
                field: "scan.default_prefix".to_string(),
                message: "Prefix must be between 0 and 32".to_string(),
            });
        }
        if !self.health_path.starts_with('/') {
            return Err(ConfigValidationError::InvalidValue {
                field: "scan.health_path".to_string(),
                message: "Path must start with '/'".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
