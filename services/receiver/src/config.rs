//! Configuration management for the capture receiver.
//!
//! Loaded from `config/receiver.toml`, `/etc/camlink/receiver.toml`, then
//! environment variables prefixed with `RECEIVER__` (e.g.
//! `RECEIVER__SESSIONS__REUSE_WINDOW_SECS=60`).

use camlink::config::{
    ConfigValidationError, DiscoveryConfig, LoggingConfig, DEFAULT_FRAME_PORT, DEFAULT_UPLOAD_PORT,
};
use camlink::frame_transport::DEFAULT_MAX_IMAGE_LEN;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the receiver.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub frame_stream: FrameStreamConfig,

    #[serde(default)]
    pub annotation: AnnotationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Upload API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_upload_port")]
    pub port: u16,

    /// Prometheus exporter port (disabled when unset)
    #[serde(default)]
    pub metrics_port: Option<u16>,

    /// Broadcast `capture_receiver` beacons
    #[serde(default = "default_true")]
    pub advertise: bool,
}

/// Session directory settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Directory all sessions are created under
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Seconds a session stays open to further frames of the same name
    #[serde(default = "default_reuse_window_secs")]
    pub reuse_window_secs: u64,

    /// Largest accepted upload request body
    #[serde(default = "default_max_bytes")]
    pub max_upload_bytes: usize,
}

/// TCP frame stream listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameStreamConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_frame_port")]
    pub port: u16,

    /// Largest accepted image in one frame
    #[serde(default = "default_max_bytes")]
    pub max_image_bytes: usize,
}

/// Image annotation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Describe endpoint of the annotation service
    #[serde(default = "default_annotation_url")]
    pub url: String,

    /// `path` sends the image path, `upload` sends the image bytes
    #[serde(default = "default_annotation_mode")]
    pub mode: String,

    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Pending jobs before new ones are dropped
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[serde(default = "default_annotation_timeout_secs")]
    pub timeout_secs: u64,

    /// Delay before reading a freshly stored image
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Path prefix rewritten before sending in `path` mode
    #[serde(default)]
    pub remap_src: Option<String>,

    #[serde(default)]
    pub remap_dst: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_upload_port() -> u16 {
    DEFAULT_UPLOAD_PORT
}
fn default_frame_port() -> u16 {
    DEFAULT_FRAME_PORT
}
fn default_true() -> bool {
    true
}
fn default_root() -> PathBuf {
    PathBuf::from("/tmp/incoming_frames")
}
fn default_reuse_window_secs() -> u64 {
    120
}
fn default_max_bytes() -> usize {
    DEFAULT_MAX_IMAGE_LEN
}
fn default_annotation_url() -> String {
    "http://127.0.0.1:8080/describe".to_string()
}
fn default_annotation_mode() -> String {
    "path".to_string()
}
fn default_workers() -> usize {
    2
}
fn default_queue_size() -> usize {
    64
}
fn default_annotation_timeout_secs() -> u64 {
    60
}
fn default_settle_ms() -> u64 {
    50
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_upload_port(),
            metrics_port: None,
            advertise: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            reuse_window_secs: default_reuse_window_secs(),
            max_upload_bytes: default_max_bytes(),
        }
    }
}

impl Default for FrameStreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_frame_port(),
            max_image_bytes: default_max_bytes(),
        }
    }
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_annotation_url(),
            mode: default_annotation_mode(),
            workers: default_workers(),
            queue_size: default_queue_size(),
            timeout_secs: default_annotation_timeout_secs(),
            settle_ms: default_settle_ms(),
            remap_src: None,
            remap_dst: None,
        }
    }
}

impl ReceiverConfig {
    /// Load configuration from files and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/receiver").required(false))
            .add_source(File::with_name("/etc/camlink/receiver").required(false))
            .add_source(
                Environment::with_prefix("RECEIVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.service.port == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "service.port".to_string(),
                message: "Port must be greater than 0".to_string(),
            });
        }

        self.discovery.validate()?;

        if self.sessions.root.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField("sessions.root".to_string()));
        }

        if self.frame_stream.enabled {
            if self.frame_stream.port == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: "frame_stream.port".to_string(),
                    message: "Port must be greater than 0".to_string(),
                });
            }
            if self.frame_stream.port == self.service.port && self.frame_stream.host == self.service.host
            {
                return Err(ConfigValidationError::InvalidValue {
                    field: "frame_stream.port".to_string(),
                    message: "Frame stream and upload API cannot share a port".to_string(),
                });
            }
        }

        if self.annotation.enabled {
            if self.annotation.url.is_empty() {
                return Err(ConfigValidationError::MissingField("annotation.url".to_string()));
            }
            if !matches!(self.annotation.mode.as_str(), "path" | "upload") {
                return Err(ConfigValidationError::InvalidValue {
                    field: "annotation.mode".to_string(),
                    message: format!("Unknown mode '{}' (expected path or upload)", self.annotation.mode),
                });
            }
            if self.annotation.workers == 0 || self.annotation.queue_size == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: "annotation.workers/queue_size".to_string(),
                    message: "Must be at least 1".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl SessionConfig {
    /// Get the reuse window as Duration.
    pub fn reuse_window(&self) -> Duration {
        Duration::from_secs(self.reuse_window_secs)
    }
}

impl AnnotationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Both halves of the path remap, when configured.
    pub fn remap(&self) -> Option<(String, String)> {
        match (&self.remap_src, &self.remap_dst) {
            (Some(src), Some(dst)) if !src.is_empty() => Some((src.clone(), dst.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReceiverConfig::default();
        assert_eq!(config.service.port, 5000);
        assert_eq!(config.frame_stream.port, 5001);
        assert_eq!(config.sessions.reuse_window(), Duration::from_secs(120));
        assert!(!config.annotation.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shared_port_rejected() {
        let mut config = ReceiverConfig::default();
        config.frame_stream.port = 5000;
        assert!(config.validate().is_err());
        config.frame_stream.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_annotation_mode_checked_when_enabled() {
        let mut config = ReceiverConfig::default();
        config.annotation.mode = "base64".to_string();
        assert!(config.validate().is_ok());
        config.annotation.enabled = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { field, .. }) if field == "annotation.mode"
        ));
    }

    #[test]
    fn test_remap_requires_both_halves() {
        let mut annotation = AnnotationConfig::default();
        assert!(annotation.remap().is_none());
        annotation.remap_src = Some("/tmp/incoming_frames".to_string());
        assert!(annotation.remap().is_none());
        annotation.remap_dst = Some("/data".to_string());
        assert_eq!(
            annotation.remap(),
            Some(("/tmp/incoming_frames".to_string(), "/data".to_string()))
        );
    }
}
