//! Configuration management for the capture service.
//!
//! Loaded from `config/capture.toml`, `/etc/camlink/capture.toml`, then
//! environment variables prefixed with `CAPTURE__` (e.g.
//! `CAPTURE__ENCODER__QUALITY=85`).

use camlink::config::{
    ConfigValidationError, DiscoveryConfig, LoggingConfig, DEFAULT_CAPTURE_PORT,
    DEFAULT_FRAME_PORT, DEFAULT_UPLOAD_PORT,
};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the capture service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureServiceConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Where frames go
    #[serde(default)]
    pub receiver: UplinkConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Prometheus exporter port (disabled when unset)
    #[serde(default)]
    pub metrics_port: Option<u16>,

    /// Broadcast `raspi_cam` beacons
    #[serde(default = "default_true")]
    pub advertise: bool,
}

/// Camera device settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Device backend: `gst` or `test`
    #[serde(default = "default_backend")]
    pub backend: String,

    /// GStreamer source element
    #[serde(default = "default_source")]
    pub source: String,

    /// Capture width (0 = sensor default)
    #[serde(default = "default_width")]
    pub width: u32,

    /// Capture height (0 = sensor default)
    #[serde(default = "default_height")]
    pub height: u32,

    /// Sensor warm-up after start, in milliseconds
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,

    /// Longest wait for one frame, in milliseconds
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
}

/// JPEG encoder settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    /// JPEG quality (1-100)
    #[serde(default = "default_quality")]
    pub quality: u8,
}

/// Frame delivery settings.
#[derive(Debug, Clone, Deserialize)]
pub struct UplinkConfig {
    /// `tcp` (frame stream) or `http` (multipart upload)
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Fixed frame stream address (`host:port`); discovered when unset
    #[serde(default)]
    pub frame_addr: Option<String>,

    /// Fixed receiver base URL for uploads; discovered when unset
    #[serde(default)]
    pub upload_url: Option<String>,

    /// Frame stream port of a discovered receiver
    #[serde(default = "default_frame_port")]
    pub frame_port: u16,

    /// Upload port of a discovered receiver that advertises no URL
    #[serde(default = "default_upload_port")]
    pub upload_port: u16,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Best-effort wait for each frame ack
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,

    /// Session hint attached to uploads
    #[serde(default)]
    pub session: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    DEFAULT_CAPTURE_PORT
}
fn default_true() -> bool {
    true
}
fn default_backend() -> String {
    if cfg!(feature = "gst") { "gst" } else { "test" }.to_string()
}
fn default_source() -> String {
    "libcamerasrc".to_string()
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_warmup_ms() -> u64 {
    700
}
fn default_capture_timeout_ms() -> u64 {
    5000
}
fn default_quality() -> u8 {
    90
}
fn default_transport() -> String {
    "tcp".to_string()
}
fn default_frame_port() -> u16 {
    DEFAULT_FRAME_PORT
}
fn default_upload_port() -> u16 {
    DEFAULT_UPLOAD_PORT
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_ack_timeout_ms() -> u64 {
    500
}
fn default_upload_timeout_secs() -> u64 {
    60
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            metrics_port: None,
            advertise: true,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            source: default_source(),
            width: default_width(),
            height: default_height(),
            warmup_ms: default_warmup_ms(),
            capture_timeout_ms: default_capture_timeout_ms(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            quality: default_quality(),
        }
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            frame_addr: None,
            upload_url: None,
            frame_port: default_frame_port(),
            upload_port: default_upload_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            upload_timeout_secs: default_upload_timeout_secs(),
            session: None,
        }
    }
}

impl CaptureServiceConfig {
    /// Load configuration from files and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/capture").required(false))
            .add_source(File::with_name("/etc/camlink/capture").required(false))
            .add_source(
                Environment::with_prefix("CAPTURE")
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

        match self.camera.backend.as_str() {
            "test" => {}
            "gst" if cfg!(feature = "gst") => {
                if self.camera.source.trim().is_empty() {
                    return Err(ConfigValidationError::MissingField("camera.source".to_string()));
                }
            }
            "gst" => {
                return Err(ConfigValidationError::InvalidValue {
                    field: "camera.backend".to_string(),
                    message: "Built without the `gst` feature".to_string(),
                });
            }
            other => {
                return Err(ConfigValidationError::InvalidValue {
                    field: "camera.backend".to_string(),
                    message: format!("Unknown backend '{}' (expected gst or test)", other),
                });
            }
        }

        if (self.camera.width == 0) != (self.camera.height == 0) {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.width/height".to_string(),
                message: "Set both dimensions or neither".to_string(),
            });
        }

        if !(1..=100).contains(&self.encoder.quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "encoder.quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }

        match self.receiver.transport.as_str() {
            "tcp" | "http" => {}
            other => {
                return Err(ConfigValidationError::InvalidValue {
                    field: "receiver.transport".to_string(),
                    message: format!("Unknown transport '{}' (expected tcp or http)", other),
                });
            }
        }

        if let Some(url) = &self.receiver.upload_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigValidationError::InvalidValue {
                    field: "receiver.upload_url".to_string(),
                    message: "URL must start with http:// or https://".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl CameraConfig {
    /// Get the warm-up delay as Duration.
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    /// Get the per-frame capture timeout as Duration.
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }
}

impl UplinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CaptureServiceConfig::default();
        assert_eq!(config.service.port, 8088);
        assert_eq!(config.encoder.quality, 90);
        assert_eq!(config.receiver.transport, "tcp");
        assert_eq!(config.receiver.ack_timeout(), Duration::from_millis(500));
        assert_eq!(config.camera.warmup(), Duration::from_millis(700));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_quality_bounds() {
        let mut config = CaptureServiceConfig::default();
        config.encoder.quality = 0;
        assert!(config.validate().is_err());
        config.encoder.quality = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_transport_rejected() {
        let mut config = CaptureServiceConfig::default();
        config.receiver.transport = "udp".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { field, .. }) if field == "receiver.transport"
        ));
    }

    #[test]
    fn test_half_set_dimensions_rejected() {
        let mut config = CaptureServiceConfig::default();
        config.camera.width = 0;
        assert!(config.validate().is_err());
        config.camera.height = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let config: CaptureServiceConfig = Config::builder()
            .add_source(config::File::from_str(
                "[receiver]\ntransport = \"http\"\nupload_url = \"http://10.0.0.2:5000\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.receiver.transport, "http");
        assert_eq!(config.receiver.frame_port, 5001);
        assert_eq!(config.discovery.port, 50001);
    }
}
