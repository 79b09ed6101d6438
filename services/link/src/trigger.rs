//! Remote capture requests against a camera node.

use crate::config::DEFAULT_CAPTURE_PORT;
use crate::registry::PeerRecord;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};

/// Fixed part of every trigger timeout.
pub const BASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Processing allowance per requested frame.
pub const PER_FRAME_SLACK: Duration = Duration::from_secs(5);

/// Longest accepted pause between frames, in seconds.
pub const MAX_INTERVAL_SECS: f64 = 3600.0;

/// Body of `POST /capture`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRequest {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_count")]
    pub count: u32,

    /// Seconds between frames
    #[serde(default)]
    pub interval: f64,
}

fn default_name() -> String {
    "capture".to_string()
}

fn default_count() -> u32 {
    1
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            name: default_name(),
            count: default_count(),
            interval: 0.0,
        }
    }
}

impl CaptureRequest {
    pub fn new(name: impl Into<String>, count: u32, interval: f64) -> Self {
        Self {
            name: name.into(),
            count,
            interval,
        }
    }

    /// Frames actually taken; a count of 0 still takes one.
    pub fn frame_count(&self) -> u32 {
        self.count.max(1)
    }

    /// The pause between frames, clamped to `0..=MAX_INTERVAL_SECS`.
    pub fn interval_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.interval.clamp(0.0, MAX_INTERVAL_SECS))
            .unwrap_or(Duration::ZERO)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.interval.is_finite() || self.interval < 0.0 {
            return Err(format!(
                "interval must be a non-negative number of seconds, got {}",
                self.interval
            ));
        }
        if self.interval > MAX_INTERVAL_SECS {
            return Err(format!(
                "interval must be at most {} seconds, got {}",
                MAX_INTERVAL_SECS, self.interval
            ));
        }
        Ok(())
    }
}

/// Successful `POST /capture` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResponse {
    pub ok: bool,
    pub sent: u32,
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Invalid capture request: {0}")]
    InvalidRequest(String),

    #[error("Capture request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Capture node returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Undecodable capture response: {0}")]
    Decode(#[source] reqwest::Error),
}

/// Sends capture requests; one attempt per call.
#[derive(Debug, Clone)]
pub struct CaptureTrigger {
    client: Client,
    capture_port: u16,
}

impl Default for CaptureTrigger {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_PORT)
    }
}

impl CaptureTrigger {
    pub fn new(capture_port: u16) -> Self {
        Self {
            client: Client::new(),
            capture_port,
        }
    }

    pub fn capture_url(&self, ip: IpAddr) -> String {
        match ip {
            IpAddr::V4(v4) => format!("http://{}:{}/capture", v4, self.capture_port),
            IpAddr::V6(v6) => format!("http://[{}]:{}/capture", v6, self.capture_port),
        }
    }

    /// Long enough for every frame, its interval and some processing.
    pub fn timeout_for(request: &CaptureRequest) -> Duration {
        let per_frame = request.interval_duration().saturating_add(PER_FRAME_SLACK);
        BASE_TIMEOUT.saturating_add(per_frame.saturating_mul(request.frame_count()))
    }

    pub async fn trigger(
        &self,
        peer: &PeerRecord,
        request: &CaptureRequest,
    ) -> Result<CaptureResponse, TriggerError> {
        self.trigger_at(peer.ip, request).await
    }

    #[instrument(skip(self, request), fields(name = %request.name, count = request.count))]
    pub async fn trigger_at(
        &self,
        ip: IpAddr,
        request: &CaptureRequest,
    ) -> Result<CaptureResponse, TriggerError> {
        request.validate().map_err(TriggerError::InvalidRequest)?;

        let url = self.capture_url(ip);
        let timeout = Self::timeout_for(request);
        info!(url = %url, timeout_secs = timeout.as_secs(), "Triggering capture");

        let response = self
            .client
            .post(&url)
            .json(request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|source| TriggerError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TriggerError::Status { status, body });
        }

        let body: CaptureResponse = response.json().await.map_err(TriggerError::Decode)?;
        info!(sent = body.sent, "Capture completed");
        Ok(body)
    }
}
