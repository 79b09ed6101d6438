//! Serialized capture → encode → transmit.
//!
//! One [`CaptureWorker`] owns the camera. Every request takes the same FIFO
//! lock and holds it until its last frame is delivered, so captures never
//! overlap and a slow receiver delays the requests queued behind it.

use crate::camera::{Camera, CameraError, CameraFactory};
use crate::encoder::{EncodeError, FrameEncoder};
use crate::sink::{FrameSink, TransmitError};
use camlink::trigger::CaptureRequest;
use metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Invalid capture request: {0}")]
    InvalidRequest(String),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Transmit error: {0}")]
    Transmit(#[from] TransmitError),

    #[error("Encoder task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result of one completed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureOutcome {
    pub name: String,
    pub sent: u32,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Worker counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct WorkerStats {
    pub requests: u64,
    pub failures: u64,
    pub frames_sent: u64,
    pub device_opens: u64,
    pub device_open: bool,
}

pub struct CaptureWorker {
    factory: Box<dyn CameraFactory>,
    encoder: Arc<dyn FrameEncoder>,
    sink: Arc<dyn FrameSink>,
    camera: Mutex<Option<Box<dyn Camera>>>,
    stats: RwLock<WorkerStats>,
}

impl CaptureWorker {
    pub fn new(
        factory: Box<dyn CameraFactory>,
        encoder: Arc<dyn FrameEncoder>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            factory,
            encoder,
            sink,
            camera: Mutex::new(None),
            stats: RwLock::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.read().clone()
    }

    /// Capture `max(1, count)` frames and deliver them over one connection.
    #[instrument(skip(self, request), fields(name = %request.name, count = request.count))]
    pub async fn capture(&self, request: &CaptureRequest) -> Result<CaptureOutcome, CaptureError> {
        request.validate().map_err(CaptureError::InvalidRequest)?;

        let mut camera = self.camera.lock().await;
        self.stats.write().requests += 1;
        let started = Instant::now();

        match self.run_locked(&mut camera, request).await {
            Ok(sent) => {
                let outcome = CaptureOutcome {
                    name: request.name.clone(),
                    sent,
                    elapsed: started.elapsed(),
                };
                info!(
                    sent,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "Capture request completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.stats.write().failures += 1;
                counter!("camlink_capture_failures_total").increment(1);
                warn!(error = %e, "Capture request failed");
                Err(e)
            }
        }
    }

    async fn run_locked(
        &self,
        slot: &mut Option<Box<dyn Camera>>,
        request: &CaptureRequest,
    ) -> Result<u32, CaptureError> {
        if slot.is_none() {
            info!("Opening camera");
            let opened = self.factory.open().await?;
            let mut stats = self.stats.write();
            stats.device_opens += 1;
            stats.device_open = true;
            *slot = Some(opened);
        }
        let Some(camera) = slot.as_mut() else {
            return Err(CameraError::Init("Camera unavailable".to_string()).into());
        };

        let count = request.frame_count();
        let interval = request.interval_duration();
        let mut connection = self.sink.connect().await?;

        for index in 0..count {
            let frame = camera.capture().await?;
            let encoder = self.encoder.clone();
            let image = tokio::task::spawn_blocking(move || encoder.encode(&frame)).await??;

            debug!(index, bytes = image.len(), "Frame encoded");
            connection.send(&request.name, index, image).await?;
            self.stats.write().frames_sent += 1;

            if index + 1 < count && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }

        connection.finish().await?;
        Ok(count)
    }

    /// Stop and drop the device; the next request reopens it.
    pub async fn reset(&self) {
        let mut slot = self.camera.lock().await;
        if let Some(mut camera) = slot.take() {
            camera.stop().await;
            self.stats.write().device_open = false;
            info!("Camera reset");
        }
    }
}
