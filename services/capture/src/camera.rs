//! Camera devices.
//!
//! A [`CameraFactory`] opens a started, warmed-up [`Camera`]; the worker keeps
//! the opened device across requests. Two backends ship: a GStreamer
//! pipeline (feature `gst`) and a synthetic test pattern.

use crate::config::CameraConfig;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from camera devices.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("Camera initialization failed: {0}")]
    Init(String),

    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    #[error("Pipeline state change failed: {0}")]
    StateChangeFailed(String),

    #[error("No frame within {0:?}")]
    Timeout(Duration),

    #[error("Frame extraction failed: {0}")]
    FrameExtractionFailed(String),

    #[error("Camera task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One uncompressed RGB8 frame.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Tightly packed RGB bytes, `width * height * 3` long
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Frames captured by this device so far
    pub sequence: u64,
    pub captured_at: Instant,
}

/// An opened, running camera.
#[async_trait]
pub trait Camera: Send {
    /// Grab the next frame.
    async fn capture(&mut self) -> Result<RawFrame, CameraError>;

    /// Release the device.
    async fn stop(&mut self);
}

/// Opens camera devices.
#[async_trait]
pub trait CameraFactory: Send + Sync {
    /// Configure, start and warm up a device.
    async fn open(&self) -> Result<Box<dyn Camera>, CameraError>;
}

/// Build the factory named by `camera.backend`.
pub fn factory_from_config(config: &CameraConfig) -> Result<Box<dyn CameraFactory>, CameraError> {
    match config.backend.as_str() {
        "test" => Ok(Box::new(TestPatternFactory::new(config.clone()))),
        #[cfg(feature = "gst")]
        "gst" => Ok(Box::new(gst::GstCameraFactory::new(config.clone())?)),
        other => Err(CameraError::Init(format!("Unsupported camera backend '{}'", other))),
    }
}

/// Opens [`TestPatternCamera`]s.
#[derive(Debug, Clone)]
pub struct TestPatternFactory {
    config: CameraConfig,
}

impl TestPatternFactory {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CameraFactory for TestPatternFactory {
    async fn open(&self) -> Result<Box<dyn Camera>, CameraError> {
        let (width, height) = match (self.config.width, self.config.height) {
            (0, _) | (_, 0) => (640, 480),
            dims => dims,
        };
        info!(width, height, "Opening test pattern camera");
        tokio::time::sleep(self.config.warmup()).await;
        Ok(Box::new(TestPatternCamera::new(width, height)))
    }
}

/// Moving gradient; useful on hosts without a sensor.
#[derive(Debug)]
pub struct TestPatternCamera {
    width: u32,
    height: u32,
    sequence: u64,
}

impl TestPatternCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            sequence: 0,
        }
    }

    fn render(&self) -> Vec<u8> {
        let shift = (self.sequence * 8) as u32;
        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push(((x + shift) * 255 / self.width.max(1)) as u8);
                data.push((y * 255 / self.height.max(1)) as u8);
                data.push((shift % 256) as u8);
            }
        }
        data
    }
}

#[async_trait]
impl Camera for TestPatternCamera {
    async fn capture(&mut self) -> Result<RawFrame, CameraError> {
        let frame = RawFrame {
            data: self.render(),
            width: self.width,
            height: self.height,
            sequence: self.sequence,
            captured_at: Instant::now(),
        };
        self.sequence += 1;
        Ok(frame)
    }

    async fn stop(&mut self) {
        debug!(frames = self.sequence, "Test pattern camera stopped");
    }
}

#[cfg(feature = "gst")]
pub mod gst {
    //! GStreamer-backed camera.

    use super::{Camera, CameraError, CameraFactory, RawFrame};
    use crate::config::CameraConfig;
    use async_trait::async_trait;
    use gstreamer as gst;
    use gstreamer::prelude::*;
    use gstreamer_app as gst_app;
    use std::time::Instant;
    use tracing::{debug, info, warn};

    /// Opens a `<source> ! ... ! appsink` pipeline per device.
    #[derive(Debug, Clone)]
    pub struct GstCameraFactory {
        config: CameraConfig,
    }

    impl GstCameraFactory {
        pub fn new(config: CameraConfig) -> Result<Self, CameraError> {
            gst::init().map_err(|e| CameraError::Init(e.to_string()))?;
            Ok(Self { config })
        }

        fn pipeline_string(&self) -> String {
            let mut caps = "video/x-raw,format=RGB".to_string();
            if self.config.width > 0 && self.config.height > 0 {
                caps.push_str(&format!(
                    ",width={},height={}",
                    self.config.width, self.config.height
                ));
            }
            format!(
                "{source} ! videoconvert ! videoscale ! {caps} \
                 ! appsink name=sink sync=false max-buffers=1 drop=true",
                source = self.config.source,
                caps = caps,
            )
        }
    }

    #[async_trait]
    impl CameraFactory for GstCameraFactory {
        async fn open(&self) -> Result<Box<dyn Camera>, CameraError> {
            let pipeline_str = self.pipeline_string();
            debug!(pipeline = %pipeline_str, "Creating GStreamer pipeline");

            let pipeline = gst::parse::launch(&pipeline_str)
                .map_err(|e| CameraError::PipelineCreation(e.to_string()))?
                .downcast::<gst::Pipeline>()
                .map_err(|_| {
                    CameraError::PipelineCreation("Failed to cast to Pipeline".to_string())
                })?;

            let appsink = pipeline
                .by_name("sink")
                .ok_or_else(|| CameraError::PipelineCreation("appsink not found".to_string()))?
                .downcast::<gst_app::AppSink>()
                .map_err(|_| {
                    CameraError::PipelineCreation("Could not cast to AppSink".to_string())
                })?;

            pipeline
                .set_state(gst::State::Playing)
                .map_err(|e| CameraError::StateChangeFailed(e.to_string()))?;

            info!(source = %self.config.source, "Camera pipeline started");
            tokio::time::sleep(self.config.warmup()).await;

            Ok(Box::new(GstCamera {
                pipeline,
                appsink,
                timeout: self.config.capture_timeout(),
                sequence: 0,
            }))
        }
    }

    pub struct GstCamera {
        pipeline: gst::Pipeline,
        appsink: gst_app::AppSink,
        timeout: std::time::Duration,
        sequence: u64,
    }

    #[async_trait]
    impl Camera for GstCamera {
        async fn capture(&mut self) -> Result<RawFrame, CameraError> {
            let appsink = self.appsink.clone();
            let timeout = self.timeout;
            let sequence = self.sequence;

            let frame = tokio::task::spawn_blocking(move || {
                let sample = appsink
                    .try_pull_sample(gst::ClockTime::from_mseconds(timeout.as_millis() as u64))
                    .ok_or(CameraError::Timeout(timeout))?;
                let buffer = sample.buffer().ok_or_else(|| {
                    CameraError::FrameExtractionFailed("Sample without buffer".to_string())
                })?;
                let caps = sample.caps().ok_or_else(|| {
                    CameraError::FrameExtractionFailed("Sample without caps".to_string())
                })?;
                let structure = caps.structure(0).ok_or_else(|| {
                    CameraError::FrameExtractionFailed("Caps without structure".to_string())
                })?;
                let width: i32 = structure.get("width").unwrap_or(0);
                let height: i32 = structure.get("height").unwrap_or(0);

                let map = buffer
                    .map_readable()
                    .map_err(|e| CameraError::FrameExtractionFailed(e.to_string()))?;

                Ok::<_, CameraError>(RawFrame {
                    data: map.as_slice().to_vec(),
                    width: width as u32,
                    height: height as u32,
                    sequence,
                    captured_at: Instant::now(),
                })
            })
            .await??;

            self.sequence += 1;
            Ok(frame)
        }

        async fn stop(&mut self) {
            if let Err(e) = self.pipeline.set_state(gst::State::Null) {
                warn!(error = %e, "Failed to stop camera pipeline");
            }
            info!(frames = self.sequence, "Camera pipeline stopped");
        }
    }
}
