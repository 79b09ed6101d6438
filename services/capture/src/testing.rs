//! Recording doubles for worker and API tests.

use crate::camera::{Camera, CameraError, CameraFactory, RawFrame};
use crate::encoder::{EncodeError, FrameEncoder};
use crate::sink::{FrameConnection, FrameSink, TransmitError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct CameraLog {
    opens: usize,
    stops: usize,
    spans: Vec<(Instant, Instant)>,
}

/// Opens cameras that record when each capture started and ended.
#[derive(Debug, Clone, Default)]
pub struct RecordingCameraFactory {
    delay: Duration,
    log: Arc<Mutex<CameraLog>>,
}

impl RecordingCameraFactory {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            log: Arc::default(),
        }
    }

    pub fn opens(&self) -> usize {
        self.log.lock().opens
    }

    pub fn stops(&self) -> usize {
        self.log.lock().stops
    }

    pub fn captures(&self) -> usize {
        self.log.lock().spans.len()
    }

    pub fn spans(&self) -> Vec<(Instant, Instant)> {
        self.log.lock().spans.clone()
    }
}

#[async_trait]
impl CameraFactory for RecordingCameraFactory {
    async fn open(&self) -> Result<Box<dyn Camera>, CameraError> {
        self.log.lock().opens += 1;
        Ok(Box::new(RecordingCamera {
            delay: self.delay,
            log: self.log.clone(),
            sequence: 0,
        }))
    }
}

struct RecordingCamera {
    delay: Duration,
    log: Arc<Mutex<CameraLog>>,
    sequence: u64,
}

#[async_trait]
impl Camera for RecordingCamera {
    async fn capture(&mut self) -> Result<RawFrame, CameraError> {
        let start = Instant::now();
        tokio::time::sleep(self.delay).await;
        self.log.lock().spans.push((start, Instant::now()));

        let frame = RawFrame {
            data: vec![self.sequence as u8; 4 * 4 * 3],
            width: 4,
            height: 4,
            sequence: self.sequence,
            captured_at: start,
        };
        self.sequence += 1;
        Ok(frame)
    }

    async fn stop(&mut self) {
        self.log.lock().stops += 1;
    }
}

#[derive(Debug)]
struct SinkLog {
    connections: usize,
    finished: usize,
    sent: Vec<String>,
    fail_after: usize,
}

impl Default for SinkLog {
    fn default() -> Self {
        Self {
            connections: 0,
            finished: 0,
            sent: Vec::new(),
            fail_after: usize::MAX,
        }
    }
}

/// Records the wire name of every frame sent.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    log: Arc<Mutex<SinkLog>>,
}

impl RecordingSink {
    pub fn connections(&self) -> usize {
        self.log.lock().connections
    }

    pub fn finished(&self) -> usize {
        self.log.lock().finished
    }

    pub fn sent_names(&self) -> Vec<String> {
        self.log.lock().sent.clone()
    }

    /// Fail every send once `n` frames have gone through in total.
    pub fn fail_after(&self, n: usize) {
        let mut log = self.log.lock();
        log.fail_after = log.sent.len().saturating_add(n);
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn connect(&self) -> Result<Box<dyn FrameConnection>, TransmitError> {
        self.log.lock().connections += 1;
        Ok(Box::new(RecordingConnection {
            log: self.log.clone(),
        }))
    }
}

struct RecordingConnection {
    log: Arc<Mutex<SinkLog>>,
}

#[async_trait]
impl FrameConnection for RecordingConnection {
    async fn send(&mut self, name: &str, index: u32, _image: Bytes) -> Result<(), TransmitError> {
        let mut log = self.log.lock();
        if log.sent.len() >= log.fail_after {
            return Err(TransmitError::NoReceiver);
        }
        log.sent.push(camlink::frame_transport::indexed_name(name, index));
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), TransmitError> {
        self.log.lock().finished += 1;
        Ok(())
    }
}

/// Encoder that rejects every frame.
#[derive(Debug, Clone, Copy)]
pub struct FailingEncoder;

impl FrameEncoder for FailingEncoder {
    fn encode(&self, frame: &RawFrame) -> Result<Bytes, EncodeError> {
        Err(EncodeError::BadDimensions {
            width: frame.width,
            height: frame.height,
            expected: 0,
            actual: frame.data.len(),
        })
    }
}
