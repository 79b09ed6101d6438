//! camlink capture service
//!
//! Runs on the camera node. A `POST /capture` request takes frames from the
//! camera, JPEG-encodes them and streams them to a receiver, one request at
//! a time.
//!
//! # Architecture
//!
//! ```text
//! POST /capture -> CaptureWorker -> Camera -> FrameEncoder -> FrameSink -> receiver
//! ```

pub mod api;
pub mod camera;
pub mod config;
pub mod encoder;
pub mod sink;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use camera::{Camera, CameraError, CameraFactory, RawFrame, TestPatternFactory};
pub use config::CaptureServiceConfig;
pub use encoder::{EncodeError, FrameEncoder, JpegEncoder};
pub use sink::{FrameConnection, FrameSink, HttpUploadSink, ReceiverResolver, TcpFrameSink, TransmitError};
pub use worker::{CaptureError, CaptureOutcome, CaptureWorker};
