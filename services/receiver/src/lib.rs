//! camlink capture receiver
//!
//! Runs on the aggregator. Frames arrive either as `POST /upload` multipart
//! requests or over the `IMG1` TCP frame stream, and are grouped into
//! session directories. Stored images can optionally be annotated by an
//! external vision service.
//!
//! # Architecture
//!
//! ```text
//! POST /upload ─┐
//!               ├─> SessionManager -> <root>/<session>/<file>.jpg -> AnnotationPool -> <file>.json
//! TCP frames ───┘
//! ```

pub mod annotation;
pub mod config;
pub mod frame_server;
pub mod session_manager;
pub mod upload_api;

pub use annotation::{
    AnnotateError, Annotation, AnnotationPool, AnnotationQueue, Annotator, HttpAnnotator, Pose,
};
pub use config::ReceiverConfig;
pub use frame_server::{FrameServer, FrameServerHandle, StreamError};
pub use session_manager::{SessionEntry, SessionError, SessionManager};
