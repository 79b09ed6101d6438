//! camlink - LAN rendezvous and frame streaming for camera nodes
//!
//! This library holds the protocol pieces shared by the camlink services:
//!
//! - UDP beacons announcing a node's role and URL ([`beacon`])
//! - A lock-guarded peer table fed by those beacons ([`registry`])
//! - Peer selection and remote capture triggering ([`selector`], [`trigger`])
//! - The `IMG1` length-prefixed frame stream ([`frame_transport`])
//! - An active subnet probe for when no beacon arrives ([`subnet_scan`])
//!
//! # Example
//!
//! ```rust,no_run
//! use camlink::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let discovery = DiscoveryConfig::default();
//!     let registry = Arc::new(Registry::new(&[PeerKind::RaspiCam]));
//!     let listener = RegistryListener::bind(
//!         registry.clone(),
//!         ([0, 0, 0, 0], discovery.port).into(),
//!         discovery.poll_interval(),
//!     )
//!     .await?
//!     .spawn();
//!
//!     let peer = wait_for_target(&registry, None, Duration::from_secs(10), DEFAULT_RETRY_INTERVAL).await?;
//!     let response = CaptureTrigger::default()
//!         .trigger(&peer, &CaptureRequest::new("session", 3, 0.5))
//!         .await?;
//!     println!("{} frames sent", response.sent);
//!
//!     listener.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod beacon;
pub mod config;
pub mod frame_transport;
pub mod logging;
pub mod net;
pub mod registry;
pub mod selector;
pub mod subnet_scan;
pub mod trigger;

// Re-export main types
pub use beacon::{Beacon, BeaconError, BeaconHandle, BeaconPayload, PeerKind};
pub use config::{ConfigValidationError, DiscoveryConfig, LoggingConfig, ScanConfig};
pub use frame_transport::{FrameCodec, FrameError, FrameMessage};
pub use registry::{ListenerHandle, PeerRecord, Registry, RegistryError, RegistryListener};
pub use selector::{choose_target, wait_for_target, SelectError};
pub use subnet_scan::{ScanError, ScanHit, SubnetScan};
pub use trigger::{CaptureRequest, CaptureResponse, CaptureTrigger, TriggerError};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::beacon::{Beacon, PeerKind};
    pub use crate::config::{DiscoveryConfig, LoggingConfig, ScanConfig};
    pub use crate::registry::{PeerRecord, Registry, RegistryListener};
    pub use crate::selector::{choose_target, wait_for_target, DEFAULT_RETRY_INTERVAL};
    pub use crate::trigger::{CaptureRequest, CaptureTrigger};
}
