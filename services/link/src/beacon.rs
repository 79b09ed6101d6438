//! Periodic UDP self-announcement.
//!
//! Every node broadcasts a small JSON [`BeaconPayload`] on the discovery port
//! so peers can find it without fixed addresses. Nothing acknowledges a
//! beacon; a lost one is simply replaced by the next.

use crate::config::DiscoveryConfig;
use crate::net::{is_transient, local_hostname, resolve_local_address, LocalAddress};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Payload version carried in every beacon.
pub const BEACON_VERSION: u32 = 1;

/// Errors from a single beacon send that are not ordinary LAN noise.
#[derive(Debug, Error)]
pub enum BeaconError {
    #[error("Failed to encode beacon: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Beacon socket error: {0}")]
    Socket(#[source] io::Error),

    #[error("Beacon send to {target} failed: {source}")]
    Send {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Role a beacon announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    /// Camera node accepting `/capture` requests
    RaspiCam,
    /// Aggregator accepting uploads and frame streams
    CaptureReceiver,
}

impl PeerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerKind::RaspiCam => "raspi_cam",
            PeerKind::CaptureReceiver => "capture_receiver",
        }
    }
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discovery datagram body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconPayload {
    #[serde(rename = "type")]
    pub kind: PeerKind,

    #[serde(default)]
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iface: Option<String>,

    /// Where a camera node sends its frames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_url: Option<String>,

    /// Reachable service URL of the announcing node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

/// Builds and sends beacons for one role.
#[derive(Debug, Clone)]
pub struct Beacon {
    kind: PeerKind,
    host: String,
    service_port: u16,
    receiver_url: Option<String>,
    ifaces: Vec<String>,
    target: SocketAddr,
    config: DiscoveryConfig,
}

impl Beacon {
    /// Announce `kind` with a URL on `service_port`, broadcast on the
    /// configured discovery port.
    pub fn new(kind: PeerKind, service_port: u16, config: DiscoveryConfig) -> Self {
        let target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, config.port));
        Self {
            kind,
            host: local_hostname(),
            service_port,
            receiver_url: None,
            ifaces: config.beacon_ifaces.clone(),
            target,
            config,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_receiver_url(mut self, url: Option<String>) -> Self {
        self.receiver_url = url;
        self
    }

    /// Send to a specific address instead of the limited broadcast address.
    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;
        self
    }

    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    /// Payload for the given local address; still valid without one.
    pub fn payload(&self, local: Option<&LocalAddress>) -> BeaconPayload {
        BeaconPayload {
            kind: self.kind,
            host: self.host.clone(),
            ip: local.map(|l| l.ip.to_string()),
            iface: local.and_then(|l| l.iface.clone()),
            receiver_url: self.receiver_url.clone(),
            url: Some(
                local
                    .map(|l| format!("http://{}:{}", l.ip, self.service_port))
                    .unwrap_or_default(),
            ),
            version: Some(BEACON_VERSION),
        }
    }

    /// Broadcast one payload.
    ///
    /// Expected LAN failures (no route, permission denied, ...) are logged
    /// and swallowed; anything else is returned.
    pub async fn send_once(&self, payload: &BeaconPayload) -> Result<(), BeaconError> {
        let data = serde_json::to_vec(payload)?;

        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) if is_transient(&e) => {
                debug!(error = %e, "Beacon socket unavailable, retrying next interval");
                return Ok(());
            }
            Err(e) => return Err(BeaconError::Socket(e)),
        };

        if let Err(e) = socket.set_broadcast(true) {
            if !is_transient(&e) {
                return Err(BeaconError::Socket(e));
            }
        }

        match socket.send_to(&data, self.target).await {
            Ok(_) => {
                counter!("camlink_beacons_sent_total", "kind" => self.kind.as_str()).increment(1);
                Ok(())
            }
            Err(e) if is_transient(&e) => {
                debug!(error = %e, target = %self.target, "Beacon send failed, retrying next interval");
                Ok(())
            }
            Err(source) => Err(BeaconError::Send {
                target: self.target,
                source,
            }),
        }
    }

    /// Start broadcasting every configured interval until stopped.
    pub fn spawn(self) -> BeaconHandle {
        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(self.run(running.clone()));
        BeaconHandle { running, task }
    }

    async fn run(self, running: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(self.config.beacon_interval());
        let mut last_ip: Option<LocalAddress> = None;
        let mut warned_missing = false;

        info!(
            kind = %self.kind,
            host = %self.host,
            target = %self.target,
            interval_secs = self.config.beacon_interval_secs,
            "Beacon started"
        );

        while running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if !running.load(Ordering::SeqCst) {
                break;
            }

            // Leases change; resolve the address every tick.
            let local = resolve_local_address(&self.ifaces).await;
            match &local {
                Some(addr) if last_ip.as_ref() != Some(addr) => {
                    info!(
                        kind = %self.kind,
                        ip = %addr.ip,
                        iface = addr.iface.as_deref().unwrap_or("-"),
                        port = self.service_port,
                        "Advertising address"
                    );
                    last_ip = Some(addr.clone());
                    warned_missing = false;
                }
                None if !warned_missing => {
                    warn!(kind = %self.kind, "No local IPv4 address detected, beacon carries no URL");
                    last_ip = None;
                    warned_missing = true;
                }
                _ => {}
            }

            let payload = self.payload(local.as_ref());
            if let Err(e) = self.send_once(&payload).await {
                warn!(error = %e, kind = %self.kind, "Beacon send failed");
            }
        }

        info!(kind = %self.kind, "Beacon stopped");
    }
}

/// Running beacon task.
#[derive(Debug)]
pub struct BeaconHandle {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl BeaconHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    /// Stop broadcasting. Sending holds no state, so the task is also
    /// cancelled rather than left to wake on its next tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for BeaconHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
