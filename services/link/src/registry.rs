//! Peer table fed by discovery beacons.
//!
//! A [`Registry`] is a lock-guarded map from `host@ip` to the latest
//! [`PeerRecord`] heard for that peer. [`RegistryListener`] owns the UDP
//! socket and feeds datagrams into it until stopped.

use crate::beacon::{BeaconPayload, PeerKind};
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Receive buffer size; larger datagrams are truncated and fail to decode.
pub const MAX_DATAGRAM_LEN: usize = 4096;

/// Pause after a failed receive before polling the socket again.
pub const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Host used when a beacon carries none.
const FALLBACK_HOST: &str = "raspi";

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Malformed beacon: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Beacon kind {0} is not accepted by this registry")]
    NotAccepted(PeerKind),

    #[error("Failed to bind discovery socket {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// One known peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerRecord {
    /// `host@ip`; stable identity of the peer
    pub key: String,
    pub kind: PeerKind,
    pub host: String,
    pub ip: IpAddr,
    pub iface: Option<String>,
    pub receiver_url: Option<String>,
    pub url: Option<String>,
    pub first_seen: DateTime<Utc>,
    /// Only ever increases
    pub last_seen: DateTime<Utc>,
    pub raw_payload: Value,
}

/// Known peers of the accepted kinds.
#[derive(Debug)]
pub struct Registry {
    peers: Mutex<HashMap<String, PeerRecord>>,
    accepts: Vec<PeerKind>,
    stale_after: Option<Duration>,
}

impl Registry {
    pub fn new(accepts: &[PeerKind]) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            accepts: accepts.to_vec(),
            stale_after: None,
        }
    }

    /// Hide and prune peers not heard from within `stale_after`.
    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn accepts(&self, kind: PeerKind) -> bool {
        self.accepts.contains(&kind)
    }

    /// Decode one datagram and record it as seen now.
    pub fn ingest(&self, data: &[u8], src: SocketAddr) -> Result<PeerRecord, RegistryError> {
        let raw: Value = serde_json::from_slice(data)?;
        let payload: BeaconPayload = serde_json::from_value(raw.clone())?;
        self.observe(payload, raw, src, Utc::now())
    }

    /// Upsert the peer described by `payload`.
    pub fn observe(
        &self,
        payload: BeaconPayload,
        raw: Value,
        src: SocketAddr,
        seen_at: DateTime<Utc>,
    ) -> Result<PeerRecord, RegistryError> {
        if !self.accepts(payload.kind) {
            return Err(RegistryError::NotAccepted(payload.kind));
        }

        let ip = payload
            .ip
            .as_deref()
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
            .unwrap_or_else(|| src.ip());
        let host = match payload.host.trim() {
            "" => FALLBACK_HOST.to_string(),
            host => host.to_string(),
        };
        let key = format!("{}@{}", host, ip);
        let url = payload.url.filter(|u| !u.is_empty());

        let mut peers = self.peers.lock();
        let record = peers
            .entry(key.clone())
            .and_modify(|existing| {
                existing.last_seen = existing.last_seen.max(seen_at);
                existing.iface = payload.iface.clone();
                existing.receiver_url = payload.receiver_url.clone();
                existing.url = url.clone();
                existing.raw_payload = raw.clone();
            })
            .or_insert_with(|| {
                debug!(peer = %key, kind = %payload.kind, "New peer discovered");
                PeerRecord {
                    key: key.clone(),
                    kind: payload.kind,
                    host: host.clone(),
                    ip,
                    iface: payload.iface.clone(),
                    receiver_url: payload.receiver_url.clone(),
                    url: url.clone(),
                    first_seen: seen_at,
                    last_seen: seen_at,
                    raw_payload: raw.clone(),
                }
            });

        Ok(record.clone())
    }

    /// Every visible peer, newest first.
    pub fn list_all(&self) -> Vec<PeerRecord> {
        let cutoff = self.cutoff(Utc::now());
        let peers = self.peers.lock();
        let mut list: Vec<PeerRecord> = peers
            .values()
            .filter(|p| cutoff.map_or(true, |c| p.last_seen >= c))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.key.cmp(&b.key)));
        list
    }

    /// Most recently seen peer.
    pub fn latest(&self) -> Option<PeerRecord> {
        self.list_all().into_iter().next()
    }

    /// First peer, newest first, whose host contains `needle` (case-insensitive).
    pub fn find_by_host(&self, needle: &str) -> Option<PeerRecord> {
        let needle = needle.to_lowercase();
        self.list_all()
            .into_iter()
            .find(|p| p.host.to_lowercase().contains(&needle))
    }

    /// Drop peers older than the staleness threshold; returns how many went.
    pub fn prune_stale(&self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = self.cutoff(now) else {
            return 0;
        };
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|key, p| {
            let keep = p.last_seen >= cutoff;
            if !keep {
                debug!(peer = %key, "Pruning stale peer");
            }
            keep
        });
        before - peers.len()
    }

    /// Stored peers, stale or not.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let stale_after = chrono::Duration::from_std(self.stale_after?).ok()?;
        Some(now - stale_after)
    }
}

/// Background receiver feeding a [`Registry`].
pub struct RegistryListener {
    registry: Arc<Registry>,
    socket: UdpSocket,
    poll: Duration,
}

impl RegistryListener {
    /// Bind the discovery socket. Use port 0 in tests.
    pub async fn bind(
        registry: Arc<Registry>,
        addr: SocketAddr,
        poll: Duration,
    ) -> Result<Self, RegistryError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| RegistryError::Bind { addr, source })?;
        Ok(Self {
            registry,
            socket,
            poll,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start receiving in a background task.
    pub fn spawn(self) -> ListenerHandle {
        let running = Arc::new(AtomicBool::new(true));
        let local_addr = self.socket.local_addr().ok();
        let task = tokio::spawn(self.run(running.clone()));
        ListenerHandle {
            running,
            local_addr,
            task,
        }
    }

    async fn run(self, running: Arc<AtomicBool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        info!(
            addr = ?self.socket.local_addr().ok(),
            poll_ms = self.poll.as_millis() as u64,
            "Registry listener started"
        );

        while running.load(Ordering::SeqCst) {
            match tokio::time::timeout(self.poll, self.socket.recv_from(&mut buf)).await {
                Err(_) => {}
                Ok(Ok((len, src))) => match self.registry.ingest(&buf[..len], src) {
                    Ok(record) => {
                        counter!("camlink_beacons_received_total", "kind" => record.kind.as_str())
                            .increment(1);
                        trace!(peer = %record.key, "Beacon received");
                    }
                    Err(e) => trace!(error = %e, src = %src, "Discarding datagram"),
                },
                Ok(Err(e)) => {
                    warn!(error = %e, "Discovery receive failed");
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                }
            }

            let pruned = self.registry.prune_stale(Utc::now());
            if pruned > 0 {
                info!(pruned, "Pruned stale peers");
            }
        }

        info!("Registry listener stopped");
    }
}

/// Running listener task.
#[derive(Debug)]
pub struct ListenerHandle {
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Ask the listener to stop; it notices within one poll interval.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop and wait for the task to finish.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Registry listener task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::Beacon;
    use crate::config::DiscoveryConfig;
    use serde_json::json;

    fn src() -> SocketAddr {
        "192.168.1.50:40000".parse().unwrap()
    }

    fn cam_payload(host: &str, ip: &str) -> BeaconPayload {
        BeaconPayload {
            kind: PeerKind::RaspiCam,
            host: host.to_string(),
            ip: Some(ip.to_string()),
            iface: Some("wlan0".to_string()),
            receiver_url: None,
            url: Some(format!("http://{}:8088", ip)),
            version: Some(1),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn observe(registry: &Registry, host: &str, ip: &str, secs: i64) {
        let payload = cam_payload(host, ip);
        let raw = serde_json::to_value(&payload).unwrap();
        registry.observe(payload, raw, src(), at(secs)).unwrap();
    }

    #[test]
    fn test_repeated_beacons_do_not_grow_table() {
        let registry = Registry::new(&[PeerKind::RaspiCam]);
        let datagram = br#"{"type":"raspi_cam","host":"cam-a","ip":"192.168.1.40"}"#;
        for _ in 0..5 {
            registry.ingest(datagram, src()).unwrap();
        }
        assert_eq!(registry.list_all().len(), 1);
        assert_eq!(registry.list_all()[0].key, "cam-a@192.168.1.40");
    }

    #[test]
    fn test_latest_has_max_last_seen() {
        let registry = Registry::new(&[PeerKind::RaspiCam]);
        observe(&registry, "cam-a", "192.168.1.40", 10);
        observe(&registry, "cam-b", "192.168.1.41", 30);
        observe(&registry, "cam-c", "192.168.1.42", 20);

        let all = registry.list_all();
        let max = all.iter().map(|p| p.last_seen).max().unwrap();
        let latest = registry.latest().unwrap();
        assert_eq!(latest.host, "cam-b");
        assert_eq!(latest.last_seen, max);
        let hosts: Vec<_> = all.iter().map(|p| p.host.as_str()).collect();
        assert_eq!(hosts, ["cam-b", "cam-c", "cam-a"]);
    }

    #[test]
    fn test_find_by_host_case_insensitive_newest_first() {
        let registry = Registry::new(&[PeerKind::RaspiCam]);
        observe(&registry, "cam-B", "192.168.1.41", 10);
        observe(&registry, "cam-A", "192.168.1.40", 20);

        assert_eq!(registry.find_by_host("CAM").unwrap().host, "cam-A");
        assert_eq!(registry.find_by_host("m-b").unwrap().host, "cam-B");
        assert!(registry.find_by_host("door").is_none());
    }

    #[test]
    fn test_unknown_type_is_discarded() {
        let registry = Registry::new(&[PeerKind::RaspiCam, PeerKind::CaptureReceiver]);
        let result = registry.ingest(br#"{"type":"unknown","host":"x"}"#, src());
        assert!(matches!(result, Err(RegistryError::Malformed(_))));
        assert!(registry.ingest(b"not json", src()).is_err());
        assert!(registry.list_all().is_empty());
    }

    #[test]
    fn test_non_accepted_kind_is_discarded() {
        let registry = Registry::new(&[PeerKind::CaptureReceiver]);
        let result = registry.ingest(br#"{"type":"raspi_cam","host":"cam"}"#, src());
        assert!(matches!(result, Err(RegistryError::NotAccepted(PeerKind::RaspiCam))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_last_seen_never_decreases() {
        let registry = Registry::new(&[PeerKind::RaspiCam]);
        observe(&registry, "cam-a", "192.168.1.40", 50);
        observe(&registry, "cam-a", "192.168.1.40", 10);

        let record = registry.latest().unwrap();
        assert_eq!(record.last_seen, at(50));
        assert_eq!(record.first_seen, at(50));
    }

    #[test]
    fn test_missing_fields_fall_back() {
        let registry = Registry::new(&[PeerKind::RaspiCam]);
        let record = registry
            .ingest(br#"{"type":"raspi_cam","ip":"not-an-ip"}"#, src())
            .unwrap();
        assert_eq!(record.host, "raspi");
        assert_eq!(record.ip, src().ip());
        assert_eq!(record.raw_payload, json!({"type": "raspi_cam", "ip": "not-an-ip"}));
    }

    #[test]
    fn test_stale_peers_hidden_and_pruned() {
        let registry =
            Registry::new(&[PeerKind::RaspiCam]).with_stale_after(Some(Duration::from_secs(60)));
        let now = Utc::now();
        for (host, age) in [("old", 300), ("fresh", 5)] {
            let payload = cam_payload(host, "10.0.0.1");
            let raw = serde_json::to_value(&payload).unwrap();
            registry
                .observe(payload, raw, src(), now - chrono::Duration::seconds(age))
                .unwrap();
        }

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.list_all().len(), 1);
        assert_eq!(registry.prune_stale(now), 1);
        assert_eq!(registry.latest().unwrap().host, "fresh");
    }

    #[tokio::test]
    async fn test_listener_receives_beacon() {
        let registry = Arc::new(Registry::new(&[PeerKind::RaspiCam]));
        let listener = RegistryListener::bind(
            registry.clone(),
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        let target = listener.local_addr().unwrap();
        let handle = listener.spawn();

        let beacon = Beacon::new(PeerKind::RaspiCam, 8088, DiscoveryConfig::default())
            .with_host("cam-loop")
            .with_target(target);
        beacon.send_once(&beacon.payload(None)).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let peer = registry.latest().unwrap();
        assert_eq!(peer.host, "cam-loop");
        assert_eq!(peer.ip, "127.0.0.1".parse::<IpAddr>().unwrap());

        handle.shutdown().await;
    }
}
