//! Peer selection policy.

use crate::registry::{PeerRecord, Registry};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

/// Pause between selection attempts while waiting.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Shortest wait honoured by [`wait_for_target`].
pub const MIN_WAIT: Duration = Duration::from_millis(100);

/// Longest wait honoured by [`wait_for_target`].
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("No discovered peer matches host '{0}'")]
    NoMatch(String),

    #[error("No peers discovered")]
    NoPeers,
}

/// Pick a peer: the newest one whose host contains `hint`, or the newest
/// overall when there is no hint.
pub fn choose_target(registry: &Registry, hint: Option<&str>) -> Result<PeerRecord, SelectError> {
    match hint.map(str::trim).filter(|h| !h.is_empty()) {
        Some(hint) => registry
            .find_by_host(hint)
            .ok_or_else(|| SelectError::NoMatch(hint.to_string())),
        None => registry.latest().ok_or(SelectError::NoPeers),
    }
}

/// Retry [`choose_target`] until it succeeds or `wait` elapses; the last
/// selection error is returned on timeout.
pub async fn wait_for_target(
    registry: &Registry,
    hint: Option<&str>,
    wait: Duration,
    retry: Duration,
) -> Result<PeerRecord, SelectError> {
    let now = Instant::now();
    let deadline = now.checked_add(wait.max(MIN_WAIT)).unwrap_or(now + MAX_WAIT);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match choose_target(registry, hint) {
            Ok(peer) => {
                info!(peer = %peer.key, attempts, "Selected peer");
                return Ok(peer);
            }
            Err(e) => {
                let now = Instant::now();
                if now >= deadline {
                    debug!(attempts, error = %e, "Selection wait elapsed");
                    return Err(e);
                }
                tokio::time::sleep(retry.min(deadline - now)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::{BeaconPayload, PeerKind};
    use chrono::Utc;
    use std::sync::Arc;

    fn add(registry: &Registry, host: &str, ip: &str, age_secs: i64) {
        let payload = BeaconPayload {
            kind: PeerKind::RaspiCam,
            host: host.to_string(),
            ip: Some(ip.to_string()),
            iface: None,
            receiver_url: None,
            url: None,
            version: Some(1),
        };
        let raw = serde_json::to_value(&payload).unwrap();
        registry
            .observe(
                payload,
                raw,
                "10.0.0.9:1".parse().unwrap(),
                Utc::now() - chrono::Duration::seconds(age_secs),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_huge_wait_still_returns_first_match() {
        let registry = Registry::new(&[PeerKind::RaspiCam]);
        add(&registry, "cam-a", "10.0.0.5", 0);
        let peer = wait_for_target(&registry, None, Duration::MAX, DEFAULT_RETRY_INTERVAL)
            .await
            .unwrap();
        assert_eq!(peer.host, "cam-a");
    }

    #[test]
    fn test_no_hint_picks_newest() {
        let registry = Registry::new(&[PeerKind::RaspiCam]);
        add(&registry, "cam-a", "10.0.0.1", 20);
        add(&registry, "cam-b", "10.0.0.2", 1);
        assert_eq!(choose_target(&registry, None).unwrap().host, "cam-b");
        assert_eq!(choose_target(&registry, Some("  ")).unwrap().host, "cam-b");
    }

    #[test]
    fn test_hint_must_match() {
        let registry = Registry::new(&[PeerKind::RaspiCam]);
        add(&registry, "cam-a", "10.0.0.1", 20);
        add(&registry, "cam-b", "10.0.0.2", 1);
        assert_eq!(choose_target(&registry, Some("A")).unwrap().host, "cam-a");
        assert!(matches!(
            choose_target(&registry, Some("door")),
            Err(SelectError::NoMatch(h)) if h == "door"
        ));
    }

    #[test]
    fn test_empty_registry() {
        let registry = Registry::new(&[PeerKind::RaspiCam]);
        assert!(matches!(choose_target(&registry, None), Err(SelectError::NoPeers)));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let registry = Registry::new(&[PeerKind::RaspiCam]);
        let started = Instant::now();
        let result = wait_for_target(
            &registry,
            None,
            Duration::from_millis(150),
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(result, Err(SelectError::NoPeers)));
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_wait_sees_late_peer() {
        let registry = Arc::new(Registry::new(&[PeerKind::RaspiCam]));
        let late = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            add(&late, "cam-late", "10.0.0.3", 0);
        });

        let peer = wait_for_target(
            &registry,
            Some("late"),
            Duration::from_secs(2),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        assert_eq!(peer.host, "cam-late");
    }
}
