//! Active fallback: probe every address on the local subnet for a capture
//! node's health endpoint.

use crate::config::ScanConfig;
use crate::net::{interface_network, resolve_local_address};
use futures::stream::{self, StreamExt};
use ipnetwork::Ipv4Network;
use reqwest::Client;
use serde_json::Value;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{debug, info, instrument, trace};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("No local IPv4 address to derive a subnet from")]
    NoLocalAddress,

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("No capture node answered on {network} ({probed} hosts probed)")]
    NotFound { network: Ipv4Network, probed: usize },
}

/// First node that answered the health probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanHit {
    pub ip: Ipv4Addr,
    pub health: Value,
}

/// Addresses worth probing on `network`, ascending, capped at `max_hosts`.
pub fn candidates(network: Ipv4Network, own: Ipv4Addr, max_hosts: usize) -> Vec<Ipv4Addr> {
    let has_edges = network.prefix() < 31;
    network
        .iter()
        .filter(|ip| *ip != own)
        .filter(|ip| !has_edges || (*ip != network.network() && *ip != network.broadcast()))
        .take(max_hosts)
        .collect()
}

/// A 2xx JSON object carrying `"status": "ok"`.
pub fn is_health_payload(body: &Value) -> bool {
    body.get("status").and_then(Value::as_str) == Some("ok")
}

/// Subnet prober for one service port.
#[derive(Debug, Clone)]
pub struct SubnetScan {
    client: Client,
    config: ScanConfig,
    port: u16,
}

impl SubnetScan {
    pub fn new(config: ScanConfig, port: u16) -> Result<Self, ScanError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .build()
            .map_err(ScanError::Client)?;
        Ok(Self {
            client,
            config,
            port,
        })
    }

    /// Probe one host; `None` for anything but a valid health payload.
    pub async fn probe(&self, ip: Ipv4Addr) -> Option<ScanHit> {
        let url = format!("http://{}:{}{}", ip, self.port, self.config.health_path);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                trace!(ip = %ip, error = %e, "No response");
                return None;
            }
        };
        if !response.status().is_success() {
            trace!(ip = %ip, status = %response.status(), "Unhealthy response");
            return None;
        }
        let health: Value = response.json().await.ok()?;
        is_health_payload(&health).then_some(ScanHit { ip, health })
    }

    /// First valid responder among `hosts`, in the order given.
    pub async fn scan(&self, hosts: Vec<Ipv4Addr>) -> Option<ScanHit> {
        let concurrency = self.config.concurrency.max(1);
        let mut probes = stream::iter(hosts)
            .map(|ip| self.probe(ip))
            .buffered(concurrency);

        while let Some(result) = probes.next().await {
            if let Some(hit) = result {
                return Some(hit);
            }
        }
        None
    }

    /// Scan the subnet of the first usable local interface.
    #[instrument(skip(self), fields(port = self.port))]
    pub async fn scan_local(&self, ifaces: &[String]) -> Result<ScanHit, ScanError> {
        let local = resolve_local_address(ifaces)
            .await
            .ok_or(ScanError::NoLocalAddress)?;
        let network = interface_network(local.ip, self.config.default_prefix)
            .await
            .ok_or(ScanError::NoLocalAddress)?;
        let hosts = candidates(network, local.ip, self.config.max_hosts);
        let probed = hosts.len();

        info!(
            network = %network,
            hosts = probed,
            concurrency = self.config.concurrency,
            "Scanning subnet"
        );

        match self.scan(hosts).await {
            Some(hit) => {
                info!(ip = %hit.ip, "Capture node found by scan");
                Ok(hit)
            }
            None => {
                debug!(network = %network, "Scan found nothing");
                Err(ScanError::NotFound { network, probed })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn test_candidates_skip_self_and_edges() {
        let network: Ipv4Network = "192.168.1.0/29".parse().unwrap();
        let own = Ipv4Addr::new(192, 168, 1, 3);
        let hosts = candidates(network, own, 1024);
        let last_octets: Vec<u8> = hosts.iter().map(|ip| ip.octets()[3]).collect();
        assert_eq!(last_octets, [1, 2, 4, 5, 6]);
    }

    #[test]
    fn test_candidates_capped() {
        let network: Ipv4Network = "10.0.0.0/16".parse().unwrap();
        let hosts = candidates(network, Ipv4Addr::new(10, 0, 0, 1), 10);
        assert_eq!(hosts.len(), 10);
        assert_eq!(hosts[0], Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_health_payload() {
        assert!(is_health_payload(&json!({"status": "ok", "role": "raspi_cam"})));
        assert!(!is_health_payload(&json!({"status": "degraded"})));
        assert!(!is_health_payload(&json!(["ok"])));
    }

    #[tokio::test]
    async fn test_scan_finds_first_healthy_host_in_order() {
        let router = Router::new().route("/health", get(|| async { Json(json!({"status": "ok"})) }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let config = ScanConfig {
            timeout_ms: 200,
            concurrency: 4,
            ..Default::default()
        };
        let scan = SubnetScan::new(config, port).unwrap();
        // 127.0.0.1 answers; 127.0.0.2 and 127.0.0.3 usually refuse.
        let hosts = vec![
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(127, 0, 0, 2),
            Ipv4Addr::new(127, 0, 0, 3),
        ];

        let hit = tokio::time::timeout(Duration::from_secs(5), scan.scan(hosts))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.ip, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(hit.health["status"], "ok");
    }

    #[tokio::test]
    async fn test_scan_ignores_wrong_payload() {
        let router =
            Router::new().route("/health", get(|| async { Json(json!({"status": "booting"})) }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let scan = SubnetScan::new(ScanConfig::default(), port).unwrap();
        assert!(scan.scan(vec![Ipv4Addr::LOCALHOST]).await.is_none());
    }
}
