//! discover-and-capture: find a camera node on the LAN and trigger a capture
//!
//! Listens for `raspi_cam` beacons, picks a node (optionally by host
//! substring), and asks it to capture and stream frames to its receiver.
//! When no beacon arrives in time, `--scan` probes the local subnet for a
//! node's health endpoint instead.
//!
//! Exits non-zero when discovery times out, selection fails, or the capture
//! request fails.

use anyhow::{bail, Context, Result};
use camlink::config::{
    DiscoveryConfig, LoggingConfig, ScanConfig, DEFAULT_CAPTURE_PORT, DEFAULT_DISCOVERY_PORT,
};
use camlink::selector::{DEFAULT_RETRY_INTERVAL, MAX_WAIT};
use camlink::{
    logging, wait_for_target, CaptureRequest, CaptureTrigger, PeerKind, Registry,
    RegistryListener, SubnetScan,
};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "discover-and-capture",
    version,
    about = "Discover raspi_cam nodes via UDP and trigger captures without hardcoding IPs"
)]
struct Args {
    /// UDP port to listen on for raspi_cam beacons
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    listen_port: u16,

    /// Substring of the node hostname to select when several are present
    #[arg(long, default_value = "")]
    host: String,

    /// Capture name sent to the node
    #[arg(long, default_value = "session")]
    name: String,

    /// Number of frames to capture
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Seconds between frames
    #[arg(long, default_value_t = 0.0)]
    interval: f64,

    /// HTTP port of the node's capture service
    #[arg(long, default_value_t = DEFAULT_CAPTURE_PORT)]
    capture_port: u16,

    /// Seconds to wait for discovery before failing
    #[arg(long, default_value_t = 10.0)]
    wait: f64,

    /// Probe the local subnet when no beacon arrives in time
    #[arg(long)]
    scan: bool,

    /// Hosts probed at once during a scan
    #[arg(long, default_value_t = 1)]
    scan_concurrency: usize,

    /// Interfaces tried for the local address, in order
    #[arg(long, value_delimiter = ',', default_value = "wlan0,eth0")]
    ifaces: Vec<String>,

    /// Print discovered nodes after the wait and exit
    #[arg(long)]
    list: bool,

    #[arg(long, env = "CAMLINK_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "CAMLINK_LOG_FORMAT", default_value = "pretty")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(
        &LoggingConfig {
            level: args.log_level.clone(),
            format: args.log_format.clone(),
            include_location: false,
        },
        "discover_and_capture",
    )?;

    let request = CaptureRequest::new(args.name.clone(), args.count, args.interval);
    if let Err(message) = request.validate() {
        bail!("Invalid capture request: {}", message);
    }
    let wait = wait_duration(args.wait)?;

    let discovery = DiscoveryConfig {
        port: args.listen_port,
        beacon_ifaces: args.ifaces.clone(),
        ..Default::default()
    };
    discovery.validate()?;

    let registry = Arc::new(Registry::new(&[PeerKind::RaspiCam]));
    let listen_addr = SocketAddr::from(([0, 0, 0, 0], discovery.port));
    let listener = RegistryListener::bind(registry.clone(), listen_addr, discovery.poll_interval())
        .await
        .with_context(|| format!("Failed to listen for beacons on {}", listen_addr))?
        .spawn();

    info!(port = discovery.port, "Listening for raspi_cam beacons");

    let result = if args.list {
        list_peers(&registry, wait).await
    } else {
        discover_and_capture(&args, &registry, &request, wait).await
    };

    listener.shutdown().await;
    result
}

/// `--wait` as a Duration, bounded by [`MAX_WAIT`].
fn wait_duration(secs: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(wait) if wait <= MAX_WAIT => Ok(wait),
        _ => bail!(
            "--wait must be between 0 and {} seconds, got {}",
            MAX_WAIT.as_secs(),
            secs
        ),
    }
}

async fn list_peers(registry: &Registry, wait: Duration) -> Result<()> {
    tokio::time::sleep(wait).await;

    let peers = registry.list_all();
    if peers.is_empty() {
        bail!("No raspi_cam discovered within {:.1}s", wait.as_secs_f64());
    }
    for peer in peers {
        println!("{}", serde_json::to_string(&peer)?);
    }
    Ok(())
}

async fn discover_and_capture(
    args: &Args,
    registry: &Registry,
    request: &CaptureRequest,
    wait: Duration,
) -> Result<()> {
    let hint = Some(args.host.as_str()).filter(|h| !h.trim().is_empty());

    let target_ip: IpAddr = match wait_for_target(registry, hint, wait, DEFAULT_RETRY_INTERVAL).await
    {
        Ok(peer) => {
            info!(
                host = %peer.host,
                ip = %peer.ip,
                iface = peer.iface.as_deref().unwrap_or(""),
                "Selected node"
            );
            peer.ip
        }
        Err(e) if args.scan => {
            warn!(error = %e, "No beacon matched in time, scanning subnet");
            if hint.is_some() {
                warn!("Host filter does not apply to subnet scan results");
            }
            let scan = SubnetScan::new(
                ScanConfig {
                    concurrency: args.scan_concurrency.max(1),
                    ..Default::default()
                },
                args.capture_port,
            )?;
            let hit = scan
                .scan_local(&args.ifaces)
                .await
                .context("Subnet scan failed")?;
            IpAddr::V4(hit.ip)
        }
        Err(e) => {
            return Err(e).context(format!(
                "No raspi_cam discovered within {:.1}s",
                wait.as_secs_f64()
            ))
        }
    };

    let response = CaptureTrigger::new(args.capture_port)
        .trigger_at(target_ip, request)
        .await
        .context("Capture request failed")?;

    info!(ip = %target_ip, sent = response.sent, "Capture finished");
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_ports() {
        let args = Args::parse_from(["discover-and-capture"]);
        assert_eq!(args.listen_port, 50001);
        assert_eq!(args.capture_port, 8088);
        assert_eq!(args.name, "session");
        assert_eq!(args.count, 1);
        assert_eq!(args.wait, 10.0);
        assert!(!args.scan);
        assert_eq!(args.ifaces, ["wlan0", "eth0"]);
    }

    #[test]
    fn test_flags_parse() {
        let args = Args::parse_from([
            "discover-and-capture",
            "--host",
            "cam-a",
            "--count",
            "3",
            "--interval",
            "0.5",
            "--scan",
            "--scan-concurrency",
            "8",
            "--ifaces",
            "eth1",
        ]);
        assert_eq!(args.host, "cam-a");
        assert_eq!(args.count, 3);
        assert_eq!(args.interval, 0.5);
        assert!(args.scan);
        assert_eq!(args.scan_concurrency, 8);
        assert_eq!(args.ifaces, ["eth1"]);
    }

    #[test]
    fn test_wait_bounds() {
        assert_eq!(wait_duration(2.5).unwrap(), Duration::from_millis(2500));
        assert!(wait_duration(-1.0).is_err());
        assert!(wait_duration(f64::NAN).is_err());
        assert!(wait_duration(1e20).is_err());
    }
}
