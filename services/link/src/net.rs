//! Local address detection and I/O error classification.

use ipnetwork::Ipv4Network;
use local_ip_address::list_afinet_netifas;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Stdio;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tracing::{debug, trace};

/// Address "connected" to when probing for the outbound interface. No
/// packet is ever sent to it.
pub const OUTBOUND_PROBE_ADDR: &str = "8.8.8.8:80";

/// The address a beacon advertises, and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAddress {
    pub ip: Ipv4Addr,
    /// Interface name when the address came from a configured interface
    pub iface: Option<String>,
}

/// IPv4 address of a named interface, if it has one.
pub fn iface_ipv4(iface: &str) -> Option<Ipv4Addr> {
    let netifs = list_afinet_netifas().ok()?;
    netifs.into_iter().find_map(|(name, ip)| match ip {
        IpAddr::V4(v4) if name == iface => Some(v4),
        _ => None,
    })
}

/// Outbound-probe heuristic: "connect" a UDP socket and read back the local
/// endpoint the kernel picked.
pub async fn outbound_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect(OUTBOUND_PROBE_ADDR).await.ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// First configured interface with an IPv4 address, else the outbound probe.
pub async fn resolve_local_address(ifaces: &[String]) -> Option<LocalAddress> {
    for iface in ifaces.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Some(ip) = iface_ipv4(iface) {
            trace!(iface = iface, ip = %ip, "Using configured interface address");
            return Some(LocalAddress {
                ip,
                iface: Some(iface.to_string()),
            });
        }
    }

    outbound_ipv4().await.map(|ip| LocalAddress { ip, iface: None })
}

/// Network that `ip` belongs to, with the prefix length read from the
/// interface when possible.
pub async fn interface_network(ip: Ipv4Addr, default_prefix: u8) -> Option<Ipv4Network> {
    let output = Command::new("ip")
        .args(["-o", "-4", "addr", "show"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if let Some(network) = parse_ip_addr_output(&stdout, ip) {
                return Some(network);
            }
        }
        Ok(_) => debug!("`ip addr show` returned non-zero status"),
        Err(e) => debug!(error = %e, "`ip addr show` unavailable"),
    }

    Ipv4Network::new(ip, default_prefix).ok()
}

/// Find `ip`'s `inet a.b.c.d/len` entry in `ip -o -4 addr show` output.
pub fn parse_ip_addr_output(output: &str, ip: Ipv4Addr) -> Option<Ipv4Network> {
    // 2: wlan0    inet 192.168.1.23/24 brd 192.168.1.255 scope global dynamic wlan0
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        parts.find(|p| *p == "inet")?;
        let network: Ipv4Network = parts.next()?.parse().ok()?;
        (network.ip() == ip).then_some(network)
    })
}

/// Failures that are expected on a flaky LAN and retried on schedule.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable
    )
}

/// This host's name, as advertised in beacons.
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
