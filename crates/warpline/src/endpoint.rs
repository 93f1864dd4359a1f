//! Built-in WARP endpoint catalogue

use crate::prefix::Prefix;
use rand::Rng;
use rand::seq::SliceRandom;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Handshake port every WARP responder listens on
pub const PROBE_PORT: u16 = 2408;

/// Ports WARP endpoints accept tunnel traffic on
pub const ENDPOINT_PORTS: &[u16] = &[
    500, 854, 859, 864, 878, 880, 890, 891, 894, 903, 908, 928, 934, 939, 942, 943, 945, 946, 955,
    968, 987, 988, 1002, 1010, 1014, 1018, 1070, 1074, 1180, 1387, 1701, 1843, 2371, 2408, 2506,
    3138, 3476, 3581, 3854, 4177, 4198, 4233, 4500, 5279, 5956, 7103, 7152, 7156, 7281, 7559,
    8319, 8742, 8854, 8886,
];

/// Host used to decide whether IPv6 candidates are worth scanning
pub const IPV6_CHECK_TARGET: SocketAddr = SocketAddr::new(
    IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888)),
    80,
);

pub const IPV6_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

const V4_PREFIXES: [(Ipv4Addr, u8); 6] = [
    (Ipv4Addr::new(162, 159, 192, 0), 24),
    (Ipv4Addr::new(162, 159, 195, 0), 24),
    (Ipv4Addr::new(188, 114, 96, 0), 24),
    (Ipv4Addr::new(188, 114, 97, 0), 24),
    (Ipv4Addr::new(188, 114, 98, 0), 24),
    (Ipv4Addr::new(188, 114, 99, 0), 24),
];

const V6_PREFIXES: [(Ipv6Addr, u8); 2] = [
    (Ipv6Addr::new(0x2606, 0x4700, 0xd0, 0, 0, 0, 0, 0), 48),
    (Ipv6Addr::new(0x2606, 0x4700, 0xd1, 0, 0, 0, 0, 0), 48),
];

pub fn ipv4_prefixes() -> Vec<Prefix> {
    V4_PREFIXES
        .iter()
        .filter_map(|&(addr, len)| Prefix::new(IpAddr::V4(addr), len).ok())
        .collect()
}

/// All scan prefixes, IPv4 first
pub fn warp_prefixes() -> Vec<Prefix> {
    let mut all = ipv4_prefixes();
    all.extend(
        V6_PREFIXES
            .iter()
            .filter_map(|&(addr, len)| Prefix::new(IpAddr::V6(addr), len).ok()),
    );
    all
}

/// A random IPv4 endpoint on a random tunnel port, for runs without a scan.
pub fn random_endpoint<R: Rng + ?Sized>(rng: &mut R) -> SocketAddr {
    let prefixes = ipv4_prefixes();
    let port = ENDPOINT_PORTS.choose(rng).copied().unwrap_or(PROBE_PORT);

    let addr = match prefixes.choose(rng) {
        Some(p) => p.nth(rng.gen_range(0..p.size())),
        None => IpAddr::V4(V4_PREFIXES[0].0),
    };
    SocketAddr::new(addr, port)
}

/// True when a TCP connection to `target` succeeds within `timeout`.
pub async fn ipv6_reachable(target: SocketAddr, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("IPv6 check against {} failed: {}", target, e);
            false
        }
        Err(_) => {
            debug!("IPv6 check against {} timed out", target);
            false
        }
    }
}
