//! warpline - WARP Endpoint Scanner and Tunnel Orchestrator
//!
//! Finds low-latency WARP edge endpoints with real WireGuard handshakes,
//! then exposes a local HTTP/SOCKS5 proxy through one of three tunnel
//! topologies.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          warpline                          │
//! │                                                            │
//! │  ┌──────────┐   ┌───────────────┐   ┌──────────────────┐   │
//! │  │ Address  │──▶│ Scanner       │──▶│ Result cache     │   │
//! │  │ source   │   │ (probe pool)  │   │ (best N by RTT)  │   │
//! │  └──────────┘   └───────────────┘   └────────┬─────────┘   │
//! │                                              │ endpoints   │
//! │  ┌──────────┐   ┌───────────────┐   ┌────────▼─────────┐   │
//! │  │  Client  │──▶│ Proxy (bind)  │──▶│  Orchestrator    │   │
//! │  └──────────┘   └───────────────┘   │ direct / chained │   │
//! │                                     │ / obfuscated     │   │
//! │                                     └────────┬─────────┘   │
//! └──────────────────────────────────────────────│─────────────┘
//!                                                ▼ UDP
//!                                    ┌───────────────────────┐
//!                                    │  WARP edge endpoint   │
//!                                    └───────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Handshake probing**: RTT measured on a genuine Noise_IKpsk2 initiation
//! - **Sampling without replacement**: no address is probed twice per pass
//! - **Tunnel-in-tunnel**: inner tunnel carried over a UDP relay
//! - **Single teardown path**: partial setups roll back, handles stop once

mod buffer;
mod config;
mod endpoint;
mod keys;
mod noise;
mod obfuscation;
mod orchestrator;
mod prefix;
mod probe;
mod profile;
mod proxy;
mod relay;
mod scanner;
mod tunnel;

pub use buffer::{BufferPool, PooledBuf};
pub use config::{
    ConfigError, ConfigFormat, DEFAULT_BIND, Ipv6Mode, ObfuscationSettings, PeerConfig,
    ProfilePaths, ProxySettings, RunConfig, ScanSettings,
};
pub use endpoint::{
    ENDPOINT_PORTS, IPV6_CHECK_TARGET, IPV6_CHECK_TIMEOUT, PROBE_PORT, ipv4_prefixes,
    ipv6_reachable, random_endpoint, warp_prefixes,
};
pub use keys::{KeyError, KeyPair, PresharedKey, PrivateKey, PublicKey};
pub use noise::{HandshakeError, HandshakeInitiator, INITIATION_LEN, Initiation, RESPONSE_LEN};
pub use obfuscation::{
    CommandTransport, ObfuscationTransport, READY_TIMEOUT, Region, SUPPORTED_REGIONS,
    TransportError,
};
pub use orchestrator::{
    CHAINED_MTU, DIRECT_KEEPALIVE, ENCAPSULATION_OVERHEAD, INNER_KEEPALIVE, Profiles, RunError,
    Running, SINGLE_MTU, Topology, TunnelOrchestrator, run,
};
pub use prefix::{AddressFamilies, AddressSource, Prefix, PrefixError};
pub use probe::{
    DECOY_GAP_MS, DECOY_LEN, HandshakeProbe, PROBE_TIMEOUT, PlainProbe, ProbeError, ProbeKeys,
    ProbeStrategy,
};
pub use profile::{InterfaceSection, PeerSection, Profile, ProfileError};
pub use proxy::{ProxyConfig, ProxyError, ProxyFrontend};
pub use relay::{RelayBinding, RelayError, UdpRelay};
pub use scanner::{
    DEFAULT_RESULT_COUNT, ProbeResult, ResultCache, ScanConfig, ScanError, ScannerEngine,
};
pub use tunnel::{
    BoxedStream, DatagramConn, HostNetwork, HostTunnel, StreamConn, Tunnel, TunnelError,
    TunnelHandle, TunnelProvider, TunnelSpec, TunnelState,
};
