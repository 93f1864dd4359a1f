//! Tunnel Orchestrator
//!
//! Builds the run's topology once and owns everything it started.
//!
//! ```text
//! Direct      client ─► proxy(bind) ─► tunnel ─► endpoint[0]
//!
//! Obfuscated  client ─► transport(bind) ─► proxy(loopback) ─► tunnel ─► endpoint[0]
//!
//! Chained     client ─► proxy(bind) ─► inner tunnel ─► relay(loopback)
//!                                                        │ outer.dial_udp
//!                           endpoint[1] ◄─ outer tunnel ◄┘ (to endpoint[0])
//! ```
//!
//! Any failure while building tears down whatever was already started.
//! Shutdown closes the proxy and relay first, then stops tunnels
//! innermost first.

use crate::config::{ConfigError, Ipv6Mode, ObfuscationSettings, ProxySettings, RunConfig};
use crate::endpoint::{IPV6_CHECK_TARGET, IPV6_CHECK_TIMEOUT, ipv6_reachable, random_endpoint};
use crate::obfuscation::{CommandTransport, ObfuscationTransport, Region, TransportError};
use crate::probe::{HandshakeProbe, ProbeStrategy};
use crate::profile::{Profile, ProfileError};
use crate::proxy::{ProxyError, ProxyFrontend};
use crate::relay::{RelayError, UdpRelay};
use crate::scanner::{ScanError, ScannerEngine};
use crate::tunnel::{TunnelError, TunnelHandle, TunnelProvider};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// MTU of a tunnel that talks to its endpoint directly
pub const SINGLE_MTU: usize = 1400;

/// Bytes one layer of tunnel encapsulation adds
pub const ENCAPSULATION_OVERHEAD: usize = 80;

/// MTU of the inner tunnel of a chain
pub const CHAINED_MTU: usize = SINGLE_MTU - ENCAPSULATION_OVERHEAD;

/// Keepalive of tunnels facing the network directly
pub const DIRECT_KEEPALIVE: Duration = Duration::from_secs(3);

/// Keepalive of the inner tunnel of a chain
pub const INNER_KEEPALIVE: Duration = Duration::from_secs(10);

/// How the tunnels of a run are arranged; fixed for the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Direct,
    Chained,
    Obfuscated { region: Region },
}

impl Topology {
    /// Pick the topology from the mode flags. Chaining and obfuscation
    /// exclude each other.
    pub fn select(chained: bool, obfuscation: Option<Region>) -> Result<Self, ConfigError> {
        match (chained, obfuscation) {
            (true, Some(_)) => Err(ConfigError::ConflictingModes),
            (true, None) => Ok(Topology::Chained),
            (false, Some(region)) => Ok(Topology::Obfuscated { region }),
            (false, None) => Ok(Topology::Direct),
        }
    }

    /// Distinct endpoints the topology dials
    pub fn endpoints_needed(&self) -> usize {
        match self {
            Topology::Chained => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::Direct => write!(f, "direct"),
            Topology::Chained => write!(f, "chained"),
            Topology::Obfuscated { region } => write!(f, "obfuscated ({})", region),
        }
    }
}

/// Identities for the run. The secondary one is only used by the outer
/// tunnel of a chain.
#[derive(Debug, Clone)]
pub struct Profiles {
    pub primary: Profile,
    pub secondary: Option<Profile>,
}

fn loopback_ephemeral() -> SocketAddr {
    (Ipv4Addr::LOCALHOST, 0).into()
}

/// Builds and owns one topology
pub struct TunnelOrchestrator {
    topology: Topology,
    provider: Arc<dyn TunnelProvider>,
    transport: Option<Arc<dyn ObfuscationTransport>>,
    proxy_settings: ProxySettings,
    token: CancellationToken,
    /// Outermost first
    handles: Vec<TunnelHandle>,
    relay: Option<UdpRelay>,
    proxy: Option<ProxyFrontend>,
}

impl TunnelOrchestrator {
    pub fn new(
        topology: Topology,
        provider: Arc<dyn TunnelProvider>,
        transport: Option<Arc<dyn ObfuscationTransport>>,
        proxy_settings: ProxySettings,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            topology,
            provider,
            transport,
            proxy_settings,
            token: cancel.child_token(),
            handles: Vec::new(),
            relay: None,
            proxy: None,
        }
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Running tunnels, outermost first
    pub fn handles(&self) -> &[TunnelHandle] {
        &self.handles
    }

    pub fn proxy(&self) -> Option<&ProxyFrontend> {
        self.proxy.as_ref()
    }

    /// Build the topology. Returns the address clients connect to.
    pub async fn start(
        &mut self,
        bind: SocketAddr,
        endpoints: &[SocketAddr],
        profiles: &Profiles,
    ) -> Result<SocketAddr, RunError> {
        let needed = self.topology.endpoints_needed();
        if endpoints.len() < needed {
            return Err(RunError::NotEnoughEndpoints {
                needed,
                got: endpoints.len(),
            });
        }

        info!("Starting {} topology via {:?}", self.topology, &endpoints[..needed]);

        match self.build(bind, endpoints, profiles).await {
            Ok(addr) => Ok(addr),
            Err(e) => {
                warn!("Topology setup failed: {}", e);
                self.shutdown().await;
                Err(e)
            }
        }
    }

    async fn build(
        &mut self,
        bind: SocketAddr,
        endpoints: &[SocketAddr],
        profiles: &Profiles,
    ) -> Result<SocketAddr, RunError> {
        match self.topology {
            Topology::Direct => {
                let index = self
                    .start_tunnel("primary", &profiles.primary, endpoints[0], SINGLE_MTU, true)
                    .await?;
                self.start_proxy(bind, index).await
            }
            Topology::Obfuscated { region } => {
                let transport = self.transport.clone().ok_or(RunError::MissingTransport)?;
                let index = self
                    .start_tunnel("primary", &profiles.primary, endpoints[0], SINGLE_MTU, true)
                    .await?;
                let upstream = self.start_proxy(loopback_ephemeral(), index).await?;

                transport
                    .start(upstream, bind, region, self.token.clone())
                    .await?;
                info!("Serving on {} through obfuscation transport", bind);
                Ok(bind)
            }
            Topology::Chained => {
                let secondary = profiles
                    .secondary
                    .as_ref()
                    .ok_or(RunError::MissingProfile("secondary"))?;
                let outer = self
                    .start_tunnel("outer", secondary, endpoints[0], SINGLE_MTU, true)
                    .await?;

                let relay = UdpRelay::bind(
                    loopback_ephemeral(),
                    endpoints[1],
                    self.handles[outer].tunnel(),
                    SINGLE_MTU,
                    self.token.child_token(),
                )
                .await?;
                let relay_addr = relay.local_addr();
                self.relay = Some(relay);

                let inner = self
                    .start_tunnel("inner", &profiles.primary, relay_addr, CHAINED_MTU, false)
                    .await?;
                self.start_proxy(bind, inner).await
            }
        }
    }

    /// Start one tunnel and keep its handle; returns the handle index.
    async fn start_tunnel(
        &mut self,
        name: &'static str,
        profile: &Profile,
        endpoint: SocketAddr,
        mtu: usize,
        faces_network: bool,
    ) -> Result<usize, RunError> {
        let keepalive = if faces_network { DIRECT_KEEPALIVE } else { INNER_KEEPALIVE };
        let spec = profile.tunnel_spec(endpoint, mtu, keepalive, faces_network)?;

        let tunnel = self.provider.start(spec).await?;
        info!("{} tunnel up (endpoint {}, mtu {})", name, endpoint, mtu);

        self.handles.push(TunnelHandle::new(name, tunnel, mtu));
        Ok(self.handles.len() - 1)
    }

    async fn start_proxy(&mut self, bind: SocketAddr, index: usize) -> Result<SocketAddr, RunError> {
        let config = self.proxy_settings.to_proxy_config(bind);
        let proxy = ProxyFrontend::new(config, self.handles[index].tunnel());
        let addr = proxy.start(self.token.child_token()).await?;
        self.proxy = Some(proxy);
        Ok(addr)
    }

    /// Close proxy and relay sockets, then stop tunnels innermost first.
    /// Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.token.cancel();
        self.proxy = None;

        if let Some(relay) = self.relay.take() {
            relay.join().await;
        }

        for handle in self.handles.iter().rev() {
            handle.stop().await;
        }
    }
}

/// A started run; shut it down to release everything
pub struct Running {
    proxy_addr: SocketAddr,
    endpoints: Vec<SocketAddr>,
    orchestrator: TunnelOrchestrator,
}

impl Running {
    /// Where clients connect
    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    pub fn topology(&self) -> Topology {
        self.orchestrator.topology()
    }

    pub fn endpoints(&self) -> &[SocketAddr] {
        &self.endpoints
    }

    pub fn orchestrator(&self) -> &TunnelOrchestrator {
        &self.orchestrator
    }

    pub async fn shutdown(mut self) {
        info!("Shutting down");
        self.orchestrator.shutdown().await;
    }
}

/// Validate `config`, pick endpoints and bring the topology up.
///
/// `transport` overrides the command transport built from the
/// obfuscation settings.
pub async fn run(
    config: &RunConfig,
    provider: Arc<dyn TunnelProvider>,
    transport: Option<Arc<dyn ObfuscationTransport>>,
    cancel: CancellationToken,
) -> Result<Running, RunError> {
    let topology = config.validate()?;

    let profiles = Profiles {
        primary: Profile::load(&config.profiles.primary)?,
        secondary: match topology {
            Topology::Chained => Some(Profile::load(&config.profiles.secondary)?),
            _ => None,
        },
    };

    let transport = transport.or_else(|| {
        config
            .obfuscation
            .as_ref()
            .map(|obfs: &ObfuscationSettings| {
                Arc::new(CommandTransport::new(obfs.program.clone(), obfs.args.clone()))
                    as Arc<dyn ObfuscationTransport>
            })
    });

    let endpoints = resolve_endpoints(config, &profiles.primary, &cancel).await?;
    info!("Using endpoints {:?}", endpoints);

    let mut orchestrator =
        TunnelOrchestrator::new(topology, provider, transport, config.proxy.clone(), &cancel);
    let proxy_addr = orchestrator.start(config.bind, &endpoints, &profiles).await?;

    Ok(Running {
        proxy_addr,
        endpoints,
        orchestrator,
    })
}

/// Scanned endpoints when scanning is on, else the configured endpoint,
/// else a random catalogue endpoint. Always at least two entries.
async fn resolve_endpoints(
    config: &RunConfig,
    primary: &Profile,
    cancel: &CancellationToken,
) -> Result<Vec<SocketAddr>, RunError> {
    if let Some(scan) = &config.scan {
        let ipv6 = match scan.ipv6 {
            Ipv6Mode::On => true,
            Ipv6Mode::Off => false,
            Ipv6Mode::Auto => ipv6_reachable(IPV6_CHECK_TARGET, IPV6_CHECK_TIMEOUT).await,
        };
        let strategy: Arc<dyn ProbeStrategy> =
            Arc::new(HandshakeProbe::new(primary.probe_keys()?).with_decoys(scan.decoys));

        let mut scanner = ScannerEngine::new(scan.to_scan_config(ipv6), strategy);
        let mut endpoints: Vec<SocketAddr> =
            scanner.scan(cancel).await?.into_iter().map(|r| r.addr).collect();
        if endpoints.len() == 1 {
            endpoints.push(endpoints[0]);
        }
        return Ok(endpoints);
    }

    let endpoint = match config.endpoint {
        Some(endpoint) => endpoint,
        None => random_endpoint(&mut StdRng::from_entropy()),
    };
    Ok(vec![endpoint, endpoint])
}

/// Errors that abort a run
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("Missing {0} profile")]
    MissingProfile(&'static str),

    #[error("Endpoint scan failed: {0}")]
    Scan(#[from] ScanError),

    #[error("Topology needs {needed} endpoints, got {got}")]
    NotEnoughEndpoints { needed: usize, got: usize },

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Obfuscation transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Obfuscated topology without a transport")]
    MissingTransport,
}
