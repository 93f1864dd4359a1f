//! Tunnel Provider Contract
//!
//! The encrypted tunnel engine is external. This module fixes the narrow
//! surface the orchestrator needs from it: start a tunnel from a
//! [`TunnelSpec`], dial streams and datagrams through it, stop it.
//!
//! [`TunnelHandle`] owns one running tunnel and guarantees it is stopped
//! at most once. [`HostNetwork`] is a provider that dials through the
//! host's own network stack.

use crate::config::PeerConfig;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info};

/// Byte stream dialed through a tunnel
pub trait StreamConn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamConn for T {}

pub type BoxedStream = Box<dyn StreamConn>;

/// Connected datagram endpoint dialed through a tunnel
#[async_trait]
pub trait DatagramConn: Send + Sync {
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

#[async_trait]
impl DatagramConn for UdpSocket {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }
}

/// A running virtual tunnel
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Open a byte stream to `destination` (`host:port`)
    async fn dial(&self, destination: &str) -> Result<BoxedStream, TunnelError>;

    /// Open a datagram flow to `destination`
    async fn dial_udp(&self, destination: SocketAddr) -> Result<Box<dyn DatagramConn>, TunnelError>;

    /// Tear the tunnel down. May be called more than once.
    async fn stop(&self);
}

/// Everything a provider needs to bring one tunnel up
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub peer: PeerConfig,
    /// Addresses assigned to the virtual device
    pub addresses: Vec<IpAddr>,
    pub dns: Vec<IpAddr>,
    pub mtu: usize,
}

/// Starts tunnels
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn start(&self, spec: TunnelSpec) -> Result<Arc<dyn Tunnel>, TunnelError>;
}

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Running,
    Stopped,
}

impl TunnelState {
    pub fn is_running(&self) -> bool {
        matches!(self, TunnelState::Running)
    }
}

/// Sole owner of one running tunnel
pub struct TunnelHandle {
    name: &'static str,
    tunnel: Arc<dyn Tunnel>,
    mtu: usize,
    stopped: AtomicBool,
}

impl TunnelHandle {
    pub fn new(name: &'static str, tunnel: Arc<dyn Tunnel>, mtu: usize) -> Self {
        Self {
            name,
            tunnel,
            mtu,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn tunnel(&self) -> Arc<dyn Tunnel> {
        self.tunnel.clone()
    }

    pub fn state(&self) -> TunnelState {
        if self.stopped.load(Ordering::Acquire) {
            TunnelState::Stopped
        } else {
            TunnelState::Running
        }
    }

    /// Stop the underlying tunnel; later calls do nothing.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Stopping {} tunnel", self.name);
        self.tunnel.stop().await;
    }
}

impl fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .field("state", &self.state())
            .finish()
    }
}

/// How long [`HostNetwork`] waits for a stream dial
pub const HOST_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider whose tunnels are the host network stack itself
#[derive(Debug, Clone, Default)]
pub struct HostNetwork;

#[async_trait]
impl TunnelProvider for HostNetwork {
    async fn start(&self, spec: TunnelSpec) -> Result<Arc<dyn Tunnel>, TunnelError> {
        debug!(
            "Host network standing in for peer {} (mtu {})",
            spec.peer.endpoint, spec.mtu
        );
        Ok(Arc::new(HostTunnel::default()))
    }
}

#[derive(Debug, Default)]
pub struct HostTunnel {
    stopped: AtomicBool,
}

impl HostTunnel {
    fn ensure_running(&self) -> Result<(), TunnelError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TunnelError::Stopped);
        }
        Ok(())
    }
}

#[async_trait]
impl Tunnel for HostTunnel {
    async fn dial(&self, destination: &str) -> Result<BoxedStream, TunnelError> {
        self.ensure_running()?;
        let stream = tokio::time::timeout(HOST_DIAL_TIMEOUT, TcpStream::connect(destination))
            .await
            .map_err(|_| TunnelError::DialTimeout(destination.to_string()))??;
        Ok(Box::new(stream))
    }

    async fn dial_udp(&self, destination: SocketAddr) -> Result<Box<dyn DatagramConn>, TunnelError> {
        self.ensure_running()?;
        let local: SocketAddr = if destination.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(destination).await?;
        Ok(Box::new(socket))
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// Tunnel errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Tunnel failed to start: {0}")]
    StartFailed(String),

    #[error("Tunnel is stopped")]
    Stopped,

    #[error("Dial to {0} timed out")]
    DialTimeout(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
