//! Address-Learning UDP Relay
//!
//! Bridges a local UDP socket to a remote destination dialed through an
//! outer tunnel, so an inner tunnel can use the local socket as its peer
//! endpoint.
//!
//! ```text
//! inner tunnel ──► local socket ──► outer.dial_udp(remote) ──► remote
//!      ▲                                      │
//!      └───────── learned client ◄────────────┘
//! ```
//!
//! Return traffic goes to the most recent sender seen on the local socket
//! (one learned client, last writer wins). Nothing is returned before a
//! client has been learned.

use crate::tunnel::{DatagramConn, Tunnel, TunnelError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Local and remote ends of a relay plus the learned client
#[derive(Debug, Clone)]
pub struct RelayBinding {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    learned: Arc<RwLock<Option<SocketAddr>>>,
}

impl RelayBinding {
    pub async fn learned_client(&self) -> Option<SocketAddr> {
        *self.learned.read().await
    }
}

/// A running relay; both loops stop when its token fires
pub struct UdpRelay {
    binding: RelayBinding,
    task: JoinHandle<()>,
}

impl UdpRelay {
    /// Bind `local`, dial `remote` through `outer` and start forwarding
    /// datagrams of up to `mtu` bytes.
    pub async fn bind(
        local: SocketAddr,
        remote: SocketAddr,
        outer: Arc<dyn Tunnel>,
        mtu: usize,
        cancel: CancellationToken,
    ) -> Result<Self, RelayError> {
        if mtu == 0 {
            return Err(RelayError::InvalidMtu);
        }

        let listener = Arc::new(UdpSocket::bind(local).await?);
        let local = listener.local_addr()?;
        let upstream: Arc<dyn DatagramConn> = Arc::from(outer.dial_udp(remote).await?);

        let binding = RelayBinding {
            local,
            remote,
            learned: Arc::new(RwLock::new(None)),
        };

        info!("UDP relay {} -> {} (mtu {})", local, remote, mtu);

        let outbound = client_to_remote(
            listener.clone(),
            upstream.clone(),
            binding.learned.clone(),
            mtu,
            cancel.clone(),
        );
        let inbound = remote_to_client(listener, upstream, binding.learned.clone(), mtu, cancel);

        let task = tokio::spawn(async move {
            tokio::join!(outbound, inbound);
            debug!("UDP relay on {} closed", local);
        });

        Ok(Self { binding, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.binding.local
    }

    pub fn binding(&self) -> &RelayBinding {
        &self.binding
    }

    /// Wait for both loops to finish and the sockets to close
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn client_to_remote(
    listener: Arc<UdpSocket>,
    upstream: Arc<dyn DatagramConn>,
    learned: Arc<RwLock<Option<SocketAddr>>>,
    mtu: usize,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; mtu];
    loop {
        let (n, from) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = listener.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    debug!("Relay local read error: {}", e);
                    continue;
                }
            },
        };

        {
            let mut client = learned.write().await;
            if *client != Some(from) {
                debug!("Relay learned client {}", from);
                *client = Some(from);
            }
        }

        if let Err(e) = upstream.send(&buf[..n]).await {
            debug!("Relay upstream write error: {}", e);
        }
    }
}

async fn remote_to_client(
    listener: Arc<UdpSocket>,
    upstream: Arc<dyn DatagramConn>,
    learned: Arc<RwLock<Option<SocketAddr>>>,
    mtu: usize,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; mtu];
    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = upstream.recv(&mut buf) => match received {
                Ok(n) => n,
                Err(e) => {
                    debug!("Relay upstream read error: {}", e);
                    continue;
                }
            },
        };

        let Some(client) = *learned.read().await else {
            debug!("Relay dropped {} bytes: no client yet", n);
            continue;
        };
        if let Err(e) = listener.send_to(&buf[..n], client).await {
            debug!("Relay local write error: {}", e);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Relay MTU must be non-zero")]
    InvalidMtu,

    #[error("Outer tunnel dial failed: {0}")]
    Dial(#[from] TunnelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{BoxedStream, HostTunnel};
    use async_trait::async_trait;
    use std::io;
    use std::time::Duration;
    use tokio::sync::{Mutex, mpsc};
    use tokio::time::timeout;

    /// Datagram flow backed by channels: sends are observable and
    /// replies are injected by the test.
    struct ChannelDatagram {
        sent: mpsc::UnboundedSender<Vec<u8>>,
        replies: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    }

    #[async_trait]
    impl DatagramConn for ChannelDatagram {
        async fn send(&self, buf: &[u8]) -> io::Result<usize> {
            let _ = self.sent.send(buf.to_vec());
            Ok(buf.len())
        }

        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(reply) = self.replies.lock().await.recv().await else {
                return std::future::pending().await;
            };
            let n = reply.len().min(buf.len());
            buf[..n].copy_from_slice(&reply[..n]);
            Ok(n)
        }
    }

    struct ChannelTunnel {
        conn: std::sync::Mutex<Option<ChannelDatagram>>,
    }

    #[async_trait]
    impl Tunnel for ChannelTunnel {
        async fn dial(&self, _destination: &str) -> Result<BoxedStream, TunnelError> {
            Err(TunnelError::Stopped)
        }

        async fn dial_udp(&self, _destination: SocketAddr) -> Result<Box<dyn DatagramConn>, TunnelError> {
            let conn = self.conn.lock().ok().and_then(|mut c| c.take());
            conn.map(|c| Box::new(c) as Box<dyn DatagramConn>)
                .ok_or(TunnelError::Stopped)
        }

        async fn stop(&self) {}
    }

    fn channel_tunnel() -> (
        Arc<ChannelTunnel>,
        mpsc::UnboundedReceiver<Vec<u8>>,
        mpsc::UnboundedSender<Vec<u8>>,
    ) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let tunnel = ChannelTunnel {
            conn: std::sync::Mutex::new(Some(ChannelDatagram {
                sent: sent_tx,
                replies: Mutex::new(reply_rx),
            })),
        };
        (Arc::new(tunnel), sent_rx, reply_tx)
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_relay_round_trip_through_host_tunnel() {
        let remote = UdpSocket::bind(loopback()).await.unwrap();
        let cancel = CancellationToken::new();
        let relay = UdpRelay::bind(
            loopback(),
            remote.local_addr().unwrap(),
            Arc::new(HostTunnel::default()),
            1400,
            cancel.clone(),
        )
        .await
        .unwrap();

        let client = UdpSocket::bind(loopback()).await.unwrap();
        client.send_to(b"initiation", relay.local_addr()).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, upstream) = timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"initiation");

        remote.send_to(b"response", upstream).await.unwrap();
        let (n, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"response");
        assert_eq!(from, relay.local_addr());
        assert_eq!(
            relay.binding().learned_client().await,
            Some(client.local_addr().unwrap())
        );

        cancel.cancel();
        timeout(Duration::from_secs(2), relay.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_reply_before_client_is_learned() {
        let (tunnel, mut sent, replies) = channel_tunnel();
        let cancel = CancellationToken::new();
        let relay = UdpRelay::bind(loopback(), "192.0.2.1:2408".parse().unwrap(), tunnel, 1400, cancel.clone())
            .await
            .unwrap();
        let client = UdpSocket::bind(loopback()).await.unwrap();
        let mut buf = [0u8; 64];

        replies.send(b"early".to_vec()).unwrap();
        assert!(
            timeout(Duration::from_millis(150), client.recv_from(&mut buf))
                .await
                .is_err()
        );
        assert_eq!(relay.binding().learned_client().await, None);

        client.send_to(b"hello", relay.local_addr()).await.unwrap();
        let forwarded = timeout(Duration::from_secs(2), sent.recv()).await.unwrap().unwrap();
        assert_eq!(forwarded, b"hello");

        replies.send(b"late".to_vec()).unwrap();
        let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"late");

        cancel.cancel();
        timeout(Duration::from_secs(2), relay.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_last_sender_wins() {
        let (tunnel, mut sent, replies) = channel_tunnel();
        let cancel = CancellationToken::new();
        let relay = UdpRelay::bind(loopback(), "192.0.2.1:2408".parse().unwrap(), tunnel, 1400, cancel.clone())
            .await
            .unwrap();

        let first = UdpSocket::bind(loopback()).await.unwrap();
        let second = UdpSocket::bind(loopback()).await.unwrap();
        first.send_to(b"a", relay.local_addr()).await.unwrap();
        sent.recv().await.unwrap();
        second.send_to(b"b", relay.local_addr()).await.unwrap();
        sent.recv().await.unwrap();

        assert_eq!(
            relay.binding().learned_client().await,
            Some(second.local_addr().unwrap())
        );
        replies.send(b"to-second".to_vec()).unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = timeout(Duration::from_secs(2), second.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"to-second");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_closes_local_socket() {
        let cancel = CancellationToken::new();
        let remote = UdpSocket::bind(loopback()).await.unwrap();
        let relay = UdpRelay::bind(
            loopback(),
            remote.local_addr().unwrap(),
            Arc::new(HostTunnel::default()),
            1400,
            cancel.clone(),
        )
        .await
        .unwrap();
        let local = relay.local_addr();

        cancel.cancel();
        timeout(Duration::from_secs(2), relay.join()).await.unwrap();
        UdpSocket::bind(local).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_mtu_rejected() {
        let (tunnel, _, _) = channel_tunnel();
        let err = UdpRelay::bind(loopback(), loopback(), tunnel, 0, CancellationToken::new()).await;
        assert!(matches!(err, Err(RelayError::InvalidMtu)));
    }
}
