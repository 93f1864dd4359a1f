use super::{ProbeError, ProbeKeys, ProbeStrategy};
use crate::keys::PrivateKey;
use crate::noise::{HandshakeInitiator, PROBE_SENDER_INDEX, tai64n};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, RngCore};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::{Duration, SystemTime};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::debug;

/// How long to wait for the handshake response
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Size range of a decoy datagram
pub const DECOY_LEN: RangeInclusive<usize> = 1..=100;

/// Pause after each decoy
pub const DECOY_GAP_MS: RangeInclusive<u64> = 200..=500;

const DECOY_COUNT: RangeInclusive<usize> = 1..=2;

/// Sends a WireGuard handshake initiation and times the response.
///
/// The exchange stops after the responder's message has been verified;
/// no session keys are kept and no data is sent.
pub struct HandshakeProbe {
    initiator: HandshakeInitiator,
    timeout: Duration,
    decoys: bool,
}

impl HandshakeProbe {
    pub fn new(keys: ProbeKeys) -> Self {
        Self {
            initiator: HandshakeInitiator::new(keys.private, keys.peer, keys.psk),
            timeout: PROBE_TIMEOUT,
            decoys: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Toggle the random datagrams sent ahead of the initiation
    pub fn with_decoys(mut self, decoys: bool) -> Self {
        self.decoys = decoys;
        self
    }

    async fn send_decoys(&self, socket: &UdpSocket, rng: &mut StdRng) -> Result<(), ProbeError> {
        let count = rng.gen_range(DECOY_COUNT);
        for _ in 0..count {
            let mut junk = vec![0u8; rng.gen_range(DECOY_LEN)];
            rng.fill_bytes(&mut junk);
            socket.send(&junk).await?;

            let gap = Duration::from_millis(rng.gen_range(DECOY_GAP_MS));
            tokio::time::sleep(gap).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ProbeStrategy for HandshakeProbe {
    fn name(&self) -> &'static str {
        "handshake"
    }

    async fn probe(&self, target: SocketAddr, rng: &mut StdRng) -> Result<Duration, ProbeError> {
        let local: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;

        let initiation = self.initiator.initiate(
            PrivateKey::generate_from(rng),
            PROBE_SENDER_INDEX,
            tai64n(SystemTime::now()),
        )?;

        if self.decoys {
            self.send_decoys(&socket, rng).await?;
        }

        let sent_at = Instant::now();
        socket.send(initiation.packet()).await?;

        // Oversized so a long reply is seen as one instead of truncated.
        let mut buf = [0u8; 256];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))??;
        let rtt = sent_at.elapsed();

        initiation.consume_response(&buf[..len])?;
        debug!("Handshake with {} completed in {:?}", target, rtt);

        Ok(rtt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use crate::noise::INITIATION_LEN;
    use crate::noise::responder::Responder;
    use rand::SeedableRng;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn keys_for(server: &KeyPair) -> ProbeKeys {
        ProbeKeys {
            private: PrivateKey::generate(),
            peer: server.public,
            psk: None,
        }
    }

    /// Loopback responder: answers initiations, records everything else.
    async fn spawn_responder(
        server: KeyPair,
        reply: fn(&Responder, &[u8]) -> Option<Vec<u8>>,
    ) -> (SocketAddr, Arc<Mutex<Vec<usize>>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            let responder = Responder::new(server.private);
            let mut buf = [0u8; 512];
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                log.lock().await.push(n);
                if n != INITIATION_LEN {
                    continue;
                }
                if let Some(out) = reply(&responder, &buf[..n]) {
                    let _ = socket.send_to(&out, from).await;
                }
            }
        });

        (addr, seen)
    }

    fn well_formed(responder: &Responder, initiation: &[u8]) -> Option<Vec<u8>> {
        responder
            .respond(initiation, PrivateKey::generate())
            .ok()
            .map(|r| r.to_vec())
    }

    #[tokio::test]
    async fn test_probe_against_responder() {
        let server = KeyPair::generate();
        let (addr, seen) = spawn_responder(server.clone(), well_formed).await;

        let probe = HandshakeProbe::new(keys_for(&server)).with_decoys(false);
        let mut rng = StdRng::seed_from_u64(5);
        let rtt = probe.probe(addr, &mut rng).await.unwrap();

        assert!(rtt < PROBE_TIMEOUT);
        assert_eq!(*seen.lock().await, vec![INITIATION_LEN]);
    }

    #[tokio::test]
    async fn test_decoys_precede_initiation() {
        let server = KeyPair::generate();
        let (addr, seen) = spawn_responder(server.clone(), well_formed).await;

        let probe = HandshakeProbe::new(keys_for(&server));
        let mut rng = StdRng::seed_from_u64(8);
        probe.probe(addr, &mut rng).await.unwrap();

        let seen = seen.lock().await;
        let (last, decoys) = seen.split_last().unwrap();
        assert_eq!(*last, INITIATION_LEN);
        assert!(DECOY_COUNT.contains(&decoys.len()));
        assert!(decoys.iter().all(|n| DECOY_LEN.contains(n)));
    }

    #[tokio::test]
    async fn test_short_reply_is_rejected() {
        let server = KeyPair::generate();
        let (addr, _) = spawn_responder(server.clone(), |_, _| Some(vec![2u8; 10])).await;

        let probe = HandshakeProbe::new(keys_for(&server)).with_decoys(false);
        let err = probe
            .probe(addr, &mut StdRng::seed_from_u64(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_wrong_peer_key_is_rejected() {
        let server = KeyPair::generate();
        let (addr, seen) = spawn_responder(server, well_formed).await;

        // mac1 is keyed to a different responder, so it stays silent.
        let probe = HandshakeProbe::new(keys_for(&KeyPair::generate()))
            .with_decoys(false)
            .with_timeout(Duration::from_millis(200));
        let err = probe
            .probe(addr, &mut StdRng::seed_from_u64(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(_)));
        assert_eq!(seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_silent_endpoint_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let probe = HandshakeProbe::new(keys_for(&KeyPair::generate()))
            .with_decoys(false)
            .with_timeout(Duration::from_millis(150));
        let err = probe
            .probe(addr, &mut StdRng::seed_from_u64(3))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(d) if d == Duration::from_millis(150)));
    }
}
