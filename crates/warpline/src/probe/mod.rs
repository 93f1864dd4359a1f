//! Endpoint Probes
//!
//! A probe measures the round-trip time to one candidate or fails. The
//! scanner only sees [`ProbeStrategy`], so new transports can be added
//! without touching it.
//!
//! - [`HandshakeProbe`]: a partial WireGuard handshake over UDP
//! - [`PlainProbe`]: a TCP connect

mod handshake;
mod plain;

pub use handshake::{DECOY_GAP_MS, DECOY_LEN, HandshakeProbe, PROBE_TIMEOUT};
pub use plain::PlainProbe;

use crate::keys::{KeyError, PresharedKey, PrivateKey, PublicKey};
use crate::noise::HandshakeError;
use async_trait::async_trait;
use rand::rngs::StdRng;
use std::net::SocketAddr;
use std::time::Duration;

/// Measure reachability and latency of a single address
#[async_trait]
pub trait ProbeStrategy: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Round-trip time to `target`, or why it is unusable.
    ///
    /// `rng` is owned by the calling task and drives every random choice
    /// the probe makes.
    async fn probe(&self, target: SocketAddr, rng: &mut StdRng) -> Result<Duration, ProbeError>;
}

/// Key material the handshake probe needs, read verbatim from a profile
#[derive(Debug, Clone)]
pub struct ProbeKeys {
    pub private: PrivateKey,
    pub peer: PublicKey,
    pub psk: Option<PresharedKey>,
}

impl ProbeKeys {
    pub fn from_base64(private: &str, peer: &str, psk: Option<&str>) -> Result<Self, KeyError> {
        Ok(Self {
            private: PrivateKey::from_base64(private)?,
            peer: PublicKey::from_base64(peer)?,
            psk: psk.map(PresharedKey::from_base64).transpose()?,
        })
    }
}

/// Why a single probe produced no result
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Handshake rejected: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
