use super::{ProbeError, ProbeStrategy};
use async_trait::async_trait;
use rand::rngs::StdRng;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};

/// Times a TCP connect. Passes for any host with an open port, so it says
/// nothing about the UDP responder behind it.
pub struct PlainProbe {
    timeout: Duration,
}

impl PlainProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for PlainProbe {
    fn default() -> Self {
        Self::new(super::PROBE_TIMEOUT)
    }
}

#[async_trait]
impl ProbeStrategy for PlainProbe {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn probe(&self, target: SocketAddr, _rng: &mut StdRng) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        match timeout(self.timeout, TcpStream::connect(target)).await {
            Ok(Ok(_)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }
}
