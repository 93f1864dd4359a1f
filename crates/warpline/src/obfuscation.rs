//! Obfuscation Transport
//!
//! An external circumvention client re-exposes the tunnel's local proxy
//! under a disguised transport. It is driven through
//! [`ObfuscationTransport`]; [`CommandTransport`] launches it as a child
//! process.

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exit countries the circumvention network serves
pub const SUPPORTED_REGIONS: &[&str] = &[
    "AT", "BE", "BG", "BR", "CA", "CH", "CZ", "DE", "DK", "EE", "ES", "FI", "FR", "GB", "HU", "IE",
    "IN", "IT", "JP", "LV", "NL", "NO", "PL", "RO", "RS", "SE", "SG", "SK", "UA", "US",
];

/// A supported exit country code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region(&'static str);

impl Region {
    pub fn code(&self) -> &'static str {
        self.0
    }

    pub fn all() -> impl Iterator<Item = Region> {
        SUPPORTED_REGIONS.iter().map(|code| Region(*code))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl FromStr for Region {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        SUPPORTED_REGIONS
            .iter()
            .find(|code| **code == wanted)
            .map(|code| Region(*code))
            .ok_or_else(|| TransportError::UnsupportedRegion(s.to_string()))
    }
}

/// Starts the external transport. It keeps running until `cancel` fires.
#[async_trait]
pub trait ObfuscationTransport: Send + Sync {
    async fn start(
        &self,
        upstream: SocketAddr,
        downstream: SocketAddr,
        region: Region,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>;
}

/// How long a launched client has to start accepting on its downstream
pub const READY_TIMEOUT: Duration = Duration::from_secs(15);

const READY_POLL: Duration = Duration::from_millis(100);

/// Runs the transport as a child process
#[derive(Debug, Clone)]
pub struct CommandTransport {
    program: String,
    args: Vec<String>,
    ready_timeout: Duration,
}

impl CommandTransport {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ready_timeout: READY_TIMEOUT,
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Arguments with placeholders filled in
    pub fn expand_args(&self, upstream: SocketAddr, downstream: SocketAddr, region: Region) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{upstream}", &upstream.to_string())
                    .replace("{downstream}", &downstream.to_string())
                    .replace("{region}", region.code())
            })
            .collect()
    }
}

impl CommandTransport {
    /// Poll `downstream` until it accepts. Fails if the child exits first
    /// or the deadline passes; the child is killed on failure.
    async fn wait_ready(
        &self,
        child: &mut Child,
        downstream: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            let exited = child
                .try_wait()
                .map_err(|e| TransportError::Spawn(self.program.clone(), e))?;
            if let Some(status) = exited {
                return Err(TransportError::Exited(self.program.clone(), status.to_string()));
            }
            if TcpStream::connect(downstream).await.is_ok() {
                debug!("{} accepting on {}", self.program, downstream);
                return Ok(());
            }
            if cancel.is_cancelled() || Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(TransportError::NotReady(self.program.clone(), downstream));
            }
            sleep(READY_POLL).await;
        }
    }
}

#[async_trait]
impl ObfuscationTransport for CommandTransport {
    async fn start(
        &self,
        upstream: SocketAddr,
        downstream: SocketAddr,
        region: Region,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let args = self.expand_args(upstream, downstream, region);
        debug!("Launching {} {:?}", self.program, args);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Spawn(self.program.clone(), e))?;

        self.wait_ready(&mut child, downstream, &cancel).await?;
        info!(
            "Obfuscation transport ({}) serving {} via {}",
            region, downstream, upstream
        );

        let program = self.program.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to stop {}: {}", program, e);
                    }
                    debug!("{} stopped", program);
                }
                status = child.wait() => match status {
                    Ok(status) => warn!("{} exited with {}", program, status),
                    Err(e) => warn!("{} wait failed: {}", program, e),
                },
            }
        });

        Ok(())
    }
}

/// Obfuscation transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Unsupported region: {0:?}")]
    UnsupportedRegion(String),

    #[error("Failed to launch {0}: {1}")]
    Spawn(String, std::io::Error),

    #[error("{0} exited before serving: {1}")]
    Exited(String, String),

    #[error("{0} is not accepting on {1}")]
    NotReady(String, SocketAddr),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_parsing() {
        assert_eq!("de".parse::<Region>().unwrap().code(), "DE");
        assert_eq!(Region::all().count(), 30);
        assert!(matches!(
            "XX".parse::<Region>(),
            Err(TransportError::UnsupportedRegion(_))
        ));
    }

    #[test]
    fn test_expand_args() {
        let transport = CommandTransport::new(
            "client",
            vec!["--up={upstream}".into(), "{downstream}".into(), "-r".into(), "{region}".into()],
        );
        let args = transport.expand_args(
            "127.0.0.1:4000".parse().unwrap(),
            "127.0.0.1:8086".parse().unwrap(),
            "SE".parse().unwrap(),
        );
        assert_eq!(args, vec!["--up=127.0.0.1:4000", "127.0.0.1:8086", "-r", "SE"]);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let transport = CommandTransport::new("warpline-no-such-program", vec![]);
        let err = transport
            .start(
                "127.0.0.1:1".parse().unwrap(),
                "127.0.0.1:2".parse().unwrap(),
                "US".parse().unwrap(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Spawn(..)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_runs_until_canceled() {
        // Stands in for the client's listener on the downstream address.
        let downstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transport = CommandTransport::new("sleep", vec!["30".into()]);
        let cancel = CancellationToken::new();
        transport
            .start(
                "127.0.0.1:1".parse().unwrap(),
                downstream.local_addr().unwrap(),
                "US".parse().unwrap(),
                cancel.clone(),
            )
            .await
            .unwrap();
        cancel.cancel();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_client_exiting_at_once_fails_start() {
        let downstream = free_port().await;
        let transport = CommandTransport::new("true", vec![]);
        let err = transport
            .start(
                "127.0.0.1:1".parse().unwrap(),
                downstream,
                "US".parse().unwrap(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Exited(..)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_client_that_never_listens_fails_start() {
        let downstream = free_port().await;
        let transport = CommandTransport::new("sleep", vec!["30".into()])
            .with_ready_timeout(Duration::from_millis(300));
        let err = transport
            .start(
                "127.0.0.1:1".parse().unwrap(),
                downstream,
                "US".parse().unwrap(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotReady(_, addr) if addr == downstream));
    }

    async fn free_port() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }
}
