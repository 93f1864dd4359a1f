//! Local Proxy Front End
//!
//! Accepts local clients and forwards each connection through the active
//! tunnel's stream dial.
//!
//! # Protocol
//!
//! ```text
//! App → SOCKS5 / HTTP (127.0.0.1:8086) → Tunnel::dial → Internet
//! ```
//!
//! SOCKS5 (no auth, CONNECT) and HTTP proxy requests share one listener;
//! the first byte decides which one a client speaks.
//!
//! # Resources
//!
//! - Semaphore-bounded connection count
//! - Pooled copy buffers, one per direction
//! - Idle read deadline on each direction

use crate::buffer::BufferPool;
use crate::tunnel::{BoxedStream, Tunnel};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Largest HTTP request head accepted
const MAX_HTTP_HEAD: usize = 8 * 1024;

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen address; port 0 picks an ephemeral port
    pub listen_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Buffer size per direction
    pub buffer_size: usize,
    /// A direction with no data for this long closes the connection
    pub idle_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: crate::config::DEFAULT_BIND,
            max_connections: 512,
            buffer_size: 32 * 1024,
            idle_timeout: Duration::from_secs(15),
        }
    }
}

impl ProxyConfig {
    /// Estimate memory usage
    pub fn memory_estimate(&self) -> usize {
        // Per connection: 2 buffers (one per direction) + overhead
        self.max_connections * (self.buffer_size * 2 + 512)
    }
}

/// How a client asked for its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Socks5,
    HttpConnect,
    /// Absolute-form HTTP request, forwarded as-is
    HttpForward,
}

struct Request {
    dialect: Dialect,
    destination: String,
    /// Bytes read past the request head that belong to the destination
    pending: Vec<u8>,
}

struct Shared {
    config: ProxyConfig,
    tunnel: Arc<dyn Tunnel>,
    pool: BufferPool,
    semaphore: Arc<Semaphore>,
    active: AtomicU64,
}

/// Forward proxy in front of one tunnel
#[derive(Clone)]
pub struct ProxyFrontend {
    shared: Arc<Shared>,
}

impl ProxyFrontend {
    pub fn new(config: ProxyConfig, tunnel: Arc<dyn Tunnel>) -> Self {
        let pool = BufferPool::new(config.max_connections * 2, config.buffer_size);
        let semaphore = Arc::new(Semaphore::new(config.max_connections));

        Self {
            shared: Arc::new(Shared {
                config,
                tunnel,
                pool,
                semaphore,
                active: AtomicU64::new(0),
            }),
        }
    }

    /// Get number of active connections
    pub fn active_connections(&self) -> u64 {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Bind the listener and serve in the background until `cancel`
    /// fires. Returns the bound address.
    pub async fn start(&self, cancel: CancellationToken) -> Result<SocketAddr, ProxyError> {
        let config = &self.shared.config;
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| ProxyError::BindError(config.listen_addr, e))?;
        let addr = listener.local_addr()?;

        info!(
            "Proxy listening on {} (max {} connections, ~{:.1}MB buffers)",
            addr,
            config.max_connections,
            config.memory_estimate() as f64 / (1024.0 * 1024.0)
        );

        tokio::spawn(serve(self.shared.clone(), listener, cancel));
        Ok(addr)
    }
}

async fn serve(shared: Arc<Shared>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        // Accept with semaphore (limits connections)
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = shared.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, peer) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept error: {}", e);
                    continue;
                }
            },
        };

        let shared = shared.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shared.active.fetch_add(1, Ordering::Relaxed);
            debug!("Proxy connection from {}", peer);

            tokio::select! {
                _ = cancel.cancelled() => debug!("Dropping {} on shutdown", peer),
                result = handle_connection(&shared, stream) => {
                    if let Err(e) = result {
                        debug!("Connection {} ended: {}", peer, e);
                    }
                }
            }

            shared.active.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
        });
    }

    info!("Proxy on {:?} stopped", listener.local_addr().ok());
}

async fn handle_connection(shared: &Shared, mut client: TcpStream) -> Result<(), ProxyError> {
    let idle = shared.config.idle_timeout;
    let request = match tokio::time::timeout(idle, read_request(&mut client))
        .await
        .map_err(|_| ProxyError::IdleTimeout(idle))??
    {
        Some(request) => request,
        None => return Ok(()),
    };

    debug!("{:?} request for {}", request.dialect, request.destination);

    let mut remote = match shared.tunnel.dial(&request.destination).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!("Failed to dial {} through tunnel: {}", request.destination, e);
            let _ = reply_failure(&mut client, request.dialect).await;
            return Err(ProxyError::ConnectionFailed(request.destination, e.to_string()));
        }
    };

    reply_success(&mut client, request.dialect).await?;
    if !request.pending.is_empty() {
        write_fully(&mut remote, &request.pending).await?;
    }

    relay(client, remote, &shared.pool, idle).await
}

/// Parse the client's request; `None` when it closed without sending one
async fn read_request(client: &mut TcpStream) -> Result<Option<Request>, ProxyError> {
    let mut first = [0u8; 1];
    if client.peek(&mut first).await? == 0 {
        return Ok(None);
    }

    let request = if first[0] == SOCKS5_VERSION {
        read_socks5_request(client).await?
    } else {
        read_http_request(client).await?
    };
    Ok(Some(request))
}

async fn read_socks5_request(stream: &mut TcpStream) -> Result<Request, ProxyError> {
    // Read greeting (version + methods)
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    if buf[0] != SOCKS5_VERSION {
        return Err(ProxyError::InvalidVersion);
    }

    let mut methods = vec![0u8; buf[1] as usize];
    stream.read_exact(&mut methods).await?;

    // We only support no authentication
    if !methods.contains(&AUTH_NO_AUTH) {
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(ProxyError::AuthNotSupported);
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(ProxyError::InvalidVersion);
    }

    if header[1] != CMD_CONNECT {
        send_socks5_reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(ProxyError::UnsupportedCommand);
    }

    let host = match header[3] {
        ADDR_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        ADDR_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| ProxyError::InvalidAddress)?
        }
        ADDR_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            format!("[{}]", std::net::Ipv6Addr::from(ip))
        }
        _ => {
            send_socks5_reply(stream, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Err(ProxyError::InvalidAddress);
        }
    };
    let port = stream.read_u16().await?;

    Ok(Request {
        dialect: Dialect::Socks5,
        destination: format!("{}:{}", host, port),
        pending: Vec::new(),
    })
}

async fn read_http_request(stream: &mut TcpStream) -> Result<Request, ProxyError> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::BadRequest("connection closed in request head"));
        }
        head.extend_from_slice(&chunk[..n]);

        if let Some(pos) = head.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if head.len() > MAX_HTTP_HEAD {
            return Err(ProxyError::BadRequest("request head too large"));
        }
    };

    let text = std::str::from_utf8(&head[..end]).map_err(|_| ProxyError::BadRequest("non-UTF-8 head"))?;
    let request_line = text.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next()) {
        (Some(method), Some(target)) => (method, target),
        _ => return Err(ProxyError::BadRequest("malformed request line")),
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        return Ok(Request {
            dialect: Dialect::HttpConnect,
            destination: with_default_port(target, 443),
            pending: head[end..].to_vec(),
        });
    }

    let rest = target
        .strip_prefix("http://")
        .ok_or(ProxyError::BadRequest("only CONNECT and absolute http:// requests are proxied"))?;
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(ProxyError::BadRequest("missing host"));
    }

    Ok(Request {
        dialect: Dialect::HttpForward,
        destination: with_default_port(authority, 80),
        pending: head,
    })
}

fn with_default_port(authority: &str, port: u16) -> String {
    let has_port = match authority.rfind(':') {
        Some(idx) => !authority[idx..].contains(']'),
        None => false,
    };
    if has_port {
        authority.to_string()
    } else {
        format!("{}:{}", authority, port)
    }
}

/// Send SOCKS5 reply
async fn send_socks5_reply<S: AsyncWrite + Unpin>(stream: &mut S, reply: u8) -> Result<(), ProxyError> {
    let response = [
        SOCKS5_VERSION,
        reply,
        0x00, // Reserved
        ADDR_IPV4,
        0, 0, 0, 0, // Bind address (0.0.0.0)
        0, 0,       // Bind port (0)
    ];
    stream.write_all(&response).await?;
    Ok(())
}

async fn reply_success(stream: &mut TcpStream, dialect: Dialect) -> Result<(), ProxyError> {
    match dialect {
        Dialect::Socks5 => send_socks5_reply(stream, REPLY_SUCCESS).await,
        Dialect::HttpConnect => {
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await?;
            Ok(())
        }
        Dialect::HttpForward => Ok(()),
    }
}

async fn reply_failure(stream: &mut TcpStream, dialect: Dialect) -> Result<(), ProxyError> {
    match dialect {
        Dialect::Socks5 => send_socks5_reply(stream, REPLY_CONNECTION_REFUSED).await,
        Dialect::HttpConnect | Dialect::HttpForward => {
            stream
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                .await?;
            Ok(())
        }
    }
}

async fn write_fully<W: AsyncWrite + Unpin + ?Sized>(dst: &mut W, data: &[u8]) -> Result<(), ProxyError> {
    dst.write_all(data).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::WriteZero => ProxyError::ShortWrite,
        _ => ProxyError::Io(e),
    })
}

/// Copy until EOF, error, or no data for `idle`
async fn copy_with_idle<R, W>(src: &mut R, dst: &mut W, buf: &mut [u8], idle: Duration) -> Result<u64, ProxyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0u64;
    loop {
        let n = tokio::time::timeout(idle, src.read(buf))
            .await
            .map_err(|_| ProxyError::IdleTimeout(idle))??;
        if n == 0 {
            return Ok(total);
        }
        write_fully(dst, &buf[..n]).await?;
        total += n as u64;
    }
}

/// Relay data between client and tunnel until either direction ends
async fn relay(
    client: TcpStream,
    remote: BoxedStream,
    pool: &BufferPool,
    idle: Duration,
) -> Result<(), ProxyError> {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let mut up_buf = pool.get();
    let mut down_buf = pool.get();

    let outcome = tokio::select! {
        r = copy_with_idle(&mut client_read, &mut remote_write, &mut up_buf, idle) => r,
        r = copy_with_idle(&mut remote_read, &mut client_write, &mut down_buf, idle) => r,
    };

    let _ = remote_write.shutdown().await;
    let _ = client_write.shutdown().await;
    outcome.map(|_| ())
}

/// Proxy errors
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Failed to bind {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    #[error("Invalid SOCKS version")]
    InvalidVersion,

    #[error("Authentication not supported")]
    AuthNotSupported,

    #[error("Unsupported command")]
    UnsupportedCommand,

    #[error("Invalid address")]
    InvalidAddress,

    #[error("Bad HTTP request: {0}")]
    BadRequest(&'static str),

    #[error("Connection to {0} failed: {1}")]
    ConnectionFailed(String, String),

    #[error("Short write")]
    ShortWrite,

    #[error("Idle for {0:?}")]
    IdleTimeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::HostTunnel;
    use tokio::time::timeout;

    #[test]
    fn test_proxy_config() {
        let config = ProxyConfig::default();

        assert_eq!(config.max_connections, 512);
        assert_eq!(config.idle_timeout, Duration::from_secs(15));
        assert!(config.memory_estimate() < 64 * 1024 * 1024);
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(with_default_port("example.com", 443), "example.com:443");
        assert_eq!(with_default_port("example.com:8443", 443), "example.com:8443");
        assert_eq!(with_default_port("[2001:db8::1]", 80), "[2001:db8::1]:80");
        assert_eq!(with_default_port("[2001:db8::1]:81", 80), "[2001:db8::1]:81");
    }

    async fn frontend(idle: Duration) -> (ProxyFrontend, SocketAddr, CancellationToken) {
        let config = ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections: 8,
            buffer_size: 1024,
            idle_timeout: idle,
        };
        let proxy = ProxyFrontend::new(config, Arc::new(HostTunnel::default()));
        let cancel = CancellationToken::new();
        let addr = proxy.start(cancel.clone()).await.unwrap();
        (proxy, addr, cancel)
    }

    async fn socks5_connect(proxy: SocketAddr, target: SocketAddr) -> (TcpStream, u8) {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [SOCKS5_VERSION, AUTH_NO_AUTH]);

        let SocketAddr::V4(v4) = target else {
            panic!("test targets are IPv4");
        };
        let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0, ADDR_IPV4];
        request.extend_from_slice(&v4.ip().octets());
        request.extend_from_slice(&v4.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        (client, reply[1])
    }

    #[tokio::test]
    async fn test_socks5_bidirectional() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (proxy, addr, cancel) = frontend(Duration::from_secs(5)).await;

        let (mut client, code) = socks5_connect(addr, target.local_addr().unwrap()).await;
        assert_eq!(code, REPLY_SUCCESS);
        let (mut server, _) = target.accept().await.unwrap();

        client.write_all(b"ping through tunnel").await.unwrap();
        let mut buf = [0u8; 19];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping through tunnel");

        server.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(proxy.active_connections(), 1);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_http_connect() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let (_proxy, addr, cancel) = frontend(Duration::from_secs(5)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\nearly", target_addr);
        client.write_all(request.as_bytes()).await.unwrap();

        let mut status = [0u8; 12];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(&status, b"HTTP/1.1 200");

        let (mut server, _) = target.accept().await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (proxy, addr, cancel) = frontend(Duration::from_millis(200)).await;

        let (mut client, code) = socks5_connect(addr, target.local_addr().unwrap()).await;
        assert_eq!(code, REPLY_SUCCESS);
        let (mut server, _) = target.accept().await.unwrap();

        let mut buf = [0u8; 8];
        let client_eof = timeout(Duration::from_secs(3), client.read(&mut buf)).await.unwrap();
        assert_eq!(client_eof.unwrap(), 0);
        let server_eof = timeout(Duration::from_secs(3), server.read(&mut buf)).await.unwrap();
        assert_eq!(server_eof.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(proxy.active_connections(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_dial_failure_is_isolated() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);
        let (_proxy, addr, cancel) = frontend(Duration::from_secs(5)).await;

        let (mut client, code) = socks5_connect(addr, closed_addr).await;
        assert_eq!(code, REPLY_CONNECTION_REFUSED);
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        // The frontend keeps serving other clients.
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_client, code) = socks5_connect(addr, target.local_addr().unwrap()).await;
        assert_eq!(code, REPLY_SUCCESS);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_silent_clients_release_their_slots() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections: 2,
            buffer_size: 1024,
            idle_timeout: Duration::from_millis(200),
        };
        let proxy = ProxyFrontend::new(config, Arc::new(HostTunnel::default()));
        let cancel = CancellationToken::new();
        let addr = proxy.start(cancel.clone()).await.unwrap();

        let mut silent_a = TcpStream::connect(addr).await.unwrap();
        let mut silent_b = TcpStream::connect(addr).await.unwrap();

        // Both silent clients are dropped once the request deadline passes.
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(3), silent_a.read(&mut buf)).await.unwrap();
        assert_eq!(n.unwrap(), 0);
        let n = timeout(Duration::from_secs(3), silent_b.read(&mut buf)).await.unwrap();
        assert_eq!(n.unwrap(), 0);

        let (_client, code) = timeout(
            Duration::from_secs(3),
            socks5_connect(addr, target.local_addr().unwrap()),
        )
        .await
        .unwrap();
        assert_eq!(code, REPLY_SUCCESS);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_stops_listener() {
        let (_proxy, addr, cancel) = frontend(Duration::from_secs(5)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_unknown_http_method() {
        let (_proxy, addr, cancel) = frontend(Duration::from_secs(5)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /relative HTTP/1.1\r\n\r\n").await.unwrap();

        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap();
        assert_eq!(n.unwrap(), 0);
        cancel.cancel();
    }
}
