//! Run Configuration
//!
//! [`PeerConfig`] is what a tunnel is started from. [`RunConfig`] is the
//! user-facing settings file (TOML or JSON), every field defaulted, which
//! is validated into a [`Topology`] before any socket is opened.

use crate::endpoint::PROBE_PORT;
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::obfuscation::Region;
use crate::orchestrator::Topology;
use crate::prefix::{AddressFamilies, Prefix};
use crate::proxy::ProxyConfig;
use crate::scanner::ScanConfig;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// WireGuard peer configuration for one tunnel
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub private_key: PrivateKey,
    pub public_key: PublicKey,
    pub preshared_key: Option<PresharedKey>,
    /// Traffic routed through this peer
    pub allowed_ips: Vec<Prefix>,
    pub endpoint: SocketAddr,
    pub keepalive: Duration,
    pub mtu: usize,
    /// Ask the engine to disguise its handshake traffic
    pub obfuscate: bool,
}

/// Default local proxy address
pub const DEFAULT_BIND: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(Ipv4Addr::LOCALHOST),
    8086,
);

/// Complete settings for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Where the user-facing proxy listens
    pub bind: SocketAddr,
    /// Fixed endpoint; skips scanning when set
    pub endpoint: Option<SocketAddr>,
    pub log_level: String,
    /// Tunnel-in-tunnel mode
    pub gool: bool,
    pub obfuscation: Option<ObfuscationSettings>,
    pub scan: Option<ScanSettings>,
    pub profiles: ProfilePaths,
    pub proxy: ProxySettings,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND,
            endpoint: None,
            log_level: "info".to_string(),
            gool: false,
            obfuscation: None,
            scan: None,
            profiles: ProfilePaths::default(),
            proxy: ProxySettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationSettings {
    /// Two-letter exit country
    pub region: String,
    #[serde(default = "default_obfs_program")]
    pub program: String,
    /// Arguments with `{upstream}`, `{downstream}` and `{region}` placeholders
    #[serde(default = "default_obfs_args")]
    pub args: Vec<String>,
}

impl ObfuscationSettings {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            program: default_obfs_program(),
            args: default_obfs_args(),
        }
    }
}

fn default_obfs_program() -> String {
    "psiphon".to_string()
}

fn default_obfs_args() -> Vec<String> {
    ["--upstream-proxy", "socks5://{upstream}", "--listen", "{downstream}", "--region", "{region}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Whether IPv6 candidates are scanned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ipv6Mode {
    /// Only when the host can reach the IPv6 internet
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub max_rtt_ms: u64,
    pub deadline_secs: u64,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub ipv4: bool,
    pub ipv6: Ipv6Mode,
    /// Send decoy datagrams ahead of each probe
    pub decoys: bool,
    pub ports: Vec<u16>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            max_rtt_ms: 1000,
            deadline_secs: 120,
            concurrency: 32,
            poll_interval_ms: 1000,
            ipv4: true,
            ipv6: Ipv6Mode::Auto,
            decoys: true,
            ports: vec![PROBE_PORT],
        }
    }
}

impl ScanSettings {
    /// Scanner settings, with `ipv6` resolved by the caller
    pub fn to_scan_config(&self, ipv6: bool) -> ScanConfig {
        ScanConfig {
            families: AddressFamilies { ipv4: self.ipv4, ipv6 },
            ports: self.ports.clone(),
            max_rtt: Duration::from_millis(self.max_rtt_ms),
            deadline: Duration::from_secs(self.deadline_secs),
            concurrency: self.concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..ScanConfig::default()
        }
    }
}

/// Identity files for the two tunnels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilePaths {
    pub primary: PathBuf,
    pub secondary: PathBuf,
}

impl Default for ProfilePaths {
    fn default() -> Self {
        Self {
            primary: PathBuf::from("stuff/primary/wgcf-profile.ini"),
            secondary: PathBuf::from("stuff/secondary/wgcf-profile.ini"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub idle_timeout_secs: u64,
    pub max_connections: usize,
    pub buffer_size: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 15,
            max_connections: 512,
            buffer_size: 32 * 1024,
        }
    }
}

impl ProxySettings {
    pub fn to_proxy_config(&self, listen_addr: SocketAddr) -> ProxyConfig {
        ProxyConfig {
            listen_addr,
            max_connections: self.max_connections,
            buffer_size: self.buffer_size,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl RunConfig {
    /// Load from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => ConfigFormat::Toml,
            Some("json") => ConfigFormat::Json,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or_default().to_string(),
                ));
            }
        };

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        Self::from_str_as(&content, format)
    }

    pub fn from_str_as(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        match format {
            ConfigFormat::Toml => toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string())),
            ConfigFormat::Json => {
                serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
            }
        }
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn is_debug(&self) -> bool {
        self.log_level.eq_ignore_ascii_case("debug")
    }

    /// Check mode flags and limits and pick the topology
    pub fn validate(&self) -> Result<Topology, ConfigError> {
        if let Some(scan) = &self.scan {
            if scan.max_rtt_ms == 0 {
                return Err(ConfigError::Invalid("scan max_rtt_ms must be non-zero"));
            }
            if scan.concurrency == 0 {
                return Err(ConfigError::Invalid("scan concurrency must be non-zero"));
            }
            if scan.ports.is_empty() {
                return Err(ConfigError::Invalid("scan ports must not be empty"));
            }
        }
        if self.proxy.max_connections == 0 || self.proxy.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "proxy max_connections and buffer_size must be non-zero",
            ));
        }
        if self.proxy.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("proxy idle_timeout_secs must be non-zero"));
        }

        let region = match &self.obfuscation {
            Some(obfs) => Some(
                obfs.region
                    .parse::<Region>()
                    .map_err(|_| ConfigError::UnsupportedRegion(obfs.region.clone()))?,
            ),
            None => None,
        };

        Topology::select(self.gool, region)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Obfuscation and chained mode cannot be used together")]
    ConflictingModes,

    #[error("Unsupported obfuscation region: {0:?}")]
    UnsupportedRegion(String),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),

    #[error("Unsupported config format: {0:?} (expected toml or json)")]
    UnsupportedFormat(String),

    #[error("Failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}
