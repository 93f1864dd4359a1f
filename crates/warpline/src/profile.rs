//! WireGuard Profile Files
//!
//! Reads the INI-style `wgcf-profile.ini` identity written by the
//! provisioning tool. Only the fields a tunnel or probe needs are kept.
//!
//! ```text
//! [Interface]
//! PrivateKey = <base64>
//! Address = 172.16.0.2/32, 2606:4700:110:8a36::1/128
//! DNS = 1.1.1.1
//! MTU = 1280
//!
//! [Peer]
//! PublicKey = <base64>
//! AllowedIPs = 0.0.0.0/0, ::/0
//! Endpoint = engage.cloudflareclient.com:2408
//! ```

use crate::config::PeerConfig;
use crate::keys::{KeyError, PresharedKey, PrivateKey, PublicKey};
use crate::prefix::Prefix;
use crate::probe::ProbeKeys;
use crate::tunnel::TunnelSpec;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceSection {
    pub private_key: String,
    /// Device addresses with their host bits; any `/len` suffix is dropped
    pub addresses: Vec<IpAddr>,
    pub dns: Vec<IpAddr>,
    pub mtu: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSection {
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub allowed_ips: Vec<Prefix>,
    pub endpoint: Option<String>,
    pub keepalive: Option<u16>,
}

/// A parsed profile. Keys are kept as the verbatim base64 text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub interface: InterfaceSection,
    pub peer: PeerSection,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
    Other,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProfileError::Read(path.display().to_string(), e))?;
        debug!("Loaded profile {}", path.display());
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ProfileError> {
        let mut profile = Profile::default();
        let mut section = Section::None;

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = match name.trim() {
                    n if n.eq_ignore_ascii_case("interface") => Section::Interface,
                    n if n.eq_ignore_ascii_case("peer") => Section::Peer,
                    _ => Section::Other,
                };
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ProfileError::Syntax(line_no));
            };
            let (key, value) = (key.trim(), value.trim());

            match section {
                Section::Interface => profile.interface.set(key, value, line_no)?,
                Section::Peer => profile.peer.set(key, value, line_no)?,
                Section::Other => {}
                Section::None => return Err(ProfileError::Syntax(line_no)),
            }
        }

        if profile.interface.private_key.is_empty() {
            return Err(ProfileError::Missing("Interface.PrivateKey"));
        }
        if profile.peer.public_key.is_empty() {
            return Err(ProfileError::Missing("Peer.PublicKey"));
        }
        Ok(profile)
    }

    /// Key material for the handshake probe
    pub fn probe_keys(&self) -> Result<ProbeKeys, ProfileError> {
        Ok(ProbeKeys::from_base64(
            &self.interface.private_key,
            &self.peer.public_key,
            self.peer.preshared_key.as_deref(),
        )?)
    }

    /// Peer configuration for a tunnel to `endpoint`
    pub fn peer_config(
        &self,
        endpoint: SocketAddr,
        mtu: usize,
        keepalive: Duration,
        obfuscate: bool,
    ) -> Result<PeerConfig, ProfileError> {
        Ok(PeerConfig {
            private_key: PrivateKey::from_base64(&self.interface.private_key)?,
            public_key: PublicKey::from_base64(&self.peer.public_key)?,
            preshared_key: self
                .peer
                .preshared_key
                .as_deref()
                .map(PresharedKey::from_base64)
                .transpose()?,
            allowed_ips: self.peer.allowed_ips.clone(),
            endpoint,
            keepalive,
            mtu,
            obfuscate,
        })
    }

    /// Everything a provider needs to start the tunnel
    pub fn tunnel_spec(
        &self,
        endpoint: SocketAddr,
        mtu: usize,
        keepalive: Duration,
        obfuscate: bool,
    ) -> Result<TunnelSpec, ProfileError> {
        Ok(TunnelSpec {
            peer: self.peer_config(endpoint, mtu, keepalive, obfuscate)?,
            addresses: self.interface.addresses.clone(),
            dns: self.interface.dns.clone(),
            mtu,
        })
    }
}

fn list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn prefixes(value: &str, line: usize) -> Result<Vec<Prefix>, ProfileError> {
    list(value)
        .map(|p| p.parse().map_err(|_| ProfileError::Value(line, p.to_string())))
        .collect()
}

/// `172.16.0.2/24` yields `172.16.0.2`; the length must still be valid.
fn device_addresses(value: &str, line: usize) -> Result<Vec<IpAddr>, ProfileError> {
    list(value)
        .map(|item| {
            let invalid = || ProfileError::Value(line, item.to_string());
            item.parse::<Prefix>().map_err(|_| invalid())?;
            let host = item.split_once('/').map_or(item, |(host, _)| host);
            host.trim().parse::<IpAddr>().map_err(|_| invalid())
        })
        .collect()
}

impl InterfaceSection {
    fn set(&mut self, key: &str, value: &str, line: usize) -> Result<(), ProfileError> {
        match key.to_ascii_lowercase().as_str() {
            "privatekey" => self.private_key = value.to_string(),
            "address" => self.addresses.extend(device_addresses(value, line)?),
            "dns" => {
                for server in list(value) {
                    // Search domains may share the DNS line; only addresses are kept.
                    if let Ok(ip) = server.parse() {
                        self.dns.push(ip);
                    }
                }
            }
            "mtu" => {
                self.mtu = Some(
                    value
                        .parse()
                        .map_err(|_| ProfileError::Value(line, value.to_string()))?,
                )
            }
            _ => {}
        }
        Ok(())
    }
}

impl PeerSection {
    fn set(&mut self, key: &str, value: &str, line: usize) -> Result<(), ProfileError> {
        match key.to_ascii_lowercase().as_str() {
            "publickey" => self.public_key = value.to_string(),
            "presharedkey" => self.preshared_key = Some(value.to_string()),
            "allowedips" => self.allowed_ips.extend(prefixes(value, line)?),
            "endpoint" => self.endpoint = Some(value.to_string()),
            "persistentkeepalive" => {
                self.keepalive = Some(
                    value
                        .parse()
                        .map_err(|_| ProfileError::Value(line, value.to_string()))?,
                )
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Failed to read profile {0}: {1}")]
    Read(String, std::io::Error),

    #[error("Line {0}: expected `[Section]` or `Key = Value`")]
    Syntax(usize),

    #[error("Line {0}: invalid value {1:?}")]
    Value(usize, String),

    #[error("Profile is missing {0}")]
    Missing(&'static str),

    #[error("Invalid key: {0}")]
    Key(#[from] KeyError),
}
