//! Address Prefixes and Candidate Sampling
//!
//! [`Prefix`] is a masked IPv4/IPv6 network. [`AddressSource`] draws
//! candidate addresses from a set of prefixes uniformly at random and
//! without replacement within a pass, so probe load is spread over each
//! range instead of walking it in order.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Pools at most this large are sampled from a materialized offset list;
/// larger ones fall back to rejection sampling against a seen-set.
const DENSE_POOL_LIMIT: u128 = 1 << 16;

/// A network prefix, always stored with host bits cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Prefix {
    network: IpAddr,
    len: u8,
}

impl Prefix {
    /// Create a prefix, masking off host bits
    pub fn new(addr: IpAddr, len: u8) -> Result<Self, PrefixError> {
        let width = width(&addr);
        if len > width {
            return Err(PrefixError::InvalidLength(len, width));
        }

        let network = match addr {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & v4_mask(len))),
            IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6) & v6_mask(len))),
        };
        Ok(Self { network, len })
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_ipv4(&self) -> bool {
        self.network.is_ipv4()
    }

    fn host_bits(&self) -> u32 {
        u32::from(width(&self.network) - self.len)
    }

    /// Number of addresses covered. Saturates at `u128::MAX` for `::/0`.
    pub fn size(&self) -> u128 {
        let bits = self.host_bits();
        if bits >= 128 { u128::MAX } else { 1u128 << bits }
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(a)) => u32::from(a) & v4_mask(self.len) == u32::from(net),
            (IpAddr::V6(net), IpAddr::V6(a)) => u128::from(a) & v6_mask(self.len) == u128::from(net),
            _ => false,
        }
    }

    /// The address at `offset` from the network address (wrapping inside the prefix).
    pub fn nth(&self, offset: u128) -> IpAddr {
        match self.network {
            IpAddr::V4(net) => {
                let host = (offset as u32) & !v4_mask(self.len);
                IpAddr::V4(Ipv4Addr::from(u32::from(net) | host))
            }
            IpAddr::V6(net) => {
                let host = offset & !v6_mask(self.len);
                IpAddr::V6(Ipv6Addr::from(u128::from(net) | host))
            }
        }
    }
}

fn width(addr: &IpAddr) -> u8 {
    if addr.is_ipv4() { 32 } else { 128 }
}

fn v4_mask(len: u8) -> u32 {
    if len == 0 { 0 } else { u32::MAX << (32 - u32::from(len)) }
}

fn v6_mask(len: u8) -> u128 {
    if len == 0 { 0 } else { u128::MAX << (128 - u32::from(len)) }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.len)
    }
}

impl FromStr for Prefix {
    type Err = PrefixError;

    /// Parse CIDR notation. A bare address is a host prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ip, len) = match s.split_once('/') {
            Some((ip, len)) => (ip, Some(len)),
            None => (s, None),
        };

        let addr: IpAddr = ip.parse().map_err(|_| PrefixError::Parse(s.to_string()))?;
        let len = match len {
            Some(len) => len.parse().map_err(|_| PrefixError::Parse(s.to_string()))?,
            None => width(&addr),
        };
        Self::new(addr, len)
    }
}

impl TryFrom<String> for Prefix {
    type Error = PrefixError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Prefix> for String {
    fn from(prefix: Prefix) -> Self {
        prefix.to_string()
    }
}

/// Which address families a scan may draw from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressFamilies {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl AddressFamilies {
    pub fn allows(&self, prefix: &Prefix) -> bool {
        if prefix.is_ipv4() { self.ipv4 } else { self.ipv6 }
    }
}

impl Default for AddressFamilies {
    fn default() -> Self {
        Self { ipv4: true, ipv6: false }
    }
}

enum Remaining {
    /// Offsets not yet drawn this pass
    Dense(Vec<u32>),
    /// Offsets already drawn this pass
    Sparse(HashSet<u128>),
}

struct PrefixPool {
    prefix: Prefix,
    remaining: Remaining,
}

impl PrefixPool {
    fn new(prefix: Prefix) -> Self {
        let mut pool = Self {
            prefix,
            remaining: Remaining::Sparse(HashSet::new()),
        };
        pool.refill();
        pool
    }

    fn refill(&mut self) {
        let size = self.prefix.size();
        self.remaining = if size <= DENSE_POOL_LIMIT {
            Remaining::Dense((0..size as u32).collect())
        } else {
            Remaining::Sparse(HashSet::new())
        };
    }

    fn is_exhausted(&self) -> bool {
        match &self.remaining {
            Remaining::Dense(offsets) => offsets.is_empty(),
            Remaining::Sparse(seen) => seen.len() as u128 >= self.prefix.size(),
        }
    }

    fn draw<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<IpAddr> {
        let size = self.prefix.size();
        match &mut self.remaining {
            Remaining::Dense(offsets) => {
                if offsets.is_empty() {
                    return None;
                }
                let idx = rng.gen_range(0..offsets.len());
                Some(self.prefix.nth(u128::from(offsets.swap_remove(idx))))
            }
            Remaining::Sparse(seen) => {
                if seen.len() as u128 >= size {
                    return None;
                }
                loop {
                    let offset = if size == u128::MAX {
                        rng.gen_range(0..=u128::MAX)
                    } else {
                        rng.gen_range(0..size)
                    };
                    if seen.insert(offset) {
                        return Some(self.prefix.nth(offset));
                    }
                }
            }
        }
    }
}

/// Endless stream of candidate addresses drawn from a prefix set.
///
/// Each pass visits every address of every pool at most once; when all
/// pools are exhausted a new pass begins.
pub struct AddressSource {
    pools: Vec<PrefixPool>,
    passes: u64,
}

impl AddressSource {
    pub fn new<I>(prefixes: I, families: AddressFamilies) -> Result<Self, PrefixError>
    where
        I: IntoIterator<Item = Prefix>,
    {
        let pools: Vec<PrefixPool> = prefixes
            .into_iter()
            .filter(|p| families.allows(p))
            .map(PrefixPool::new)
            .collect();

        if pools.is_empty() {
            return Err(PrefixError::NoPrefixes);
        }
        Ok(Self { pools, passes: 0 })
    }

    /// Completed passes over the whole prefix set
    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn next_candidate<R: Rng + ?Sized>(&mut self, rng: &mut R) -> IpAddr {
        loop {
            let open: Vec<usize> = (0..self.pools.len())
                .filter(|&i| !self.pools[i].is_exhausted())
                .collect();

            if open.is_empty() {
                self.passes += 1;
                for pool in &mut self.pools {
                    pool.refill();
                }
                continue;
            }

            let pick = open[rng.gen_range(0..open.len())];
            if let Some(addr) = self.pools[pick].draw(rng) {
                return addr;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrefixError {
    #[error("Invalid prefix: {0}")]
    Parse(String),

    #[error("Invalid prefix length {0} (maximum {1})")]
    InvalidLength(u8, u8),

    #[error("No prefixes left for the enabled address families")]
    NoPrefixes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_prefix_masks_host_bits() {
        let p: Prefix = "188.114.97.77/24".parse().unwrap();
        assert_eq!(p.to_string(), "188.114.97.0/24");
        assert_eq!(p.size(), 256);

        let v6: Prefix = "2606:4700:d0::1234/48".parse().unwrap();
        assert_eq!(v6.to_string(), "2606:4700:d0::/48");
        assert!(v6.contains("2606:4700:d0:ffff::1".parse().unwrap()));
        assert!(!v6.contains("2606:4700:d1::1".parse().unwrap()));
    }

    #[test]
    fn test_prefix_edges() {
        assert_eq!("10.0.0.1".parse::<Prefix>().unwrap().size(), 1);
        assert_eq!("::/0".parse::<Prefix>().unwrap().size(), u128::MAX);
        assert_eq!(
            "10.0.0.0/33".parse::<Prefix>(),
            Err(PrefixError::InvalidLength(33, 32))
        );
        assert!("nonsense/8".parse::<Prefix>().is_err());
        assert!(!"10.0.0.0/8".parse::<Prefix>().unwrap().contains("::1".parse().unwrap()));
    }

    #[test]
    fn test_candidates_stay_inside_their_prefix() {
        let prefixes: Vec<Prefix> = ["162.159.192.0/24", "10.20.0.0/12", "2606:4700:d0::/48", "0.0.0.0/0"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let families = AddressFamilies { ipv4: true, ipv6: true };
        let mut source = AddressSource::new(prefixes.clone(), families).unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..5000 {
            let addr = source.next_candidate(&mut rng);
            assert!(prefixes.iter().any(|p| p.contains(addr)), "{addr} escaped");
        }
    }

    #[test]
    fn test_pass_is_without_replacement() {
        let prefix: Prefix = "192.0.2.0/25".parse().unwrap();
        let mut source = AddressSource::new([prefix], AddressFamilies::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        let drawn: HashSet<IpAddr> = (0..128).map(|_| source.next_candidate(&mut rng)).collect();
        assert_eq!(drawn.len(), 128);
        assert_eq!(source.passes(), 0);

        source.next_candidate(&mut rng);
        assert_eq!(source.passes(), 1);
    }

    #[test]
    fn test_order_is_not_sequential() {
        let prefix: Prefix = "192.0.2.0/24".parse().unwrap();
        let mut source = AddressSource::new([prefix], AddressFamilies::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(3);

        let drawn: Vec<IpAddr> = (0..16).map(|_| source.next_candidate(&mut rng)).collect();
        let sequential: Vec<IpAddr> = (0..16).map(|i| prefix.nth(i)).collect();
        assert_ne!(drawn, sequential);
    }

    #[test]
    fn test_seeded_sources_repeat() {
        let prefix: Prefix = "198.51.100.0/24".parse().unwrap();
        let draw = |seed| {
            let mut source = AddressSource::new([prefix], AddressFamilies::default()).unwrap();
            let mut rng = StdRng::seed_from_u64(seed);
            (0..8).map(|_| source.next_candidate(&mut rng)).collect::<Vec<_>>()
        };
        assert_eq!(draw(9), draw(9));
    }

    #[test]
    fn test_disabled_families_are_skipped() {
        let v6: Prefix = "2606:4700:d1::/48".parse().unwrap();
        assert_eq!(
            AddressSource::new([v6], AddressFamilies { ipv4: true, ipv6: false }).err(),
            Some(PrefixError::NoPrefixes)
        );
    }
}
