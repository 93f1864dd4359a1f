//! Endpoint Scanner
//!
//! Draws candidates from an [`AddressSource`], probes them with a bounded
//! number of concurrent tasks and stops as soon as enough endpoints answer
//! under the RTT ceiling.
//!
//! ```text
//! AddressSource ─► feeder ─► probe tasks (≤ concurrency) ─► ResultCache
//!                                                              │
//!                         poll every tick until `wanted` ◄─────┘
//! ```

use crate::endpoint::{PROBE_PORT, warp_prefixes};
use crate::prefix::{AddressFamilies, AddressSource, Prefix, PrefixError};
use crate::probe::ProbeStrategy;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Results handed to the orchestrator: one per tunnel in a chain
pub const DEFAULT_RESULT_COUNT: usize = 2;

/// Scanner settings
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub prefixes: Vec<Prefix>,
    pub families: AddressFamilies,
    /// Ports a candidate is probed on, one picked at random per probe
    pub ports: Vec<u16>,
    pub max_rtt: Duration,
    pub wanted: usize,
    pub deadline: Duration,
    pub concurrency: usize,
    /// How often the cache is checked; coarser than a probe timeout
    pub poll_interval: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            prefixes: warp_prefixes(),
            families: AddressFamilies::default(),
            ports: vec![PROBE_PORT],
            max_rtt: Duration::from_millis(1000),
            wanted: DEFAULT_RESULT_COUNT,
            deadline: Duration::from_secs(120),
            concurrency: 32,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// A successful probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub addr: SocketAddr,
    pub rtt: Duration,
}

#[derive(Default)]
struct CacheInner {
    results: HashMap<IpAddr, ProbeResult>,
    best_rtt: Option<Duration>,
}

/// Qualifying results of the current scan, at most one per address.
#[derive(Clone, Default)]
pub struct ResultCache {
    inner: Arc<RwLock<CacheInner>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful probe; kept only when `rtt <= max_rtt` and the
    /// address has no entry yet. Returns whether it was kept.
    pub async fn record(&self, result: ProbeResult, max_rtt: Duration) -> bool {
        let mut inner = self.inner.write().await;
        inner.best_rtt = Some(match inner.best_rtt {
            Some(best) => best.min(result.rtt),
            None => result.rtt,
        });

        if result.rtt > max_rtt || inner.results.contains_key(&result.addr.ip()) {
            return false;
        }
        inner.results.insert(result.addr.ip(), result);
        true
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.results.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Lowest RTT seen from any successful probe, qualifying or not
    pub async fn best_rtt(&self) -> Option<Duration> {
        self.inner.read().await.best_rtt
    }

    /// Entries sorted by ascending RTT
    pub async fn ranked(&self) -> Vec<ProbeResult> {
        let mut results: Vec<ProbeResult> =
            self.inner.read().await.results.values().copied().collect();
        results.sort_by_key(|r| r.rtt);
        results
    }

    pub async fn clear(&self) {
        *self.inner.write().await = CacheInner::default();
    }
}

/// Runs scans with one strategy and an owned random source
pub struct ScannerEngine {
    config: ScanConfig,
    strategy: Arc<dyn ProbeStrategy>,
    rng: StdRng,
    cache: ResultCache,
}

impl ScannerEngine {
    pub fn new(config: ScanConfig, strategy: Arc<dyn ProbeStrategy>) -> Self {
        Self {
            config,
            strategy,
            rng: StdRng::from_entropy(),
            cache: ResultCache::new(),
        }
    }

    /// Replace the random source, e.g. with a seeded one
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Handle on the live cache, readable while a scan runs
    pub fn cache(&self) -> ResultCache {
        self.cache.clone()
    }

    /// Scan until `wanted` endpoints qualify, the deadline passes or
    /// `cancel` fires. Results are sorted by RTT.
    pub async fn scan(&mut self, cancel: &CancellationToken) -> Result<Vec<ProbeResult>, ScanError> {
        let config = &self.config;
        if config.wanted == 0 || config.concurrency == 0 || config.ports.is_empty() {
            return Err(ScanError::InvalidConfig(
                "wanted, concurrency and ports must be non-empty",
            ));
        }

        self.cache.clear().await;
        let source = AddressSource::new(config.prefixes.iter().copied(), config.families)?;

        info!(
            "Scanning {} prefixes with {} probe ({} workers, max RTT {:?})",
            config.prefixes.len(),
            self.strategy.name(),
            config.concurrency,
            config.max_rtt
        );

        let scan_token = cancel.child_token();
        let feeder = tokio::spawn(feed(
            Feeder {
                source,
                ports: config.ports.clone(),
                rng: StdRng::seed_from_u64(self.rng.next_u64()),
                strategy: self.strategy.clone(),
                cache: self.cache.clone(),
                max_rtt: config.max_rtt,
                slots: Arc::new(Semaphore::new(config.concurrency)),
            },
            scan_token.clone(),
        ));

        let outcome = self.wait_for_results(cancel).await;

        scan_token.cancel();
        let _ = feeder.await;
        outcome
    }

    async fn wait_for_results(&self, cancel: &CancellationToken) -> Result<Vec<ProbeResult>, ScanError> {
        let wanted = self.config.wanted;
        let deadline = tokio::time::sleep(self.config.deadline);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.config.poll_interval.max(Duration::from_millis(1)));

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ScanError::Canceled),
                _ = &mut deadline => {
                    let found = self.cache.len().await;
                    if found >= wanted {
                        return Ok(self.top(wanted).await);
                    }
                    return Err(ScanError::DeadlineExceeded {
                        found,
                        wanted,
                        best_rtt: self.cache.best_rtt().await,
                    });
                }
                _ = ticker.tick() => {
                    if self.cache.len().await >= wanted {
                        return Ok(self.top(wanted).await);
                    }
                }
            }
        }
    }

    async fn top(&self, wanted: usize) -> Vec<ProbeResult> {
        let mut ranked = self.cache.ranked().await;
        ranked.truncate(wanted);
        for r in &ranked {
            info!("Selected endpoint {} (RTT {:?})", r.addr, r.rtt);
        }
        ranked
    }
}

struct Feeder {
    source: AddressSource,
    ports: Vec<u16>,
    rng: StdRng,
    strategy: Arc<dyn ProbeStrategy>,
    cache: ResultCache,
    max_rtt: Duration,
    slots: Arc<Semaphore>,
}

/// Keep every probe slot busy until the scan token fires.
async fn feed(mut feeder: Feeder, token: CancellationToken) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            permit = feeder.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let ip = feeder.source.next_candidate(&mut feeder.rng);
        let port = feeder.ports[feeder.rng.gen_range(0..feeder.ports.len())];
        let target = SocketAddr::new(ip, port);
        let mut probe_rng = StdRng::seed_from_u64(feeder.rng.next_u64());

        let strategy = feeder.strategy.clone();
        let cache = feeder.cache.clone();
        let max_rtt = feeder.max_rtt;
        let token = token.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                outcome = strategy.probe(target, &mut probe_rng) => outcome,
            };

            match outcome {
                Ok(rtt) => {
                    let result = ProbeResult { addr: target, rtt };
                    if cache.record(result, max_rtt).await {
                        debug!("{} answered in {:?}", target, rtt);
                    } else {
                        debug!("{} answered in {:?}, not kept", target, rtt);
                    }
                }
                Err(e) => debug!("Probe {} failed: {}", target, e),
            }
        });

        tokio::task::yield_now().await;
    }
}

fn describe_best(best: &Option<Duration>) -> String {
    match best {
        Some(rtt) => format!("best RTT {:?}", rtt),
        None => "no candidates answered".to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Scan canceled")]
    Canceled,

    #[error("Scan deadline exceeded with {found} of {wanted} endpoints: {}", describe_best(.best_rtt))]
    DeadlineExceeded {
        found: usize,
        wanted: usize,
        best_rtt: Option<Duration>,
    },

    #[error("Invalid scan configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("Address source error: {0}")]
    Prefix(#[from] PrefixError),
}
