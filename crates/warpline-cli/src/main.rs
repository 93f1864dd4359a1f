//! warpline: WARP endpoint scanner and local proxy
//!
//! Loads settings, applies command-line overrides, brings the tunnel
//! topology up and serves until interrupted.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use warpline::{HostNetwork, ObfuscationSettings, RunConfig, ScanSettings};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "warpline", version, about = "WARP endpoint scanner and local proxy")]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Proxy listen address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// WARP endpoint to use instead of scanning
    #[arg(short, long)]
    endpoint: Option<SocketAddr>,

    /// Exit country for the obfuscation transport
    #[arg(long, value_name = "CODE")]
    country: Option<String>,

    /// Re-expose the proxy through the obfuscation transport
    #[arg(long)]
    cfon: bool,

    /// Run one tunnel inside another
    #[arg(long)]
    gool: bool,

    /// Scan for the fastest endpoints
    #[arg(long)]
    scan: bool,

    /// Maximum scan round-trip time in milliseconds
    #[arg(long, value_name = "MS")]
    rtt: Option<u64>,

    /// Settings file (.toml or .json)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    primary_profile: Option<PathBuf>,

    #[arg(long)]
    secondary_profile: Option<PathBuf>,

    /// Obfuscation client executable
    #[arg(long, value_name = "PATH")]
    obfs_program: Option<String>,
}

impl Args {
    fn apply(self, config: &mut RunConfig) -> Result<()> {
        if self.verbose {
            config.log_level = "debug".to_string();
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(endpoint) = self.endpoint {
            config.endpoint = Some(endpoint);
        }
        if self.gool {
            config.gool = true;
        }

        if self.cfon {
            let region = match (self.country, &config.obfuscation) {
                (Some(country), _) => country,
                (None, Some(existing)) => existing.region.clone(),
                (None, None) => bail!("--cfon needs --country"),
            };
            let obfuscation = config
                .obfuscation
                .get_or_insert_with(|| ObfuscationSettings::new(region.clone()));
            obfuscation.region = region;
        } else if self.country.is_some() {
            bail!("--country is only used with --cfon");
        }
        if let Some(program) = self.obfs_program {
            if let Some(obfuscation) = config.obfuscation.as_mut() {
                obfuscation.program = program;
            }
        }

        if self.scan || self.rtt.is_some() {
            let scan = config.scan.get_or_insert_with(ScanSettings::default);
            if let Some(rtt) = self.rtt {
                scan.max_rtt_ms = rtt;
            }
        }

        if let Some(path) = self.primary_profile {
            config.profiles.primary = path;
        }
        if let Some(path) = self.secondary_profile {
            config.profiles.secondary = path;
        }
        Ok(())
    }
}

fn init_logging(config: &RunConfig) {
    let level = if config.is_debug() { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact();

    // RUST_LOG wins when set
    match EnvFilter::try_from_default_env() {
        Ok(filter) => builder.with_env_filter(filter).init(),
        Err(_) => builder.init(),
    }
}

async fn serve(config: RunConfig) -> Result<()> {
    let cancel = CancellationToken::new();

    let running = warpline::run(&config, Arc::new(HostNetwork), None, cancel.clone())
        .await
        .context("failed to start")?;
    info!(
        "Serving {} topology on {} (endpoints {:?})",
        running.topology(),
        running.proxy_addr(),
        running.endpoints()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    info!("Interrupted");

    cancel.cancel();
    running.shutdown().await;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    args.apply(&mut config)?;

    init_logging(&config);
    info!("warpline starting...");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    if let Err(e) = runtime.block_on(serve(config)) {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("warpline shutting down");
    Ok(())
}
