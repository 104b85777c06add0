//! # Swap Monitor Service
//!
//! Subscribes to Raydium AMM program logs and caches market data for every new token
//! address the swaps touch.
//!
//! ## Usage
//!
//! ```bash
//! HELIUS_WSS_ENDPOINT=wss://mainnet.helius-rpc.com HELIUS_API_KEY=... \
//!     cargo run --bin swap_monitor -- --config Config.toml
//! ```
//!
//! Press Ctrl+C to stop. Exits non-zero if the feed's retry budget is exhausted.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[cfg(feature = "redis")]
use raydium_swap_monitor::cache::RedisBackend;
use raydium_swap_monitor::{
    cache::{CacheBackend, InMemoryTtlCache, TokenCache},
    market_data::{DexScreenerClient, MarketDataFetcher},
    metrics,
    pipeline::Pipeline,
    settings::{Settings, DEFAULT_CONFIG_PATH},
    supervisor::ConnectionSupervisor,
    tracked_addresses::TrackedAddressStore,
    transaction_resolver::RpcTransactionResolver,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file; missing is fine, env vars fill in.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override `tracking.path`.
    #[arg(long)]
    tracking_file: Option<String>,

    /// Validate configuration and exit.
    #[arg(long)]
    check_config: bool,

    /// Prometheus listener, e.g. 0.0.0.0:9000.
    #[cfg(feature = "observability")]
    #[arg(long)]
    metrics_addr: Option<std::net::SocketAddr>,
}

#[cfg(not(feature = "observability"))]
fn init_logging(file: Option<&str>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = file {
        let sink = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path))?;
        builder.target(env_logger::Target::Pipe(Box::new(sink)));
    }
    builder.init();
    Ok(())
}

/// JSON lines on stdout; `log` records are bridged into the subscriber.
#[cfg(feature = "observability")]
fn init_logging(_file: Option<&str>) -> Result<()> {
    tracing_subscriber::fmt().json().init();
    Ok(())
}

async fn connect_cache(settings: &Settings) -> TokenCache {
    let backend: Option<Arc<dyn CacheBackend>> = match settings.cache.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        Some(url) => match RedisBackend::connect(url).await {
            Ok(redis) => Some(Arc::new(redis) as Arc<dyn CacheBackend>),
            Err(e) => {
                error!("❌ [Cache] Redis unavailable: {:#}", e);
                None
            }
        },
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("⚠️ [Cache] cache.redis_url is set but the `redis` feature is disabled");
            None
        }
        None => {
            warn!("⚠️ [Cache] No Redis endpoint configured, caching in process memory");
            Some(Arc::new(InMemoryTtlCache::new()) as Arc<dyn CacheBackend>)
        }
    };

    TokenCache::new(backend)
        .with_ttl(Duration::from_secs(settings.cache.ttl_secs))
        .with_key_prefix(settings.cache.key_prefix.clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut settings = Settings::from_path(&cli.config)?;
    if let Some(path) = cli.tracking_file {
        settings.tracking.path = path;
    }

    init_logging(settings.logging.file.as_deref())?;
    settings.validate().context("Invalid configuration")?;
    info!("✅ Settings loaded");
    if cli.check_config {
        return Ok(());
    }

    metrics::describe_metrics();
    #[cfg(feature = "observability")]
    {
        if let Some(addr) = cli.metrics_addr {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .context("Failed to install Prometheus exporter")?;
            info!("📈 Metrics listening on {}", addr);
        }
    }

    let mut store = TrackedAddressStore::load(&settings.tracking.path);
    if let Some(ttl) = settings.not_found_ttl() {
        store = store.with_not_found_ttl(ttl);
    }
    let store = Arc::new(store);

    let resolver = RpcTransactionResolver::new(
        settings.rpc_url(),
        settings.rpc.commitment.clone(),
        Duration::from_secs(settings.rpc.timeout_secs),
    )
    .context("Failed to build RPC client")?;

    let market_data = DexScreenerClient::new(
        settings.market_data.base_url.clone(),
        Duration::from_secs(settings.market_data.timeout_secs),
    )
    .context("Failed to build market data client")?;

    let fetcher = MarketDataFetcher::new(Arc::new(market_data), store.clone())
        .with_batch_size(settings.market_data.batch_size);

    let cache = connect_cache(&settings).await;
    if !cache.is_available() {
        warn!("⚠️ [Cache] Cache unavailable, enriched pairs will not be stored");
    }

    let pipeline = Pipeline::new(Arc::new(resolver), fetcher, cache)
        .with_skip_failed_transactions(settings.pipeline.skip_failed_transactions);

    let supervisor = ConnectionSupervisor::new(
        settings.feed_config(),
        settings.reconnect.policy(),
        Arc::new(pipeline),
    );

    info!(
        "🚀 Starting Raydium swap monitor for program {}",
        settings.feed.program_id
    );

    tokio::select! {
        result = supervisor.run() => {
            result.context("Feed supervisor stopped")?;
        }
        _ = signal::ctrl_c() => {
            info!("🛑 Shutdown signal received, stopping");
        }
    }

    info!("✅ Swap monitor stopped ({} tracked addresses)", store.len());
    Ok(())
}
