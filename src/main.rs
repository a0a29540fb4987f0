//! tiered-cache: multi-tier cache coordinator.
//!
//! Serves a key/value HTTP API over an ordered list of cache tiers:
//!   in-process memory (fast, bounded) → Redis (shared, optional)
//!
//! Reads walk the tiers and backfill faster ones on a hit; writes and deletes
//! go to every tier; invalidations from the shared tier are fanned out locally.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use tiered_cache::cache::memory::MemoryStore;
use tiered_cache::cache::tiered::{Tier, TieredCache};
use tiered_cache::config::{Cli, Config, LogFormat, RemoteTierConfig};
use tiered_cache::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    init_tracing(&cli);

    info!("tiered-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen.clone() {
        config.server.listen = listen;
    }

    info!(
        memory_ttl_secs = config.memory.ttl_secs,
        max_entries = config.memory.max_entries,
        remote = config.remote.is_some(),
        backfill = ?config.coordinator.backfill,
        "Configuration loaded"
    );

    // Tier 0: in-process memory.
    let memory = Arc::new(MemoryStore::with_name("memory", config.memory.store_config())?);
    let mut tiers = vec![Tier::new(Arc::clone(&memory), config.memory.ttl())];

    // Tier 1: shared remote store.
    if let Some(remote) = &config.remote {
        tiers.push(connect_remote(remote).await?);
    }

    let cache = Arc::new(TieredCache::with_options(
        tiers,
        config.coordinator.options(),
    ));

    // Build application state.
    let state = Arc::new(AppState {
        cache: Arc::clone(&cache),
        memory: Some(memory),
        start_time: Instant::now(),
    });

    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped, closing tiers");
    if let Err(e) = cache.close().await {
        error!("Failed to close cleanly: {e}");
        return Err(e.into());
    }

    Ok(())
}

fn init_tracing(cli: &Cli) {
    let filter = if cli.verbose {
        "tiered_cache=debug,tower_http=debug"
    } else {
        "tiered_cache=info,tower_http=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());

    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init(),
    }
}

#[cfg(feature = "redis")]
async fn connect_remote(remote: &RemoteTierConfig) -> anyhow::Result<Tier<String>> {
    use tiered_cache::cache::redis_client::RedisClient;
    use tiered_cache::cache::remote::RemoteStore;

    let client = RedisClient::connect(&remote.url, remote.invalidation_channel.clone()).await?;
    let store = RemoteStore::with_name("redis", client).await?;
    Ok(Tier::new(Arc::new(store), remote.ttl()))
}

#[cfg(not(feature = "redis"))]
async fn connect_remote(_remote: &RemoteTierConfig) -> anyhow::Result<Tier<String>> {
    anyhow::bail!("a remote tier is configured but this build lacks the `redis` feature")
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {e}"),
    }
}
