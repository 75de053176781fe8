//! GridCache - in-process cluster node runner
//!
//! Boots `GRIDCACHE_CLUSTER_SIZE` nodes sharing one in-process cluster, each
//! with a `default` cache, and keeps them running until shutdown.

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridcache::{Address, CacheManager, Config, LocalCluster, StoreKind};

const DEFAULT_CACHE: &str = "default";

/// Main entry point.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Create one cache manager per node and define the default cache
/// 4. Start every manager (global state, membership, caches, purge task)
/// 5. Stop every manager on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "gridcache=info", can be overridden with RUST_LOG
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gridcache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting GridCache");

    let config = Config::from_env();
    info!(
        "Configuration loaded: mode={:?}, num_owners={}, segments={}, nodes={}",
        config.clustering.mode,
        config.clustering.num_owners,
        config.clustering.num_segments,
        config.cluster_size
    );

    let cluster = LocalCluster::<String, String>::new(config.clustering.num_segments);
    let mut managers = Vec::with_capacity(config.cluster_size);
    for i in 0..config.cluster_size.max(1) {
        let address = Address::new(format!("node-{}", i))?;
        let manager = CacheManager::new(config.clone(), address, cluster.clone());
        manager
            .define_cache(DEFAULT_CACHE, StoreKind::Memory)
            .await
            .with_context(|| format!("defining cache on node-{}", i))?;
        manager
            .start()
            .await
            .with_context(|| format!("starting node-{}", i))?;
        managers.push(manager);
    }

    let view = cluster.topology().current();
    info!(
        "Cluster up: topology {} with {} members",
        view.topology_id(),
        view.members().len()
    );

    shutdown_signal().await;

    for manager in managers.iter().rev() {
        if let Err(e) = manager.stop().await {
            warn!("Node {} did not stop cleanly: {}", manager.address(), e);
        }
    }
    info!("Shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
