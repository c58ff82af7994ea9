//! Node mode — runs one cluster member until shut down.
//!
//! 1. Opens the state store and seeds it with the configured peers
//! 2. Builds the node server provider
//! 3. Starts the local node and the heartbeat loop
//! 4. Stops on Ctrl-C or when the cluster asks this node to shut down

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use fleetgrid_cluster::{ClusterConfig, ProviderBuilder, ServiceDirectory};
use fleetgrid_state::StateStore;

use crate::console::Console;

pub const STATE_FILE: &str = "cluster.redb";

pub async fn run_node(config_path: PathBuf, data_dir: PathBuf) -> anyhow::Result<()> {
    let config = ClusterConfig::from_file(&config_path)?;
    info!(node = %config.node.unique_id, "FleetGrid daemon starting");
    std::fs::create_dir_all(&data_dir)?;

    // ── State store ──────────────────────────────────────────────
    let db_path = data_dir.join(STATE_FILE);
    let store = StateStore::open(&db_path)?;
    for peer in config.peer_identities()? {
        store.put_cluster_node(&peer)?;
    }
    info!(path = ?db_path, peers = store.list_cluster_nodes()?.len(), "state store opened");

    // ── Cluster ──────────────────────────────────────────────────
    let services = Arc::new(ServiceDirectory::new(&config.node.unique_id));
    let console = Console::new(store.clone(), services.clone());
    let provider = ProviderBuilder::from_config(&config, store, services)?
        .with_command_executor(Arc::new(console))
        .build()?;

    let (stop_tx, mut stop_rx) = watch::channel(false);
    provider.local_node().on_shutdown(move || {
        stop_tx.send_replace(true);
    });

    provider.local_node().start();
    let heartbeat = provider.spawn_heartbeat(config.heartbeat_interval());
    info!(head = %provider.head_node_name(), "node started");

    // ── Wait for shutdown ────────────────────────────────────────
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown signal received");
        }
        _ = stop_rx.changed() => info!("shutdown requested by the cluster"),
    }

    provider.close();
    let _ = heartbeat.await;

    info!("FleetGrid daemon stopped");
    Ok(())
}
