//! fleetd — the FleetGrid daemon.
//!
//! Runs one node of a game-server fleet: loads the node config, restores
//! the known peers from the state store, starts the local node server and
//! keeps the heartbeat going until Ctrl-C or a cluster shutdown request.
//!
//! # Usage
//!
//! ```text
//! fleetd init --node-id node-1 --listener 10.0.0.1:1410
//! fleetd run --config fleet.toml --data-dir /var/lib/fleetgrid
//! fleetd nodes --data-dir /var/lib/fleetgrid
//! ```

mod console;
mod node_mode;

use std::path::{Path, PathBuf};

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing::info;

use fleetgrid_cluster::ClusterConfig;

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid cluster node daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a single-node config to get started.
    Init {
        /// Unique id of this node in the cluster.
        #[arg(long)]
        node_id: String,

        /// Address peers reach this node on.
        #[arg(long, default_value = "0.0.0.0:1410")]
        listener: String,

        /// Where to write the config.
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Overwrite an existing config.
        #[arg(long)]
        force: bool,
    },

    /// Run this node until interrupted.
    Run {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,
    },

    /// List the peers persisted in the state store.
    Nodes {
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleetd=debug,fleetgrid=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Init {
            node_id,
            listener,
            config,
            force,
        } => init(&node_id, &listener, &config, force),
        Command::Run { config, data_dir } => node_mode::run_node(config, data_dir).await,
        Command::Nodes { data_dir } => list_nodes(data_dir),
    }
}

fn init(node_id: &str, listener: &str, path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, pass --force to overwrite", path.display());
    }
    let config = ClusterConfig::scaffold(node_id, listener);
    // Validates the listener before anything is written.
    config.local_identity()?;
    std::fs::write(path, config.to_toml_string()?)?;
    info!(path = %path.display(), node = node_id, "config written");
    Ok(())
}

fn list_nodes(data_dir: PathBuf) -> anyhow::Result<()> {
    let db_path = data_dir.join(node_mode::STATE_FILE);
    if !db_path.exists() {
        bail!("no state store at {}", db_path.display());
    }
    let store = fleetgrid_state::StateStore::open(&db_path)?;
    if let Some(me) = store.local_identity()? {
        println!("{} (local)", console::describe(&me));
    }
    for node in store.list_cluster_nodes()? {
        println!("{}", console::describe(&node));
    }
    Ok(())
}
