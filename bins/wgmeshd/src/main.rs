//! wgmesh daemon
//!
//! Wires the three long-lived components together (overlay transport,
//! network state store, tunnel control loop) and supervises them: all
//! start together, and the first fatal error or a signal cancels the
//! rest. The tunnel always gets to run its teardown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use wgmesh_core::{ConfigFile, NetworkState};
use wgmesh_p2p::P2pWorker;
use wgmesh_wg::{WgCli, WgControl};

/// wgmesh - self-configuring encrypted overlay mesh
#[derive(Parser)]
#[command(name = "wgmeshd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "/etc/wgmesh/config.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config_file =
        Arc::new(ConfigFile::open(&cli.config).context("Failed to load configuration")?);
    let config = config_file.config();

    let identity = config
        .p2p
        .load_identity()
        .context("Failed to load p2p identity")?;
    let local_peer_id = identity.public().to_peer_id();
    info!("starting wgmesh node {local_peer_id}");

    let state = Arc::new(NetworkState::new(local_peer_id));

    let wg = Arc::new(
        WgControl::new(&config, state.clone(), Arc::new(WgCli::new()))
            .context("Failed to set up the tunnel control loop")?,
    );
    let p2p = P2pWorker::new(&config, state, wg.clone(), config_file.clone())
        .context("Failed to set up the overlay transport")?;

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    {
        let cancel = cancel.clone();
        tasks.spawn(async move { p2p.run(cancel).await.map_err(anyhow::Error::from) });
    }
    {
        let wg = wg.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { wg.run(cancel).await.map_err(anyhow::Error::from) });
    }

    let mut result = Ok(());
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
        Some(joined) = tasks.join_next() => {
            result = flatten(joined);
            if let Err(ref err) = result {
                error!("component failed: {err:#}");
            }
        }
    }

    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = flatten(joined) {
            if result.is_ok() {
                result = Err(err);
            } else {
                error!("component failed during shutdown: {err:#}");
            }
        }
    }

    result
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(anyhow::anyhow!("component task panicked: {err}")),
    }
}
