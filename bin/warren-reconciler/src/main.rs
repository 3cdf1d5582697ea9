//! warren-reconciler -- background convergence for warren-ipam state
//!
//! Runs the two reconciliation sweeps: lease parity between the
//! coordinator and each network's local cache, and removal of assignments
//! whose container has gone away. Deploy it as a one-shot cron job or a
//! long-running sidecar with `--interval`.

mod docker;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use docker::DockerProbe;
use warren_etcd::Client;
use warren_ipam::{reconcile_containers, reconcile_leases, LeaseManager, DEFAULT_DATA_DIR};

#[derive(Debug, Parser)]
#[command(name = "warren-reconciler", version, about)]
struct Cli {
    /// Directory holding the per-network assignment stores
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Seconds between sweeps; runs a single sweep when omitted
    #[arg(long)]
    interval: Option<u64>,

    /// Skip the container-liveness sweep
    #[arg(long)]
    skip_liveness: bool,

    /// Container CLI used for liveness probes
    #[arg(long, default_value = "docker")]
    container_cli: String,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = warren_ipam::init_logging(&cli.log_level, None)?;

    let mut client = Client::connect()
        .await
        .context("connecting to coordinator")?;
    let manager = LeaseManager::new(client.root_key(), client.node_id());
    let runtime = DockerProbe::with_binary(cli.container_cli.clone());

    loop {
        info!(data_dir = %cli.data_dir.display(), "starting reconciliation sweep");
        reconcile_leases(&mut client, &manager, &cli.data_dir).await;
        if !cli.skip_liveness {
            reconcile_containers(&runtime, &cli.data_dir).await;
        }
        info!("reconciliation sweep finished");

        match cli.interval {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => break,
        }
    }
    Ok(())
}
