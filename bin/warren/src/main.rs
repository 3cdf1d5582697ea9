//! warren-ipam -- CNI IPAM plugin backed by an etcd-coordinated lease tree
//!
//! The container runtime invokes this binary once per operation with the
//! command in `CNI_COMMAND` and the network configuration on stdin. Logs go
//! to stderr and, when writable, a JSON log file; stdout carries only the
//! CNI result or error object.

mod cni;
mod commands;
mod resolv;
mod result;

use std::fs::OpenOptions;
use std::path::Path;
use std::process::ExitCode;
use tracing::debug;

use cni::{CmdArgs, Command};

const DEFAULT_LOG_FILE: &str = "/var/log/warren-ipam.log";
const ENV_LOG_FILE: &str = "WARREN_IPAM_LOG";
const FALLBACK_CNI_VERSION: &str = "0.4.0";

#[tokio::main]
async fn main() -> ExitCode {
    let _log_guard = init_logging();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "command failed");
            cni::emit_error(FALLBACK_CNI_VERSION, &e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let args = CmdArgs::from_env()?;
    debug!(
        command = ?args.command,
        container = %args.container_id,
        netns = %args.netns,
        "invoked"
    );
    match args.command {
        Command::Add => commands::cmd_add(&args).await,
        Command::Del => commands::cmd_del(&args).await,
        Command::Check => commands::cmd_check(&args).await,
        Command::Version => commands::cmd_version(),
    }
}

/// Set up logging before anything can fail
///
/// The log file is best effort: when it cannot be opened (read-only root,
/// missing directory) the plugin still runs with stderr logging only.
fn init_logging() -> Option<warren_ipam::LogGuard> {
    let path = std::env::var(ENV_LOG_FILE).unwrap_or_else(|_| DEFAULT_LOG_FILE.to_string());
    let file_usable = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .is_ok();
    let file = file_usable.then(|| Path::new(path.as_str()));
    warren_ipam::init_logging("info", file).ok()
}
