//! Logging initialization shared by the plugin binaries
//!
//! The CNI result owns stdout, so human-readable logs go to stderr and,
//! when a log file is configured, structured JSON lines go there through a
//! non-blocking appender.

use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{IpamError, Result};

/// Guard that must be held to keep the async file writer flushing
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

/// Initialize logging for the current process
///
/// The `RUST_LOG` environment variable overrides `default_level`. Returns
/// a guard the caller holds for the lifetime of the process.
pub fn init_logging(default_level: &str, file: Option<&Path>) -> Result<LogGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path.file_name().ok_or_else(|| {
                IpamError::Logging(format!("log path {} has no file name", path.display()))
            })?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer().with_writer(writer).with_ansi(false).json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = fmt::layer().with_writer(io::stderr).with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| IpamError::Logging(e.to_string()))?;

    Ok(LogGuard { _guard: guard })
}
