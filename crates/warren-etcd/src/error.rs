//! Error types for coordinator access

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur talking to the coordinator
#[derive(Debug, Error)]
pub enum EtcdError {
    /// Coordinator configuration is unusable
    #[error("invalid coordinator configuration: {0}")]
    Config(String),

    /// Reading configuration or TLS material failed
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// etcd request failed
    #[error("etcd request failed: {0}")]
    Etcd(#[from] etcd_client::Error),
}

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, EtcdError>;
