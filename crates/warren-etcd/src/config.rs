//! Coordinator configuration
//!
//! The etcd connection is described by a JSON file the cluster operator
//! drops next to the network configurations, plus a handful of environment
//! variables selecting the config directory, the key-tree root, and this
//! node's identity.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{EtcdError, Result};

/// Default directory holding `etcd.conf` and the node id file
pub const DEFAULT_CFG_DIR: &str = "/etc/cni/net.d/multus.d/etcd";

/// Default root of the coordinator key tree
pub const DEFAULT_ROOT_KEY: &str = "multus";

/// Config file name inside the config directory
pub const CFG_FILE: &str = "etcd.conf";

const ENV_CFG_DIR: &str = "ETCD_CFG_DIR";
const ENV_ROOT_KEY: &str = "ETCD_ROOT_DIR";
const ENV_NODE_ID: &str = "HOSTNAME";

/// Contents of `etcd.conf`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default)]
    pub client: AuthClient,
    #[serde(default)]
    pub peer: AuthPeer,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthClient {
    #[serde(default)]
    pub secure_transport: bool,
    #[serde(default)]
    pub enable_authentication: bool,
    #[serde(default)]
    pub secret_directory: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPeer {
    #[serde(default)]
    pub secure_transport: bool,
    #[serde(default)]
    pub enable_authentication: bool,
    #[serde(default)]
    pub use_auto_tls: bool,
}

/// Environment-derived connection parameters
#[derive(Debug, Clone)]
pub struct InitParams {
    pub cfg_dir: PathBuf,
    pub root_key: String,
    pub node_id: String,
}

fn env_or(var: &str, default: &str) -> String {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => {
            debug!(var, default, "environment variable unset, using default");
            default.to_string()
        }
    }
}

/// Resolve config directory, root key, and node identity
///
/// The node identity is `$HOSTNAME`, falling back to the contents of the
/// `id` file in the config directory; a node without either cannot claim
/// leases and the call fails.
pub fn init_params() -> Result<InitParams> {
    let cfg_dir = PathBuf::from(env_or(ENV_CFG_DIR, DEFAULT_CFG_DIR));
    let root_key = env_or(ENV_ROOT_KEY, DEFAULT_ROOT_KEY);

    let node_id = match std::env::var(ENV_NODE_ID) {
        Ok(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => {
            let id_path = cfg_dir.join("id");
            debug!(path = %id_path.display(), "HOSTNAME unset, reading node id file");
            let raw = fs::read_to_string(&id_path).map_err(|e| EtcdError::Io {
                path: id_path,
                source: e,
            })?;
            raw.trim().to_string()
        }
    };
    if node_id.is_empty() {
        return Err(EtcdError::Config("node identity is empty".into()));
    }

    Ok(InitParams {
        cfg_dir,
        root_key,
        node_id,
    })
}

/// Load and validate the config file
pub fn load_etcd_config(path: &Path) -> Result<EtcdConfig> {
    let raw = fs::read_to_string(path).map_err(|e| EtcdError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let cfg: EtcdConfig = serde_json::from_str(&raw)?;
    if cfg.endpoints.is_empty() {
        return Err(EtcdError::Config(format!(
            "no etcd endpoints in {}",
            path.display()
        )));
    }
    Ok(cfg)
}
