//! warren-etcd -- coordinator client for cluster lease blocks
//!
//! Wraps an etcd v3 cluster as the strongly consistent store that
//! serializes lease claims across nodes. Every write that must not race
//! writers on other nodes runs under a session-scoped etcd lock derived
//! from the key's directory; the lock rides on a short-lived lease, so a
//! node that dies mid-operation releases it automatically.

pub mod config;
mod error;

pub use config::{load_etcd_config, EtcdConfig, InitParams, DEFAULT_CFG_DIR, DEFAULT_ROOT_KEY};
pub use error::{EtcdError, Result};

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client as EtcdClient, ConnectOptions, GetOptions, Identity, LockOptions,
    SortOrder, SortTarget, TlsOptions,
};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use warren_ipam::{IpamError, LeaseBackend};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const CONNECT_RETRIES: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Seconds the mutex session lease stays alive without its holder
const SESSION_TTL: i64 = 10;

const MUTEX_DIR: &str = "mutex";

const CLIENT_CERT: &str = "etcd-client.crt";
const CLIENT_KEY: &str = "etcd-client.key";
const CLIENT_CA: &str = "etcd-client-ca.crt";

/// Coordinator client bound to this node's identity
pub struct Client {
    inner: EtcdClient,
    root_key: String,
    node_id: String,
}

impl Client {
    /// Connect using the file and environment configuration
    pub async fn connect() -> Result<Self> {
        let params = config::init_params()?;
        let cfg = config::load_etcd_config(&params.cfg_dir.join(config::CFG_FILE))?;
        Self::connect_with(&cfg, params.root_key, params.node_id).await
    }

    /// Connect with explicit configuration
    pub async fn connect_with(
        cfg: &EtcdConfig,
        root_key: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Result<Self> {
        if cfg.endpoints.is_empty() {
            return Err(EtcdError::Config("no etcd endpoints".into()));
        }

        let mut delay = CONNECT_BACKOFF;
        let mut attempt = 1;
        let inner = loop {
            match EtcdClient::connect(cfg.endpoints.clone(), Some(connect_options(cfg)?)).await {
                Ok(inner) => break inner,
                Err(e) if attempt < CONNECT_RETRIES => {
                    warn!(attempt, error = %e, "coordinator connection failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        Ok(Self {
            inner,
            root_key: root_key.into(),
            node_id: node_id.into(),
        })
    }

    /// Root of this cluster's coordinator key tree
    pub fn root_key(&self) -> &str {
        &self.root_key
    }

    /// This node's identity, the value written into lease keys
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Key/value pairs under a prefix, sorted ascending by key
    pub async fn get_prefix(&mut self, prefix: &str) -> Result<Vec<(String, String)>> {
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let resp = self.inner.get(prefix, Some(options)).await?;
        let mut pairs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            pairs.push((kv.key_str()?.to_string(), kv.value_str()?.to_string()));
        }
        Ok(pairs)
    }

    /// Unconditional write, serialized against other nodes
    pub async fn put(&mut self, key: &str, value: &str) -> Result<()> {
        let mutex = self.lock_dir(key).await?;
        let result = self.inner.put(key, value, None).await;
        self.unlock_dir(mutex).await;
        result?;
        Ok(())
    }

    /// Write only when the key is absent
    ///
    /// Returns `false` when another writer already owns the key. Check and
    /// write both happen under the directory mutex, so the pair is atomic
    /// with respect to other nodes following the same discipline.
    pub async fn put_if_absent(&mut self, key: &str, value: &str) -> Result<bool> {
        let mutex = self.lock_dir(key).await?;
        let result = self.try_put_absent(key, value).await;
        self.unlock_dir(mutex).await;
        result
    }

    async fn try_put_absent(&mut self, key: &str, value: &str) -> Result<bool> {
        let existing = self.inner.get(key, None).await?;
        if !existing.kvs().is_empty() {
            return Ok(false);
        }
        self.inner.put(key, value, None).await?;
        Ok(true)
    }

    /// Delete a key, serialized against other nodes
    pub async fn delete(&mut self, key: &str) -> Result<()> {
        let mutex = self.lock_dir(key).await?;
        let result = self.inner.delete(key, None).await;
        self.unlock_dir(mutex).await;
        result?;
        Ok(())
    }

    async fn lock_dir(&mut self, key: &str) -> Result<SessionMutex> {
        let name = key_to_mutex(&self.root_key, key);
        let lease = self.inner.lease_grant(SESSION_TTL, None).await?.id();
        let resp = self
            .inner
            .lock(name.as_str(), Some(LockOptions::new().with_lease(lease)))
            .await?;
        debug!(mutex = %name, "acquired coordinator mutex");
        Ok(SessionMutex {
            key: resp.key().to_vec(),
            lease,
        })
    }

    async fn unlock_dir(&mut self, mutex: SessionMutex) {
        if let Err(e) = self.inner.unlock(mutex.key).await {
            warn!(error = %e, "unlocking coordinator mutex failed");
        }
        if let Err(e) = self.inner.lease_revoke(mutex.lease).await {
            debug!(error = %e, "revoking mutex lease failed");
        }
    }
}

struct SessionMutex {
    key: Vec<u8>,
    lease: i64,
}

/// Mutex name guarding a key's directory
///
/// The first path segment is the tree root; the mutex tree mirrors the
/// rest of the directory under `<root>/mutex/`, so writers to one lease
/// directory serialize without blocking other networks.
fn key_to_mutex(root_key: &str, key: &str) -> String {
    let dir = match key.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => key,
    };
    match dir.split_once('/') {
        Some((root, rest)) => format!("{}/{}/{}", root, MUTEX_DIR, rest),
        None => format!("{}/{}", root_key, MUTEX_DIR),
    }
}

fn connect_options(cfg: &EtcdConfig) -> Result<ConnectOptions> {
    let mut options = ConnectOptions::new()
        .with_connect_timeout(DIAL_TIMEOUT)
        .with_timeout(REQUEST_TIMEOUT);
    if cfg.auth.client.secure_transport {
        debug!("using secure transport");
        options = options.with_tls(client_tls(&cfg.auth.client.secret_directory)?);
    } else {
        debug!(endpoints = ?cfg.endpoints, "using plain transport");
    }
    Ok(options)
}

fn client_tls(secret_dir: &Path) -> Result<TlsOptions> {
    let read = |name: &str| -> Result<Vec<u8>> {
        let path = secret_dir.join(name);
        fs::read(&path).map_err(|e| EtcdError::Io { path, source: e })
    };
    let ca = read(CLIENT_CA)?;
    let cert = read(CLIENT_CERT)?;
    let key = read(CLIENT_KEY)?;
    Ok(TlsOptions::new()
        .ca_certificate(Certificate::from_pem(ca))
        .identity(Identity::from_pem(cert, key)))
}

fn coordinator_err(e: EtcdError) -> IpamError {
    IpamError::Coordinator(e.to_string())
}

#[async_trait]
impl LeaseBackend for Client {
    async fn list(&mut self, prefix: &str) -> warren_ipam::Result<Vec<(String, String)>> {
        self.get_prefix(prefix).await.map_err(coordinator_err)
    }

    async fn put_if_absent(&mut self, key: &str, value: &str) -> warren_ipam::Result<bool> {
        Client::put_if_absent(self, key, value)
            .await
            .map_err(coordinator_err)
    }

    async fn put(&mut self, key: &str, value: &str) -> warren_ipam::Result<()> {
        Client::put(self, key, value).await.map_err(coordinator_err)
    }

    async fn delete(&mut self, key: &str) -> warren_ipam::Result<()> {
        Client::delete(self, key).await.map_err(coordinator_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_to_mutex_mirrors_directory() {
        assert_eq!(
            key_to_mutex("multus", "multus/lease/net1/0167772162-4"),
            "multus/mutex/lease/net1"
        );
        assert_eq!(
            key_to_mutex("multus", "multus/lease/net1"),
            "multus/mutex/lease"
        );
    }

    #[test]
    fn test_key_to_mutex_shallow_keys() {
        assert_eq!(key_to_mutex("multus", "multus/top"), "multus/mutex");
        assert_eq!(key_to_mutex("multus", "orphan"), "multus/mutex");
    }

    #[tokio::test]
    async fn test_connect_with_rejects_empty_endpoints() {
        let cfg = EtcdConfig::default();
        let err = Client::connect_with(&cfg, "multus", "node-1").await;
        assert!(matches!(err, Err(EtcdError::Config(_))));
    }
}
