//! Background convergence of coordinator state, local cache, and live
//! containers
//!
//! The reconciler is an eventual-consistency mechanism: every failure is
//! logged and skipped, never escalated, and the next sweep tries again.
//! Two sweeps run:
//!
//! 1. Lease parity -- the coordinator is authoritative for which blocks
//!    this node holds; the cache file is brought in line, and cache entries
//!    the coordinator lost are re-asserted.
//! 2. Container liveness -- assignments whose container no longer exists
//!    are removed, re-checking the assignment under the store lock so a
//!    freshly reused address is never deleted out from under a new
//!    container.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lease::{LeaseBackend, LeaseManager};
use crate::range::SimpleRange;
use crate::store::Store;

/// Liveness queries against the node's container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether a container with this id currently exists
    ///
    /// An error means liveness is unknown; the sweep leaves the assignment
    /// alone and retries on the next round.
    async fn container_exists(&self, container_id: &str) -> Result<bool>;
}

/// Fixed container set for tests and development
#[derive(Debug, Default)]
pub struct MockRuntime {
    containers: HashSet<String>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_containers<I: IntoIterator<Item = S>, S: Into<String>>(ids: I) -> Self {
        Self {
            containers: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn add(&mut self, container_id: &str) {
        self.containers.insert(container_id.to_string());
    }

    pub fn remove(&mut self, container_id: &str) {
        self.containers.remove(container_id);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn container_exists(&self, container_id: &str) -> Result<bool> {
        Ok(self.containers.contains(container_id))
    }
}

/// Bring every network's cache file in line with the coordinator
///
/// Covers the union of networks the coordinator says we own blocks in and
/// networks present on disk, so a cache whose coordinator records were lost
/// entirely still gets re-asserted.
pub async fn reconcile_leases(
    backend: &mut dyn LeaseBackend,
    manager: &LeaseManager,
    data_dir: &Path,
) {
    let owned = match manager.list_own(backend).await {
        Ok(owned) => owned,
        Err(e) => {
            warn!(error = %e, "listing owned leases failed; skipping lease sweep");
            return;
        }
    };
    let mut networks: BTreeSet<String> = owned.keys().cloned().collect();
    match Store::networks(data_dir) {
        Ok(local) => networks.extend(local),
        Err(e) => warn!(error = %e, "listing local networks failed"),
    }

    for network in networks {
        let blocks = owned.get(&network).cloned().unwrap_or_default();
        reconcile_network(backend, manager, data_dir, &network, &blocks).await;
    }
}

async fn reconcile_network(
    backend: &mut dyn LeaseBackend,
    manager: &LeaseManager,
    data_dir: &Path,
    network: &str,
    blocks: &[SimpleRange],
) {
    let mut store = match Store::open(network, data_dir) {
        Ok(store) => store,
        Err(e) => {
            warn!(network, error = %e, "opening store failed; skipping network");
            return;
        }
    };
    if let Err(e) = store.lock() {
        warn!(network, error = %e, "locking store failed; skipping network");
        return;
    }

    sweep_network(backend, manager, &mut store, network, blocks).await;

    if let Err(e) = store.unlock() {
        warn!(network, error = %e, "failed to release store lock");
    }
}

async fn sweep_network(
    backend: &mut dyn LeaseBackend,
    manager: &LeaseManager,
    store: &mut Store,
    network: &str,
    blocks: &[SimpleRange],
) {
    let cached = match store.load_cache() {
        Ok(cached) => cached,
        Err(e) => {
            warn!(network, error = %e, "reading cache failed; skipping network");
            return;
        }
    };

    // pass 1: the coordinator decides which blocks we hold
    for block in blocks {
        let mut matched = false;
        for entry in &cached {
            if !entry.overlaps(block) {
                continue;
            }
            if entry == block {
                matched = true;
            } else if let Err(e) = store.delete_cache(entry) {
                warn!(network, cache = %entry, error = %e, "dropping cache entry failed");
            }
        }
        if matched {
            continue;
        }
        if let Err(e) = store.append_cache(block) {
            // the cache could not record the claim; give the block back
            // rather than leave it orphaned in the coordinator
            warn!(network, %block, error = %e, "caching lease failed; releasing it");
            if let Err(e) = manager.release(backend, network, block).await {
                warn!(network, %block, error = %e, "lease rollback failed");
            }
        } else {
            info!(network, %block, "cached coordinator lease");
        }
    }

    // pass 2: re-assert cache entries the coordinator no longer records
    let cached = match store.load_cache() {
        Ok(cached) => cached,
        Err(e) => {
            warn!(network, error = %e, "re-reading cache failed");
            return;
        }
    };
    for entry in &cached {
        if blocks.contains(entry) {
            continue;
        }
        match manager.assert_own(backend, network, entry).await {
            Ok(true) => info!(network, block = %entry, "re-asserted lease in coordinator"),
            Ok(false) => {
                warn!(network, block = %entry, "block now held by another node; dropping cache entry");
                if let Err(e) = store.delete_cache(entry) {
                    warn!(network, cache = %entry, error = %e, "dropping cache entry failed");
                }
            }
            Err(e) => {
                warn!(network, block = %entry, error = %e, "re-asserting lease failed; dropping cache entry");
                if let Err(e) = store.delete_cache(entry) {
                    warn!(network, cache = %entry, error = %e, "dropping cache entry failed");
                }
            }
        }
    }
}

/// Remove assignments whose owning container no longer exists
pub async fn reconcile_containers(runtime: &dyn ContainerRuntime, data_dir: &Path) {
    let networks = match Store::networks(data_dir) {
        Ok(networks) => networks,
        Err(e) => {
            warn!(error = %e, "listing local networks failed; skipping liveness sweep");
            return;
        }
    };

    for network in &networks {
        let network = network.as_str();
        let mut store = match Store::open(network, data_dir) {
            Ok(store) => store,
            Err(e) => {
                warn!(network, error = %e, "opening store failed; skipping network");
                continue;
            }
        };
        let assignments = match store.assignments() {
            Ok(assignments) => assignments,
            Err(e) => {
                warn!(network, error = %e, "listing assignments failed; skipping network");
                continue;
            }
        };

        for assignment in assignments {
            let exists = match runtime.container_exists(&assignment.container_id).await {
                Ok(exists) => exists,
                Err(e) => {
                    debug!(
                        container = %assignment.container_id,
                        error = %e,
                        "container liveness unknown; retrying next sweep"
                    );
                    continue;
                }
            };
            if exists {
                continue;
            }

            // Between the liveness check and this point the address may have
            // been released and reassigned; re-read under the lock and only
            // delete the assignment we actually saw.
            if let Err(e) = store.lock() {
                warn!(network, error = %e, "locking store failed");
                continue;
            }
            match store.read_assignment(assignment.ip) {
                Ok(Some(current)) if current.container_id == assignment.container_id => {
                    match store.release_by_ip(assignment.ip) {
                        Ok(()) => info!(
                            network,
                            ip = %assignment.ip,
                            container = %assignment.container_id,
                            "removed assignment of dead container"
                        ),
                        Err(e) => warn!(network, ip = %assignment.ip, error = %e, "removing assignment failed"),
                    }
                }
                Ok(_) => debug!(network, ip = %assignment.ip, "assignment changed; leaving in place"),
                Err(e) => warn!(network, ip = %assignment.ip, error = %e, "re-reading assignment failed"),
            }
            if let Err(e) = store.unlock() {
                warn!(network, error = %e, "failed to release store lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IpamError;
    use crate::lease::MemoryBackend;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn span(s: &str, e: &str) -> SimpleRange {
        SimpleRange::new(addr(s), addr(e)).unwrap()
    }

    fn manager() -> LeaseManager {
        LeaseManager::new("multus", "node-1")
    }

    #[tokio::test]
    async fn test_coordinator_lease_is_cached() {
        let dir = TempDir::new().unwrap();
        let mgr = manager();
        let mut backend = MemoryBackend::new();
        backend.insert("multus/lease/net1/0167772162-4", "node-1");
        Store::open("net1", dir.path()).unwrap();

        reconcile_leases(&mut backend, &mgr, dir.path()).await;

        let store = Store::open("net1", dir.path()).unwrap();
        assert_eq!(
            store.load_cache().unwrap(),
            vec![span("10.0.0.2", "10.0.0.17")]
        );
    }

    #[tokio::test]
    async fn test_orphaned_cache_entry_is_reasserted() {
        let dir = TempDir::new().unwrap();
        let mgr = manager();
        let mut backend = MemoryBackend::new();

        let mut store = Store::open("net1", dir.path()).unwrap();
        store.lock().unwrap();
        store.append_cache(&span("10.0.0.2", "10.0.0.17")).unwrap();
        store.unlock().unwrap();
        drop(store);

        reconcile_leases(&mut backend, &mgr, dir.path()).await;

        // the coordinator key was rewritten and the cache entry kept
        assert!(backend.contains("multus/lease/net1/0167772162-4"));
        let store = Store::open("net1", dir.path()).unwrap();
        assert_eq!(
            store.load_cache().unwrap(),
            vec![span("10.0.0.2", "10.0.0.17")]
        );
    }

    #[tokio::test]
    async fn test_cache_entry_held_elsewhere_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mgr = manager();
        let mut backend = MemoryBackend::new();
        backend.insert("multus/lease/net1/0167772162-4", "node-2");

        let mut store = Store::open("net1", dir.path()).unwrap();
        store.lock().unwrap();
        store.append_cache(&span("10.0.0.2", "10.0.0.17")).unwrap();
        store.unlock().unwrap();
        drop(store);

        reconcile_leases(&mut backend, &mgr, dir.path()).await;

        let store = Store::open("net1", dir.path()).unwrap();
        assert!(store.load_cache().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_mismatch_is_replaced() {
        let dir = TempDir::new().unwrap();
        let mgr = manager();
        let mut backend = MemoryBackend::new();
        backend.insert("multus/lease/net1/0167772162-4", "node-1");

        // stale cache line overlapping the real block with different bounds
        let mut store = Store::open("net1", dir.path()).unwrap();
        store.lock().unwrap();
        store.append_cache(&span("10.0.0.10", "10.0.0.25")).unwrap();
        store.unlock().unwrap();
        drop(store);

        reconcile_leases(&mut backend, &mgr, dir.path()).await;

        let store = Store::open("net1", dir.path()).unwrap();
        assert_eq!(
            store.load_cache().unwrap(),
            vec![span("10.0.0.2", "10.0.0.17")]
        );
    }

    #[tokio::test]
    async fn test_liveness_sweep_removes_dead_containers() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open("net1", dir.path()).unwrap();
        store.lock().unwrap();
        store.reserve("alive", "eth0", addr("10.0.0.2"), 0).unwrap();
        store.reserve("dead", "eth0", addr("10.0.0.3"), 0).unwrap();
        store.unlock().unwrap();
        drop(store);

        let runtime = MockRuntime::with_containers(["alive"]);
        reconcile_containers(&runtime, dir.path()).await;

        let store = Store::open("net1", dir.path()).unwrap();
        assert!(store.read_assignment(addr("10.0.0.2")).unwrap().is_some());
        assert!(store.read_assignment(addr("10.0.0.3")).unwrap().is_none());
    }

    /// Runtime whose queries always fail, as when the daemon is down
    struct UnreachableRuntime;

    #[async_trait]
    impl ContainerRuntime for UnreachableRuntime {
        async fn container_exists(&self, _container_id: &str) -> Result<bool> {
            Err(IpamError::Runtime("runtime unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_liveness_unknown_leaves_assignments_alone() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open("net1", dir.path()).unwrap();
        store.lock().unwrap();
        store.reserve("cont-a", "eth0", addr("10.0.0.2"), 0).unwrap();
        store.unlock().unwrap();
        drop(store);

        reconcile_containers(&UnreachableRuntime, dir.path()).await;

        let store = Store::open("net1", dir.path()).unwrap();
        assert!(store.read_assignment(addr("10.0.0.2")).unwrap().is_some());
    }
}
