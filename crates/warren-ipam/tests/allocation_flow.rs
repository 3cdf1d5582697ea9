//! End-to-end allocation flow: lease acquisition, local assignment, and
//! block exhaustion against an in-memory coordinator and a real on-disk
//! store.

use std::net::Ipv4Addr;
use std::path::Path;
use tempfile::TempDir;

use warren_ipam::{
    IpAllocator, IpamError, LeaseManager, MemoryBackend, Range, RangeSet, Store,
};

const NETWORK: &str = "net1";
const APPLY_UNIT: u32 = 4;

fn addr(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

fn configured_range() -> Range {
    Range::new(
        "10.0.0.0/24".parse().unwrap(),
        None,
        None,
        Some(addr("10.0.0.1")),
    )
    .unwrap()
}

/// The adapter's ADD flow: allocate from cached blocks, acquiring a fresh
/// lease when the local blocks are exhausted.
async fn add(
    backend: &mut MemoryBackend,
    manager: &LeaseManager,
    data_dir: &Path,
    container: &str,
) -> Result<Ipv4Addr, IpamError> {
    let mut store = Store::open(NETWORK, data_dir)?;
    store.lock()?;
    let cache = store.load_cache()?;
    store.unlock()?;

    let template = configured_range();
    let clipped: Vec<Range> = cache.iter().filter_map(|b| template.clip(b)).collect();

    let mut outcome = if clipped.is_empty() {
        Err(IpamError::NoAddressesAvailable)
    } else {
        IpAllocator::new(RangeSet::new(clipped)?, 0).get(&mut store, container, "eth0", None)
    };

    for _ in 0..3 {
        match outcome {
            Err(IpamError::NoAddressesAvailable) => {
                let block = manager
                    .acquire(backend, NETWORK, template.subnet, APPLY_UNIT)
                    .await?;
                store.lock()?;
                store.append_cache(&block)?;
                store.unlock()?;

                let fresh = template.with_block(&block);
                outcome = IpAllocator::new(RangeSet::new(vec![fresh])?, 0).get(
                    &mut store, container, "eth0", None,
                );
            }
            other => {
                outcome = other;
                break;
            }
        }
    }
    outcome.map(|conf| conf.address.addr())
}

#[tokio::test]
async fn test_fresh_network_first_container() {
    let dir = TempDir::new().unwrap();
    let mut backend = MemoryBackend::new();
    let manager = LeaseManager::new("multus", "node-1");

    let ip = add(&mut backend, &manager, dir.path(), "cont-1")
        .await
        .unwrap();

    assert_eq!(ip, addr("10.0.0.2"));
    assert!(backend.contains("multus/lease/net1/0167772162-4"));

    let store = Store::open(NETWORK, dir.path()).unwrap();
    assert_eq!(
        store.load_cache().unwrap(),
        vec!["10.0.0.2-10.0.0.17".parse().unwrap()]
    );
}

#[tokio::test]
async fn test_sequential_allocation_reuses_lease() {
    let dir = TempDir::new().unwrap();
    let mut backend = MemoryBackend::new();
    let manager = LeaseManager::new("multus", "node-1");

    let first = add(&mut backend, &manager, dir.path(), "cont-1")
        .await
        .unwrap();
    let second = add(&mut backend, &manager, dir.path(), "cont-2")
        .await
        .unwrap();

    assert_eq!(first, addr("10.0.0.2"));
    assert_eq!(second, addr("10.0.0.3"));
    // no second lease was acquired
    assert_eq!(backend.len(), 1);
}

#[tokio::test]
async fn test_block_exhaustion_acquires_next_lease() {
    let dir = TempDir::new().unwrap();
    let mut backend = MemoryBackend::new();
    let manager = LeaseManager::new("multus", "node-1");

    // a block of 2^4 addresses serves exactly sixteen containers
    for i in 0..16 {
        add(&mut backend, &manager, dir.path(), &format!("cont-{}", i))
            .await
            .unwrap();
    }
    assert_eq!(backend.len(), 1);

    let overflow = add(&mut backend, &manager, dir.path(), "cont-16")
        .await
        .unwrap();

    assert_eq!(overflow, addr("10.0.0.18"));
    assert!(backend.contains("multus/lease/net1/0167772178-4"));

    let store = Store::open(NETWORK, dir.path()).unwrap();
    assert_eq!(
        store.load_cache().unwrap(),
        vec![
            "10.0.0.2-10.0.0.17".parse().unwrap(),
            "10.0.0.18-10.0.0.33".parse().unwrap(),
        ]
    );
}

#[tokio::test]
async fn test_two_nodes_claim_disjoint_blocks() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let mut backend = MemoryBackend::new();
    let node_a = LeaseManager::new("multus", "node-a");
    let node_b = LeaseManager::new("multus", "node-b");

    let ip_a = add(&mut backend, &node_a, dir_a.path(), "cont-a")
        .await
        .unwrap();
    let ip_b = add(&mut backend, &node_b, dir_b.path(), "cont-b")
        .await
        .unwrap();

    assert_eq!(ip_a, addr("10.0.0.2"));
    assert_eq!(ip_b, addr("10.0.0.18"));
    assert_eq!(backend.len(), 2);

    let owned_a = node_a.list_own(&mut backend).await.unwrap();
    assert_eq!(owned_a[NETWORK].len(), 1);
    assert_eq!(owned_a[NETWORK][0], "10.0.0.2-10.0.0.17".parse().unwrap());
}

#[tokio::test]
async fn test_release_then_hint_forward_allocation() {
    let dir = TempDir::new().unwrap();
    let mut backend = MemoryBackend::new();
    let manager = LeaseManager::new("multus", "node-1");

    for i in 0..4 {
        add(&mut backend, &manager, dir.path(), &format!("cont-{}", i))
            .await
            .unwrap();
    }

    // free the most recent assignment (.5), then allocate again
    let mut store = Store::open(NETWORK, dir.path()).unwrap();
    store.lock().unwrap();
    store.release_by_id("cont-3", "eth0").unwrap();
    store.unlock().unwrap();
    drop(store);

    // the hint moves the scan forward; the freed address is only reused
    // once the scan wraps
    let next = add(&mut backend, &manager, dir.path(), "cont-4")
        .await
        .unwrap();
    assert_eq!(next, addr("10.0.0.6"));
}
