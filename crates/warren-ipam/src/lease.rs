//! Cluster lease-block management
//!
//! Nodes claim contiguous power-of-two blocks of a subnet in the
//! coordinator under `<root>/lease/<network>/<start-u32>-<host-size>`, with
//! the node identity as the value. The wire key stores the block's starting
//! address as a zero-padded decimal `u32` and its size as the exponent, so
//! `10.0.0.2`..`10.0.0.17` becomes `0167772162-4`.
//!
//! All coordinator access goes through the [`LeaseBackend`] trait; the etcd
//! client implements it for production and [`MemoryBackend`] stands in for
//! tests and development.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::error::{IpamError, Result};
use crate::ip;
use crate::range::SimpleRange;

const LEASE_DIR: &str = "lease";
const KEY_WIDTH: usize = 10;
const MAX_APPLY_TRY: u32 = 3;

/// Coordinator operations the lease manager and reconciler need
///
/// Implementations must linearize `put_if_absent` and `delete` against
/// concurrent writers from other nodes (the etcd client does so with a
/// session-scoped mutex per key directory).
#[async_trait]
pub trait LeaseBackend: Send {
    /// Key/value pairs under `prefix`, sorted ascending by key
    async fn list(&mut self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Write `key` only if absent; `false` means another writer holds it
    async fn put_if_absent(&mut self, key: &str, value: &str) -> Result<bool>;

    /// Unconditional write
    async fn put(&mut self, key: &str, value: &str) -> Result<()>;

    async fn delete(&mut self, key: &str) -> Result<()>;
}

/// In-memory coordinator for tests and development
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: BTreeMap<String, String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl LeaseBackend for MemoryBackend {
    async fn list(&mut self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put_if_absent(&mut self, key: &str, value: &str) -> Result<bool> {
        if self.entries.contains_key(key) {
            return Ok(false);
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn put(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// First free block of `2^unit_exp` addresses in `subnet`
///
/// Walks the existing leases in address order with a cursor that starts at
/// the subnet's first usable address, so the first block of an empty
/// network opens one past it (the conventional gateway slot stays free).
pub fn find_free_block(
    leases: &[SimpleRange],
    subnet: Ipv4Net,
    unit_exp: u32,
) -> Result<SimpleRange> {
    if unit_exp > 30 {
        return Err(IpamError::Config(format!(
            "apply unit 2^{} is not a usable block size",
            unit_exp
        )));
    }
    let unit = 1u64 << unit_exp;
    let (first, last) = ip::subnet_bounds(subnet);
    let (first, last) = (u64::from(ip::to_u32(first)), u64::from(ip::to_u32(last)));

    let mut sorted = leases.to_vec();
    sorted.sort();

    // highest address known to be unavailable
    let mut cursor = first;
    for block in &sorted {
        let (start, end) = (
            u64::from(ip::to_u32(block.start)),
            u64::from(ip::to_u32(block.end)),
        );
        if start > cursor + 1 && start - (cursor + 1) >= unit {
            break;
        }
        cursor = cursor.max(end);
    }

    if cursor + unit > last {
        return Err(IpamError::NoSpaceInSubnet {
            subnet,
            unit: unit as u32,
        });
    }
    SimpleRange::new(
        ip::from_u32((cursor + 1) as u32),
        ip::from_u32((cursor + unit) as u32),
    )
}

/// Acquires, releases, and enumerates this node's lease blocks
pub struct LeaseManager {
    root: String,
    node_id: String,
}

impl LeaseManager {
    pub fn new(root: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            node_id: node_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Coordinator key prefix for one network's leases
    pub fn network_prefix(&self, network: &str) -> String {
        format!("{}/{}/{}/", self.root, LEASE_DIR, network)
    }

    fn lease_prefix(&self) -> String {
        format!("{}/{}/", self.root, LEASE_DIR)
    }

    /// Coordinator key for a lease block
    ///
    /// Fails when the block's span is not the power of two its exponent
    /// claims; such a block cannot round-trip and writing it would corrupt
    /// the lease tree.
    pub fn encode_key(&self, network: &str, block: &SimpleRange) -> Result<String> {
        let exp = block.host_size();
        if u64::from(block.size()) != 1u64 << exp {
            return Err(IpamError::InvalidLeaseKey(format!(
                "block {} does not span a power of two",
                block
            )));
        }
        Ok(format!(
            "{}{:0width$}-{}",
            self.network_prefix(network),
            ip::to_u32(block.start),
            exp,
            width = KEY_WIDTH,
        ))
    }

    /// Decode the `<start-u32>-<host-size>` tail of a lease key
    pub fn decode_key(key: &str) -> Result<SimpleRange> {
        let invalid = || IpamError::InvalidLeaseKey(key.to_string());
        let base = key.rsplit('/').next().ok_or_else(invalid)?;
        let (start, exp) = base.split_once('-').ok_or_else(invalid)?;
        let start: u32 = start.parse().map_err(|_| invalid())?;
        let exp: u32 = exp.parse().map_err(|_| invalid())?;
        if exp > 30 || start == 0 {
            return Err(invalid());
        }
        let end = u64::from(start) + (1u64 << exp) - 1;
        if end > u64::from(u32::MAX) {
            return Err(invalid());
        }
        SimpleRange::new(ip::from_u32(start), ip::from_u32(end as u32))
    }

    /// Every lease currently recorded for a network, any owner
    ///
    /// Keys that fail to decode are corruption; they are skipped with a
    /// warning and never treated as free space by the caller.
    pub async fn list_network(
        &self,
        backend: &mut dyn LeaseBackend,
        network: &str,
    ) -> Result<Vec<SimpleRange>> {
        let mut blocks = Vec::new();
        for (key, _) in backend.list(&self.network_prefix(network)).await? {
            match Self::decode_key(&key) {
                Ok(block) => blocks.push(block),
                Err(_) => warn!(%key, "skipping malformed lease key"),
            }
        }
        Ok(blocks)
    }

    /// Claim a free block of `2^apply_unit` addresses for this node
    ///
    /// Losing the `put_if_absent` race to another node re-reads the lease
    /// tree and retries, up to three attempts.
    pub async fn acquire(
        &self,
        backend: &mut dyn LeaseBackend,
        network: &str,
        subnet: Ipv4Net,
        apply_unit: u32,
    ) -> Result<SimpleRange> {
        for attempt in 1..=MAX_APPLY_TRY {
            let leases = self.list_network(backend, network).await?;
            let block = find_free_block(&leases, subnet, apply_unit)?;
            let key = self.encode_key(network, &block)?;
            if backend.put_if_absent(&key, &self.node_id).await? {
                info!(network, %block, node = %self.node_id, "acquired lease block");
                return Ok(block);
            }
            debug!(network, %block, attempt, "lost lease race");
            if attempt == MAX_APPLY_TRY {
                return Err(IpamError::LeaseRaceLost(block));
            }
        }
        unreachable!("lease acquisition loop always returns")
    }

    /// Release one of this node's blocks back to the cluster
    pub async fn release(
        &self,
        backend: &mut dyn LeaseBackend,
        network: &str,
        block: &SimpleRange,
    ) -> Result<()> {
        let key = self.encode_key(network, block)?;
        backend.delete(&key).await?;
        info!(network, %block, "released lease block");
        Ok(())
    }

    /// Re-assert ownership of a block, failing when another node holds it
    pub async fn assert_own(
        &self,
        backend: &mut dyn LeaseBackend,
        network: &str,
        block: &SimpleRange,
    ) -> Result<bool> {
        let key = self.encode_key(network, block)?;
        backend.put_if_absent(&key, &self.node_id).await
    }

    /// Every block owned by this node, grouped by network
    pub async fn list_own(
        &self,
        backend: &mut dyn LeaseBackend,
    ) -> Result<BTreeMap<String, Vec<SimpleRange>>> {
        let prefix = self.lease_prefix();
        let mut owned: BTreeMap<String, Vec<SimpleRange>> = BTreeMap::new();
        for (key, value) in backend.list(&prefix).await? {
            if value.trim() != self.node_id {
                continue;
            }
            let Some(tail) = key.strip_prefix(&prefix) else {
                continue;
            };
            let Some((network, _)) = tail.rsplit_once('/') else {
                warn!(%key, "skipping lease key without a network segment");
                continue;
            };
            match Self::decode_key(&key) {
                Ok(block) => owned.entry(network.to_string()).or_default().push(block),
                Err(_) => warn!(%key, "skipping malformed lease key"),
            }
        }
        Ok(owned)
    }
}
