//! Per-node IP allocation over a `RangeSet`
//!
//! The allocator owns no state of its own: every assignment and the
//! last-reserved hint live in the [`Store`], so concurrent invocations on
//! one node coordinate purely through the store's lock.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

use crate::error::{IpamError, Result};
use crate::range::RangeSet;
use crate::store::Store;

/// An allocated address with the metadata callers package into results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpConfig {
    /// Assigned address with its subnet prefix
    pub address: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
}

/// Allocator over one range set
///
/// `idx` is the position of this set in the network configuration; the
/// store keeps one last-reserved hint per index.
pub struct IpAllocator {
    range_set: RangeSet,
    idx: usize,
}

impl IpAllocator {
    pub fn new(range_set: RangeSet, idx: usize) -> Self {
        Self { range_set, idx }
    }

    /// Assign an address to `(container, interface)`
    ///
    /// With a requested IP the containing range is looked up and that exact
    /// address reserved or the call fails. Otherwise the scan starts one
    /// past the stored hint and walks the whole set once, wrapping across
    /// range boundaries, skipping gateways, before giving up with
    /// [`IpamError::NoAddressesAvailable`].
    pub fn get(
        &self,
        store: &mut Store,
        container_id: &str,
        if_name: &str,
        requested: Option<Ipv4Addr>,
    ) -> Result<IpConfig> {
        store.lock()?;
        let result = self.get_locked(store, container_id, if_name, requested);
        if let Err(e) = store.unlock() {
            warn!(error = %e, "failed to release store lock");
        }
        result
    }

    fn get_locked(
        &self,
        store: &mut Store,
        container_id: &str,
        if_name: &str,
        requested: Option<Ipv4Addr>,
    ) -> Result<IpConfig> {
        // one address per container per range set
        for held in store.assignments()? {
            if held.container_id == container_id
                && held.if_name == if_name
                && self.range_set.contains(held.ip)
            {
                return Err(IpamError::DuplicateAllocation {
                    ip: held.ip,
                    container: container_id.to_string(),
                });
            }
        }

        if let Some(ip) = requested {
            return self.reserve_requested(store, container_id, if_name, ip);
        }

        let start = self.start_position(store);
        for (candidate, range) in self.range_set.iter_from(start) {
            if range.gateway == Some(candidate) {
                continue;
            }
            if store.reserve(container_id, if_name, candidate, self.idx)? {
                return Ok(IpConfig {
                    address: prefixed(candidate, range.subnet)?,
                    gateway: range.gateway,
                });
            }
            // taken; keep scanning
        }
        Err(IpamError::NoAddressesAvailable)
    }

    fn reserve_requested(
        &self,
        store: &mut Store,
        container_id: &str,
        if_name: &str,
        ip: Ipv4Addr,
    ) -> Result<IpConfig> {
        let range = self
            .range_set
            .range_for(ip)
            .ok_or(IpamError::IpNotInRange(ip))?;
        if range.gateway == Some(ip) {
            return Err(IpamError::GatewayExcluded(ip));
        }
        if !store.reserve(container_id, if_name, ip, self.idx)? {
            return Err(IpamError::AlreadyReserved(ip));
        }
        debug!(%ip, container = container_id, "reserved requested address");
        Ok(IpConfig {
            address: prefixed(ip, range.subnet)?,
            gateway: range.gateway,
        })
    }

    /// Scan start derived from the hint: one past the last reserved address
    /// when that address still falls in some range, else the set's first
    /// address. A stale hint only slows the scan down, never misdirects it.
    fn start_position(&self, store: &Store) -> Option<(usize, Ipv4Addr)> {
        let hint = store.last_reserved_ip(self.idx)?;
        let idx = self
            .range_set
            .iter()
            .position(|r| r.contains(hint))?;
        Some(self.range_set.advance(idx, hint))
    }

    /// Release every address held by `(container, interface)`
    pub fn release(&self, store: &mut Store, container_id: &str, if_name: &str) -> Result<()> {
        store.lock()?;
        let result = store.release_by_id(container_id, if_name);
        if let Err(e) = store.unlock() {
            warn!(error = %e, "failed to release store lock");
        }
        result
    }
}

fn prefixed(ip: Ipv4Addr, subnet: Ipv4Net) -> Result<Ipv4Net> {
    Ipv4Net::new(ip, subnet.prefix_len())
        .map_err(|_| IpamError::InvalidCidr(format!("{}/{}", ip, subnet.prefix_len())))
}
