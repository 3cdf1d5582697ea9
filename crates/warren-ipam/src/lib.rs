//! warren-ipam -- two-tier IP address management for container networks
//!
//! Every node runs the same plugin; uniqueness across the cluster comes
//! from carving the configured subnet into power-of-two lease blocks
//! claimed through a strongly consistent coordinator, while individual
//! addresses are assigned from those blocks against a durable per-node
//! disk store.
//!
//! # Modules
//!
//! - [`ip`] - IPv4 arithmetic helpers
//! - [`range`] - ranges, range sets, and the wrap-around scan
//! - [`config`] - network configuration parsing
//! - [`store`] - durable per-node assignment store
//! - [`allocator`] - address allocation over a range set
//! - [`lease`] - cluster lease-block acquisition and release
//! - [`reconcile`] - background convergence sweeps
//! - [`logging`] - tracing setup for the binaries
//! - [`error`] - error types
//!
//! # Example
//!
//! ```no_run
//! use warren_ipam::{IpAllocator, Range, RangeSet, Store};
//! use std::path::Path;
//!
//! # fn main() -> warren_ipam::Result<()> {
//! let range = Range::new(
//!     "10.0.0.0/24".parse().unwrap(),
//!     Some("10.0.0.2".parse().unwrap()),
//!     Some("10.0.0.17".parse().unwrap()),
//!     Some("10.0.0.1".parse().unwrap()),
//! )?;
//! let mut store = Store::open("net1", Path::new("/var/lib/cni/networks"))?;
//! let alloc = IpAllocator::new(RangeSet::new(vec![range])?, 0);
//! let ip = alloc.get(&mut store, "f81d4fae-7dec", "eth0", None)?;
//! println!("assigned {}", ip.address);
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod config;
pub mod error;
pub mod ip;
pub mod lease;
pub mod logging;
pub mod range;
pub mod reconcile;
pub mod store;

// Re-export commonly used types
pub use allocator::{IpAllocator, IpConfig};
pub use config::{load_ipam_config, IpamConfig, Route, DEFAULT_APPLY_UNIT, DEFAULT_DATA_DIR};
pub use error::{IpamError, Result};
pub use lease::{find_free_block, LeaseBackend, LeaseManager, MemoryBackend};
pub use logging::{init_logging, LogGuard};
pub use range::{Range, RangeIter, RangeSet, SimpleRange};
pub use reconcile::{reconcile_containers, reconcile_leases, ContainerRuntime, MockRuntime};
pub use store::{Assignment, Store};
