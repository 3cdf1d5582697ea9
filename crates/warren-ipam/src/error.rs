//! Error types for IPAM operations

use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

use crate::range::SimpleRange;

/// Errors that can occur during IPAM operations
#[derive(Debug, Error)]
pub enum IpamError {
    /// Network configuration is invalid
    #[error("invalid network configuration: {0}")]
    Config(String),

    /// Invalid CIDR notation
    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),

    /// IP address not covered by any configured range
    #[error("IP address {0} is not in any configured range")]
    IpNotInRange(Ipv4Addr),

    /// Requested IP is the range gateway
    #[error("IP address {0} is reserved as the gateway")]
    GatewayExcluded(Ipv4Addr),

    /// IP address already assigned to another container
    #[error("IP address {0} is already reserved")]
    AlreadyReserved(Ipv4Addr),

    /// Every address in the range set is taken
    #[error("no IP addresses available in range set")]
    NoAddressesAvailable,

    /// The container already holds an address from this range set
    #[error("{container} already holds {ip} from this range set")]
    DuplicateAllocation { ip: Ipv4Addr, container: String },

    /// The subnet has no free lease block left
    #[error("no free block of {unit} addresses left in subnet {subnet}")]
    NoSpaceInSubnet { subnet: ipnet::Ipv4Net, unit: u32 },

    /// Another node claimed the lease block first, retries exhausted
    #[error("lease block {0} was claimed by another node")]
    LeaseRaceLost(SimpleRange),

    /// A coordinator lease key that does not decode to a block
    #[error("malformed lease key '{0}'")]
    InvalidLeaseKey(String),

    /// Coordinator request failed
    #[error("coordinator error: {0}")]
    Coordinator(String),

    /// Container runtime query failed; liveness is unknown
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// The cache file already records this lease block
    #[error("lease block {0} is already cached")]
    DuplicateCacheEntry(SimpleRange),

    /// Store file operation failed
    #[error("store IO error at {path}: {source}")]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Logging initialization failed
    #[error("logging init failed: {0}")]
    Logging(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for IPAM operations
pub type Result<T> = std::result::Result<T, IpamError>;
