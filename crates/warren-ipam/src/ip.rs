//! IPv4 arithmetic helpers
//!
//! Pure functions over `Ipv4Addr`/`u32`; all range and lease math in this
//! crate goes through these so the wrap-around edge cases live in one place.

use ipnet::Ipv4Net;
use std::cmp::Ordering;
use std::net::Ipv4Addr;

/// Big-endian `u32` form of an IPv4 address
pub fn to_u32(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

/// IPv4 address from its big-endian `u32` form
pub fn from_u32(v: u32) -> Ipv4Addr {
    Ipv4Addr::from(v)
}

/// Numeric ordering of two addresses
pub fn cmp(a: Ipv4Addr, b: Ipv4Addr) -> Ordering {
    to_u32(a).cmp(&to_u32(b))
}

/// First and last usable address of a subnet
///
/// The network and broadcast addresses are never assignable, so the usable
/// span is `[network + 1, broadcast - 1]`. Requires a prefix of /30 or
/// shorter; point-to-point subnets have no usable span under this rule.
pub fn subnet_bounds(subnet: Ipv4Net) -> (Ipv4Addr, Ipv4Addr) {
    let net = subnet.trunc();
    (
        from_u32(to_u32(net.network()) + 1),
        from_u32(to_u32(net.broadcast()) - 1),
    )
}

/// The address one above `ip`, or `None` when `ip` is the last usable
/// address of `subnet`
pub fn next_ip(ip: Ipv4Addr, subnet: Ipv4Net) -> Option<Ipv4Addr> {
    let (_, last) = subnet_bounds(subnet);
    if ip >= last {
        return None;
    }
    Some(from_u32(to_u32(ip) + 1))
}

/// The address one below `ip`, or `None` when `ip` is the first usable
/// address of `subnet`
pub fn prev_ip(ip: Ipv4Addr, subnet: Ipv4Net) -> Option<Ipv4Addr> {
    let (first, _) = subnet_bounds(subnet);
    if ip <= first {
        return None;
    }
    Some(from_u32(to_u32(ip) - 1))
}
