//! Range model for IP allocation
//!
//! A `Range` is a contiguous span of assignable addresses inside one subnet,
//! optionally with a gateway that is never handed out. A `RangeSet` is the
//! ordered collection of ranges an allocator draws from; iteration order is
//! allocation-preference order. `SimpleRange` is the bare `(start, end)` pair
//! used for lease blocks and the on-disk cache.

use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{IpamError, Result};
use crate::ip;

/// An inclusive span of IPv4 addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimpleRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl SimpleRange {
    /// Create a span; `start` must not exceed `end`
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        if start > end {
            return Err(IpamError::Config(format!(
                "range start {} is after range end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Number of addresses in the span
    pub fn size(&self) -> u32 {
        ip::to_u32(self.end) - ip::to_u32(self.start) + 1
    }

    /// Smallest exponent `n` such that the span fits in `2^n` addresses
    ///
    /// This is the size form lease keys carry on the wire.
    pub fn host_size(&self) -> u32 {
        let size = self.size();
        if size <= 1 {
            0
        } else {
            32 - (size - 1).leading_zeros()
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        addr >= self.start && addr <= self.end
    }

    pub fn overlaps(&self, other: &SimpleRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for SimpleRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for SimpleRange {
    type Err = IpamError;

    /// Parse the `"start-end"` form used by the cache file
    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| IpamError::Config(format!("malformed range '{}'", s)))?;
        let start = start
            .parse()
            .map_err(|_| IpamError::Config(format!("malformed range start '{}'", start)))?;
        let end = end
            .parse()
            .map_err(|_| IpamError::Config(format!("malformed range end '{}'", end)))?;
        SimpleRange::new(start, end)
    }
}

/// An assignable range: a span plus its subnet and optional gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub subnet: Ipv4Net,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
}

impl Range {
    /// Canonicalize a configured range
    ///
    /// Missing bounds default to the subnet's usable span. Bounds must lie
    /// inside that span, and the gateway, when given, inside the subnet.
    pub fn new(
        subnet: Ipv4Net,
        start: Option<Ipv4Addr>,
        end: Option<Ipv4Addr>,
        gateway: Option<Ipv4Addr>,
    ) -> Result<Self> {
        if subnet.prefix_len() > 30 {
            return Err(IpamError::Config(format!(
                "subnet {} is too small to allocate from",
                subnet
            )));
        }
        let subnet = subnet.trunc();
        let (first, last) = ip::subnet_bounds(subnet);

        let start = start.unwrap_or(first);
        let end = end.unwrap_or(last);
        if start < first || start > last {
            return Err(IpamError::Config(format!(
                "range start {} is outside subnet {}",
                start, subnet
            )));
        }
        if end < first || end > last {
            return Err(IpamError::Config(format!(
                "range end {} is outside subnet {}",
                end, subnet
            )));
        }
        if start > end {
            return Err(IpamError::Config(format!(
                "range start {} is after range end {}",
                start, end
            )));
        }
        if let Some(gw) = gateway {
            if !subnet.contains(&gw) {
                return Err(IpamError::Config(format!(
                    "gateway {} is outside subnet {}",
                    gw, subnet
                )));
            }
        }

        Ok(Self {
            subnet,
            start,
            end,
            gateway,
        })
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        addr >= self.start && addr <= self.end
    }

    /// The bare span of this range
    pub fn span(&self) -> SimpleRange {
        SimpleRange {
            start: self.start,
            end: self.end,
        }
    }

    /// This range clipped to a lease block, or `None` when they are disjoint
    pub fn clip(&self, block: &SimpleRange) -> Option<Range> {
        if !self.span().overlaps(block) {
            return None;
        }
        Some(Range {
            subnet: self.subnet,
            start: self.start.max(block.start),
            end: self.end.min(block.end),
            gateway: self.gateway,
        })
    }

    /// This range rebounded to a freshly acquired lease block
    pub fn with_block(&self, block: &SimpleRange) -> Range {
        Range {
            subnet: self.subnet,
            start: block.start,
            end: block.end,
            gateway: self.gateway,
        }
    }
}

/// Ordered, non-overlapping ranges sharing one subnet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<Range>,
}

impl RangeSet {
    /// Validate and build a set: non-empty, one subnet, no overlaps
    pub fn new(ranges: Vec<Range>) -> Result<Self> {
        let first = ranges
            .first()
            .ok_or_else(|| IpamError::Config("empty range set".into()))?;
        let subnet = first.subnet;
        for r in &ranges {
            if r.subnet != subnet {
                return Err(IpamError::Config(format!(
                    "range set mixes subnets {} and {}",
                    subnet, r.subnet
                )));
            }
        }
        for (i, a) in ranges.iter().enumerate() {
            for b in ranges.iter().skip(i + 1) {
                if a.span().overlaps(&b.span()) {
                    return Err(IpamError::Config(format!(
                        "ranges {} and {} overlap",
                        a.span(),
                        b.span()
                    )));
                }
            }
        }
        Ok(Self { ranges })
    }

    /// The subnet every range in the set shares
    pub fn subnet(&self) -> Ipv4Net {
        self.ranges[0].subnet
    }

    /// First range containing `addr`, in preference order
    pub fn range_for(&self, addr: Ipv4Addr) -> Option<&Range> {
        self.ranges.iter().find(|r| r.contains(addr))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.range_for(addr).is_some()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Range> {
        self.ranges.iter()
    }

    pub fn get(&self, idx: usize) -> Option<&Range> {
        self.ranges.get(idx)
    }

    /// Iterate every address once, starting at the given position
    ///
    /// `start` is `(range index, address)` of the first candidate; callers
    /// derive it from the last-reserved hint. Without a start the scan
    /// begins at the first address of the first range.
    pub fn iter_from(&self, start: Option<(usize, Ipv4Addr)>) -> RangeIter<'_> {
        let (idx, addr) = start.unwrap_or((0, self.ranges[0].start));
        RangeIter {
            set: self,
            start_idx: idx,
            start_ip: addr,
            cur_idx: idx,
            cur_ip: addr,
            exhausted: false,
            started: false,
        }
    }

    /// The position one step past `addr` within the set, wrapping ranges
    pub fn advance(&self, idx: usize, addr: Ipv4Addr) -> (usize, Ipv4Addr) {
        let r = &self.ranges[idx];
        if addr >= r.end {
            let next = (idx + 1) % self.ranges.len();
            (next, self.ranges[next].start)
        } else {
            (idx, ip::from_u32(ip::to_u32(addr) + 1))
        }
    }
}

/// Wrap-around scan over a `RangeSet`
///
/// Tracks `(range index, address)` explicitly and terminates when the scan
/// returns to its starting position, so every address is visited exactly
/// once regardless of where the scan begins.
pub struct RangeIter<'a> {
    set: &'a RangeSet,
    start_idx: usize,
    start_ip: Ipv4Addr,
    cur_idx: usize,
    cur_ip: Ipv4Addr,
    exhausted: bool,
    started: bool,
}

impl<'a> Iterator for RangeIter<'a> {
    type Item = (Ipv4Addr, &'a Range);

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        if self.started && self.cur_idx == self.start_idx && self.cur_ip == self.start_ip {
            self.exhausted = true;
            return None;
        }
        self.started = true;
        let item = (self.cur_ip, &self.set.ranges[self.cur_idx]);
        let (idx, addr) = self.set.advance(self.cur_idx, self.cur_ip);
        self.cur_idx = idx;
        self.cur_ip = addr;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn span(s: &str, e: &str) -> SimpleRange {
        SimpleRange::new(addr(s), addr(e)).unwrap()
    }

    #[test]
    fn test_simple_range_size_and_host_size() {
        assert_eq!(span("10.0.0.2", "10.0.0.17").size(), 16);
        assert_eq!(span("10.0.0.2", "10.0.0.17").host_size(), 4);
        assert_eq!(span("10.0.0.5", "10.0.0.5").host_size(), 0);
        assert_eq!(span("10.0.0.1", "10.0.0.9").host_size(), 4);
        assert_eq!(span("10.0.0.0", "10.0.0.255").host_size(), 8);
    }

    #[test]
    fn test_simple_range_rejects_inverted() {
        assert!(SimpleRange::new(addr("10.0.0.9"), addr("10.0.0.2")).is_err());
    }

    #[test]
    fn test_simple_range_display_parse_roundtrip() {
        let r = span("10.0.0.2", "10.0.0.17");
        let parsed: SimpleRange = r.to_string().parse().unwrap();
        assert_eq!(parsed, r);
        assert!("10.0.0.2".parse::<SimpleRange>().is_err());
        assert!("a-b".parse::<SimpleRange>().is_err());
    }

    #[test]
    fn test_simple_range_overlaps() {
        let a = span("10.0.0.2", "10.0.0.17");
        assert!(a.overlaps(&span("10.0.0.17", "10.0.0.33")));
        assert!(a.overlaps(&span("10.0.0.1", "10.0.0.2")));
        assert!(!a.overlaps(&span("10.0.0.18", "10.0.0.33")));
    }

    #[test]
    fn test_range_defaults_to_usable_span() {
        let r = Range::new(net("10.0.0.0/24"), None, None, None).unwrap();
        assert_eq!(r.start, addr("10.0.0.1"));
        assert_eq!(r.end, addr("10.0.0.254"));
    }

    #[test]
    fn test_range_rejects_small_subnet() {
        assert!(Range::new(net("10.0.0.0/31"), None, None, None).is_err());
    }

    #[test]
    fn test_range_rejects_out_of_subnet_bounds() {
        let n = net("10.0.0.0/24");
        assert!(Range::new(n, Some(addr("10.0.1.5")), None, None).is_err());
        assert!(Range::new(n, None, Some(addr("10.0.0.255")), None).is_err());
        assert!(Range::new(n, None, None, Some(addr("192.168.0.1"))).is_err());
    }

    #[test]
    fn test_range_clip() {
        let r = Range::new(net("10.0.0.0/24"), None, None, Some(addr("10.0.0.1"))).unwrap();
        let clipped = r.clip(&span("10.0.0.2", "10.0.0.17")).unwrap();
        assert_eq!(clipped.start, addr("10.0.0.2"));
        assert_eq!(clipped.end, addr("10.0.0.17"));
        assert_eq!(clipped.gateway, Some(addr("10.0.0.1")));

        let narrow = Range::new(n24(), Some(addr("10.0.0.10")), Some(addr("10.0.0.20")), None)
            .unwrap()
            .clip(&span("10.0.0.2", "10.0.0.17"))
            .unwrap();
        assert_eq!(narrow.start, addr("10.0.0.10"));
        assert_eq!(narrow.end, addr("10.0.0.17"));

        assert!(r
            .clip(&span("10.1.0.2", "10.1.0.17"))
            .is_none());
    }

    fn n24() -> Ipv4Net {
        net("10.0.0.0/24")
    }

    #[test]
    fn test_range_set_rejects_mixed_subnets() {
        let a = Range::new(net("10.0.0.0/24"), None, None, None).unwrap();
        let b = Range::new(net("10.1.0.0/24"), None, None, None).unwrap();
        assert!(RangeSet::new(vec![a, b]).is_err());
    }

    #[test]
    fn test_range_set_rejects_overlap() {
        let a = Range::new(n24(), Some(addr("10.0.0.1")), Some(addr("10.0.0.100")), None).unwrap();
        let b = Range::new(n24(), Some(addr("10.0.0.50")), Some(addr("10.0.0.200")), None).unwrap();
        assert!(RangeSet::new(vec![a, b]).is_err());
    }

    #[test]
    fn test_range_for_prefers_order() {
        let a = Range::new(n24(), Some(addr("10.0.0.1")), Some(addr("10.0.0.100")), None).unwrap();
        let b =
            Range::new(n24(), Some(addr("10.0.0.101")), Some(addr("10.0.0.200")), None).unwrap();
        let set = RangeSet::new(vec![a, b]).unwrap();
        assert_eq!(set.range_for(addr("10.0.0.150")).unwrap().start, addr("10.0.0.101"));
        assert!(set.range_for(addr("10.0.0.201")).is_none());
    }

    #[test]
    fn test_iter_visits_every_address_once() {
        let a = Range::new(n24(), Some(addr("10.0.0.1")), Some(addr("10.0.0.3")), None).unwrap();
        let b = Range::new(n24(), Some(addr("10.0.0.10")), Some(addr("10.0.0.11")), None).unwrap();
        let set = RangeSet::new(vec![a, b]).unwrap();

        let visited: Vec<Ipv4Addr> = set.iter_from(None).map(|(ip, _)| ip).collect();
        assert_eq!(
            visited,
            vec![
                addr("10.0.0.1"),
                addr("10.0.0.2"),
                addr("10.0.0.3"),
                addr("10.0.0.10"),
                addr("10.0.0.11"),
            ]
        );
    }

    #[test]
    fn test_iter_wraps_from_start_point() {
        let a = Range::new(n24(), Some(addr("10.0.0.1")), Some(addr("10.0.0.3")), None).unwrap();
        let b = Range::new(n24(), Some(addr("10.0.0.10")), Some(addr("10.0.0.11")), None).unwrap();
        let set = RangeSet::new(vec![a, b]).unwrap();

        // start mid-set, as a hint would place it
        let visited: Vec<Ipv4Addr> = set
            .iter_from(Some((0, addr("10.0.0.3"))))
            .map(|(ip, _)| ip)
            .collect();
        assert_eq!(
            visited,
            vec![
                addr("10.0.0.3"),
                addr("10.0.0.10"),
                addr("10.0.0.11"),
                addr("10.0.0.1"),
                addr("10.0.0.2"),
            ]
        );
    }

    #[test]
    fn test_iter_single_address_range() {
        let a = Range::new(n24(), Some(addr("10.0.0.5")), Some(addr("10.0.0.5")), None).unwrap();
        let set = RangeSet::new(vec![a]).unwrap();
        let visited: Vec<Ipv4Addr> = set.iter_from(None).map(|(ip, _)| ip).collect();
        assert_eq!(visited, vec![addr("10.0.0.5")]);
    }
}
