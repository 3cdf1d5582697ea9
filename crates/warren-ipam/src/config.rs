//! Network configuration parsing
//!
//! The plugin receives the network configuration as JSON on stdin; the
//! `ipam` section is ours. Ranges arrive as a list of range lists -- one
//! allocator (and one assigned address) per outer element.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::error::{IpamError, Result};
use crate::range::{Range, RangeSet};

/// Where per-network assignment stores live unless configured otherwise
pub const DEFAULT_DATA_DIR: &str = "/var/lib/cni/networks";

/// Default lease-block exponent: blocks of `2^4` addresses
pub const DEFAULT_APPLY_UNIT: u32 = 4;

const DEFAULT_CNI_VERSION: &str = "0.4.0";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetJson {
    #[serde(default)]
    cni_version: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    ipam: Option<IpamJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpamJson {
    #[serde(default, rename = "type")]
    _plugin: Option<String>,
    #[serde(default)]
    ranges: Vec<Vec<RangeJson>>,
    #[serde(default)]
    routes: Vec<Route>,
    #[serde(default)]
    data_dir: Option<PathBuf>,
    #[serde(default)]
    resolv_conf: Option<PathBuf>,
    #[serde(default)]
    apply_unit: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RangeJson {
    subnet: Ipv4Net,
    #[serde(default)]
    range_start: Option<Ipv4Addr>,
    #[serde(default)]
    range_end: Option<Ipv4Addr>,
    #[serde(default)]
    gateway: Option<Ipv4Addr>,
}

/// A route entry, passed through into the plugin result untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

/// Parsed and validated IPAM configuration for one network
#[derive(Debug, Clone)]
pub struct IpamConfig {
    pub name: String,
    /// One range set per requested address
    pub ranges: Vec<RangeSet>,
    pub routes: Vec<Route>,
    pub data_dir: PathBuf,
    pub resolv_conf: Option<PathBuf>,
    /// Lease-block size exponent
    pub apply_unit: u32,
    /// Address requested through the `ip=` runtime argument
    pub requested_ip: Option<Ipv4Addr>,
}

/// Parse the stdin configuration plus the `CNI_ARGS` runtime arguments
///
/// Returns the config and the CNI version to echo into results.
pub fn load_ipam_config(config: &[u8], runtime_args: Option<&str>) -> Result<(IpamConfig, String)> {
    let net: NetJson = serde_json::from_slice(config)?;
    let cni_version = net
        .cni_version
        .unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string());

    let name = net
        .name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| IpamError::Config("network name is required".into()))?;
    let ipam = net
        .ipam
        .ok_or_else(|| IpamError::Config("missing 'ipam' section".into()))?;
    if ipam.ranges.is_empty() {
        return Err(IpamError::Config("'ipam.ranges' must not be empty".into()));
    }

    let mut ranges = Vec::with_capacity(ipam.ranges.len());
    for set in ipam.ranges {
        let parsed = set
            .into_iter()
            .map(|r| Range::new(r.subnet, r.range_start, r.range_end, r.gateway))
            .collect::<Result<Vec<Range>>>()?;
        ranges.push(RangeSet::new(parsed)?);
    }

    // sets allocate independently, so they must not share addresses
    for (i, a) in ranges.iter().enumerate() {
        for b in ranges.iter().skip(i + 1) {
            for ra in a.iter() {
                for rb in b.iter() {
                    if ra.span().overlaps(&rb.span()) {
                        return Err(IpamError::Config(format!(
                            "range {} overlaps range {} in another set",
                            ra.span(),
                            rb.span()
                        )));
                    }
                }
            }
        }
    }

    let apply_unit = match ipam.apply_unit {
        0 => DEFAULT_APPLY_UNIT,
        unit if unit > 30 => {
            return Err(IpamError::Config(format!(
                "applyUnit {} exceeds the largest usable block exponent",
                unit
            )))
        }
        unit => unit,
    };

    Ok((
        IpamConfig {
            name,
            ranges,
            routes: ipam.routes,
            data_dir: ipam.data_dir.unwrap_or_else(|| DEFAULT_DATA_DIR.into()),
            resolv_conf: ipam.resolv_conf,
            apply_unit,
            requested_ip: parse_requested_ip(runtime_args)?,
        },
        cni_version,
    ))
}

/// Extract `ip=<addr>` from the `key=value;key=value` runtime argument form
fn parse_requested_ip(runtime_args: Option<&str>) -> Result<Option<Ipv4Addr>> {
    let Some(args) = runtime_args else {
        return Ok(None);
    };
    for pair in args.split(';') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("ip") {
            let ip = value
                .trim()
                .parse()
                .map_err(|_| IpamError::Config(format!("malformed ip argument '{}'", value)))?;
            return Ok(Some(ip));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"{
        "cniVersion": "0.4.0",
        "name": "net1",
        "type": "bridge",
        "ipam": {
            "type": "warren-ipam",
            "ranges": [
                [{"subnet": "10.1.0.0/16", "gateway": "10.1.0.1"}],
                [{"subnet": "10.2.0.0/24", "rangeStart": "10.2.0.10", "rangeEnd": "10.2.0.20"}]
            ],
            "routes": [{"dst": "0.0.0.0/0", "gw": "10.1.0.1"}],
            "dataDir": "/tmp/warren-test",
            "resolvConf": "/etc/resolv.conf",
            "applyUnit": 6
        }
    }"#;

    #[test]
    fn test_full_config_parses() {
        let (conf, version) = load_ipam_config(FULL_CONFIG.as_bytes(), None).unwrap();
        assert_eq!(version, "0.4.0");
        assert_eq!(conf.name, "net1");
        assert_eq!(conf.ranges.len(), 2);
        assert_eq!(conf.apply_unit, 6);
        assert_eq!(conf.data_dir, PathBuf::from("/tmp/warren-test"));
        assert_eq!(conf.routes.len(), 1);

        let first = conf.ranges[0].get(0).unwrap();
        assert_eq!(first.gateway, Some("10.1.0.1".parse().unwrap()));
        assert_eq!(first.start, "10.1.0.1".parse::<Ipv4Addr>().unwrap());

        let second = conf.ranges[1].get(0).unwrap();
        assert_eq!(second.start, "10.2.0.10".parse::<Ipv4Addr>().unwrap());
        assert_eq!(second.end, "10.2.0.20".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_defaults_applied() {
        let minimal = r#"{"name": "net1", "ipam": {"ranges": [[{"subnet": "10.0.0.0/24"}]]}}"#;
        let (conf, version) = load_ipam_config(minimal.as_bytes(), None).unwrap();
        assert_eq!(version, DEFAULT_CNI_VERSION);
        assert_eq!(conf.apply_unit, DEFAULT_APPLY_UNIT);
        assert_eq!(conf.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert!(conf.resolv_conf.is_none());
        assert!(conf.routes.is_empty());
    }

    #[test]
    fn test_missing_sections_rejected() {
        assert!(load_ipam_config(br#"{"ipam": {"ranges": [[{"subnet": "10.0.0.0/24"}]]}}"#, None).is_err());
        assert!(load_ipam_config(br#"{"name": "net1"}"#, None).is_err());
        assert!(load_ipam_config(br#"{"name": "net1", "ipam": {}}"#, None).is_err());
    }

    #[test]
    fn test_overlapping_sets_rejected() {
        let bad = r#"{"name": "n", "ipam": {"ranges": [
            [{"subnet": "10.0.0.0/16"}],
            [{"subnet": "10.0.1.0/24"}]
        ]}}"#;
        assert!(load_ipam_config(bad.as_bytes(), None).is_err());
    }

    #[test]
    fn test_invalid_gateway_rejected() {
        let bad = r#"{"name": "n", "ipam": {"ranges": [[{"subnet": "10.0.0.0/24", "gateway": "192.168.0.1"}]]}}"#;
        assert!(load_ipam_config(bad.as_bytes(), None).is_err());
    }

    #[test]
    fn test_oversized_apply_unit_rejected() {
        let bad = r#"{"name": "n", "ipam": {"applyUnit": 31, "ranges": [[{"subnet": "10.0.0.0/24"}]]}}"#;
        assert!(load_ipam_config(bad.as_bytes(), None).is_err());
    }

    #[test]
    fn test_runtime_args_requested_ip() {
        let minimal = r#"{"name": "net1", "ipam": {"ranges": [[{"subnet": "10.0.0.0/24"}]]}}"#;
        let (conf, _) = load_ipam_config(
            minimal.as_bytes(),
            Some("IgnoreUnknown=true;IP=10.0.0.5"),
        )
        .unwrap();
        assert_eq!(conf.requested_ip, Some("10.0.0.5".parse().unwrap()));

        let (conf, _) = load_ipam_config(minimal.as_bytes(), Some("IgnoreUnknown=true")).unwrap();
        assert_eq!(conf.requested_ip, None);

        assert!(load_ipam_config(minimal.as_bytes(), Some("ip=not-an-ip")).is_err());
    }
}
