//! CNI result types
//!
//! The success object printed on stdout after ADD: assigned addresses,
//! configured routes, and the DNS block from the node's resolver file.

use serde::Serialize;
use std::net::Ipv4Addr;

use warren_ipam::{IpConfig, Route};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    pub cni_version: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(skip_serializing_if = "Dns::is_empty")]
    pub dns: Dns,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpResult {
    pub version: String,
    /// Address in `ip/prefix` form
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
}

impl From<IpConfig> for IpResult {
    fn from(conf: IpConfig) -> Self {
        Self {
            version: "4".to_string(),
            address: conf.address.to_string(),
            gateway: conf.gateway,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dns {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Dns {
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
            && self.domain.is_empty()
            && self.search.is_empty()
            && self.options.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_serialization() {
        let result = CniResult {
            cni_version: "0.4.0".to_string(),
            ips: vec![IpResult {
                version: "4".to_string(),
                address: "10.0.0.2/24".to_string(),
                gateway: Some("10.0.0.1".parse().unwrap()),
            }],
            routes: vec![Route {
                dst: "0.0.0.0/0".to_string(),
                gw: Some("10.0.0.1".parse().unwrap()),
            }],
            dns: Dns::default(),
        };
        let body = serde_json::to_string(&result).unwrap();
        assert!(body.contains(r#""cniVersion":"0.4.0""#));
        assert!(body.contains(r#""address":"10.0.0.2/24""#));
        assert!(body.contains(r#""gateway":"10.0.0.1""#));
        // empty dns is omitted entirely
        assert!(!body.contains("dns"));
    }

    #[test]
    fn test_empty_sections_omitted() {
        let result = CniResult {
            cni_version: "0.4.0".to_string(),
            ips: Vec::new(),
            routes: Vec::new(),
            dns: Dns::default(),
        };
        assert_eq!(serde_json::to_string(&result).unwrap(), r#"{"cniVersion":"0.4.0"}"#);
    }
}
