//! Resolver-file parsing for the result's DNS block

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::result::Dns;

/// Parse a `resolv.conf`-style file into the CNI DNS block
///
/// Understands `nameserver`, `domain`, `search`, and `options` lines;
/// comments and unknown directives are ignored.
pub fn parse_resolv_conf(path: &Path) -> Result<Dns> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading resolver file {}", path.display()))?;

    let mut dns = Dns::default();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(directive) = fields.next() else {
            continue;
        };
        match directive {
            "nameserver" => {
                if let Some(server) = fields.next() {
                    dns.nameservers.push(server.to_string());
                }
            }
            "domain" => {
                if let Some(domain) = fields.next() {
                    dns.domain = domain.to_string();
                }
            }
            "search" => dns.search.extend(fields.map(str::to_string)),
            "options" => dns.options.extend(fields.map(str::to_string)),
            _ => {}
        }
    }
    Ok(dns)
}
