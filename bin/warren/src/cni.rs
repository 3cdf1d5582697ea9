//! CNI invocation protocol
//!
//! The runtime drives the plugin through environment variables and passes
//! the network configuration on stdin; results and errors leave as JSON on
//! stdout. Nothing else may be written to stdout.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::io::Read;

use warren_ipam::IpamError;

/// Error code for an unusable network configuration, per the CNI spec
const ERR_INVALID_CONFIG: u32 = 7;
/// Catch-all error code for internal failures
const ERR_INTERNAL: u32 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

/// One plugin invocation as handed over by the container runtime
#[derive(Debug)]
pub struct CmdArgs {
    pub command: Command,
    pub container_id: String,
    pub if_name: String,
    pub netns: String,
    /// Raw `CNI_ARGS` runtime arguments, `key=value;key=value`
    pub args: Option<String>,
    pub stdin_data: Vec<u8>,
}

fn required_env(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => bail!("required environment variable {} is not set", var),
    }
}

impl CmdArgs {
    /// Read the invocation from the process environment and stdin
    pub fn from_env() -> Result<Self> {
        let command = match required_env("CNI_COMMAND")?.as_str() {
            "ADD" => Command::Add,
            "DEL" => Command::Del,
            "CHECK" => Command::Check,
            "VERSION" => Command::Version,
            other => bail!("unknown CNI_COMMAND '{}'", other),
        };

        let mut stdin_data = Vec::new();
        if command != Command::Version {
            std::io::stdin()
                .read_to_end(&mut stdin_data)
                .context("reading network configuration from stdin")?;
        }

        // VERSION carries no invocation context
        let (container_id, if_name, netns) = if command == Command::Version {
            (String::new(), String::new(), String::new())
        } else {
            (
                required_env("CNI_CONTAINERID")?,
                required_env("CNI_IFNAME")?,
                std::env::var("CNI_NETNS").unwrap_or_default(),
            )
        };

        Ok(Self {
            command,
            container_id,
            if_name,
            netns,
            args: std::env::var("CNI_ARGS").ok().filter(|a| !a.is_empty()),
            stdin_data,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CniErrorMsg {
    cni_version: String,
    code: u32,
    msg: String,
}

/// Print a failure as the CNI error object
pub fn emit_error(cni_version: &str, err: &anyhow::Error) {
    let code = match err.downcast_ref::<IpamError>() {
        Some(IpamError::Config(_)) | Some(IpamError::InvalidCidr(_)) => ERR_INVALID_CONFIG,
        _ => ERR_INTERNAL,
    };
    let msg = CniErrorMsg {
        cni_version: cni_version.to_string(),
        code,
        msg: format!("{:#}", err),
    };
    match serde_json::to_string(&msg) {
        Ok(body) => println!("{}", body),
        Err(_) => println!(r#"{{"code":{},"msg":"error serialization failed"}}"#, code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_for_config_errors() {
        let err = anyhow::Error::new(IpamError::Config("bad".into()));
        assert!(matches!(
            err.downcast_ref::<IpamError>(),
            Some(IpamError::Config(_))
        ));
    }
}
