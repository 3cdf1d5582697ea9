//! Container liveness probe backed by the Docker CLI

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use warren_ipam::{ContainerRuntime, IpamError};

/// Probes container existence with `docker inspect`
pub struct DockerProbe {
    binary: String,
}

impl DockerProbe {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Use an alternative CLI binary (podman, test stubs)
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for DockerProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerProbe {
    async fn container_exists(&self, container_id: &str) -> warren_ipam::Result<bool> {
        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.Id}}", container_id])
            .output()
            .await?;

        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such object") {
            debug!(container = container_id, "container not found");
            return Ok(false);
        }
        // daemon unreachable or other CLI failure: liveness is unknown
        Err(IpamError::Runtime(format!(
            "{} inspect failed: {}",
            self.binary,
            stderr.trim()
        )))
    }
}
