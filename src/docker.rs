//! Docker adapter
//!
//! Narrow capability set the controller needs: start/stop a container, probe
//! liveness, resolve the published RPC endpoint, exec a shell command, and
//! list managed containers for adoption. The production implementation shells
//! out to the `docker` CLI; failures are surfaced and the controller decides
//! policy.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

pub const LABEL_RECORD_ID: &str = "msfailab.container_record_id";
pub const LABEL_WORKSPACE_SLUG: &str = "msfailab.workspace_slug";
pub const LABEL_CONTAINER_SLUG: &str = "msfailab.container_slug";

/// Managed container name: `msfailab-<workspace_slug>-<container_slug>`.
pub fn container_name(workspace_slug: &str, container_slug: &str) -> String {
    format!("msfailab-{workspace_slug}-{container_slug}")
}

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("failed to run docker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("docker command failed: {0}")]
    Command(String),
    #[error("unexpected docker output: {0}")]
    Parse(String),
}

/// Host/port pair the in-container RPC service is reachable at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEndpoint {
    pub host: String,
    pub port: u16,
}

impl RpcEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}/api/", self.host, self.port)
    }
}

/// Labels attached to every managed container.
#[derive(Debug, Clone)]
pub struct ContainerLabels {
    pub record_id: i64,
    pub workspace_slug: String,
    pub container_slug: String,
}

/// Result of `exec` inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub exit_code: i32,
}

/// A running container carrying our management labels.
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub docker_id: String,
    pub record_id: i64,
}

#[async_trait]
pub trait DockerAdapter: Send + Sync {
    async fn start_container(
        &self,
        name: &str,
        labels: &ContainerLabels,
        rpc_port: u16,
    ) -> Result<String, DockerError>;

    async fn stop_container(&self, docker_id: &str) -> Result<(), DockerError>;

    async fn container_running(&self, docker_id: &str) -> Result<bool, DockerError>;

    async fn rpc_endpoint(&self, docker_id: &str) -> Result<RpcEndpoint, DockerError>;

    async fn exec(&self, docker_id: &str, command: &str) -> Result<ExecOutput, DockerError>;

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, DockerError>;
}

/// Shell-out implementation against the local `docker` CLI.
pub struct CliDockerAdapter {
    image: String,
    rpc_password: String,
}

impl CliDockerAdapter {
    pub fn new(image: impl Into<String>, rpc_password: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            rpc_password: rpc_password.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, DockerError> {
        let output = Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(DockerError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[derive(Deserialize)]
struct InspectState {
    #[serde(rename = "Running")]
    running: bool,
}

#[async_trait]
impl DockerAdapter for CliDockerAdapter {
    async fn start_container(
        &self,
        name: &str,
        labels: &ContainerLabels,
        rpc_port: u16,
    ) -> Result<String, DockerError> {
        let record_label = format!("{LABEL_RECORD_ID}={}", labels.record_id);
        let ws_label = format!("{LABEL_WORKSPACE_SLUG}={}", labels.workspace_slug);
        let slug_label = format!("{LABEL_CONTAINER_SLUG}={}", labels.container_slug);
        let publish = format!("{rpc_port}:55553");
        let password_env = format!("MSF_RPC_PASSWORD={}", self.rpc_password);

        self.run(&[
            "run",
            "--detach",
            "--rm",
            "--name",
            name,
            "--label",
            &record_label,
            "--label",
            &ws_label,
            "--label",
            &slug_label,
            "--publish",
            &publish,
            "--env",
            &password_env,
            &self.image,
        ])
        .await
    }

    async fn stop_container(&self, docker_id: &str) -> Result<(), DockerError> {
        self.run(&["stop", docker_id]).await.map(|_| ())
    }

    async fn container_running(&self, docker_id: &str) -> Result<bool, DockerError> {
        match self
            .run(&["inspect", "--format", "{{json .State}}", docker_id])
            .await
        {
            Ok(out) => {
                let state: InspectState = serde_json::from_str(&out)
                    .map_err(|e| DockerError::Parse(format!("inspect state: {e}")))?;
                Ok(state.running)
            }
            // A missing container is not an adapter failure; it is just gone.
            Err(DockerError::Command(msg)) if msg.contains("No such") => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn rpc_endpoint(&self, docker_id: &str) -> Result<RpcEndpoint, DockerError> {
        let out = self.run(&["port", docker_id, "55553/tcp"]).await?;
        // `docker port` prints lines like `0.0.0.0:55553`; take the first.
        let line = out
            .lines()
            .next()
            .ok_or_else(|| DockerError::Parse("empty port mapping".to_string()))?;
        let (host, port) = line
            .rsplit_once(':')
            .ok_or_else(|| DockerError::Parse(format!("port mapping: {line}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| DockerError::Parse(format!("port mapping: {line}")))?;
        let host = if host == "0.0.0.0" || host == "[::]" {
            "127.0.0.1".to_string()
        } else {
            host.to_string()
        };
        Ok(RpcEndpoint { host, port })
    }

    async fn exec(&self, docker_id: &str, command: &str) -> Result<ExecOutput, DockerError> {
        let output = Command::new("docker")
            .args(["exec", docker_id, "sh", "-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.is_empty() {
            stdout.to_string()
        } else if stdout.is_empty() {
            stderr.to_string()
        } else {
            format!("{stdout}{stderr}")
        };

        Ok(ExecOutput {
            stdout: combined,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, DockerError> {
        let filter = format!("label={LABEL_RECORD_ID}");
        let format = format!("{{{{.ID}}}} {{{{.Label \"{LABEL_RECORD_ID}\"}}}}");
        let out = self
            .run(&["ps", "--filter", &filter, "--format", &format])
            .await?;

        let mut containers = Vec::new();
        for line in out.lines() {
            let mut parts = line.split_whitespace();
            let (Some(id), Some(record)) = (parts.next(), parts.next()) else {
                continue;
            };
            if let Ok(record_id) = record.parse::<i64>() {
                containers.push(ManagedContainer {
                    docker_id: id.to_string(),
                    record_id,
                });
            }
        }
        Ok(containers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_format() {
        assert_eq!(container_name("acme", "msf-1"), "msfailab-acme-msf-1");
    }

    #[test]
    fn endpoint_url() {
        let ep = RpcEndpoint {
            host: "127.0.0.1".to_string(),
            port: 55553,
        };
        assert_eq!(ep.url(), "http://127.0.0.1:55553/api/");
    }
}
