//! Docker API wrapper using the bollard crate.
//!
//! Provides the container operations the sandbox runner needs: image
//! availability, create/start, state inspection for the polling loop, log
//! capture, and forced removal.

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;

use crate::error::DockerError;
use crate::execution::resources::ExecutionLimits;

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique container name.
    pub name: String,
    /// Docker image to run.
    pub image: String,
    /// Command to run in the container.
    pub cmd: Vec<String>,
    /// Environment variables (`KEY=value`).
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: String,
    /// Resource ceilings.
    pub limits: ExecutionLimits,
    /// Volume binds (`host:container:mode`).
    pub binds: Vec<String>,
    /// Docker network to attach to.
    pub network_mode: String,
}

/// Observed state of a container, distilled from inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    /// Container reached a terminal Docker state (`exited` or `dead`).
    Exited { exit_code: i64 },
    Other(String),
}

/// Docker client wrapper for sandbox container operations.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connects to the local Docker daemon.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;
        Ok(Self { docker })
    }

    /// Ensures the image is available locally, pulling it if necessary.
    pub async fn ensure_image(&self, image: &str) -> Result<(), DockerError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(image = image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| DockerError::PullFailed {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Creates a container from the spec, returning its id.
    pub async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let host_config = HostConfig {
            memory: Some(spec.limits.memory_bytes()),
            cpu_period: Some(spec.limits.cpu_period()),
            cpu_quota: Some(spec.limits.cpu_quota()),
            pids_limit: Some(spec.limits.max_processes as i64),
            network_mode: Some(spec.network_mode.clone()),
            binds: Some(spec.binds.clone()),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            working_dir: Some(spec.working_dir.clone()),
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to create container: {e}")))?;

        Ok(response.id)
    }

    /// Starts a container by id.
    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to start container: {e}")))
    }

    /// Stops a container, waiting up to 10 seconds before SIGKILL.
    pub async fn stop_container(&self, id: &str) -> Result<(), DockerError> {
        let options = StopContainerOptions { t: 10 };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to stop container: {e}")))
    }

    /// Force-removes a container and its volumes.
    pub async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to remove container: {e}")))
    }

    /// Inspects a container and distills its state for the polling loop.
    pub async fn container_state(&self, id: &str) -> Result<ContainerState, DockerError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if e.to_string().contains("No such container") {
                    DockerError::ContainerNotFound { id: id.to_string() }
                } else {
                    DockerError::RunFailed(format!("Failed to inspect container: {e}"))
                }
            })?;

        let state = info
            .state
            .ok_or_else(|| DockerError::RunFailed("Container has no state".to_string()))?;
        let status = state.status.map(|s| s.to_string()).unwrap_or_default();

        match status.as_str() {
            "running" => Ok(ContainerState::Running),
            "exited" | "dead" => Ok(ContainerState::Exited {
                exit_code: state.exit_code.unwrap_or(-1),
            }),
            other => Ok(ContainerState::Other(other.to_string())),
        }
    }

    /// Returns combined stdout/stderr logs as one string.
    pub async fn logs(&self, id: &str) -> Result<String, DockerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(DockerError::RunFailed(format!("Error reading logs: {e}")));
                }
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_spec_construction() {
        let spec = ContainerSpec {
            name: "agent-run-abc".to_string(),
            image: "python:3.11-slim".to_string(),
            cmd: vec!["python".to_string(), "runner.py".to_string()],
            env: vec!["PYTHONUNBUFFERED=1".to_string()],
            working_dir: "/workspace".to_string(),
            limits: ExecutionLimits::default(),
            binds: vec!["/tmp/ws:/workspace:rw".to_string()],
            network_mode: "bridge".to_string(),
        };

        assert_eq!(spec.limits.memory_bytes(), 2048 * 1024 * 1024);
        assert_eq!(spec.binds.len(), 1);
        assert_eq!(spec.working_dir, "/workspace");
    }

    #[test]
    fn test_container_state_terminal_matching() {
        let exited = ContainerState::Exited { exit_code: 0 };
        assert!(matches!(exited, ContainerState::Exited { exit_code: 0 }));
        assert_ne!(ContainerState::Running, exited);
        assert!(matches!(
            ContainerState::Other("paused".to_string()),
            ContainerState::Other(_)
        ));
    }
}
