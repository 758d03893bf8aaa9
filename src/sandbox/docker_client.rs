//! Docker API wrapper using the bollard crate.
//!
//! Thin, hardened interface over the operations the sandbox service
//! needs: provision a capability-stripped container, exec commands in it,
//! upload file archives, and tear it down.

use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;

use crate::error::SandboxError;
use crate::sandbox::limits::ResourceLimits;

/// Working directory inside every sandbox container.
pub const SANDBOX_WORKDIR: &str = "/workspace";

/// Capabilities kept for package installation; everything else is
/// dropped.
const RETAINED_CAPABILITIES: [&str; 4] = ["CHOWN", "SETUID", "SETGID", "DAC_OVERRIDE"];

/// Configuration for provisioning a sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique container name.
    pub name: String,
    /// Base image, selected per detected language.
    pub image: String,
    /// Environment variables (`KEY=value`), including injected
    /// credentials.
    pub env: Vec<String>,
    /// Resource caps.
    pub limits: ResourceLimits,
}

impl ContainerSpec {
    /// Creates a spec with default limits.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: Vec::new(),
            limits: ResourceLimits::default(),
        }
    }

    /// Sets the environment variables.
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// Sets the resource limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Result of executing a command in a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Combined stdout and stderr in arrival order.
    pub output: String,
}

/// Docker client wrapper for sandbox container operations.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connects to the local Docker daemon.
    pub fn new() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::DaemonUnavailable(format!("Failed to connect: {e}")))?;
        Ok(Self { docker })
    }

    /// Wraps an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Provisions and starts a hardened sandbox container.
    ///
    /// The container gets: memory and swap capped, a pids limit, all OS
    /// capabilities dropped except the minimal install set, and no
    /// privilege escalation. It idles on `sleep infinity` so commands
    /// can be exec'd phase by phase.
    ///
    /// # Returns
    ///
    /// The container ID.
    pub async fn provision(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        if !self.image_exists(&spec.image).await {
            self.pull_image(&spec.image).await?;
        }

        let host_config = HostConfig {
            memory: Some(spec.limits.memory_bytes()),
            memory_swap: Some(spec.limits.memory_swap_bytes()),
            cpu_period: Some(spec.limits.cpu_period()),
            cpu_quota: Some(spec.limits.cpu_quota()),
            pids_limit: Some(spec.limits.max_processes as i64),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(
                RETAINED_CAPABILITIES
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
            ),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            // Package installation needs the network; everything else the
            // container can reach is limited by its own credentials.
            network_mode: Some("bridge".to_string()),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            working_dir: Some(SANDBOX_WORKDIR.to_string()),
            host_config: Some(host_config),
            tty: Some(false),
            attach_stdin: Some(false),
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
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| SandboxError::ProvisionFailed(format!("Failed to create container: {e}")))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::ProvisionFailed(format!("Failed to start container: {e}")))?;

        Ok(response.id)
    }

    /// Executes a shell command inside a running container.
    ///
    /// Stdout and stderr are interleaved into a single capture so phase
    /// logs read the way they would in a terminal.
    pub async fn exec_shell(&self, id: &str, command: &str) -> Result<ExecOutput, SandboxError> {
        let exec_options = CreateExecOptions {
            cmd: Some(vec!["sh", "-lc", command]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(SANDBOX_WORKDIR),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_options)
            .await
            .map_err(|e| SandboxError::ExecFailed(format!("Failed to create exec: {e}")))?;

        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::ExecFailed(format!("Failed to start exec: {e}")))?;

        let mut output = String::new();
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = start_result
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(log) => output.push_str(&String::from_utf8_lossy(&log.into_bytes())),
                    Err(e) => {
                        return Err(SandboxError::ExecFailed(format!(
                            "Error reading exec output: {e}"
                        )));
                    }
                }
            }
        }

        let exec_info = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::ExecFailed(format!("Failed to inspect exec: {e}")))?;

        Ok(ExecOutput {
            exit_code: exec_info.exit_code.unwrap_or(-1),
            output,
        })
    }

    /// Uploads an uncompressed tar archive into the container.
    ///
    /// `dest` is the directory the archive is unpacked into.
    pub async fn upload_archive(
        &self,
        id: &str,
        dest: &str,
        archive: Vec<u8>,
    ) -> Result<(), SandboxError> {
        let options = UploadToContainerOptions {
            path: dest,
            ..Default::default()
        };

        self.docker
            .upload_to_container(id, Some(options), archive.into())
            .await
            .map_err(|e| SandboxError::CopyFailed(format!("Failed to upload archive: {e}")))?;

        Ok(())
    }

    /// Tears down a container: graceful stop, then forced removal.
    ///
    /// Must succeed even if the container already exited or the stop
    /// fails; the forced remove is the backstop.
    pub async fn teardown(&self, id: &str) -> Result<(), SandboxError> {
        if let Err(e) = self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: 5 }))
            .await
        {
            tracing::warn!(container = id, error = %e, "graceful stop failed, forcing removal");
        }

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| {
                if e.to_string().contains("No such container") {
                    SandboxError::ContainerNotFound { id: id.to_string() }
                } else {
                    SandboxError::ProvisionFailed(format!("Failed to remove container: {e}"))
                }
            })?;

        Ok(())
    }

    /// Pulls an image from a registry.
    pub async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result
                .map_err(|e| SandboxError::ProvisionFailed(format!("Failed to pull image: {e}")))?;
        }

        Ok(())
    }

    /// Checks whether an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_spec_builder() {
        let limits = ResourceLimits {
            memory_mb: 4096,
            ..Default::default()
        };
        let spec = ContainerSpec::new("run-42", "node:20-bookworm-slim")
            .with_env(vec!["NPM_TOKEN=abc".to_string()])
            .with_limits(limits);

        assert_eq!(spec.name, "run-42");
        assert_eq!(spec.image, "node:20-bookworm-slim");
        assert_eq!(spec.env.len(), 1);
        assert_eq!(spec.limits.memory_mb, 4096);
    }

    #[test]
    fn test_retained_capabilities_minimal() {
        // The retained set must stay small; anything beyond install
        // plumbing is a hole in the sandbox.
        assert!(RETAINED_CAPABILITIES.len() <= 4);
        assert!(!RETAINED_CAPABILITIES.contains(&"SYS_ADMIN"));
        assert!(!RETAINED_CAPABILITIES.contains(&"NET_ADMIN"));
    }
}
