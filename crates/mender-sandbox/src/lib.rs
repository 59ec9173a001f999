//! Docker Engine API implementation of [`mender_core::sandbox::SandboxDriver`].
//!
//! Every container this driver creates carries `mender.managed=true` and
//! `mender.workspace=<path>` labels so the Janitor (`mender_core::janitor`)
//! can enumerate and reap them without tracking sessions itself.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mender_core::sandbox::{
    ExecResult, ManagedSandbox, ResourceLimits, SandboxDriver, SandboxError, SandboxHandle,
};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const MANAGED_LABEL: &str = "mender.managed";
const WORKSPACE_LABEL: &str = "mender.workspace";
const IN_CONTAINER_WORKSPACE: &str = "/workspace";

/// CPU accounting period bollard/Docker expects alongside a quota, in
/// microseconds — 100ms is Docker's own default.
const CPU_PERIOD_MICROS: i64 = 100_000;

/// Connects to the local Docker daemon over its default socket.
#[derive(Clone)]
pub struct DockerSandboxDriver {
    docker: Docker,
}

impl DockerSandboxDriver {
    /// # Errors
    ///
    /// Returns an error if the local Docker socket cannot be reached.
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Create(format!("connecting to Docker: {e}")))?;
        Ok(Self { docker })
    }
}

/// Convert a percentage of one CPU into the `(period, quota)` pair the
/// Docker Engine API expects, using Docker's own 100ms default period.
fn cpu_period_and_quota(cpu_quota_percent: u32) -> (i64, i64) {
    (CPU_PERIOD_MICROS, CPU_PERIOD_MICROS * i64::from(cpu_quota_percent) / 100)
}

fn managed_labels(workspace_path: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(WORKSPACE_LABEL.to_string(), workspace_path.to_string());
    labels
}

#[async_trait]
impl SandboxDriver for DockerSandboxDriver {
    async fn create(
        &self,
        image: &str,
        workspace_dir: &Path,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        let workspace_str = workspace_dir.to_string_lossy().into_owned();
        let labels = managed_labels(&workspace_str);
        let (cpu_period, cpu_quota) = cpu_period_and_quota(limits.cpu_quota_percent);

        let host_config = HostConfig {
            mounts: Some(vec![Mount {
                target: Some(IN_CONTAINER_WORKSPACE.to_string()),
                source: Some(workspace_str.clone()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            }]),
            memory: Some(limits.memory_bytes as i64),
            cpu_period: Some(cpu_period),
            cpu_quota: Some(cpu_quota),
            network_mode: Some(if limits.network_enabled {
                "bridge".to_string()
            } else {
                "none".to_string()
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            working_dir: Some(IN_CONTAINER_WORKSPACE.to_string()),
            labels: Some(labels),
            host_config: Some(host_config),
            // Keep the container alive so exec can be called repeatedly.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            tty: Some(false),
            ..Default::default()
        };

        let name = format!("mender-{}", uuid::Uuid::new_v4());
        let container = self
            .docker
            .create_container(Some(CreateContainerOptions { name: name.clone(), platform: None }), config)
            .await
            .map_err(|e| SandboxError::Create(format!("creating container: {e}")))?;

        self.docker
            .start_container::<String>(&container.id, None)
            .await
            .map_err(|e| SandboxError::Create(format!("starting container: {e}")))?;

        info!(container_id = %container.id, image, "sandbox created");

        Ok(Box::new(DockerSandboxHandle {
            docker: self.docker.clone(),
            container_id: container.id,
        }))
    }

    async fn list_managed(&self) -> Result<Vec<ManagedSandbox>, SandboxError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| SandboxError::Exec(format!("listing managed containers: {e}")))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let labels = c.labels.unwrap_or_default();
                let workspace_path = labels.get(WORKSPACE_LABEL).cloned().unwrap_or_default();
                let created_at = c
                    .created
                    .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
                    .unwrap_or_else(Utc::now);
                Some(ManagedSandbox {
                    id,
                    workspace_path,
                    created_at,
                })
            })
            .collect())
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::Teardown(format!("removing container {id}: {e}")))
    }
}

struct DockerSandboxHandle {
    docker: Docker,
    container_id: String,
}

#[async_trait]
impl SandboxHandle for DockerSandboxHandle {
    async fn exec(&self, argv: &[String], timeout: Duration) -> Result<ExecResult, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Exec(format!("creating exec: {e}")))?;

        let run = async {
            let mut stdout = String::new();
            let mut stderr = String::new();

            if let StartExecResults::Attached { mut output, .. } = self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| SandboxError::Exec(format!("starting exec: {e}")))?
            {
                while let Some(chunk) = output.next().await {
                    match chunk.map_err(|e| SandboxError::Exec(format!("reading exec output: {e}")))? {
                        bollard::container::LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            }

            let inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| SandboxError::Exec(format!("inspecting exec: {e}")))?;
            let exit_code = inspect.exit_code.unwrap_or(-1) as i32;

            Ok::<_, SandboxError>(ExecResult {
                exit_code,
                stdout,
                stderr,
                timed_out: false,
            })
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(container_id = %self.container_id, "exec timed out, killing container");
                let _ = self.docker.kill_container::<String>(&self.container_id, None).await;
                Ok(ExecResult::timeout(String::new(), String::new()))
            }
        }
    }

    async fn teardown(self: Box<Self>) -> Result<(), SandboxError> {
        self.docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::Teardown(format!("removing container {}: {e}", self.container_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_quota_scales_with_percent() {
        assert_eq!(cpu_period_and_quota(50), (100_000, 50_000));
        assert_eq!(cpu_period_and_quota(100), (100_000, 100_000));
        assert_eq!(cpu_period_and_quota(0), (100_000, 0));
    }

    #[test]
    fn managed_labels_mark_workspace_and_ownership() {
        let labels = managed_labels("/tmp/workspace-1");
        assert_eq!(labels.get(MANAGED_LABEL), Some(&"true".to_string()));
        assert_eq!(labels.get(WORKSPACE_LABEL), Some(&"/tmp/workspace-1".to_string()));
    }
}
