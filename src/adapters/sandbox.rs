//! Sandbox Lifecycle adapter (C1 sandbox capability set).
//!
//! Built on `bollard`, with a `SandboxConfig` shape (image/memory/cpus/
//! timeout/volumes/env) and a `parse_memory_limit` helper. This worker
//! needs a long-lived container it execs into repeatedly (provision
//! once, then many `exec`/`read`/`write` calls per job per §4.6), so
//! `provision` starts a container with a `sleep infinity` entrypoint
//! and every subsequent operation uses `bollard`'s exec and archive
//! APIs against that one container.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{Config as ContainerConfig, RemoveContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::errors::AdapterError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_image() -> String {
    "node:20-slim".to_string()
}
fn default_memory() -> String {
    "4g".to_string()
}
fn default_cpus() -> f64 {
    2.0
}
fn default_timeout() -> u64 {
    120
}
fn default_install_timeout() -> u64 {
    300
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            memory: default_memory(),
            cpus: default_cpus(),
            timeout_secs: default_timeout(),
            install_timeout_secs: default_install_timeout(),
            env: HashMap::new(),
        }
    }
}

/// Parses a docker-style memory string (`"4g"`, `"512m"`, `"1024k"`, or a
/// bare byte count) into bytes.
pub fn parse_memory_limit(spec: &str) -> i64 {
    let spec = spec.trim().to_lowercase();
    if let Some(num) = spec.strip_suffix('g') {
        num.parse::<f64>().map(|n| (n * 1_073_741_824.0) as i64).unwrap_or(0)
    } else if let Some(num) = spec.strip_suffix('m') {
        num.parse::<f64>().map(|n| (n * 1_048_576.0) as i64).unwrap_or(0)
    } else if let Some(num) = spec.strip_suffix('k') {
        num.parse::<f64>().map(|n| (n * 1024.0) as i64).unwrap_or(0)
    } else {
        spec.parse::<i64>().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub container_id: String,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// The capability set from §9: provision, exec, read, write, delete,
/// sync, stop. All paths passed to `read`/`write`/`delete`/`exec` are
/// relative to the project root (the sandbox user's home directory),
/// per §4.6.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn provision(&self) -> Result<SandboxHandle, AdapterError>;
    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecResult, AdapterError>;
    async fn read(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<u8>, AdapterError>;
    async fn write(
        &self,
        handle: &SandboxHandle,
        path: &str,
        content: &[u8],
    ) -> Result<(), AdapterError>;
    async fn delete(&self, handle: &SandboxHandle, path: &str) -> Result<(), AdapterError>;
    /// Recursive mirror from the sandbox to an object-store prefix,
    /// excluding `node_modules`, VCS metadata, build outputs, cache
    /// directories, `.env`, and the deployment config (§4.6).
    async fn sync_to_object_store(
        &self,
        handle: &SandboxHandle,
        bucket: &str,
        prefix: &str,
    ) -> Result<(), AdapterError>;
    async fn stop(&self, handle: &SandboxHandle) -> Result<(), AdapterError>;
}

const PROJECT_ROOT: &str = "/home/sandbox/project";

const SYNC_EXCLUDES: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    ".next",
    ".turbo",
    ".cache",
    ".env",
    "fly.toml",
];

pub struct DockerSandbox {
    docker: Docker,
    config: SandboxConfig,
}

impl DockerSandbox {
    pub fn new(config: SandboxConfig) -> Result<Self, AdapterError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| AdapterError::Sandbox(format!("failed to connect to docker: {e}")))?;
        Ok(Self { docker, config })
    }

    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }

    async fn ensure_image(&self) -> Result<(), AdapterError> {
        if self.docker.inspect_image(&self.config.image).await.is_ok() {
            return Ok(());
        }
        let options = bollard::image::CreateImageOptions {
            from_image: self.config.image.clone(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(chunk) = stream.next().await {
            chunk.map_err(|e| AdapterError::Sandbox(format!("image pull failed: {e}")))?;
        }
        Ok(())
    }

    fn exclude_flags(&self) -> String {
        SYNC_EXCLUDES
            .iter()
            .map(|e| format!("--exclude='{e}'"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn provision(&self) -> Result<SandboxHandle, AdapterError> {
        self.ensure_image().await?;

        let mut env: Vec<String> = self
            .config
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        env.push(format!("HOME={PROJECT_ROOT}"));

        let host_config = HostConfig {
            memory: Some(parse_memory_limit(&self.config.memory)),
            nano_cpus: Some((self.config.cpus * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(self.config.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(env),
            working_dir: Some(PROJECT_ROOT.to_string()),
            host_config: Some(host_config),
            labels: Some(HashMap::from([(
                "turbobackend.sandbox".to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container::<String, String>(None, container_config)
            .await
            .map_err(|e| AdapterError::Sandbox(format!("create_container failed: {e}")))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| AdapterError::Sandbox(format!("start_container failed: {e}")))?;

        self.exec(
            &SandboxHandle {
                container_id: created.id.clone(),
            },
            &format!("mkdir -p {PROJECT_ROOT}"),
            Duration::from_secs(self.config.timeout_secs),
        )
        .await?;

        Ok(SandboxHandle {
            container_id: created.id,
        })
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecResult, AdapterError> {
        let exec = self
            .docker
            .create_exec(
                &handle.container_id,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(PROJECT_ROOT.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| AdapterError::Sandbox(format!("create_exec failed: {e}")))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        let run = async {
            if let StartExecResults::Attached { mut output, .. } = self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| AdapterError::Sandbox(format!("start_exec failed: {e}")))?
            {
                while let Some(Ok(msg)) = output.next().await {
                    match msg {
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
            Ok::<_, AdapterError>(())
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| AdapterError::Timeout(timeout.as_secs()))??;

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| AdapterError::Sandbox(format!("inspect_exec failed: {e}")))?;

        Ok(ExecResult {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn read(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<u8>, AdapterError> {
        let result = self
            .exec(
                handle,
                &format!("cat '{}'", sandbox_path(path)),
                Duration::from_secs(self.config.timeout_secs),
            )
            .await?;
        if result.exit_code != 0 {
            return Err(AdapterError::Sandbox(format!(
                "read {path} failed: {}",
                result.stderr
            )));
        }
        Ok(result.stdout.into_bytes())
    }

    async fn write(
        &self,
        handle: &SandboxHandle,
        path: &str,
        content: &[u8],
    ) -> Result<(), AdapterError> {
        let full_path = sandbox_path(path);
        if let Some(parent) = std::path::Path::new(&full_path).parent() {
            let _ = self
                .exec(
                    handle,
                    &format!("mkdir -p '{}'", parent.display()),
                    Duration::from_secs(self.config.timeout_secs),
                )
                .await?;
        }
        let tar = single_file_tar(&full_path, content);
        self.docker
            .upload_to_container(
                &handle.container_id,
                Some(bollard::container::UploadToContainerOptions {
                    path: "/",
                    ..Default::default()
                }),
                tar.into(),
            )
            .await
            .map_err(|e| AdapterError::Sandbox(format!("write {path} failed: {e}")))
    }

    async fn delete(&self, handle: &SandboxHandle, path: &str) -> Result<(), AdapterError> {
        let result = self
            .exec(
                handle,
                &format!("rm -rf '{}'", sandbox_path(path)),
                Duration::from_secs(self.config.timeout_secs),
            )
            .await?;
        if result.exit_code != 0 {
            return Err(AdapterError::Sandbox(format!(
                "delete {path} failed: {}",
                result.stderr
            )));
        }
        Ok(())
    }

    async fn sync_to_object_store(
        &self,
        handle: &SandboxHandle,
        bucket: &str,
        prefix: &str,
    ) -> Result<(), AdapterError> {
        let cmd = format!(
            "objctl sync {} {} {prefix} --bucket={bucket}",
            self.exclude_flags(),
            PROJECT_ROOT,
        );
        let result = self
            .exec(handle, &cmd, Duration::from_secs(self.config.install_timeout_secs))
            .await?;
        if result.exit_code != 0 {
            return Err(AdapterError::Sandbox(format!(
                "object store sync failed: {}",
                result.stderr
            )));
        }
        Ok(())
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), AdapterError> {
        self.docker
            .stop_container(&handle.container_id, None)
            .await
            .map_err(|e| AdapterError::Sandbox(format!("stop failed: {e}")))?;
        self.docker
            .remove_container(
                &handle.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| AdapterError::Sandbox(format!("remove failed: {e}")))?;
        Ok(())
    }
}

fn sandbox_path(path: &str) -> String {
    let path = path.trim_start_matches('/');
    format!("{PROJECT_ROOT}/{path}")
}

/// Builds a minimal single-file tar archive for `upload_to_container`.
fn single_file_tar(full_path: &str, content: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    let entry_name = full_path.trim_start_matches('/');
    builder
        .append_data(&mut header, entry_name, content)
        .expect("in-memory tar append cannot fail");
    builder.into_inner().expect("in-memory tar finish cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gigabyte_memory() {
        assert_eq!(parse_memory_limit("4g"), 4 * 1_073_741_824);
    }

    #[test]
    fn parses_megabyte_memory() {
        assert_eq!(parse_memory_limit("512m"), 512 * 1_048_576);
    }

    #[test]
    fn parses_bare_byte_count() {
        assert_eq!(parse_memory_limit("2048"), 2048);
    }

    #[test]
    fn config_defaults_match_spec_timeouts() {
        let config = SandboxConfig::default();
        assert_eq!(config.timeout_secs, 120);
        assert_eq!(config.install_timeout_secs, 300);
    }

    #[test]
    fn sandbox_path_is_relative_to_project_root() {
        assert_eq!(sandbox_path("server/api/health.get.js"), format!("{PROJECT_ROOT}/server/api/health.get.js"));
        assert_eq!(sandbox_path("/server/api/health.get.js"), format!("{PROJECT_ROOT}/server/api/health.get.js"));
    }

    #[test]
    fn single_file_tar_round_trips_through_tar_crate() {
        let tar_bytes = single_file_tar("/home/sandbox/project/hello.txt", b"hi");
        let mut archive = tar::Archive::new(&tar_bytes[..]);
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut buf).unwrap();
        assert_eq!(buf, b"hi");
    }

    #[tokio::test]
    async fn docker_smoke_test_skips_when_daemon_unavailable() {
        let Ok(sandbox) = DockerSandbox::new(SandboxConfig::default()) else {
            return;
        };
        if !sandbox.is_available().await {
            return;
        }
        let handle = sandbox.provision().await.expect("provision");
        let result = sandbox
            .exec(&handle, "echo hello", Duration::from_secs(10))
            .await
            .expect("exec");
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello"));
        sandbox.stop(&handle).await.expect("stop");
    }
}
