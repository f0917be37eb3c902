//! Seam to the container runtime.
//!
//! The engine only needs a handful of operations from the runtime: discover
//! containers, manage the lifecycle of the helper container, provision named
//! volumes and run commands inside a container. [`ContainerRuntime`] captures
//! exactly those; [`DockerCli`] drives a real Docker host, [`SimulatedRuntime`]
//! keeps everything in memory.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::AppConfig;

mod docker;
mod simulated;

pub use docker::DockerCli;
pub use simulated::{RuntimeEvent, SimulatedRuntime};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("cannot connect to container runtime: {0}")]
    Connection(String),

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("failed to decode runtime response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("I/O error talking to runtime: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Volume,
    Bind,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub kind: MountKind,
    /// Volume name for named volumes, host path for binds.
    pub name: String,
    pub destination: String,
}

/// Snapshot of a container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<MountPoint>,
    pub running: bool,
}

/// A `source:destination[:ro]` bind specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

impl Bind {
    pub fn read_write(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            read_only: false,
        }
    }

    pub fn read_only(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            read_only: true,
        }
    }
}

impl fmt::Display for Bind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.destination)?;
        if self.read_only {
            write!(f, ":ro")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub binds: Vec<Bind>,
    pub labels: BTreeMap<String, String>,
}

/// Request to provision a named volume.
///
/// `driver_opts` may carry credentials, so this type is never logged as a
/// whole.
#[derive(Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub driver: String,
    pub driver_opts: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl fmt::Debug for VolumeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeSpec")
            .field("name", &self.name)
            .field("driver", &self.driver)
            .field("driver_opts", &self.driver_opts.keys().collect::<Vec<_>>())
            .field("labels", &self.labels)
            .finish()
    }
}

/// Combined stdout/stderr and exit status of an exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Name of the host the runtime runs on.
    fn hostname(&self) -> &str;

    /// List all containers (running or not) carrying every `key=value` label.
    async fn list_containers(
        &self,
        label_filters: &[(String, String)],
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Make sure `image` is available locally.
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stop a container, killing it after `timeout` seconds. `None` keeps
    /// the runtime's default grace period.
    async fn stop_container(&self, id: &str, timeout: Option<u32>) -> Result<(), RuntimeError>;

    /// Remove a container. With `force` a running container is killed first.
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<(), RuntimeError>;

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;

    /// Run `cmd` inside a running container, capturing combined output.
    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, RuntimeError>;
}

/// Connect to the Docker host named in the config.
///
/// Fails when the runtime cannot be reached, which is fatal for the daemon.
pub async fn connect(config: &AppConfig) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
    let cli = DockerCli::connect(config.docker_binary.clone(), config.host.clone()).await?;
    Ok(Arc::new(cli))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_renders_docker_syntax() {
        assert_eq!(
            Bind::read_write("backup_target", "/target").to_string(),
            "backup_target:/target"
        );
        assert_eq!(
            Bind::read_only("data", "/source/data").to_string(),
            "data:/source/data:ro"
        );
    }

    #[test]
    fn volume_spec_debug_hides_option_values() {
        let spec = VolumeSpec {
            name: "v".to_string(),
            driver: "local".to_string(),
            driver_opts: BTreeMap::from([(
                "o".to_string(),
                "username=chuck,password=secret".to_string(),
            )]),
            labels: BTreeMap::new(),
        };
        let rendered = format!("{:?}", spec);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("\"o\""));
    }
}
