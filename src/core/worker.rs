use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::core::container::Container;
use crate::core::volume::Volume;
use crate::error::BackupError;
use crate::runtime::{Bind, ContainerRuntime, ContainerSpec};

pub const TARGET_MOUNT: &str = "/target";
pub const SOURCE_MOUNT: &str = "/source";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Lifecycle of the helper container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Started,
    Stopped,
    Removed,
}

/// Archive file name for one source volume: `<YYYYMMDD>_<HHMMSS>_<volume>.tar.gz`.
pub fn archive_name(volume: &str, at: DateTime<Local>) -> String {
    format!("{}_{}.tar.gz", at.format(TIMESTAMP_FORMAT), volume)
}

/// Worker container name, unique per workload and second.
pub fn worker_name(source: &str, at: DateTime<Local>) -> String {
    format!("temp_docker_backup_{}_{}", source, at.format(TIMESTAMP_FORMAT))
}

/// Disposable container that archives the named volumes of one workload
/// into the target volume.
///
/// Binds the target read-write at `/target` and every source volume
/// read-only at `/source/<volume>`.
#[derive(Clone)]
pub struct BackupContainer {
    id: String,
    name: String,
    state: WorkerState,
    source: Container,
    target: Volume,
    runtime: Arc<dyn ContainerRuntime>,
}

impl BackupContainer {
    pub async fn create(
        runtime: Arc<dyn ContainerRuntime>,
        image: &str,
        source: &Container,
        target: &Volume,
    ) -> Result<Self, BackupError> {
        let mut binds = vec![Bind::read_write(target.name(), TARGET_MOUNT)];
        binds.extend(
            source
                .volumes()
                .iter()
                .map(|v| Bind::read_only(v.clone(), format!("{}/{}", SOURCE_MOUNT, v))),
        );

        let name = worker_name(&source.name, Local::now());
        let spec = ContainerSpec {
            name: name.clone(),
            image: image.to_string(),
            cmd: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "tail -f /dev/null".to_string(),
            ],
            binds,
            labels: BTreeMap::from([("docker-backup.worker".to_string(), source.name.clone())]),
        };

        runtime
            .pull_image(image)
            .await
            .map_err(|e| BackupError::provision(format!("pull image {}", image), e))?;
        let id = runtime
            .create_container(&spec)
            .await
            .map_err(|e| BackupError::provision("create backup container", e))?;

        debug!(
            container = %name,
            source = %source,
            target_volume = %target,
            "backup container created"
        );

        Ok(Self {
            id,
            name,
            state: WorkerState::Created,
            source: source.clone(),
            target: target.clone(),
            runtime,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub async fn start(&mut self) -> Result<(), BackupError> {
        self.runtime
            .start_container(&self.id)
            .await
            .map_err(|e| BackupError::provision("start backup container", e))?;
        self.state = WorkerState::Started;
        Ok(())
    }

    /// Directory that receives this workload's archives, inside the worker.
    fn target_folder(&self) -> String {
        format!(
            "{}/{}/{}",
            TARGET_MOUNT,
            self.runtime.hostname(),
            self.source.name
        )
    }

    /// Archive every source volume. Continues past failures; returns the
    /// archive paths written, or every failure that occurred.
    pub async fn backup(&self) -> Result<Vec<String>, BackupError> {
        let folder = self.target_folder();
        let mut archives = Vec::new();
        let mut failures = Vec::new();

        for volume in self.source.volumes() {
            let file = format!("{}/{}", folder, archive_name(volume, Local::now()));
            let span = info_span!(
                "volume_backup",
                container = %self.name,
                source = %format!("{}:{}", self.source.name, volume),
                target_volume = %self.target,
                target = %file,
            );

            let result = async {
                debug!("volume backup started");

                let mkdir = vec!["mkdir".to_string(), "-p".to_string(), folder.clone()];
                if let Err(e) = self.exec(mkdir).await {
                    error!(error = %e, "failed to create backup target folder");
                    return Err(e);
                }

                let tar = vec![
                    "/bin/tar".to_string(),
                    "czf".to_string(),
                    file.clone(),
                    format!("--directory={}/{}", SOURCE_MOUNT, volume),
                    ".".to_string(),
                ];
                if let Err(e) = self.exec(tar).await {
                    error!(error = %e, "failed to exec backup command");
                    return Err(e);
                }

                info!("volume backup finished");
                Ok(())
            }
            .instrument(span)
            .await;

            match result {
                Ok(()) => archives.push(file),
                Err(e) => failures.push(e),
            }
        }

        BackupError::collect(failures)?;
        Ok(archives)
    }

    async fn exec(&self, cmd: Vec<String>) -> Result<(), BackupError> {
        let command = cmd.join(" ");
        let output = self
            .runtime
            .exec(&self.id, &cmd)
            .await
            .map_err(|e| BackupError::provision(format!("exec `{}`", command), e))?;

        if !output.output.is_empty() {
            debug!(cmd = %command, output = %output.output.trim_end(), "exec output");
        }

        if !output.success() {
            return Err(BackupError::Exec {
                command,
                exit_code: output.exit_code,
                output: output.output,
            });
        }
        Ok(())
    }

    /// Stop (if started) and remove the worker.
    ///
    /// The worker's shell ignores SIGTERM, so it is killed without a grace
    /// period. Removal is forced and attempted even if stopping failed.
    pub async fn destroy(&mut self) -> Result<(), BackupError> {
        if self.state == WorkerState::Removed {
            return Ok(());
        }

        if self.state == WorkerState::Started {
            match self.runtime.stop_container(&self.id, Some(0)).await {
                Ok(()) => self.state = WorkerState::Stopped,
                Err(e) => {
                    warn!(container = %self.name, error = %e, "failed to stop backup container")
                }
            }
        }

        self.runtime
            .remove_container(&self.id, true)
            .await
            .map_err(|e| BackupError::provision("remove backup container", e))?;
        self.state = WorkerState::Removed;

        debug!(container = %self.name, "backup container removed");
        Ok(())
    }
}

/// Archive all volumes of `source` into `target` with a fresh worker.
///
/// The worker is destroyed on every path, including a panic during the
/// copy; a teardown failure is logged and never replaces the result of the
/// copy.
pub async fn run_backup(
    runtime: Arc<dyn ContainerRuntime>,
    image: &str,
    source: &Container,
    target: &Volume,
) -> Result<Vec<String>, BackupError> {
    let mut worker = BackupContainer::create(runtime, image, source, target).await?;

    let result = match worker.start().await {
        Ok(()) => {
            let copy = worker.clone();
            tokio::spawn(async move { copy.backup().await }.instrument(Span::current()))
                .await
                .unwrap_or_else(|e| {
                    error!(container = %worker.name(), error = %e, "volume copy interrupted");
                    Err(BackupError::Interrupted(e.to_string()))
                })
        }
        Err(e) => Err(e),
    };

    if let Err(e) = worker.destroy().await {
        error!(container = %worker.name(), error = %e, "failed to destroy backup container");
    }

    result
}
