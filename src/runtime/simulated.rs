use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    Bind, ContainerRuntime, ContainerSpec, ContainerSummary, ExecOutput, MountKind, MountPoint,
    RuntimeError, VolumeSpec,
};

/// Everything the simulated runtime was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    ContainerCreated(String),
    ContainerStarted(String),
    ContainerStopped(String),
    ContainerRemoved(String),
    VolumeCreated(String),
    VolumeRemoved(String),
    Exec { container: String, cmd: Vec<String> },
}

struct SimContainer {
    id: String,
    name: String,
    labels: BTreeMap<String, String>,
    mounts: Vec<MountPoint>,
    binds: Vec<Bind>,
    running: bool,
}

#[derive(Default)]
struct Failures {
    stop: BTreeSet<String>,
    exec: Vec<String>,
    volume_create: bool,
    container_create: bool,
}

#[derive(Default)]
struct SimState {
    containers: Vec<SimContainer>,
    volumes: BTreeMap<String, VolumeSpec>,
    images: BTreeSet<String>,
    next_id: u64,
    failures: Failures,
    events: Vec<RuntimeEvent>,
    archives: Vec<String>,
}

impl SimState {
    fn find(&self, id: &str) -> Result<&SimContainer, RuntimeError> {
        self.containers
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found("container", id))
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut SimContainer, RuntimeError> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found("container", id))
    }

    fn name_of(&self, id: &str) -> String {
        self.find(id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|_| id.to_string())
    }
}

fn not_found(kind: &'static str, name: &str) -> RuntimeError {
    RuntimeError::NotFound {
        kind,
        name: name.to_string(),
    }
}

/// In-memory container runtime.
///
/// Containers, volumes and images live in a shared state, so clones observe
/// each other. Execs of `mkdir -p` and `tar czf` are interpreted: when the
/// worker's `/target` is bound to an absolute host path the directory and a
/// placeholder archive are created on disk, otherwise the archive path is
/// only recorded.
#[derive(Clone)]
pub struct SimulatedRuntime {
    hostname: String,
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new("simulated-host")
    }
}

impl SimulatedRuntime {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a running container with one named volume per entry in `volumes`.
    pub fn add_container(&self, name: &str, labels: &[(&str, &str)], volumes: &[&str]) -> String {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("sim{:08}", state.next_id);

        for volume in volumes {
            state
                .volumes
                .entry(volume.to_string())
                .or_insert_with(|| VolumeSpec {
                    name: volume.to_string(),
                    driver: "local".to_string(),
                    driver_opts: BTreeMap::new(),
                    labels: BTreeMap::new(),
                });
        }

        state.containers.push(SimContainer {
            id: id.clone(),
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            mounts: volumes
                .iter()
                .map(|v| MountPoint {
                    kind: MountKind::Volume,
                    name: v.to_string(),
                    destination: format!("/data/{}", v),
                })
                .collect(),
            binds: Vec::new(),
            running: true,
        });

        id
    }

    /// Make `stop` fail for every container whose name starts with `prefix`.
    pub fn fail_stop(&self, prefix: &str) {
        self.state().failures.stop.insert(prefix.to_string());
    }

    /// Make every exec whose command line contains `pattern` exit with 1.
    pub fn fail_exec_matching(&self, pattern: &str) {
        self.state().failures.exec.push(pattern.to_string());
    }

    pub fn fail_volume_create(&self) {
        self.state().failures.volume_create = true;
    }

    pub fn fail_container_create(&self) {
        self.state().failures.container_create = true;
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state()
            .containers
            .iter()
            .any(|c| c.name == name && c.running)
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state().containers.iter().map(|c| c.name.clone()).collect()
    }

    /// Names of volumes that currently exist.
    pub fn volumes(&self) -> Vec<String> {
        self.state().volumes.keys().cloned().collect()
    }

    /// Names of live volumes created through `create_volume`.
    pub fn managed_volumes(&self) -> Vec<String> {
        let created = self.created_volumes();
        self.volumes()
            .into_iter()
            .filter(|v| created.contains(v))
            .collect()
    }

    /// Archive paths (inside the worker) written so far.
    pub fn archives(&self) -> Vec<String> {
        self.state().archives.clone()
    }

    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.state().events.clone()
    }

    /// Names of every volume ever created, in creation order.
    pub fn created_volumes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RuntimeEvent::VolumeCreated(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Driver options of a live volume.
    pub fn volume_options(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state().volumes.get(name).map(|v| v.driver_opts.clone())
    }
}

/// Translate a path inside the worker into the host path behind its bind.
fn host_path(binds: &[Bind], inner: &str) -> Option<PathBuf> {
    binds.iter().find_map(|b| {
        let rest = inner.strip_prefix(&b.destination)?;
        if !Path::new(&b.source).is_absolute() {
            return None;
        }
        let rest = rest.trim_start_matches('/');
        Some(Path::new(&b.source).join(rest))
    })
}

fn exit(code: i64, output: impl Into<String>) -> ExecOutput {
    ExecOutput {
        exit_code: code,
        output: output.into(),
    }
}

fn interpret(binds: &[Bind], cmd: &[String]) -> (ExecOutput, Option<String>) {
    let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["mkdir", "-p", dir] => {
            if let Some(path) = host_path(binds, dir) {
                if let Err(e) = std::fs::create_dir_all(&path) {
                    return (exit(1, format!("mkdir: {}", e)), None);
                }
            }
            (exit(0, ""), None)
        }
        [tar, "czf", archive, directory, "."] if tar.ends_with("tar") => {
            let Some(source) = directory.strip_prefix("--directory=") else {
                return (exit(2, "tar: missing --directory"), None);
            };
            if !binds.iter().any(|b| b.destination == source) {
                return (exit(2, format!("tar: {}: No such file or directory", source)), None);
            }
            if let Some(path) = host_path(binds, archive) {
                if let Err(e) = std::fs::write(&path, b"simulated archive") {
                    return (exit(1, format!("tar: {}", e)), None);
                }
            }
            (exit(0, ""), Some(archive.to_string()))
        }
        _ => (exit(127, format!("{}: not found", cmd.join(" "))), None),
    }
}

#[async_trait]
impl ContainerRuntime for SimulatedRuntime {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn list_containers(
        &self,
        label_filters: &[(String, String)],
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let state = self.state();
        Ok(state
            .containers
            .iter()
            .filter(|c| {
                label_filters
                    .iter()
                    .all(|(k, v)| c.labels.get(k).is_some_and(|actual| actual == v))
            })
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                labels: c.labels.clone(),
                mounts: c.mounts.clone(),
                running: c.running,
            })
            .collect())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.state().images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut state = self.state();

        if state.failures.container_create {
            return Err(RuntimeError::Command {
                command: "create".to_string(),
                message: "simulated failure".to_string(),
            });
        }
        if !state.images.contains(&spec.image) {
            return Err(not_found("image", &spec.image));
        }
        if state.containers.iter().any(|c| c.name == spec.name) {
            return Err(RuntimeError::Conflict(format!(
                "container name '{}' is already in use",
                spec.name
            )));
        }
        for bind in &spec.binds {
            let is_path = Path::new(&bind.source).is_absolute();
            if !is_path && !state.volumes.contains_key(&bind.source) {
                // Docker creates missing named volumes implicitly.
                state.volumes.insert(
                    bind.source.clone(),
                    VolumeSpec {
                        name: bind.source.clone(),
                        driver: "local".to_string(),
                        driver_opts: BTreeMap::new(),
                        labels: BTreeMap::new(),
                    },
                );
            }
        }

        state.next_id += 1;
        let id = format!("sim{:08}", state.next_id);
        state.containers.push(SimContainer {
            id: id.clone(),
            name: spec.name.clone(),
            labels: spec.labels.clone(),
            mounts: spec
                .binds
                .iter()
                .map(|b| MountPoint {
                    kind: if Path::new(&b.source).is_absolute() {
                        MountKind::Bind
                    } else {
                        MountKind::Volume
                    },
                    name: b.source.clone(),
                    destination: b.destination.clone(),
                })
                .collect(),
            binds: spec.binds.clone(),
            running: false,
        });
        state.events.push(RuntimeEvent::ContainerCreated(spec.name.clone()));

        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        let container = state.find_mut(id)?;
        container.running = true;
        let name = container.name.clone();
        state.events.push(RuntimeEvent::ContainerStarted(name));
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Option<u32>) -> Result<(), RuntimeError> {
        let mut state = self.state();
        let name = state.find(id)?.name.clone();

        if state.failures.stop.iter().any(|p| name.starts_with(p.as_str())) {
            return Err(RuntimeError::Command {
                command: "stop".to_string(),
                message: format!("simulated failure stopping {}", name),
            });
        }

        state.find_mut(id)?.running = false;
        state.events.push(RuntimeEvent::ContainerStopped(name));
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let mut state = self.state();
        let container = state.find(id)?;
        if container.running && !force {
            return Err(RuntimeError::Conflict(format!(
                "cannot remove running container {}",
                container.name
            )));
        }

        let name = container.name.clone();
        state.containers.retain(|c| c.id != id);
        state.events.push(RuntimeEvent::ContainerRemoved(name));
        Ok(())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<(), RuntimeError> {
        let mut state = self.state();

        if state.failures.volume_create {
            return Err(RuntimeError::Command {
                command: "volume create".to_string(),
                message: "simulated failure".to_string(),
            });
        }
        if state.volumes.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict(format!(
                "volume '{}' already exists",
                spec.name
            )));
        }

        state.volumes.insert(spec.name.clone(), spec.clone());
        state.events.push(RuntimeEvent::VolumeCreated(spec.name.clone()));
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();

        if !state.volumes.contains_key(name) {
            return Err(not_found("volume", name));
        }
        let in_use = state
            .containers
            .iter()
            .any(|c| c.mounts.iter().any(|m| m.name == name));
        if in_use {
            return Err(RuntimeError::Conflict(format!("volume '{}' is in use", name)));
        }

        state.volumes.remove(name);
        state.events.push(RuntimeEvent::VolumeRemoved(name.to_string()));
        Ok(())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, RuntimeError> {
        let mut state = self.state();
        let container = state.find(id)?;
        if !container.running {
            return Err(RuntimeError::Conflict(format!(
                "container {} is not running",
                container.name
            )));
        }

        let binds = container.binds.clone();
        let name = state.name_of(id);
        state.events.push(RuntimeEvent::Exec {
            container: name,
            cmd: cmd.to_vec(),
        });

        let line = cmd.join(" ");
        if state.failures.exec.iter().any(|p| line.contains(p.as_str())) {
            return Ok(exit(1, format!("simulated failure: {}", line)));
        }

        let (output, archive) = interpret(&binds, cmd);
        if let Some(archive) = archive {
            state.archives.push(archive);
        }
        Ok(output)
    }
}
