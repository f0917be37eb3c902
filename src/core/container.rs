use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::core::labels::{Label, LabelKeys, parse_flag};
use crate::error::BackupError;
use crate::runtime::{ContainerRuntime, ContainerSummary, MountKind, RuntimeError};

/// A workload as seen by the engine: a runtime snapshot plus the handle to
/// start and stop it.
#[derive(Clone)]
pub struct Container {
    pub name: String,
    id: String,
    labels: BTreeMap<String, String>,
    volumes: Vec<String>,
    running: bool,
    keys: LabelKeys,
    runtime: Arc<dyn ContainerRuntime>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("volumes", &self.volumes)
            .field("running", &self.running)
            .finish()
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, short_id(&self.id))
    }
}

fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

impl Container {
    pub fn from_summary(
        summary: ContainerSummary,
        keys: LabelKeys,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let volumes = summary
            .mounts
            .into_iter()
            .filter(|m| m.kind == MountKind::Volume)
            .map(|m| m.name)
            .collect();

        Self {
            name: summary.name,
            id: summary.id,
            labels: summary.labels,
            volumes,
            running: summary.running,
            keys,
            runtime,
        }
    }

    /// Find a container by its exact name.
    pub async fn find_by_name(
        runtime: &Arc<dyn ContainerRuntime>,
        keys: &LabelKeys,
        name: &str,
    ) -> Result<Self, BackupError> {
        let wanted = name.trim_start_matches('/');
        runtime
            .list_containers(&[])
            .await?
            .into_iter()
            .find(|c| c.name == wanted)
            .map(|c| Self::from_summary(c, keys.clone(), runtime.clone()))
            .ok_or_else(|| BackupError::ContainerNotFound(name.to_string()))
    }

    /// Find every container carrying all of the given label values.
    pub async fn find_by_labels(
        runtime: &Arc<dyn ContainerRuntime>,
        keys: &LabelKeys,
        labels: &[(Label, &str)],
    ) -> Result<Vec<Self>, BackupError> {
        let filters: Vec<(String, String)> = labels
            .iter()
            .map(|(label, value)| (keys.key(*label), value.to_string()))
            .collect();

        let found = runtime.list_containers(&filters).await?;
        debug!(count = found.len(), "containers discovered by label");

        Ok(found
            .into_iter()
            .map(|c| Self::from_summary(c, keys.clone(), runtime.clone()))
            .collect())
    }

    /// Named volumes attached to the container. Bind mounts are not included.
    pub fn volumes(&self) -> &[String] {
        &self.volumes
    }

    /// Whether the container was running when it was discovered.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The label value, if present and not blank.
    pub fn label(&self, label: Label) -> Option<&str> {
        self.labels
            .get(&self.keys.key(label))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Boolean label value; `Err` carries the unparseable raw value.
    pub fn flag(&self, label: Label) -> Result<bool, String> {
        match self.label(label) {
            None => Ok(false),
            Some(raw) => parse_flag(raw).ok_or_else(|| raw.to_string()),
        }
    }

    pub async fn start(&self) -> Result<(), RuntimeError> {
        self.runtime.start_container(&self.id).await?;
        debug!(container = %self.name, "container started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), RuntimeError> {
        self.runtime.stop_container(&self.id, None).await?;
        debug!(container = %self.name, "container stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SimulatedRuntime;

    fn runtime() -> (SimulatedRuntime, Arc<dyn ContainerRuntime>) {
        let sim = SimulatedRuntime::default();
        let shared: Arc<dyn ContainerRuntime> = Arc::new(sim.clone());
        (sim, shared)
    }

    #[tokio::test]
    async fn find_by_name_reports_missing_container() {
        let (sim, runtime) = runtime();
        sim.add_container("chuck", &[], &["data"]);
        let keys = LabelKeys::default();

        let found = Container::find_by_name(&runtime, &keys, "chuck").await.unwrap();
        assert_eq!(found.volumes(), ["data".to_string()]);

        let err = Container::find_by_name(&runtime, &keys, "chucky")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "container 'chucky' not found");
    }

    #[tokio::test]
    async fn labels_are_read_through_prefix() {
        let (sim, runtime) = runtime();
        sim.add_container(
            "chuck",
            &[
                ("docker-backup.enabled", "true"),
                ("docker-backup.target", "  "),
                ("docker-backup.hold", "maybe"),
            ],
            &[],
        );
        sim.add_container("norris", &[], &[]);
        let keys = LabelKeys::default();

        let found = Container::find_by_labels(&runtime, &keys, &[(Label::Enabled, "true")])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let chuck = &found[0];
        assert_eq!(chuck.label(Label::Target), None);
        assert_eq!(chuck.label(Label::Enabled), Some("true"));
        assert_eq!(chuck.flag(Label::Hold), Err("maybe".to_string()));
        assert_eq!(chuck.flag(Label::Group), Ok(false));
    }

    #[tokio::test]
    async fn stop_and_start_toggle_state() {
        let (sim, runtime) = runtime();
        sim.add_container("chuck", &[], &[]);
        let chuck = Container::find_by_name(&runtime, &LabelKeys::default(), "chuck")
            .await
            .unwrap();

        chuck.stop().await.unwrap();
        assert!(!sim.is_running("chuck"));
        chuck.start().await.unwrap();
        assert!(sim.is_running("chuck"));
    }

    #[test]
    fn short_id_counts_characters() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("0123456789aé€x"), "0123456789aé");
    }
}
