use anyhow::{Context, Result, bail};
use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::core::container::Container;
use crate::core::job::{Job, JobReport, JobScope, JobSpec, Member};
use crate::core::labels::{Label, LabelKeys};
use crate::core::resolver;
use crate::core::scheduler::Scheduler;
use crate::core::volume::mask_address;
use crate::error::BackupError;

/// Group name used by one-shot backups of several containers.
pub const MANUAL_GROUP: &str = "manual";

pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    fn keys(&self) -> LabelKeys {
        LabelKeys::new(self.ctx.config.label_prefix.clone())
    }

    fn job(&self, spec: JobSpec) -> Job {
        Job::new(
            spec,
            self.ctx.runtime.clone(),
            self.ctx.config.worker_image.clone(),
        )
    }

    /// Containers that opted in with `enabled=true`.
    pub async fn discover(&self) -> Result<Vec<Container>, BackupError> {
        let containers =
            Container::find_by_labels(&self.ctx.runtime, &self.keys(), &[(Label::Enabled, "true")])
                .await?;

        for container in containers.iter().filter(|c| !c.is_running()) {
            info!(
                container = %container,
                "container is not running, its volumes are backed up as they are"
            );
        }
        Ok(containers)
    }

    /// Resolve jobs for `containers` and register each on its schedule.
    /// Anything that cannot be scheduled is logged and left out.
    pub fn plan(&self, containers: &[Container]) -> Scheduler {
        let resolution = resolver::resolve(containers, &self.ctx.config.defaults());
        for diagnostic in &resolution.diagnostics {
            diagnostic.log();
        }

        let mut scheduler = Scheduler::new();
        for spec in resolution.jobs {
            let schedule = spec.schedule.clone();
            let job = self.job(spec);
            let name = job.name().to_string();

            if let Err(e) = scheduler.register(&schedule, job) {
                error!(job = %name, kind = e.kind().as_str(), error = %e, "skipping backup job");
            }
        }
        scheduler
    }

    /// Schedule every discovered job and run until `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        info!(hostname = %self.ctx.runtime.hostname(), "docker backup daemon starting");

        let containers = self
            .discover()
            .await
            .context("Failed to list containers")?;
        if containers.is_empty() {
            bail!(
                "no containers labelled {}=true found",
                self.keys().key(Label::Enabled)
            );
        }
        info!(count = containers.len(), "containers enabled for backup");

        let scheduler = self.plan(&containers);
        if scheduler.is_empty() {
            warn!("no backup job could be scheduled");
        }
        for (job, next) in scheduler.upcoming(Local::now()) {
            if let Some(next) = next {
                info!(job = %job.name(), next = %next, "first backup scheduled");
            }
        }

        scheduler.run(cancel).await;
        Ok(())
    }

    /// Back up the named containers right away into one shared target.
    ///
    /// Several containers form a single group run; `target` falls back to
    /// the configured default. Fails if any step failed.
    pub async fn backup_now(
        &self,
        names: &[String],
        target: Option<&str>,
        hold: bool,
    ) -> Result<JobReport> {
        if names.is_empty() {
            bail!("no containers given");
        }

        let target = target
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| self.ctx.config.defaults().target)
            .ok_or_else(|| BackupError::UndefinedTarget {
                scope: names.join(","),
            })?;

        let keys = self.keys();
        let mut members = Vec::with_capacity(names.len());
        for name in names {
            let container = Container::find_by_name(&self.ctx.runtime, &keys, name).await?;
            members.push(Member { container, hold });
        }

        let scope = if members.len() == 1 {
            JobScope::Single(members.remove(0))
        } else {
            JobScope::Group {
                name: MANUAL_GROUP.to_string(),
                members,
            }
        };

        info!(job = %scope.name(), target = %mask_address(&target), "manual backup started");
        let report = self
            .job(JobSpec {
                scope,
                target,
                schedule: String::new(),
            })
            .run()
            .await;

        if let Some(e) = &report.aborted {
            bail!("backup of {} aborted: {}", report.job, e);
        }
        if !report.failed.is_empty() {
            let failed: Vec<&str> = report.failed.iter().map(|(name, _)| name.as_str()).collect();
            bail!("backup failed for {}", failed.join(", "));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::runtime::{ContainerRuntime, SimulatedRuntime};
    use std::sync::Arc;

    fn orchestrator(sim: &SimulatedRuntime, config: AppConfig) -> Orchestrator {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(sim.clone());
        Orchestrator::new(AppContext::new(config, runtime))
    }

    #[tokio::test]
    async fn discover_only_returns_enabled_containers() {
        let sim = SimulatedRuntime::default();
        sim.add_container("chuck", &[("docker-backup.enabled", "true")], &["d"]);
        sim.add_container("norris", &[("docker-backup.enabled", "false")], &["d"]);
        sim.add_container("walker", &[], &["d"]);

        let found = orchestrator(&sim, AppConfig::default())
            .discover()
            .await
            .unwrap();
        let names: Vec<&str> = found.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["chuck"]);
    }

    #[tokio::test]
    async fn stopped_containers_are_still_discovered() {
        let sim = SimulatedRuntime::default();
        let id = sim.add_container("chuck", &[("docker-backup.enabled", "true")], &["d"]);
        sim.add_container("norris", &[("docker-backup.enabled", "true")], &["d"]);
        sim.stop_container(&id, None).await.unwrap();

        let found = orchestrator(&sim, AppConfig::default())
            .discover()
            .await
            .unwrap();
        let states: Vec<(&str, bool)> = found
            .iter()
            .map(|c| (c.name.as_str(), c.is_running()))
            .collect();
        assert_eq!(states, [("chuck", false), ("norris", true)]);
    }

    #[tokio::test]
    async fn custom_label_prefix_is_honoured() {
        let sim = SimulatedRuntime::default();
        sim.add_container("chuck", &[("backup.enabled", "true")], &["d"]);

        let config = AppConfig {
            label_prefix: "backup.".to_string(),
            ..AppConfig::default()
        };
        let found = orchestrator(&sim, config).discover().await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn plan_skips_jobs_without_valid_schedule() {
        let sim = SimulatedRuntime::default();
        sim.add_container(
            "chuck",
            &[
                ("docker-backup.enabled", "true"),
                ("docker-backup.schedule", "0 3 * * *"),
            ],
            &["d"],
        );
        sim.add_container("norris", &[("docker-backup.enabled", "true")], &["d"]);
        sim.add_container(
            "walker",
            &[
                ("docker-backup.enabled", "true"),
                ("docker-backup.schedule", "whenever"),
            ],
            &["d"],
        );

        let config = AppConfig {
            default_target: Some("nfs://nas/b".to_string()),
            ..AppConfig::default()
        };
        let orchestrator = orchestrator(&sim, config);
        let containers = orchestrator.discover().await.unwrap();
        let scheduler = orchestrator.plan(&containers);

        let jobs: Vec<&str> = scheduler.jobs().map(Job::name).collect();
        assert_eq!(jobs, ["chuck"]);
    }

    #[tokio::test]
    async fn start_fails_without_enabled_containers() {
        let sim = SimulatedRuntime::default();
        sim.add_container("chuck", &[], &["d"]);

        let err = orchestrator(&sim, AppConfig::default())
            .start(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("docker-backup.enabled=true"));
    }

    #[tokio::test]
    async fn backup_now_groups_named_containers() {
        let sim = SimulatedRuntime::default();
        sim.add_container("chuck", &[], &["a"]);
        sim.add_container("norris", &[], &["b"]);

        let report = orchestrator(&sim, AppConfig::default())
            .backup_now(
                &["chuck".to_string(), "norris".to_string()],
                Some("cifs://nas/b"),
                true,
            )
            .await
            .unwrap();

        assert_eq!(report.job, MANUAL_GROUP);
        assert_eq!(report.archives.len(), 2);
        assert_eq!(sim.created_volumes().len(), 1);
        assert!(sim.is_running("chuck"));
        assert!(sim.is_running("norris"));
    }

    #[tokio::test]
    async fn backup_now_rejects_unknown_container_and_missing_target() {
        let sim = SimulatedRuntime::default();
        sim.add_container("chuck", &[], &["a"]);
        let orchestrator = orchestrator(&sim, AppConfig::default());

        let err = orchestrator
            .backup_now(&["chucky".to_string()], Some("cifs://nas/b"), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("chucky"));

        let err = orchestrator
            .backup_now(&["chuck".to_string()], None, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("undefined backup target"));
        assert!(sim.events().is_empty());
    }

    #[tokio::test]
    async fn backup_now_reports_failed_steps() {
        let sim = SimulatedRuntime::default();
        sim.add_container("chuck", &[], &["a"]);
        sim.fail_exec_matching("/bin/tar");

        let err = orchestrator(&sim, AppConfig::default())
            .backup_now(&["chuck".to_string()], Some("cifs://nas/b"), false)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "backup failed for chuck");
        assert!(sim.managed_volumes().is_empty());
    }
}
