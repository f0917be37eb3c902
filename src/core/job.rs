//! Backup jobs.
//!
//! A job is created once from resolved configuration and run on every
//! trigger. Each run provisions the target volume, holds the containers
//! flagged for it, archives every member through a fresh worker and then
//! unwinds its cleanup stack in reverse order, whatever happened in between.

use chrono::Local;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::core::container::Container;
use crate::core::volume::{Volume, mask_address};
use crate::core::worker;
use crate::error::BackupError;
use crate::runtime::ContainerRuntime;

/// A container taking part in a job, with its resolved hold flag.
#[derive(Debug, Clone)]
pub struct Member {
    pub container: Container,
    pub hold: bool,
}

#[derive(Debug, Clone)]
pub enum JobScope {
    Single(Member),
    Group { name: String, members: Vec<Member> },
}

impl JobScope {
    /// Container name for single jobs, group name for groups.
    pub fn name(&self) -> &str {
        match self {
            Self::Single(member) => &member.container.name,
            Self::Group { name, .. } => name,
        }
    }

    pub fn members(&self) -> &[Member] {
        match self {
            Self::Single(member) => slice::from_ref(member),
            Self::Group { members, .. } => members,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group { .. })
    }
}

/// Resolved job description.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub scope: JobScope,
    /// Target address; may carry credentials, log it through `mask_address`.
    pub target: String,
    /// Cron expression, empty when neither label nor default provided one.
    pub schedule: String,
}

/// Outcome of one run.
#[derive(Debug, Default)]
pub struct JobReport {
    pub job: String,
    /// The previous run of this job was still in progress.
    pub skipped: bool,
    /// Setup failure that prevented the copy phase.
    pub aborted: Option<BackupError>,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, BackupError)>,
    pub archives: Vec<String>,
}

impl JobReport {
    fn new(job: &str) -> Self {
        Self {
            job: job.to_string(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        !self.skipped && self.aborted.is_none() && self.failed.is_empty()
    }
}

type CleanupFuture = Pin<Box<dyn Future<Output = Result<(), BackupError>> + Send>>;

/// Deferred teardown actions, run last-in first-out.
#[derive(Default)]
struct CleanupStack {
    actions: Vec<(String, CleanupFuture)>,
}

impl CleanupStack {
    fn push<F>(&mut self, what: impl Into<String>, action: F)
    where
        F: Future<Output = Result<(), BackupError>> + Send + 'static,
    {
        self.actions.push((what.into(), Box::pin(action)));
    }

    async fn unwind(self) {
        for (what, action) in self.actions.into_iter().rev() {
            match action.await {
                Ok(()) => debug!(cleanup = %what, "cleanup done"),
                Err(e) => error!(cleanup = %what, error = %e, "cleanup failed"),
            }
        }
    }
}

type SharedCleanup = Arc<Mutex<CleanupStack>>;

fn push_cleanup<F>(stack: &SharedCleanup, what: impl Into<String>, action: F)
where
    F: Future<Output = Result<(), BackupError>> + Send + 'static,
{
    stack
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(what, action);
}

/// Marks a job as running for as long as it is alive.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct JobInner {
    spec: JobSpec,
    runtime: Arc<dyn ContainerRuntime>,
    worker_image: String,
    running: AtomicBool,
}

/// A runnable backup job. Cheap to clone; clones share the re-entrancy guard.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

#[derive(Default)]
struct CopyOutcome {
    aborted: Option<BackupError>,
    succeeded: Vec<String>,
    failed: Vec<(String, BackupError)>,
    archives: Vec<String>,
}

impl Job {
    pub fn new(
        spec: JobSpec,
        runtime: Arc<dyn ContainerRuntime>,
        worker_image: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(JobInner {
                spec,
                runtime,
                worker_image: worker_image.into(),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.spec.scope.name()
    }

    pub fn schedule(&self) -> &str {
        &self.inner.spec.schedule
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Name of the runtime volume backing a network share target.
    fn volume_name(&self) -> String {
        format!(
            "temp_backup_target_{}_{}",
            self.name(),
            Local::now().format("%Y%m%d_%H%M%S")
        )
    }

    /// Execute the job once. Never panics or propagates errors; everything
    /// is logged and summarised in the report.
    pub async fn run(&self) -> JobReport {
        let spec = &self.inner.spec;
        let span = info_span!(
            "backup_job",
            hostname = %self.inner.runtime.hostname(),
            job = %self.name(),
            group = spec.scope.is_group(),
            target = %mask_address(&spec.target),
        );

        async {
            let mut report = JobReport::new(self.name());

            let Some(_guard) = RunGuard::acquire(&self.inner.running) else {
                warn!("previous backup run still in progress, skipping");
                report.skipped = true;
                return report;
            };

            let volume = match Volume::resolve(&spec.target, &self.volume_name()) {
                Ok(volume) => volume,
                Err(e) => {
                    error!(error = %e, "failed to init backup volume");
                    report.aborted = Some(e);
                    return report;
                }
            };

            if let Err(e) = volume.create(self.inner.runtime.as_ref()).await {
                error!(error = %e, "failed to create backup volume");
                report.aborted = Some(e);
                return report;
            }

            let cleanup: SharedCleanup = Arc::default();
            push_cleanup(&cleanup, format!("destroy volume {}", volume), {
                let volume = volume.clone();
                let runtime = self.inner.runtime.clone();
                async move { volume.destroy(runtime.as_ref()).await }
            });

            // The copy phase runs on its own task so a panic in it still
            // leaves us here to unwind the cleanup stack.
            let phase = tokio::spawn({
                let job = self.clone();
                let cleanup = cleanup.clone();
                async move { job.hold_and_copy(&volume, &cleanup).await }
                    .instrument(tracing::Span::current())
            });
            let outcome = phase.await;

            let stack = mem::take(&mut *cleanup.lock().unwrap_or_else(PoisonError::into_inner));
            stack.unwind().await;

            match outcome {
                Ok(outcome) => {
                    report.aborted = outcome.aborted;
                    report.succeeded = outcome.succeeded;
                    report.failed = outcome.failed;
                    report.archives = outcome.archives;
                }
                Err(e) => {
                    error!(error = %e, "backup run interrupted");
                    report.aborted = Some(BackupError::Interrupted(e.to_string()));
                }
            }

            if report.is_success() {
                info!(containers = report.succeeded.len(), "container backup finished");
            } else {
                warn!(
                    succeeded = report.succeeded.len(),
                    failed = report.failed.len(),
                    aborted = report.aborted.is_some(),
                    "container backup finished with errors"
                );
            }

            report
        }
        .instrument(span)
        .await
    }

    async fn hold_and_copy(&self, volume: &Volume, cleanup: &SharedCleanup) -> CopyOutcome {
        let mut outcome = CopyOutcome::default();
        let members = self.inner.spec.scope.members();

        for member in members.iter().filter(|m| m.hold) {
            let container = &member.container;
            if let Err(source) = container.stop().await {
                let e = BackupError::Hold {
                    container: container.name.clone(),
                    source,
                };
                error!(
                    container = %container.name,
                    error = %e,
                    "failed to hold container for backup"
                );
                outcome.aborted = Some(e);
                return outcome;
            }

            push_cleanup(cleanup, format!("restart {}", container.name), {
                let container = container.clone();
                async move { container.start().await.map_err(BackupError::from) }
            });
        }

        for member in members {
            let container = &member.container;
            let result = worker::run_backup(
                self.inner.runtime.clone(),
                &self.inner.worker_image,
                container,
                volume,
            )
            .await;

            match result {
                Ok(archives) => {
                    outcome.archives.extend(archives);
                    outcome.succeeded.push(container.name.clone());
                }
                Err(e) => {
                    error!(container = %container.name, error = %e, "container backup failed");
                    outcome.failed.push((container.name.clone(), e));
                }
            }
        }

        outcome
    }
}
