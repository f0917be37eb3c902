use chrono::{DateTime, Local};
use cron::Schedule;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::core::job::{Job, JobReport};
use crate::error::BackupError;

/// Normalise a 5-field crontab expression to the 6-field form of the `cron`
/// crate: prepend a seconds field of `0` and renumber the day-of-week field
/// from crontab's 0-7 (Sunday is 0 or 7) to 1-7 (Sunday is 1). Other field
/// counts pass through unchanged.
pub fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, day, month, weekday] => format!(
            "0 {} {} {} {} {}",
            minute,
            hour,
            day,
            month,
            crontab_weekdays(weekday)
        ),
        _ => trimmed.to_string(),
    }
}

/// Renumber a crontab day-of-week field. Day names and items that are not
/// plain numeric syntax are kept as written for the cron parser to judge.
fn crontab_weekdays(field: &str) -> String {
    if field == "*" || field == "?" {
        return field.to_string();
    }

    let mut days = BTreeSet::new();
    let mut verbatim = Vec::new();
    for item in field.split(',') {
        match expand_weekdays(item) {
            Some(expanded) => days.extend(expanded),
            None => verbatim.push(item.to_string()),
        }
    }

    days.into_iter()
        .map(|d| d.to_string())
        .chain(verbatim)
        .collect::<Vec<_>>()
        .join(",")
}

/// Expand one `*`, `a`, `a-b` item with an optional `/step` into the
/// crate's weekday numbers.
fn expand_weekdays(item: &str) -> Option<Vec<u32>> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step.parse::<usize>().ok().filter(|s| *s > 0)?)),
        None => (item, None),
    };

    let (first, last) = if base == "*" {
        (0, 6)
    } else if let Some((first, last)) = base.split_once('-') {
        (crontab_weekday(first)?, crontab_weekday(last)?)
    } else {
        let first = crontab_weekday(base)?;
        (first, if step.is_some() { 6 } else { first })
    };
    if first > last {
        return None;
    }

    Some(
        (first..=last)
            .step_by(step.unwrap_or(1))
            .map(|d| d % 7 + 1)
            .collect(),
    )
}

fn crontab_weekday(raw: &str) -> Option<u32> {
    raw.parse().ok().filter(|d| *d <= 7)
}

pub fn parse_schedule(expression: &str) -> Result<Schedule, BackupError> {
    if expression.trim().is_empty() {
        return Err(BackupError::InvalidSchedule {
            expression: String::new(),
            reason: "no schedule configured".to_string(),
        });
    }

    Schedule::from_str(&normalize_cron(expression)).map_err(|e| BackupError::InvalidSchedule {
        expression: expression.trim().to_string(),
        reason: e.to_string(),
    })
}

struct Entry {
    expression: String,
    schedule: Schedule,
    job: Job,
}

/// Fires registered jobs on their cron schedules, in local time.
#[derive(Default)]
pub struct Scheduler {
    entries: Vec<Entry>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job. Fails, without registering it, on an empty or invalid
    /// expression.
    pub fn register(&mut self, expression: &str, job: Job) -> Result<(), BackupError> {
        let schedule = parse_schedule(expression)?;
        info!(job = %job.name(), schedule = %expression.trim(), "backup job registered");
        self.entries.push(Entry {
            expression: expression.trim().to_string(),
            schedule,
            job,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.entries.iter().map(|e| &e.job)
    }

    /// Next fire time of every job after `after`, in registration order.
    /// `None` when a schedule never fires again.
    pub fn upcoming(&self, after: DateTime<Local>) -> Vec<(&Job, Option<DateTime<Local>>)> {
        self.entries
            .iter()
            .map(|e| (&e.job, e.schedule.after(&after).next()))
            .collect()
    }

    /// Run every job once, one after another.
    pub async fn run_now(&self) -> Vec<JobReport> {
        let mut reports = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            reports.push(entry.job.run().await);
        }
        reports
    }

    /// Drive all trigger loops until `cancel` fires, then wait for job runs
    /// already in flight.
    pub async fn run(self, cancel: CancellationToken) {
        let tracker = TaskTracker::new();

        for entry in self.entries {
            tracker.spawn(trigger_loop(entry, tracker.clone(), cancel.clone()));
        }
        tracker.close();

        cancel.cancelled().await;
        if !tracker.is_empty() {
            info!(tasks = tracker.len(), "waiting for running backups to finish");
        }
        tracker.wait().await;
        info!("scheduler stopped");
    }
}

async fn trigger_loop(entry: Entry, tracker: TaskTracker, cancel: CancellationToken) {
    let mut last = Local::now();

    loop {
        let Some(next) = entry.schedule.after(&last).next() else {
            warn!(
                job = %entry.job.name(),
                schedule = %entry.expression,
                "schedule has no upcoming fire times"
            );
            return;
        };

        let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(job = %entry.job.name(), next = %next, "next backup scheduled");

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        last = next;
        let job = entry.job.clone();
        tracker.spawn(async move {
            job.run().await;
        });
    }
}
