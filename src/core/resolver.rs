//! Derives backup jobs from container labels and process defaults.
//!
//! Resolution is pure: it reads container snapshots and never touches the
//! runtime. Problems that do not prevent a job from being built are reported
//! as [`Diagnostic`]s next to the jobs.

use std::collections::HashMap;
use std::fmt;
use tracing::{error, warn};

use crate::core::container::Container;
use crate::core::job::{JobScope, JobSpec, Member};
use crate::core::labels::Label;
use crate::core::volume::mask_address;
use crate::error::BackupError;

/// Fallbacks for containers that do not carry their own labels.
#[derive(Debug, Clone, Default)]
pub struct Defaults {
    pub target: Option<String>,
    pub schedule: Option<String>,
}

impl Defaults {
    fn target(&self) -> Option<&str> {
        non_empty(self.target.as_deref())
    }

    fn schedule(&self) -> Option<&str> {
        non_empty(self.schedule.as_deref())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug)]
pub enum Diagnostic {
    /// Group members disagree on the target; `chosen` is used.
    /// Both values are masked.
    AmbiguousTarget {
        group: String,
        previous: String,
        chosen: String,
    },
    AmbiguousSchedule {
        group: String,
        previous: String,
        chosen: String,
    },
    /// Unrecognised hold value, treated as `false`.
    InvalidHold { container: String, value: String },
    /// No job could be built for this container or group.
    Skipped { scope: String, error: BackupError },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AmbiguousTarget {
                group,
                previous,
                chosen,
            } => write!(
                f,
                "ambiguous target for group {}: '{}' vs '{}', using '{}'",
                group, previous, chosen, chosen
            ),
            Self::AmbiguousSchedule {
                group,
                previous,
                chosen,
            } => write!(
                f,
                "ambiguous schedule for group {}: '{}' vs '{}', using '{}'",
                group, previous, chosen, chosen
            ),
            Self::InvalidHold { container, value } => write!(
                f,
                "invalid hold value '{}' on container {}, not holding",
                value, container
            ),
            Self::Skipped { scope, error } => write!(f, "skipping {}: {}", scope, error),
        }
    }
}

impl Diagnostic {
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    pub fn log(&self) {
        match self {
            Self::AmbiguousTarget { group, chosen, .. } => {
                warn!(group = %group, target = %chosen, "{}", self)
            }
            Self::AmbiguousSchedule { group, chosen, .. } => {
                warn!(group = %group, schedule = %chosen, "{}", self)
            }
            Self::InvalidHold { container, .. } => warn!(container = %container, "{}", self),
            Self::Skipped { scope, error } => {
                error!(scope = %scope, kind = error.kind().as_str(), "{}", self)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub jobs: Vec<JobSpec>,
    pub diagnostics: Vec<Diagnostic>,
}

enum Pending<'a> {
    Single(&'a Container),
    Group(String, Vec<&'a Container>),
}

/// Build one job per ungrouped container and one per group value.
///
/// Jobs come out in the order their first container was seen; group members
/// keep discovery order.
pub fn resolve(containers: &[Container], defaults: &Defaults) -> Resolution {
    let mut pending: Vec<Pending<'_>> = Vec::new();
    let mut groups: HashMap<&str, usize> = HashMap::new();

    for container in containers {
        match container.label(Label::Group) {
            None => pending.push(Pending::Single(container)),
            Some(group) => match groups.get(group) {
                Some(&index) => {
                    if let Pending::Group(_, members) = &mut pending[index] {
                        members.push(container);
                    }
                }
                None => {
                    groups.insert(group, pending.len());
                    pending.push(Pending::Group(group.to_string(), vec![container]));
                }
            },
        }
    }

    let mut resolution = Resolution::default();
    for entry in pending {
        let job = match entry {
            Pending::Single(container) => resolve_single(container, defaults, &mut resolution),
            Pending::Group(name, members) => {
                resolve_group(name, &members, defaults, &mut resolution)
            }
        };
        if let Some(job) = job {
            resolution.jobs.push(job);
        }
    }
    resolution
}

fn member(container: &Container, diagnostics: &mut Vec<Diagnostic>) -> Member {
    let hold = match container.flag(Label::Hold) {
        Ok(hold) => hold,
        Err(value) => {
            diagnostics.push(Diagnostic::InvalidHold {
                container: container.name.clone(),
                value,
            });
            false
        }
    };
    Member {
        container: container.clone(),
        hold,
    }
}

fn resolve_single(
    container: &Container,
    defaults: &Defaults,
    resolution: &mut Resolution,
) -> Option<JobSpec> {
    let target = match resolve_target(container, defaults) {
        Ok(target) => target,
        Err(error) => {
            resolution.diagnostics.push(Diagnostic::Skipped {
                scope: format!("container {}", container.name),
                error,
            });
            return None;
        }
    };

    let schedule = container
        .label(Label::Schedule)
        .or(defaults.schedule())
        .unwrap_or_default()
        .to_string();

    Some(JobSpec {
        scope: JobScope::Single(member(container, &mut resolution.diagnostics)),
        target,
        schedule,
    })
}

fn resolve_group(
    name: String,
    members: &[&Container],
    defaults: &Defaults,
    resolution: &mut Resolution,
) -> Option<JobSpec> {
    let target = match resolve_group_target(&name, members, defaults, &mut resolution.diagnostics)
    {
        Ok(target) => target,
        Err(error) => {
            resolution.diagnostics.push(Diagnostic::Skipped {
                scope: format!("group {}", name),
                error,
            });
            return None;
        }
    };

    let schedule = last_label(members, Label::Schedule, |previous, chosen| {
        resolution.diagnostics.push(Diagnostic::AmbiguousSchedule {
            group: name.clone(),
            previous: previous.to_string(),
            chosen: chosen.to_string(),
        })
    })
    .or(defaults.schedule())
    .unwrap_or_default()
    .to_string();

    let members = members
        .iter()
        .map(|c| member(c, &mut resolution.diagnostics))
        .collect();

    Some(JobSpec {
        scope: JobScope::Group { name, members },
        target,
        schedule,
    })
}

/// Target of a single container: its label, else the default.
pub fn resolve_target(container: &Container, defaults: &Defaults) -> Result<String, BackupError> {
    container
        .label(Label::Target)
        .or(defaults.target())
        .map(str::to_string)
        .ok_or_else(|| BackupError::UndefinedTarget {
            scope: format!("container {}", container.name),
        })
}

/// Target shared by a group: the last member label, else the default.
/// Disagreeing members produce an `AmbiguousTarget` diagnostic.
pub fn resolve_group_target(
    group: &str,
    members: &[&Container],
    defaults: &Defaults,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<String, BackupError> {
    last_label(members, Label::Target, |previous, chosen| {
        diagnostics.push(Diagnostic::AmbiguousTarget {
            group: group.to_string(),
            previous: mask_address(previous),
            chosen: mask_address(chosen),
        })
    })
    .or(defaults.target())
    .map(str::to_string)
    .ok_or_else(|| BackupError::UndefinedTarget {
        scope: format!("group {}", group),
    })
}

/// Last non-empty value of `label` across `members`, calling `on_conflict`
/// whenever a value differs from the one seen before it.
fn last_label<'a>(
    members: &[&'a Container],
    label: Label,
    mut on_conflict: impl FnMut(&str, &str),
) -> Option<&'a str> {
    let mut current: Option<&'a str> = None;
    for container in members {
        if let Some(value) = container.label(label) {
            if let Some(previous) = current.filter(|p| *p != value) {
                on_conflict(previous, value);
            }
            current = Some(value);
        }
    }
    current
}
