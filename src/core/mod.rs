pub mod container;
pub mod job;
pub mod labels;
pub mod orchestrator;
pub mod resolver;
pub mod scheduler;
pub mod volume;
pub mod worker;

pub use container::Container;
pub use job::{Job, JobReport, JobScope, JobSpec, Member};
pub use labels::{Label, LabelKeys};
pub use orchestrator::Orchestrator;
pub use resolver::{Defaults, Diagnostic, Resolution};
pub use scheduler::Scheduler;
pub use volume::Volume;
pub use worker::BackupContainer;
