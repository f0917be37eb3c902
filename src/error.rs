use crate::runtime::RuntimeError;

/// Coarse classification used for log fields and propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or unusable target/schedule. The job or group is skipped.
    Configuration,
    /// Volume or worker provisioning failed. Cleanup runs, the scope ends.
    Provision,
    /// The runtime cannot be reached. Fatal at process start only.
    RuntimeConnection,
    /// A container flagged for holding could not be stopped.
    Hold,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Provision => "provision",
            Self::RuntimeConnection => "runtime_connection",
            Self::Hold => "hold",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("undefined backup target for {scope}")]
    UndefinedTarget { scope: String },

    /// The reason never contains the address itself, which may hold credentials.
    #[error("invalid target address: {reason}")]
    InvalidAddress { reason: String },

    #[error("unsupported url scheme '{scheme}'")]
    UnsupportedScheme { scheme: String },

    #[error("invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("failed to {action}: {source}")]
    Provision {
        action: String,
        #[source]
        source: RuntimeError,
    },

    #[error("`{command}` exited with code {exit_code}")]
    Exec {
        command: String,
        exit_code: i64,
        output: String,
    },

    #[error("failed to hold container '{container}': {source}")]
    Hold {
        container: String,
        #[source]
        source: RuntimeError,
    },

    #[error("container '{0}' not found")]
    ContainerNotFound(String),

    #[error("backup run interrupted: {0}")]
    Interrupted(String),

    #[error("{}", join_errors(.0))]
    Multiple(Vec<BackupError>),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

fn join_errors(errors: &[BackupError]) -> String {
    let parts: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("{} errors: {}", errors.len(), parts.join("; "))
}

impl BackupError {
    pub fn provision(action: impl Into<String>, source: RuntimeError) -> Self {
        Self::Provision {
            action: action.into(),
            source,
        }
    }

    /// Collapse a list of failures: none, the single failure, or an aggregate.
    pub fn collect(mut errors: Vec<BackupError>) -> Result<(), BackupError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UndefinedTarget { .. }
            | Self::InvalidAddress { .. }
            | Self::UnsupportedScheme { .. }
            | Self::InvalidSchedule { .. }
            | Self::ContainerNotFound(_) => ErrorKind::Configuration,
            Self::Hold { .. } => ErrorKind::Hold,
            Self::Runtime(RuntimeError::Connection(_)) => ErrorKind::RuntimeConnection,
            Self::Provision {
                source: RuntimeError::Connection(_),
                ..
            } => ErrorKind::RuntimeConnection,
            Self::Multiple(errors) => errors
                .last()
                .map(BackupError::kind)
                .unwrap_or(ErrorKind::Provision),
            Self::Provision { .. }
            | Self::Exec { .. }
            | Self::Interrupted(_)
            | Self::Runtime(_) => ErrorKind::Provision,
        }
    }
}
