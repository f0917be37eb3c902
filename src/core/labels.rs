use std::fmt;

/// The fixed label vocabulary read from containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    /// Opt-in gate for discovery.
    Enabled,
    /// Cron expression.
    Schedule,
    /// Storage target address.
    Target,
    /// Stop the container while its volumes are archived.
    Hold,
    /// Containers sharing a group value are backed up together.
    Group,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Schedule => "schedule",
            Self::Target => "target",
            Self::Hold => "hold",
            Self::Group => "group",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps labels onto namespaced keys, e.g. `docker-backup.target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelKeys {
    prefix: String,
}

impl Default for LabelKeys {
    fn default() -> Self {
        Self::new("docker-backup.")
    }
}

impl LabelKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn key(&self, label: Label) -> String {
        format!("{}{}", self.prefix, label.as_str())
    }
}

/// Parse a boolean label value. `None` for anything unrecognised.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
