use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::resolver::Defaults;

pub const CONFIG_PATH: &str = "/etc/docker-backup/config.toml";
pub const ENV_PREFIX: &str = "DOCKER_BACKUP_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Docker host, e.g. `tcp://docker.host:2375`. Unset means the docker default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Target address used when a container carries no `target` label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_target: Option<String>,
    /// Cron expression used when a container carries no `schedule` label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_schedule: Option<String>,
    pub label_prefix: String,
    pub worker_image: String,
    pub docker_binary: PathBuf,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: None,
            default_target: None,
            default_schedule: None,
            label_prefix: "docker-backup.".to_string(),
            worker_image: "busybox".to_string(),
            docker_binary: PathBuf::from("docker"),
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `DOCKER_BACKUP_*` variables and CLI
    /// overrides, in that order of precedence.
    ///
    /// A missing config file is not an error; figment simply skips it.
    pub fn new<T: Serialize>(
        config_file: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, figment::Error> {
        let path = config_file.unwrap_or_else(|| Path::new(CONFIG_PATH));

        let mut figment = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract()
    }

    pub fn defaults(&self) -> Defaults {
        Defaults {
            target: self.default_target.clone(),
            schedule: self.default_schedule.clone(),
        }
    }
}
