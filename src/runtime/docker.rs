use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::{
    ContainerRuntime, ContainerSpec, ContainerSummary, ExecOutput, MountKind, MountPoint,
    RuntimeError, VolumeSpec,
};

/// Runtime backed by the `docker` command line client.
///
/// Every call spawns `docker [--host H] <subcommand>` and decodes its JSON
/// output where there is any. Error messages carry the subcommand and stderr,
/// never the arguments, since volume options may contain credentials.
pub struct DockerCli {
    binary: PathBuf,
    host: Option<String>,
    hostname: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Info {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspect {
    id: String,
    name: String,
    config: InspectConfig,
    #[serde(default)]
    mounts: Vec<InspectMount>,
    state: InspectState,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectMount {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    source: String,
    destination: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
}

impl From<Inspect> for ContainerSummary {
    fn from(inspect: Inspect) -> Self {
        let mounts = inspect
            .mounts
            .into_iter()
            .map(|m| {
                let kind = match m.kind.as_str() {
                    "volume" => MountKind::Volume,
                    "bind" => MountKind::Bind,
                    _ => MountKind::Other,
                };
                MountPoint {
                    kind,
                    name: m.name.unwrap_or(m.source),
                    destination: m.destination,
                }
            })
            .collect();

        Self {
            id: inspect.id,
            name: inspect.name.trim_start_matches('/').to_string(),
            labels: inspect.config.labels.unwrap_or_default(),
            mounts,
            running: inspect.state.running,
        }
    }
}

impl DockerCli {
    /// Verify the daemon is reachable and remember its hostname.
    pub async fn connect(binary: PathBuf, host: Option<String>) -> Result<Self, RuntimeError> {
        let mut cli = Self {
            binary,
            host,
            hostname: String::new(),
        };

        let raw = cli
            .run("info", &["info", "--format", "{{json .}}"])
            .await
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;
        let info: Info = serde_json::from_str(raw.trim())?;
        cli.hostname = info.name;

        debug!(hostname = %cli.hostname, "docker client connection established");
        Ok(cli)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(host) = &self.host {
            cmd.arg("--host").arg(host);
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run a docker subcommand and return its stdout.
    async fn run(&self, name: &str, args: &[&str]) -> Result<String, RuntimeError> {
        let output = self.command().args(args).output().await?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(name, message))
    }

    async fn inspect(&self, ids: &[&str]) -> Result<Vec<ContainerSummary>, RuntimeError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["container", "inspect"];
        args.extend_from_slice(ids);
        let raw = self.run("container inspect", &args).await?;
        let parsed: Vec<Inspect> = serde_json::from_str(&raw)?;

        Ok(parsed.into_iter().map(ContainerSummary::from).collect())
    }
}

fn stop_args(id: &str, timeout: Option<u32>) -> Vec<String> {
    let mut args = vec!["stop".to_string()];
    if let Some(seconds) = timeout {
        args.push("--time".to_string());
        args.push(seconds.to_string());
    }
    args.push(id.to_string());
    args
}

fn rm_args(id: &str, force: bool) -> Vec<&str> {
    if force {
        vec!["rm", "--force", id]
    } else {
        vec!["rm", id]
    }
}

/// Map docker's stderr onto the closest error variant.
fn classify(command: &str, message: String) -> RuntimeError {
    let lower = message.to_lowercase();
    if lower.contains("cannot connect to the docker daemon") {
        RuntimeError::Connection(message)
    } else if lower.contains("no such") {
        RuntimeError::NotFound {
            kind: "object",
            name: message,
        }
    } else if lower.contains("conflict") || lower.contains("in use") {
        RuntimeError::Conflict(message)
    } else {
        RuntimeError::Command {
            command: command.to_string(),
            message,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn list_containers(
        &self,
        label_filters: &[(String, String)],
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let filters: Vec<String> = label_filters
            .iter()
            .map(|(k, v)| format!("label={}={}", k, v))
            .collect();

        let mut args = vec!["ps", "--all", "--no-trunc", "--format", "{{.ID}}"];
        for filter in &filters {
            args.push("--filter");
            args.push(filter);
        }

        let raw = self.run("ps", &args).await?;
        let ids: Vec<&str> = raw.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

        self.inspect(&ids).await
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.run("image inspect", &["image", "inspect", image]).await.is_ok() {
            return Ok(());
        }

        debug!(image, "pulling image");
        self.run("pull", &["pull", "--quiet", image]).await?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let binds: Vec<String> = spec.binds.iter().map(|b| b.to_string()).collect();
        let labels: Vec<String> = spec
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut args = vec!["create", "--name", spec.name.as_str()];
        for bind in &binds {
            args.push("--volume");
            args.push(bind);
        }
        for label in &labels {
            args.push("--label");
            args.push(label);
        }
        args.push(spec.image.as_str());
        args.extend(spec.cmd.iter().map(String::as_str));

        let raw = self.run("create", &args).await?;
        Ok(raw.trim().to_string())
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.run("start", &["start", id]).await.map(|_| ())
    }

    async fn stop_container(&self, id: &str, timeout: Option<u32>) -> Result<(), RuntimeError> {
        let args = stop_args(id, timeout);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run("stop", &args).await.map(|_| ())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.run("rm", &rm_args(id, force)).await.map(|_| ())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<(), RuntimeError> {
        let opts: Vec<String> = spec
            .driver_opts
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let labels: Vec<String> = spec
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut args = vec!["volume", "create", "--driver", spec.driver.as_str()];
        for opt in &opts {
            args.push("--opt");
            args.push(opt);
        }
        for label in &labels {
            args.push("--label");
            args.push(label);
        }
        args.push(spec.name.as_str());

        self.run("volume create", &args).await.map(|_| ())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.run("volume rm", &["volume", "rm", name]).await.map(|_| ())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, RuntimeError> {
        let output = self
            .command()
            .arg("exec")
            .arg(id)
            .args(cmd)
            .output()
            .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ExecOutput {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            output: combined,
        })
    }
}
