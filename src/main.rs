use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use docker_backup::logging::{self, LogConfig};
use docker_backup::{config, context, core::Orchestrator, runtime};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "docker-backup")]
#[command(about = "Label driven backups of Docker volumes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Serialize)]
struct GlobalArgs {
    /// Config file, defaults to /etc/docker-backup/config.toml
    #[serde(skip)]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Docker host, e.g. tcp://docker.host:2375
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    host: Option<String>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    verbose: bool,

    /// Log as JSON
    #[serde(rename = "json_logs", skip_serializing_if = "std::ops::Not::not")]
    #[arg(long = "json", global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule backups for every labelled container and run until stopped
    Daemon(DaemonArgs),
    /// Back up the given containers once
    Backup(BackupArgs),
}

#[derive(Args, Serialize)]
struct DaemonArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    default_target: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    default_schedule: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    label_prefix: Option<String>,
}

#[derive(Args)]
struct BackupArgs {
    /// Containers to back up, comma separated
    #[arg(long = "container", value_delimiter = ',', required = true)]
    containers: Vec<String>,

    /// Target address, defaults to the configured default target
    #[arg(long)]
    target: Option<String>,

    /// Stop the containers while their volumes are archived
    #[arg(long)]
    hold: bool,
}

#[derive(Serialize)]
struct Overrides<'a> {
    #[serde(flatten)]
    global: &'a GlobalArgs,
    #[serde(flatten)]
    daemon: Option<&'a DaemonArgs>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = Overrides {
        global: &cli.global,
        daemon: match &cli.command {
            Commands::Daemon(args) => Some(args),
            _ => None,
        },
    };
    let config = config::AppConfig::new(cli.global.config.as_deref(), Some(&overrides))
        .context("Failed to load configuration")?;

    logging::init(LogConfig::from(&config)).context("Failed to initialise logging")?;

    let runtime = runtime::connect(&config)
        .await
        .context("Failed to connect to the container runtime")?;
    let ctx = context::AppContext::new(config, runtime);

    match cli.command {
        Commands::Daemon(_) => run_daemon(ctx).await.context("Failed to run daemon")?,
        Commands::Backup(args) => run_backup(ctx, args).await.context("Backup failed")?,
    }

    Ok(())
}

async fn run_daemon(ctx: context::AppContext) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));
    Orchestrator::new(ctx).start(cancel).await
}

async fn run_backup(ctx: context::AppContext, args: BackupArgs) -> Result<()> {
    let report = Orchestrator::new(ctx)
        .backup_now(&args.containers, args.target.as_deref(), args.hold)
        .await?;

    for archive in &report.archives {
        info!(archive = %archive, "archive written");
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown requested, finishing running backups");
    cancel.cancel();
}
