use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vzbackup::backup::Reporting;
use vzbackup::config::Config;
use vzbackup::exec::SystemExecutor;
use vzbackup::job::{self, JobRunner};
use vzbackup::journal::{self, BackupLog};
use vzbackup::metrics::PushgatewayReporter;
use vzbackup::telegram::TelegramNotifier;

#[derive(Parser)]
#[command(name = "vzbackup")]
#[command(about = "Scheduled database + config backups shipped to remote nodes")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the standard locations)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Back up now, then on every interval until stopped (default)
    Run,
    /// Run a single backup pass and exit
    Once,
    /// Print the effective configuration with secrets masked
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(journal::console_writer(std::io::stderr, std::io::stdout))
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&cfg.redacted())?);
        }
        Commands::Once => {
            let (runner, notifier) = build_runner(cfg)?;
            let report = tokio::task::spawn_blocking(move || runner.try_run())
                .await
                .context("backup run panicked")?;
            notifier.drain().await;
            match report {
                Some(report) if report.is_success() => {}
                Some(_) => std::process::exit(1),
                None => anyhow::bail!("another run is already in progress"),
            }
        }
        Commands::Run => {
            let interval = job::parse_duration(&cfg.backup.interval)?;
            let (runner, notifier) = build_runner(cfg)?;
            tracing::info!(
                pid = std::process::id(),
                interval = ?interval,
                targets = runner.config().remote.targets.len(),
                "vzbackup starting"
            );
            job::schedule(runner, interval, shutdown_signal()).await;
            notifier.drain().await;
        }
    }

    Ok(())
}

/// Wire the real collaborators. Fails if the backup directory is unusable.
fn build_runner(cfg: Config) -> Result<(Arc<JobRunner>, Arc<TelegramNotifier>)> {
    let journal = Arc::new(
        BackupLog::open(&cfg.backup.dir, cfg.log.local_offset_hours)
            .context("backup directory is not usable")?,
    );
    let notifier = Arc::new(TelegramNotifier::from_config(&cfg, journal.clone()));
    let metrics = Arc::new(PushgatewayReporter::from_config(&cfg, journal.clone()));
    let reporting = Reporting {
        journal,
        notifier: notifier.clone(),
        metrics,
    };
    let runner = JobRunner::new(cfg, Arc::new(SystemExecutor), reporting);
    Ok((Arc::new(runner), notifier))
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
