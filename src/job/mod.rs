use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio::time::{Duration, MissedTickBehavior};

use crate::backup::{ConfigBackup, DatabaseBackup, Reporting, TaskOutcome};
use crate::config::Config;
use crate::exec::CommandExecutor;
use crate::sync::{RemoteSync, SyncOutcome};

const START_MESSAGE: &str = "Starting backup (DB + Config + Logs)...";
const END_MESSAGE: &str = "Backup job finished.";

/// Result of one pass through dump → archive → sync.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub started_at: DateTime<Utc>,
    pub database: TaskOutcome,
    pub config: TaskOutcome,
    pub sync: Vec<SyncOutcome>,
}

impl JobReport {
    /// Paths handed to sync, database first.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        [&self.database, &self.config]
            .into_iter()
            .filter_map(TaskOutcome::artifact)
            .map(|a| a.path.clone())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.database.is_success()
            && self.config.is_success()
            && self.sync.iter().all(SyncOutcome::is_success)
    }
}

/// Runs the backup pipeline. At most one run is in flight at any time.
pub struct JobRunner {
    cfg: Config,
    exec: Arc<dyn CommandExecutor>,
    reporting: Reporting,
    running: AtomicBool,
}

impl JobRunner {
    pub fn new(cfg: Config, exec: Arc<dyn CommandExecutor>, reporting: Reporting) -> Self {
        Self {
            cfg,
            exec,
            reporting,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Run unless another run is still in progress.
    pub fn try_run(&self) -> Option<JobReport> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            tracing::warn!("Previous backup run still in progress, skipping");
            return None;
        };
        Some(self.run_once())
    }

    /// One full pass. Never fails: every step turns its own errors into an
    /// outcome that is logged and notified.
    pub fn run_once(&self) -> JobReport {
        let started_at = Utc::now();
        let exec = self.exec.as_ref();

        self.reporting.announce(START_MESSAGE, false);

        let database = DatabaseBackup::new(&self.cfg, exec, &self.reporting).run(started_at);
        let config = ConfigBackup::new(&self.cfg, &self.reporting).run(started_at);

        let mut report = JobReport {
            started_at,
            database,
            config,
            sync: Vec::new(),
        };
        report.sync = RemoteSync::new(&self.cfg, exec, &self.reporting).run(&report.artifacts());

        self.reporting.journal.info(END_MESSAGE);
        report
    }
}

struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Run immediately, then every `interval`, until `shutdown` resolves. Runs go
/// to the blocking pool; a tick that lands on an in-flight run is skipped.
/// Returns only after a run that was in flight at shutdown has finished.
pub async fn schedule<F>(runner: Arc<JobRunner>, interval: Duration, shutdown: F)
where
    F: Future<Output = ()>,
{
    let mut runs = JoinSet::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, scheduler stopping");
                break;
            }
            _ = ticker.tick() => {
                while runs.try_join_next().is_some() {}
                let runner = runner.clone();
                runs.spawn_blocking(move || {
                    runner.try_run();
                });
            }
        }
    }

    if !runs.is_empty() {
        tracing::info!("Waiting for the running backup to finish");
    }
    while let Some(joined) = runs.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Backup run panicked: {}", e);
        }
    }
}

pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (count, unit) = if let Some(h) = s.strip_suffix('h') {
        (h, 3600)
    } else if let Some(m) = s.strip_suffix('m') {
        (m, 60)
    } else if let Some(s_val) = s.strip_suffix('s') {
        (s_val, 1)
    } else {
        anyhow::bail!("Invalid duration format: {} (use e.g. 1h, 30m, 60s)", s)
    };
    let secs = count
        .parse::<u64>()?
        .checked_mul(unit)
        .with_context(|| format!("Duration too large: {}", s))?;
    let value = Duration::from_secs(secs);
    if value.is_zero() {
        anyhow::bail!("Duration must be greater than zero: {}", s);
    }
    Ok(value)
}
