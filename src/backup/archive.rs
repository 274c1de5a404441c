use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::path::{Path, PathBuf};

use super::{artifact_timestamp, retain_newest, ArtifactKind, BackupArtifact, FilePattern, Reporting, TaskOutcome};
use crate::config::{ArchiveConfig, Config};
use crate::metrics::BackupStatus;

/// Tarballs the application's config and log paths.
pub struct ConfigBackup<'a> {
    cfg: &'a Config,
    reporting: &'a Reporting,
}

impl<'a> ConfigBackup<'a> {
    pub fn new(cfg: &'a Config, reporting: &'a Reporting) -> Self {
        Self { cfg, reporting }
    }

    pub fn pattern(archive: &ArchiveConfig) -> FilePattern {
        FilePattern::new(format!("conf_{}_", archive.app), ".tar.gz")
    }

    pub fn run(&self, started_at: DateTime<Utc>) -> TaskOutcome {
        let app = &self.cfg.archive.app;
        let timestamp = artifact_timestamp(started_at);
        let path = self
            .cfg
            .backup
            .dir
            .join(format!("conf_{}_{}.tar.gz", app, timestamp));

        if let Err(e) = self.write_archive(&path) {
            let _ = fs::remove_file(&path);
            let reason = format!("{:#}", e);
            self.reporting
                .announce(&format!("Backup config {} FAILED: {}", app, reason), true);
            self.report(BackupStatus::Failure);
            return TaskOutcome::Failure(reason);
        }

        let journal = &self.reporting.journal;
        journal.info(&format!("Backup config {} OK: {}", app, path.display()));
        self.reporting.notifier.notify(&format!("Backup config {} OK", app));
        self.report(BackupStatus::Success);

        match retain_newest(&self.cfg.backup.dir, &Self::pattern(&self.cfg.archive)) {
            Ok(_) => journal.info("Cleanup old config backups done"),
            Err(e) => journal.error(&format!("Cleanup old config backups FAILED: {}", e)),
        }

        TaskOutcome::Success(BackupArtifact {
            kind: ArtifactKind::Config,
            timestamp,
            path,
        })
    }

    fn report(&self, status: BackupStatus) {
        if self.cfg.metrics.report_config {
            self.reporting.metrics.report(ArtifactKind::Config, status);
        }
    }

    fn write_archive(&self, path: &Path) -> Result<()> {
        let sources = &self.cfg.archive.paths;
        if sources.is_empty() {
            anyhow::bail!("no paths configured to archive");
        }
        if let Some(missing) = sources.iter().find(|p| !p.exists()) {
            anyhow::bail!("{} does not exist", missing.display());
        }

        fs::create_dir_all(&self.cfg.backup.dir).with_context(|| {
            format!("creating backup directory {}", self.cfg.backup.dir.display())
        })?;

        let tar_file = fs::File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        let enc = GzEncoder::new(tar_file, Compression::default());
        let mut tar = tar::Builder::new(enc);
        // Rotated logs are often dangling links; store links, not targets.
        tar.follow_symlinks(false);

        for source in sources {
            let name = entry_name(source);
            let appended = if source.is_dir() {
                tar.append_dir_all(&name, source)
            } else {
                tar.append_path_with_name(source, &name)
            };
            appended.with_context(|| format!("archiving {}", source.display()))?;
        }

        tar.into_inner()?.finish()?.sync_all()?;
        Ok(())
    }
}

/// Entries keep their absolute location, minus the leading `/`.
fn entry_name(source: &Path) -> PathBuf {
    source
        .strip_prefix("/")
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| source.to_path_buf())
}
