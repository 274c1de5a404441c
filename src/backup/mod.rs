pub mod archive;
pub mod database;

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::journal::BackupLog;
use crate::metrics::ReportMetric;
use crate::telegram::Notify;

pub use archive::ConfigBackup;
pub use database::DatabaseBackup;

/// Where task outcomes go: the journal, the chat channel and the metrics gateway.
#[derive(Clone)]
pub struct Reporting {
    pub journal: Arc<BackupLog>,
    pub notifier: Arc<dyn Notify>,
    pub metrics: Arc<dyn ReportMetric>,
}

impl Reporting {
    /// Journal and notify the same message.
    pub fn announce(&self, message: &str, is_error: bool) {
        self.journal.log(message, is_error);
        self.notifier.notify(message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Database,
    Config,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ArtifactKind::Database => write!(f, "database"),
            ArtifactKind::Config => write!(f, "config"),
        }
    }
}

/// A backup file produced by one task in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub kind: ArtifactKind,
    pub timestamp: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success(BackupArtifact),
    Failure(String),
}

impl TaskOutcome {
    pub fn artifact(&self) -> Option<&BackupArtifact> {
        match self {
            TaskOutcome::Success(artifact) => Some(artifact),
            TaskOutcome::Failure(_) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }
}

/// A filename class: everything starting with `prefix` and ending with `suffix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePattern {
    pub prefix: String,
    pub suffix: String,
}

impl FilePattern {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// A single fixed filename.
    pub fn exact(name: &str) -> Self {
        Self::new(name, "")
    }

    pub fn matches(&self, name: &str) -> bool {
        name.len() >= self.prefix.len() + self.suffix.len()
            && name.starts_with(&self.prefix)
            && name.ends_with(&self.suffix)
    }

    /// Shell glob form, as used on remote hosts.
    pub fn glob(&self) -> String {
        if self.suffix.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}*{}", self.prefix, self.suffix)
        }
    }
}

/// Filesystem-safe ISO8601 timestamp, e.g. `2024-05-01T10-00-00-000Z`.
pub fn artifact_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

/// Delete every file in `dir` matching `pattern` except the newest one.
/// Newest is by modification time, ties broken by name. Returns what was removed.
pub fn retain_newest(dir: &Path, pattern: &FilePattern) -> io::Result<Vec<PathBuf>> {
    let mut candidates: Vec<(SystemTime, String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !pattern.matches(&name) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        candidates.push((modified, name, entry.path()));
    }

    candidates.sort_by(|a, b| (&b.0, &b.1).cmp(&(&a.0, &a.1)));

    let mut removed = Vec::new();
    for (_, name, path) in candidates.into_iter().skip(1) {
        fs::remove_file(&path)?;
        tracing::info!("Pruned old backup: {}", name);
        removed.push(path);
    }
    Ok(removed)
}
