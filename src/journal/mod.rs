//! Append-only run journal: `backup.log` for progress, `backup-error.log` for
//! failures. Every line is mirrored to the console through `tracing`.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, SecondsFormat, Utc};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::fmt::writer::{MakeWriter, MakeWriterExt, OrElse, WithMaxLevel};

pub const LOG_FILE: &str = "backup.log";
pub const ERROR_FILE: &str = "backup-error.log";

const LOCAL_FORMAT: &str = "%H:%M:%S %d/%m/%Y";

#[derive(Debug)]
pub struct BackupLog {
    log_path: PathBuf,
    error_path: PathBuf,
    local_offset: Option<FixedOffset>,
}

impl BackupLog {
    /// Create the backup directory and make sure both log files are writable.
    pub fn open(dir: &Path, local_offset_hours: Option<i32>) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating backup directory {}", dir.display()))?;

        let log = Self {
            log_path: dir.join(LOG_FILE),
            error_path: dir.join(ERROR_FILE),
            local_offset: local_offset_hours.and_then(|h| FixedOffset::east_opt(h * 3600)),
        };
        for path in [&log.log_path, &log.error_path] {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
        }
        Ok(log)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn error_path(&self) -> &Path {
        &self.error_path
    }

    pub fn info(&self, message: &str) {
        self.log(message, false);
    }

    pub fn error(&self, message: &str) {
        self.log(message, true);
    }

    pub fn log(&self, message: &str, is_error: bool) {
        let line = format_line(Utc::now(), self.local_offset, message);
        if is_error {
            tracing::error!("{}", message);
        } else {
            tracing::info!("{}", message);
        }

        let path = if is_error { &self.error_path } else { &self.log_path };
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = written {
            tracing::warn!("Could not append to {}: {}", path.display(), e);
        }
    }
}

/// Console routing for the `fmt` subscriber: warnings and errors go to `err`,
/// everything else to `out`.
pub fn console_writer<E, O>(err: E, out: O) -> OrElse<WithMaxLevel<E>, O>
where
    E: for<'a> MakeWriter<'a>,
    O: for<'a> MakeWriter<'a>,
{
    err.with_max_level(Level::WARN).or_else(out)
}

/// `[UTC <iso8601> | Local <localized>] <message>\n`
pub fn format_line(utc: DateTime<Utc>, offset: Option<FixedOffset>, message: &str) -> String {
    let local = match offset {
        Some(offset) => utc.with_timezone(&offset).format(LOCAL_FORMAT).to_string(),
        None => utc.with_timezone(&Local).format(LOCAL_FORMAT).to_string(),
    };
    format!(
        "[UTC {} | Local {}] {}\n",
        utc.to_rfc3339_opts(SecondsFormat::Millis, true),
        local,
        message
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_line_format() {
        let utc = Utc.with_ymd_and_hms(2024, 5, 1, 20, 15, 0).unwrap();
        let line = format_line(utc, FixedOffset::east_opt(7 * 3600), "Backup job finished.");
        assert_eq!(
            line,
            "[UTC 2024-05-01T20:15:00.000Z | Local 03:15:00 02/05/2024] Backup job finished.\n"
        );
    }

    #[test]
    fn test_splits_normal_and_error_lines() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("nested/backups");
        let log = BackupLog::open(&dir, Some(0)).unwrap();

        log.info("all good");
        log.error("went wrong");
        log.info("still good");

        let normal = fs::read_to_string(log.log_path()).unwrap();
        let errors = fs::read_to_string(log.error_path()).unwrap();
        assert_eq!(normal.lines().count(), 2);
        assert!(normal.lines().all(|l| l.starts_with("[UTC ")));
        assert!(normal.contains("] still good"));
        assert_eq!(errors.lines().count(), 1);
        assert!(errors.ends_with("] went wrong\n"));
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_console_errors_go_to_error_stream() {
        let temp = tempfile::tempdir().unwrap();
        let log = BackupLog::open(temp.path(), Some(0)).unwrap();
        let (err, out) = (Captured::default(), Captured::default());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(console_writer(
                {
                    let err = err.clone();
                    move || err.clone()
                },
                {
                    let out = out.clone();
                    move || out.clone()
                },
            ))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            log.info("Backup DB virtualizor OK");
            log.error("Backup config virtualizor FAILED: missing");
        });

        assert!(out.text().contains("Backup DB virtualizor OK"));
        assert!(!out.text().contains("FAILED"));
        assert!(err.text().contains("Backup config virtualizor FAILED: missing"));
        assert!(!err.text().contains("OK"));
    }

    #[test]
    fn test_open_fails_when_dir_is_a_file() {
        let temp = tempfile::tempdir().unwrap();
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();
        assert!(BackupLog::open(&blocker, None).is_err());
    }
}
