use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::path::Path;

use super::{artifact_timestamp, retain_newest, ArtifactKind, BackupArtifact, FilePattern, Reporting, TaskOutcome};
use crate::config::{Config, DatabaseConfig};
use crate::exec::{CommandExecutor, CommandSpec};
use crate::metrics::BackupStatus;

/// Dumps the configured database through gzip into the backup directory.
pub struct DatabaseBackup<'a> {
    cfg: &'a Config,
    exec: &'a dyn CommandExecutor,
    reporting: &'a Reporting,
}

impl<'a> DatabaseBackup<'a> {
    pub fn new(cfg: &'a Config, exec: &'a dyn CommandExecutor, reporting: &'a Reporting) -> Self {
        Self { cfg, exec, reporting }
    }

    pub fn pattern(db: &DatabaseConfig) -> FilePattern {
        FilePattern::new(format!("db_{}_", db.name), ".sql.gz")
    }

    pub fn run(&self, started_at: DateTime<Utc>) -> TaskOutcome {
        let db = &self.cfg.database;
        let timestamp = artifact_timestamp(started_at);
        let path = self
            .cfg
            .backup
            .dir
            .join(format!("db_{}_{}.sql.gz", db.name, timestamp));

        if let Err(e) = self.dump_to(&path) {
            // A truncated dump must never become the "newest" snapshot.
            let _ = fs::remove_file(&path);
            let reason = format!("{:#}", e);
            self.reporting
                .announce(&format!("Backup DB {} FAILED: {}", db.name, reason), true);
            self.reporting
                .metrics
                .report(ArtifactKind::Database, BackupStatus::Failure);
            return TaskOutcome::Failure(reason);
        }

        let journal = &self.reporting.journal;
        journal.info(&format!("Backup DB {} OK: {}", db.name, path.display()));
        self.reporting.notifier.notify(&format!("Backup DB {} OK", db.name));
        self.reporting
            .metrics
            .report(ArtifactKind::Database, BackupStatus::Success);

        match retain_newest(&self.cfg.backup.dir, &Self::pattern(db)) {
            Ok(_) => journal.info("Cleanup old DB backups done"),
            Err(e) => journal.error(&format!("Cleanup old DB backups FAILED: {}", e)),
        }

        TaskOutcome::Success(BackupArtifact {
            kind: ArtifactKind::Database,
            timestamp,
            path,
        })
    }

    fn dump_to(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(&self.cfg.backup.dir).with_context(|| {
            format!("creating backup directory {}", self.cfg.backup.dir.display())
        })?;

        let file = fs::File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        let mut gz = GzEncoder::new(file, Compression::default());
        self.exec.run_to_writer(&dump_command(&self.cfg.database), &mut gz)?;
        gz.finish()?.sync_all()?;
        Ok(())
    }
}

/// `mysqldump [--socket=..] -u<user> <db>`. The password travels in
/// `MYSQL_PWD` so it never shows up in the process list or our logs.
pub fn dump_command(db: &DatabaseConfig) -> CommandSpec {
    let mut cmd = CommandSpec::new(&db.dump_bin);
    if let Some(socket) = db.socket.as_deref().filter(|s| !s.is_empty()) {
        cmd = cmd.arg(format!("--socket={}", socket));
    }
    cmd = cmd.arg(format!("-u{}", db.user)).arg(&db.name);
    if !db.password.is_empty() {
        cmd = cmd.env("MYSQL_PWD", &db.password);
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_command_without_socket_or_password() {
        let db = DatabaseConfig::default();
        let cmd = dump_command(&db);
        assert_eq!(cmd.program, "mysqldump");
        assert_eq!(cmd.args, vec!["-uroot", "virtualizor"]);
        assert!(cmd.env.is_empty());
    }

    #[test]
    fn test_dump_command_with_socket_and_password() {
        let db = DatabaseConfig {
            name: "panel".to_string(),
            user: "backup".to_string(),
            password: "s3cret".to_string(),
            dump_bin: "/usr/local/emps/bin/mysqldump".to_string(),
            socket: Some("/usr/local/emps/var/mysql/mysql.sock".to_string()),
        };
        let cmd = dump_command(&db);
        assert_eq!(cmd.program, "/usr/local/emps/bin/mysqldump");
        assert_eq!(
            cmd.args,
            vec![
                "--socket=/usr/local/emps/var/mysql/mysql.sock",
                "-ubackup",
                "panel"
            ]
        );
        assert_eq!(cmd.env, vec![("MYSQL_PWD".to_string(), "s3cret".to_string())]);
        assert!(!cmd.display().contains("s3cret"));
    }

    #[test]
    fn test_pattern_is_scoped_to_db_name() {
        let db = DatabaseConfig::default();
        let p = DatabaseBackup::pattern(&db);
        assert!(p.matches("db_virtualizor_2024-05-01T10-00-00-000Z.sql.gz"));
        assert!(!p.matches("conf_virtualizor_2024-05-01T10-00-00-000Z.tar.gz"));
    }
}
