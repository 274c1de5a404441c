//! Fan-out of finished artifacts and the run journal to remote hosts, followed
//! by a remote prune so each host also keeps only the newest copy per class.

use std::path::{Path, PathBuf};

use crate::backup::{ConfigBackup, DatabaseBackup, FilePattern, Reporting};
use crate::config::Config;
use crate::exec::{CommandError, CommandExecutor, CommandSpec};
use crate::journal::{ERROR_FILE, LOG_FILE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub user: String,
}

impl RemoteTarget {
    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Success { host: String },
    Failure { host: String, reason: String },
}

impl SyncOutcome {
    pub fn host(&self) -> &str {
        match self {
            SyncOutcome::Success { host } | SyncOutcome::Failure { host, .. } => host,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success { .. })
    }
}

pub struct RemoteSync<'a> {
    cfg: &'a Config,
    exec: &'a dyn CommandExecutor,
    reporting: &'a Reporting,
}

impl<'a> RemoteSync<'a> {
    pub fn new(cfg: &'a Config, exec: &'a dyn CommandExecutor, reporting: &'a Reporting) -> Self {
        Self { cfg, exec, reporting }
    }

    pub fn targets(&self) -> Vec<RemoteTarget> {
        self.cfg
            .remote
            .targets
            .iter()
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .map(|host| RemoteTarget {
                host: host.to_string(),
                user: self.cfg.remote.user.clone(),
            })
            .collect()
    }

    /// Push `artifacts` plus both log files to every target. Each target is
    /// handled independently; one failing never stops the others.
    pub fn run(&self, artifacts: &[PathBuf]) -> Vec<SyncOutcome> {
        if artifacts.is_empty() {
            return Vec::new();
        }
        self.targets()
            .iter()
            .map(|target| self.sync_target(target, artifacts))
            .collect()
    }

    fn sync_target(&self, target: &RemoteTarget, artifacts: &[PathBuf]) -> SyncOutcome {
        match self.transfer_and_prune(target, artifacts) {
            Ok(()) => SyncOutcome::Success {
                host: target.host.clone(),
            },
            Err(e) => {
                let reason = e.to_string();
                self.reporting.announce(
                    &format!(
                        "Rsync/cleanup backups + logs to {} FAILED: {}",
                        target.host, reason
                    ),
                    true,
                );
                SyncOutcome::Failure {
                    host: target.host.clone(),
                    reason,
                }
            }
        }
    }

    fn transfer_and_prune(&self, target: &RemoteTarget, artifacts: &[PathBuf]) -> Result<(), CommandError> {
        let journal = &self.reporting.journal;
        let mut files: Vec<&Path> = artifacts.iter().map(PathBuf::as_path).collect();
        files.push(journal.log_path());
        files.push(journal.error_path());

        let remote_dir = self.cfg.remote_dir();
        let rsync = rsync_command(target, &files, remote_dir, self.cfg.remote.ssh_port);
        self.exec.run(&rsync)?;
        self.reporting.announce(
            &format!("Rsync backups + logs to {} done", target.host),
            false,
        );

        let script = prune_script(remote_dir, &self.prune_classes());
        self.exec
            .run(&ssh_command(target, self.cfg.remote.ssh_port, &script))?;
        journal.info(&format!("Cleanup old backups + logs on {} done", target.host));
        Ok(())
    }

    /// The four filename classes kept at one file each on remotes.
    pub fn prune_classes(&self) -> Vec<FilePattern> {
        vec![
            DatabaseBackup::pattern(&self.cfg.database),
            ConfigBackup::pattern(&self.cfg.archive),
            FilePattern::exact(LOG_FILE),
            FilePattern::exact(ERROR_FILE),
        ]
    }
}

/// `rsync -avz [-e "ssh -p N"] <files..> user@host:<dir>/`
pub fn rsync_command(
    target: &RemoteTarget,
    files: &[&Path],
    remote_dir: &Path,
    ssh_port: Option<u16>,
) -> CommandSpec {
    let mut cmd = CommandSpec::new("rsync").arg("-avz");
    if let Some(port) = ssh_port {
        cmd = cmd.arg("-e").arg(format!("ssh -p {}", port));
    }
    cmd.args(files.iter().map(|f| f.display().to_string()))
        .arg(format!("{}:{}/", target.destination(), remote_dir.display()))
}

pub fn ssh_command(target: &RemoteTarget, ssh_port: Option<u16>, script: &str) -> CommandSpec {
    let mut cmd = CommandSpec::new("ssh");
    if let Some(port) = ssh_port {
        cmd = cmd.arg("-p").arg(port.to_string());
    }
    cmd.arg(target.destination()).arg(script)
}

/// Remote shell snippet that keeps only the newest file of every class.
pub fn prune_script(remote_dir: &Path, classes: &[FilePattern]) -> String {
    let mut steps = vec![format!("cd {}", shell_quote(&remote_dir.display().to_string()))];
    steps.extend(
        classes
            .iter()
            .map(|class| format!("ls -1t {} | tail -n +2 | xargs -r rm -f", class.glob())),
    );
    steps.join(" && ")
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> RemoteTarget {
        RemoteTarget {
            host: "host1".to_string(),
            user: "root".to_string(),
        }
    }

    #[test]
    fn test_rsync_command() {
        let files = [
            Path::new("/var/backups/db/db_app_x.sql.gz"),
            Path::new("/var/backups/db/backup.log"),
        ];
        let cmd = rsync_command(&target(), &files, Path::new("/var/backups/db"), None);
        assert_eq!(
            cmd.display(),
            "rsync -avz /var/backups/db/db_app_x.sql.gz /var/backups/db/backup.log root@host1:/var/backups/db/"
        );

        let cmd = rsync_command(&target(), &files, Path::new("/srv/b"), Some(2222));
        assert_eq!(&cmd.args[..3], &["-avz", "-e", "ssh -p 2222"]);
    }

    #[test]
    fn test_ssh_command() {
        let cmd = ssh_command(&target(), Some(2200), "true");
        assert_eq!(cmd.program, "ssh");
        assert_eq!(cmd.args, vec!["-p", "2200", "root@host1", "true"]);
    }

    #[test]
    fn test_prune_script() {
        let classes = vec![
            FilePattern::new("db_app_", ".sql.gz"),
            FilePattern::new("conf_app_", ".tar.gz"),
            FilePattern::exact("backup.log"),
            FilePattern::exact("backup-error.log"),
        ];
        assert_eq!(
            prune_script(Path::new("/var/backups/db"), &classes),
            "cd '/var/backups/db' && \
             ls -1t db_app_*.sql.gz | tail -n +2 | xargs -r rm -f && \
             ls -1t conf_app_*.tar.gz | tail -n +2 | xargs -r rm -f && \
             ls -1t backup.log | tail -n +2 | xargs -r rm -f && \
             ls -1t backup-error.log | tail -n +2 | xargs -r rm -f"
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/a b"), "'/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
