use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use thiserror::Error;

/// A fully described external command, independent of how it gets run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program and arguments joined for logs. Environment is left out since it
    /// carries credentials.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Runs external commands to completion. Implementations block the calling
/// thread until the process exits.
pub trait CommandExecutor: Send + Sync {
    /// Run and capture stdout.
    fn run(&self, cmd: &CommandSpec) -> Result<String, CommandError>;

    /// Run, streaming stdout into `sink`. Returns the number of bytes copied.
    fn run_to_writer(&self, cmd: &CommandSpec, sink: &mut dyn Write) -> Result<u64, CommandError>;
}

/// Executes commands on the local host via `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn run(&self, cmd: &CommandSpec) -> Result<String, CommandError> {
        tracing::debug!(command = %cmd.display(), "running");
        let output = cmd
            .to_command()
            .stdin(Stdio::null())
            .output()
            .map_err(|source| CommandError::Spawn {
                program: cmd.program.clone(),
                source,
            })?;

        check_status(cmd, output.status, &output.stderr)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_to_writer(&self, cmd: &CommandSpec, sink: &mut dyn Write) -> Result<u64, CommandError> {
        tracing::debug!(command = %cmd.display(), "running (streamed)");
        let mut child = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: cmd.program.clone(),
                source,
            })?;

        // Drain stderr on its own thread so a chatty tool can't fill the pipe
        // while we are blocked on stdout.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                buf
            })
        });

        let copied = match child.stdout.take() {
            Some(mut stdout) => io::copy(&mut stdout, sink),
            None => Ok(0),
        };

        let copied = match copied {
            Ok(n) => n,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CommandError::Io(e));
            }
        };

        let status = child.wait()?;
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        check_status(cmd, status, &stderr)?;
        Ok(copied)
    }
}

fn check_status(cmd: &CommandSpec, status: ExitStatus, stderr: &[u8]) -> Result<(), CommandError> {
    if status.success() {
        return Ok(());
    }
    Err(CommandError::Failed {
        program: cmd.program.clone(),
        status: status.to_string(),
        stderr: String::from_utf8_lossy(stderr).trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_omits_env() {
        let cmd = CommandSpec::new("mysqldump")
            .args(["-uroot", "app"])
            .env("MYSQL_PWD", "secret");
        assert_eq!(cmd.display(), "mysqldump -uroot app");
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let cmd = CommandSpec::new("/nonexistent/definitely-not-here");
        let err = SystemExecutor.run(&cmd).unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_streams_stdout_and_reports_failure() {
        let mut out = Vec::new();
        let cmd = CommandSpec::new("sh").args(["-c", "printf hello"]);
        let n = SystemExecutor.run_to_writer(&cmd, &mut out).unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"hello");

        let cmd = CommandSpec::new("sh").args(["-c", "echo boom >&2; exit 3"]);
        match SystemExecutor.run_to_writer(&cmd, &mut Vec::new()) {
            Err(CommandError::Failed { stderr, .. }) => assert_eq!(stderr, "boom"),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
