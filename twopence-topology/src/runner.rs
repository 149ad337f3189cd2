//! Running native tools (`vagrant`, `podman`) on the host

use crate::error::{BackendError, BackendResult};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// A host command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    /// Executable
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Overrides the runner's default timeout
    pub timeout: Option<Duration>,
}

impl HostCommand {
    /// Command without arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: None,
        }
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run in `dir`.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Limit the run time.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a failed run into `CommandFailed`.
    ///
    /// # Errors
    ///
    /// `CommandFailed` for a non-zero exit.
    pub fn check(self, command: &HostCommand) -> BackendResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(BackendError::CommandFailed {
                command: command.to_string(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Executes host commands for a backend
#[async_trait]
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Run a command to completion. A non-zero exit is not an error here.
    ///
    /// # Errors
    ///
    /// Spawn failures and timeouts.
    async fn run(&self, command: &HostCommand) -> BackendResult<CommandOutput>;

    /// Run a command and require it to succeed.
    ///
    /// # Errors
    ///
    /// As [`CommandRunner::run`], plus `CommandFailed` for non-zero exits.
    async fn run_checked(&self, command: &HostCommand) -> BackendResult<CommandOutput> {
        self.run(command).await?.check(command)
    }
}

/// Runs commands as tokio child processes
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    default_timeout: Duration,
}

impl ProcessRunner {
    /// Runner killing commands after `default_timeout` unless they set their own.
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &HostCommand) -> BackendResult<CommandOutput> {
        let mut cmd = Command::new(&command.program);
        let _ = cmd
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.cwd {
            let _ = cmd.current_dir(dir);
        }

        let limit = command.timeout.unwrap_or(self.default_timeout);
        debug!("Running {command}");
        let output = tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| BackendError::Timeout {
                command: command.to_string(),
                seconds: limit.as_secs(),
            })?
            .map_err(BackendError::io(&command.program))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Quote a string for `sh -c`.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_process_runner_captures_output() {
        let runner = ProcessRunner::default();
        let output = runner
            .run(&HostCommand::new("sh").arg("-c").arg("echo out; echo err >&2; exit 3"))
            .await
            .unwrap();

        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_run_checked_reports_failure() {
        let runner = ProcessRunner::default();
        let err = runner
            .run_checked(&HostCommand::new("sh").args(["-c", "echo broken >&2; exit 1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::CommandFailed { code: Some(1), ref stderr, .. } if stderr == "broken"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let runner = ProcessRunner::new(Duration::from_millis(100));
        let err = runner
            .run(&HostCommand::new("sleep").arg("5"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
    }

    #[test]
    fn test_display_and_quote() {
        let command = HostCommand::new("podman").args(["exec", "c", "sh", "-c", "zypper ref"]);
        assert_eq!(command.to_string(), "podman exec c sh -c \"zypper ref\"");
        assert_eq!(shell_quote("plain"), "plain");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
