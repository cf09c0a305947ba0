//! Shell/CLI boundary.
//!
//! Commands are described as data ([`ShellCommand`]) and executed through a
//! [`CommandRunner`], so the engine can be driven by scripted runners in
//! tests. Derived environment variables travel with the command and are set
//! on the child process only.

use std::{fmt, io, path::PathBuf, process::Command};

use corral_types::{AttemptError, FailureKind};
use thiserror::Error;
use tracing::debug;

use crate::redact_sensitive;

/// A program invocation plus the exit codes that count as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub success_codes: Vec<i32>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            success_codes: vec![0],
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

    pub fn envs<I>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.envs.extend(envs);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Treat `code` as success in addition to zero, e.g. Puppet's
    /// `--detailed-exitcodes` reporting 2 for "changes applied".
    pub fn success_code(mut self, code: i32) -> Self {
        if !self.success_codes.contains(&code) {
            self.success_codes.push(code);
        }
        self
    }

    pub fn accepts(&self, code: i32) -> bool {
        self.success_codes.contains(&code)
    }

    /// Command line with secrets redacted, for logs and error messages.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(char::is_whitespace) {
                line.push_str(&format!("'{arg}'"));
            } else {
                line.push_str(arg);
            }
        }
        redact_sensitive(&line)
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    /// Trimmed stdout, the usual payload of `docker-machine ip` and friends.
    pub fn text(&self) -> &str {
        self.stdout.trim()
    }
}

/// Failure to run a command or a rejected exit code.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("could not start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("'{command}' failed with exit code {}: {}", .code.map(|code| code.to_string()).unwrap_or_else(|| "<signal>".into()), .stderr.trim())]
    Exit {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl ShellError {
    /// Standard error of a rejected command, empty for spawn failures.
    pub fn stderr(&self) -> &str {
        match self {
            Self::Spawn { .. } => "",
            Self::Exit { stderr, .. } => stderr,
        }
    }

    /// Stdout and stderr joined, redacted, for operator debugging.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Spawn { source, .. } => source.to_string(),
            Self::Exit { stdout, stderr, .. } => {
                redact_sensitive(format!("{}\n{}", stdout.trim(), stderr.trim()).trim())
            }
        }
    }

    /// Convert into an [`AttemptError`], letting `classify` decide the kind
    /// of a rejected exit code. A command that cannot be started is fatal.
    pub fn into_attempt<C>(self, classify: C) -> AttemptError
    where
        C: FnOnce(&ShellError) -> FailureKind,
    {
        let kind = match &self {
            Self::Spawn { .. } => FailureKind::Fatal,
            Self::Exit { .. } => classify(&self),
        };
        AttemptError::new(kind, redact_sensitive(&self.to_string()))
    }
}

/// Executes [`ShellCommand`]s.
pub trait CommandRunner {
    fn run(&self, command: &ShellCommand) -> Result<ShellOutput, ShellError>;
}

/// Runs commands as real child processes, blocking until they exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &ShellCommand) -> Result<ShellOutput, ShellError> {
        debug!(command = %command, "running command");
        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .envs(command.envs.iter().map(|(key, value)| (key.as_str(), value.as_str())));
        if let Some(dir) = &command.current_dir {
            process.current_dir(dir);
        }
        let output = process
            .output()
            .map_err(|source| ShellError::Spawn {
                command: command.display(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        match output.status.code() {
            Some(code) if command.accepts(code) => {
                debug!(command = %command, exit_code = code, "command succeeded");
                Ok(ShellOutput {
                    exit_code: code,
                    stdout,
                    stderr,
                })
            }
            code => Err(ShellError::Exit {
                command: command.display(),
                code,
                stdout,
                stderr,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_arguments_with_spaces_and_redacts() {
        let command = ShellCommand::new("docker-machine")
            .args(["create", "--amazonec2-secret-key", "s3cr3t"])
            .arg("echo hello");
        let shown = command.display();
        assert!(shown.contains("'echo hello'"));
        assert!(!shown.contains("s3cr3t"));
    }

    #[test]
    fn success_codes_are_not_duplicated() {
        let command = ShellCommand::new("puppet").success_code(2).success_code(2);
        assert_eq!(command.success_codes, vec![0, 2]);
        assert!(command.accepts(2));
        assert!(!command.accepts(1));
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_honours_extra_success_codes() {
        let command = ShellCommand::new("sh").args(["-c", "echo applied; exit 2"]).success_code(2);
        let output = SystemRunner.run(&command).expect("exit code 2 accepted");
        assert_eq!(output.exit_code, 2);
        assert_eq!(output.text(), "applied");
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_reports_rejected_exit_codes() {
        let command = ShellCommand::new("sh").args(["-c", "echo 'Host does not exist' >&2; exit 1"]);
        let error = SystemRunner.run(&command).unwrap_err();
        assert!(matches!(error, ShellError::Exit { code: Some(1), .. }));
        assert!(error.stderr().contains("Host does not exist"));
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_passes_envs_to_child_only() {
        let command = ShellCommand::new("sh")
            .args(["-c", "printf %s \"$CORRAL_SHELL_TEST\""])
            .envs([("CORRAL_SHELL_TEST".to_string(), "child-only".to_string())]);
        let output = SystemRunner.run(&command).unwrap();
        assert_eq!(output.stdout, "child-only");
        assert!(std::env::var("CORRAL_SHELL_TEST").is_err());
    }

    #[test]
    fn missing_binary_is_fatal() {
        let command = ShellCommand::new("corral-definitely-not-installed");
        let error = SystemRunner.run(&command).unwrap_err();
        let attempt = error.into_attempt(|_| FailureKind::Transient);
        assert_eq!(attempt.kind, FailureKind::Fatal);
    }
}
