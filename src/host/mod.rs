// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host command boundary
//!
//! Every package-manager call, service restart and file write performed by a
//! step goes through a [`CommandRunner`]. Commands are built as argv vectors,
//! never as interpolated shell strings.

pub mod prompt;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{NestError, Result};

pub use prompt::{FixedPrompter, Prompter, TerminalPrompter};

/// Program used to elevate privileged commands
pub const ELEVATION_COMMAND: &str = "sudo";

/// A command to run on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<Vec<u8>>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            stdin: None,
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
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Wrap the command with the elevation program when `elevate` is set.
    ///
    /// Environment variables are passed through `env(1)` because the
    /// elevation program resets the environment.
    pub fn elevated(self, elevate: bool) -> Self {
        if !elevate {
            return self;
        }

        let mut args = Vec::with_capacity(self.args.len() + self.env.len() + 2);
        if !self.env.is_empty() {
            args.push("env".to_string());
            args.extend(self.env.iter().map(|(key, value)| format!("{}={}", key, value)));
        }
        args.push(self.program);
        args.extend(self.args);

        Self {
            program: ELEVATION_COMMAND.to_string(),
            args,
            env: BTreeMap::new(),
            stdin: self.stdin,
        }
    }

    /// `tee <path>` fed with `contents`, the way privileged files are written
    pub fn write_file(path: &Path, contents: &str) -> Self {
        Self::new("tee")
            .arg(path.display().to_string())
            .stdin(contents.as_bytes().to_vec())
    }

    /// Human readable rendering for logs and error messages
    pub fn display(&self) -> String {
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `-1` when the process was killed by a signal
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs external commands and answers `PATH` lookups
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion. A non-zero exit is *not* an error here;
    /// callers decide how to interpret the status.
    async fn run(&self, command: &HostCommand) -> Result<CommandOutput>;

    /// Resolve a program on the search path
    fn which(&self, program: &str) -> Option<PathBuf>;

    fn exists(&self, program: &str) -> bool {
        self.which(program).is_some()
    }

    /// Whether commands are only logged. Output of a dry run carries no
    /// information about the host.
    fn dry_run(&self) -> bool {
        false
    }

    /// Run and turn a non-zero exit into [`NestError::CommandFailed`]
    async fn run_checked(&self, command: &HostCommand) -> Result<CommandOutput> {
        let output = self.run(command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(NestError::CommandFailed {
                command: command.display(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// [`CommandRunner`] backed by real processes
pub struct SystemCommandRunner {
    /// Whether to run in dry-run mode (no actual execution)
    dry_run: bool,
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(dry_run: bool, timeout: Duration) -> Self {
        Self { dry_run, timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, host_command: &HostCommand) -> Result<CommandOutput> {
        let rendered = host_command.display();
        info!(command = %rendered, "Executing command");

        if self.dry_run {
            return Ok(CommandOutput {
                status: 0,
                stdout: format!("[DRY RUN] Would execute: {}", rendered),
                stderr: String::new(),
            });
        }

        let mut command = Command::new(&host_command.program);
        command.args(&host_command.args);
        command.envs(&host_command.env);

        command.stdin(if host_command.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let mut child = command.spawn()?;

        // stdin is fed while stdout and stderr are drained, otherwise a child
        // that talks before reading all of its input blocks on a full pipe
        let input = host_command.stdin.clone();
        let stdin = child.stdin.take();
        let feed = async move {
            if let (Some(input), Some(mut stdin)) = (input, stdin) {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(error = %e, "Child stopped reading stdin");
                }
                // Dropping the handle closes the pipe so the child sees EOF
            }
        };
        let finished = async move {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        match timeout(self.timeout, finished).await {
            Ok(Ok(output)) => {
                let result = CommandOutput {
                    status: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                };
                debug!(command = %rendered, status = result.status, "Command finished");
                Ok(result)
            }
            Ok(Err(e)) => Err(NestError::IoError(e)),
            Err(_) => Err(NestError::CommandTimedOut {
                command: rendered,
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        find_in_path(program, std::env::var_os("PATH").as_deref()?)
    }

    fn dry_run(&self) -> bool {
        self.dry_run
    }
}

/// Look `program` up in a `PATH`-style list of directories
pub fn find_in_path(program: &str, path: &std::ffi::OsStr) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    if program.contains('/') {
        let candidate = PathBuf::from(program);
        return candidate.is_file().then_some(candidate);
    }

    std::env::split_paths(path)
        .map(|dir| dir.join(program))
        .find(|candidate| {
            candidate
                .metadata()
                .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}
