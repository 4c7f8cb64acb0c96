// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning steps
//!
//! A step is one named, self-contained provisioning action. Steps receive a
//! [`StepContext`] with the probed [`Environment`] and the host boundaries,
//! and report an [`Outcome`]. Errors they return are classified by the
//! [`StepRunner`].

mod runner;

pub use runner::StepRunner;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;

use crate::config::Config;
use crate::environment::{Environment, PackageManager};
use crate::error::{NestError, Result};
use crate::fetch::Fetcher;
use crate::host::{CommandOutput, CommandRunner, HostCommand, Prompter};

/// Terminal result of one step execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(String),
    Skipped(String),
    Failed(String),
}

impl Outcome {
    pub fn message(&self) -> &str {
        match self {
            Outcome::Success(message) | Outcome::Skipped(message) | Outcome::Failed(message) => {
                message
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(message) => write!(formatter, "done: {}", message),
            Outcome::Skipped(reason) => write!(formatter, "skipped: {}", reason),
            Outcome::Failed(error) => write!(formatter, "failed: {}", error),
        }
    }
}

/// Everything a step may touch
pub struct StepContext<'a> {
    pub env: &'a Environment,
    pub config: &'a Config,
    pub commands: &'a dyn CommandRunner,
    pub fetcher: &'a Fetcher,
    pub prompt: &'a dyn Prompter,
}

impl StepContext<'_> {
    /// Run a command, failing on non-zero exit
    pub async fn run(&self, command: HostCommand) -> Result<CommandOutput> {
        self.commands.run_checked(&command).await
    }

    /// Run a command with privilege elevation when available
    pub async fn run_privileged(&self, command: HostCommand) -> Result<CommandOutput> {
        self.commands.run_checked(&self.env.privileged(command)).await
    }

    /// Write a root-owned file with fixed content
    pub async fn write_privileged(&self, path: &Path, contents: &str) -> Result<()> {
        self.run_privileged(HostCommand::write_file(path, contents))
            .await
            .map(|_| ())
    }

    pub fn dry_run(&self) -> bool {
        self.commands.dry_run()
    }

    /// Package manager of the host, or an error for unsupported distros
    pub fn package_manager(&self) -> Result<PackageManager> {
        self.env
            .package_manager()
            .ok_or_else(|| NestError::UnsupportedDistro {
                distro: self.env.distro_id.clone(),
            })
    }

    pub async fn install_packages<S: AsRef<str> + Sync>(&self, packages: &[S]) -> Result<()> {
        let manager = self.package_manager()?;
        self.run_privileged(manager.install_command(packages))
            .await
            .map(|_| ())
    }
}

/// One entry of the fixed provisioning pipeline
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable identifier, unique across the registry
    fn id(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    /// Failure of a critical step aborts the run
    fn critical(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome>;
}
