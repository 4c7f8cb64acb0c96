// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kea-Nest: first-boot provisioning for fresh Linux hosts
//!
//! The Nest takes a freshly installed machine and walks it through a fixed
//! pipeline of provisioning steps: base packages, SSH access, kernel tuning,
//! swap, log retention, monitoring and the operator's shell.
//!
//! # Features
//!
//! * **Environment probe:** distribution, virtualization kind, root disk size
//!   and privilege elevation are read once and handed to every step
//! * **Resilient fetches:** network retrievals retry with a code-hosting mirror
//!   and run remote scripts only from allow-listed hosts
//! * **Progress ledger:** every step outcome lands in a Markdown checklist and
//!   a JSON state file that `status` and `--resume` read back
//! * **Failure isolation:** only critical steps abort a run

pub mod config;
pub mod environment;
pub mod error;
pub mod fetch;
pub mod host;
pub mod ledger;
pub mod orchestrator;
pub mod step;
pub mod steps;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use environment::{Environment, EnvironmentProbe};
pub use error::{FetchError, NestError, ProbeError, Result};
pub use ledger::Ledger;
pub use orchestrator::{Orchestrator, RunState, RunSummary};
pub use step::{Outcome, Step, StepRunner};
