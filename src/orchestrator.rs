// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning run orchestration
//!
//! Probes the host, initializes the ledger with every step and walks the
//! pipeline in order until it ends or a critical step fails.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::environment::{Environment, EnvironmentProbe};
use crate::error::NestError;
use crate::fetch::Fetcher;
use crate::host::{CommandRunner, Prompter};
use crate::ledger::{Ledger, LedgerStatus};
use crate::step::{Outcome, Step, StepContext, StepRunner};
use crate::steps::default_steps;

/// Progress of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    ProbingEnvironment,
    /// Index of the step currently executing
    RunningSteps(usize),
    /// The end of the pipeline was reached
    Completed,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::NotStarted => write!(formatter, "not started"),
            RunState::ProbingEnvironment => write!(formatter, "probing environment"),
            RunState::RunningSteps(index) => write!(formatter, "running step {}", index + 1),
            RunState::Completed => write!(formatter, "completed"),
            RunState::Aborted => write!(formatter, "aborted"),
        }
    }
}

/// Outcome of one step as seen by the run
#[derive(Debug, Clone)]
pub struct StepReport {
    pub id: &'static str,
    pub display_name: &'static str,
    pub outcome: Outcome,
}

/// Result of a provisioning run
#[derive(Debug)]
pub struct RunSummary {
    pub state: RunState,
    /// Absent when the probe failed
    pub environment: Option<Environment>,
    /// Reached steps, in execution order
    pub steps: Vec<StepReport>,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub abort_reason: Option<String>,
    pub duration_ms: u64,
}

impl RunSummary {
    fn new(
        state: RunState,
        environment: Option<Environment>,
        steps: Vec<StepReport>,
        abort_reason: Option<String>,
        start_time: Instant,
    ) -> Self {
        let count = |predicate: fn(&Outcome) -> bool| {
            steps.iter().filter(|report| predicate(&report.outcome)).count()
        };
        let succeeded = count(|outcome| matches!(outcome, Outcome::Success(_)));
        let skipped = count(|outcome| matches!(outcome, Outcome::Skipped(_)));
        let failed = count(Outcome::is_failed);

        Self {
            state,
            environment,
            steps,
            succeeded,
            skipped,
            failed,
            abort_reason,
            duration_ms: start_time.elapsed().as_millis() as u64,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state == RunState::Aborted
    }

    pub fn outcome(&self, step_id: &str) -> Option<&Outcome> {
        self.steps
            .iter()
            .find(|report| report.id == step_id)
            .map(|report| &report.outcome)
    }
}

/// Drives a provisioning run over the step pipeline
pub struct Orchestrator {
    config: Config,
    steps: Vec<Box<dyn Step>>,
    commands: Arc<dyn CommandRunner>,
    fetcher: Fetcher,
    prompt: Box<dyn Prompter>,
    probe: EnvironmentProbe,
    ledger: Ledger,
    runner: StepRunner,
    completed_before: HashSet<String>,
    state: RunState,
}

impl Orchestrator {
    /// Orchestrator over the default pipeline, persisting the ledger at the
    /// configured paths and probing through `commands`.
    ///
    /// A dry-run `commands` keeps the ledger in memory: its outcomes describe
    /// nothing that happened, and a later `--resume` must not trust them.
    pub fn new(
        config: Config,
        commands: Arc<dyn CommandRunner>,
        fetcher: Fetcher,
        prompt: Box<dyn Prompter>,
    ) -> Self {
        let ledger = if commands.dry_run() {
            Ledger::in_memory()
        } else {
            Ledger::new(&config.ledger.progress_file, &config.ledger.state_file)
        };
        Self {
            probe: EnvironmentProbe::new(commands.clone()),
            config,
            steps: default_steps(),
            commands,
            fetcher,
            prompt,
            ledger,
            runner: StepRunner::default(),
            completed_before: HashSet::new(),
            state: RunState::NotStarted,
        }
    }

    pub fn with_probe(mut self, probe: EnvironmentProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_step_runner(mut self, runner: StepRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Skip steps that `previous` recorded as done
    pub fn resume_from(mut self, previous: &Ledger) -> Self {
        self.completed_before = previous
            .entries()
            .filter(|entry| entry.status == LedgerStatus::Done)
            .map(|entry| entry.step_id.clone())
            .collect();
        info!(
            completed = self.completed_before.len(),
            "Resuming from previous ledger"
        );
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Execute the whole run. Never panics and never returns early without
    /// a summary; fatal conditions end in [`RunState::Aborted`].
    pub async fn execute(&mut self) -> RunSummary {
        let start_time = Instant::now();
        info!(
            name = %self.config.name,
            steps = self.steps.len(),
            "Starting provisioning run"
        );

        self.state = RunState::ProbingEnvironment;
        let environment = match self.probe.probe().await {
            Ok(environment) => environment,
            Err(e) => {
                error!(error = %e, "Environment probe failed, aborting");
                self.state = RunState::Aborted;
                return RunSummary::new(
                    self.state,
                    None,
                    Vec::new(),
                    Some(e.to_string()),
                    start_time,
                );
            }
        };

        self.ledger.initialize(
            self.steps
                .iter()
                .map(|step| (step.id(), step.display_name())),
        );

        let ctx = StepContext {
            env: &environment,
            config: &self.config,
            commands: self.commands.as_ref(),
            fetcher: &self.fetcher,
            prompt: self.prompt.as_ref(),
        };

        let mut reports = Vec::with_capacity(self.steps.len());
        let mut abort_reason = None;

        for (index, step) in self.steps.iter().enumerate() {
            self.state = RunState::RunningSteps(index);

            if self.completed_before.contains(step.id()) {
                let outcome = Outcome::Success("completed in a previous run".to_string());
                info!(step = %step.id(), "Step already completed, not re-running");
                self.ledger.record_outcome(step.id(), &outcome);
                reports.push(report(step.as_ref(), outcome));
                continue;
            }

            let critical = step.critical() || self.config.is_escalated(step.id());
            match self
                .runner
                .run(step.as_ref(), critical, &ctx, &mut self.ledger)
                .await
            {
                Ok(outcome) => reports.push(report(step.as_ref(), outcome)),
                Err(e) => {
                    let message = match &e {
                        NestError::CriticalStepFailed { message, .. } => message.clone(),
                        other => other.to_string(),
                    };
                    reports.push(report(step.as_ref(), Outcome::Failed(message)));
                    abort_reason = Some(e.to_string());
                    break;
                }
            }
        }

        self.state = if abort_reason.is_some() {
            RunState::Aborted
        } else {
            RunState::Completed
        };

        let summary = RunSummary::new(
            self.state,
            Some(environment),
            reports,
            abort_reason,
            start_time,
        );

        if summary.is_aborted() {
            error!(
                reason = summary.abort_reason.as_deref().unwrap_or_default(),
                reached = summary.steps.len(),
                "Provisioning aborted"
            );
        } else if summary.failed > 0 {
            warn!(
                succeeded = summary.succeeded,
                skipped = summary.skipped,
                failed = summary.failed,
                duration_ms = summary.duration_ms,
                "Provisioning completed with failures"
            );
        } else {
            info!(
                succeeded = summary.succeeded,
                skipped = summary.skipped,
                duration_ms = summary.duration_ms,
                "Provisioning completed"
            );
        }

        summary
    }
}

fn report(step: &dyn Step, outcome: Outcome) -> StepReport {
    StepReport {
        id: step.id(),
        display_name: step.display_name(),
        outcome,
    }
}
