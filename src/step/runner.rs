// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step runner
//!
//! Runs a single step, classifies whatever happens into an [`Outcome`] and
//! records it in the ledger exactly once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::{Outcome, Step, StepContext};
use crate::error::{NestError, Result};
use crate::ledger::Ledger;

type Interrupt = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Executes steps with failure isolation
pub struct StepRunner {
    /// Produces a future per step that resolves when the operator interrupts
    /// it; `None` lets steps run to completion
    interrupts: Option<Arc<dyn Fn() -> Interrupt + Send + Sync>>,
}

impl Default for StepRunner {
    fn default() -> Self {
        Self::new(true)
    }
}

impl StepRunner {
    /// Runner that treats Ctrl-C during a step as that step failing when
    /// `handle_interrupts` is set
    pub fn new(handle_interrupts: bool) -> Self {
        if handle_interrupts {
            Self::with_interrupt(ctrl_c)
        } else {
            Self { interrupts: None }
        }
    }

    /// Runner interrupted whenever a future from `source` resolves
    pub fn with_interrupt<F, Fut>(source: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            interrupts: Some(Arc::new(move || Box::pin(source()) as Interrupt)),
        }
    }

    /// Run `step` and record its outcome.
    ///
    /// Returns `Err(NestError::CriticalStepFailed)` only when `critical` is set
    /// and the step failed; the ledger is updated before that error is raised.
    pub async fn run(
        &self,
        step: &dyn Step,
        critical: bool,
        ctx: &StepContext<'_>,
        ledger: &mut Ledger,
    ) -> Result<Outcome> {
        let start_time = Instant::now();
        info!(step = %step.id(), critical, "Running step: {}", step.display_name());

        let outcome = if ctx.config.is_skipped(step.id()) {
            Outcome::Skipped("disabled in configuration".to_string())
        } else {
            self.invoke(step, ctx).await
        };

        let duration_ms = start_time.elapsed().as_millis() as u64;
        match &outcome {
            Outcome::Success(message) => {
                info!(step = %step.id(), duration_ms, "Step completed: {}", message)
            }
            Outcome::Skipped(reason) => {
                info!(step = %step.id(), duration_ms, "Step skipped: {}", reason)
            }
            Outcome::Failed(message) if critical => {
                error!(step = %step.id(), duration_ms, "Critical step failed: {}", message)
            }
            Outcome::Failed(message) => {
                warn!(step = %step.id(), duration_ms, "Step failed, continuing: {}", message)
            }
        }

        ledger.record_outcome(step.id(), &outcome);

        if critical {
            if let Outcome::Failed(message) = &outcome {
                return Err(NestError::CriticalStepFailed {
                    step: step.id().to_string(),
                    message: message.clone(),
                });
            }
        }

        Ok(outcome)
    }

    async fn invoke(&self, step: &dyn Step, ctx: &StepContext<'_>) -> Outcome {
        let execution = async {
            match step.run(ctx).await {
                Ok(outcome) => outcome,
                Err(e) => Outcome::Failed(e.to_string()),
            }
        };

        let Some(interrupts) = &self.interrupts else {
            return execution.await;
        };

        tokio::select! {
            outcome = execution => outcome,
            _ = interrupts() => {
                debug!(step = %step.id(), "Interrupt received while step was running");
                Outcome::Failed("interrupted by operator".to_string())
            }
        }
    }
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
