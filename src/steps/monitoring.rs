// SPDX-License-Identifier: AGPL-3.0-or-later
//! Monitoring agent deployment

use async_trait::async_trait;

use crate::error::Result;
use crate::fetch::TrustedScript;
use crate::step::{Outcome, Step, StepContext};

/// Runs the configured third-party monitoring installer
pub struct MonitoringAgent;

#[async_trait]
impl Step for MonitoringAgent {
    fn id(&self) -> &'static str {
        "monitoring-agent"
    }

    fn display_name(&self) -> &'static str {
        "Install monitoring agent"
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome> {
        let Some(monitoring) = ctx.config.monitoring.as_ref() else {
            return Ok(Outcome::Skipped("no monitoring agent configured".to_string()));
        };

        // Checked before asking so a bad URL never reaches the operator
        let script = TrustedScript::new(
            &monitoring.install_url,
            monitoring.args.iter().cloned(),
            ctx.fetcher.policy(),
        )?
        .elevated(monitoring.elevated && ctx.env.has_privilege_elevation);

        let question = format!("Install the monitoring agent from {}?", script.url());
        if !ctx.prompt.confirm(&question, true).await {
            return Ok(Outcome::Skipped(
                "operator declined monitoring agent".to_string(),
            ));
        }

        ctx.fetcher.fetch_and_execute(&script).await?;
        Ok(Outcome::Success(format!(
            "installer from {} completed",
            script.url()
        )))
    }
}
