// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interactive shell framework (zsh + oh-my-zsh)
//!
//! Kept last in the pipeline: switching the login shell is the one change an
//! operator notices on their next login, and nothing after it depends on it.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::environment::PackageManager;
use crate::error::{NestError, Result};
use crate::fetch::TrustedScript;
use crate::host::HostCommand;
use crate::step::{Outcome, Step, StepContext};

const FALLBACK_ZSH: &str = "/bin/zsh";

pub struct ShellFramework;

#[async_trait]
impl Step for ShellFramework {
    fn id(&self) -> &'static str {
        "shell-framework"
    }

    fn display_name(&self) -> &'static str {
        "Install zsh and oh-my-zsh"
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome> {
        if !ctx
            .prompt
            .confirm("Install zsh with oh-my-zsh and make it the login shell?", true)
            .await
        {
            return Ok(Outcome::Skipped("operator declined shell setup".to_string()));
        }

        let home = ctx.config.home_dir().ok_or_else(|| NestError::InvalidConfig {
            message: "cannot determine home directory for shell setup".to_string(),
        })?;

        let mut packages = vec!["zsh", "git", "curl"];
        if ctx.package_manager()? == PackageManager::Apk {
            // chsh lives in shadow on Alpine
            packages.push("shadow");
        }
        ctx.install_packages(&packages).await?;

        if home.join(".oh-my-zsh").is_dir() {
            debug!(home = %home.display(), "oh-my-zsh already present");
        } else {
            let installer = TrustedScript::new(
                &ctx.config.shell.installer_url,
                ["--unattended"],
                ctx.fetcher.policy(),
            )?;
            ctx.fetcher.fetch_and_execute(&installer).await?;
        }

        if let Some(url) = ctx.config.shell.zshrc_url.as_deref() {
            ctx.fetcher.fetch_file(url, &home.join(".zshrc")).await?;
        }

        if ctx.dry_run() {
            return Ok(Outcome::Success(
                "dry run, login shell left unchanged".to_string(),
            ));
        }

        let user = ctx.run(HostCommand::new("id").arg("-un")).await?;
        let user = user.stdout.trim();
        if user.is_empty() {
            return Ok(Outcome::Failed("could not determine current user".to_string()));
        }

        let zsh = ctx
            .commands
            .which("zsh")
            .unwrap_or_else(|| PathBuf::from(FALLBACK_ZSH));
        ctx.run_privileged(
            HostCommand::new("chsh")
                .arg("-s")
                .arg(zsh.display().to_string())
                .arg(user),
        )
        .await?;

        Ok(Outcome::Success(format!(
            "login shell for {} is now {}",
            user,
            zsh.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_support::{debian_env, Harness};
    use crate::testing::{RecordingRunner, ScriptedPrompter, ScriptedTransport};
    use tempfile::tempdir;

    const ZSHRC: &str = "https://raw.githubusercontent.com/kea/dotfiles/main/.zshrc";

    fn harness_with(runner: RecordingRunner, transport: ScriptedTransport) -> Harness {
        Harness::with_runner(debian_env(), runner)
            .with_prompt(ScriptedPrompter::new().confirm_with(true))
            .with_transport(transport)
    }

    #[tokio::test]
    async fn test_declined_installs_nothing() {
        let harness = Harness::new(debian_env());
        let outcome = ShellFramework.run(&harness.ctx()).await.unwrap();
        assert!(matches!(outcome, Outcome::Skipped(_)));
        assert!(harness.runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_full_setup() {
        let temp_dir = tempdir().unwrap();
        let mut harness = harness_with(
            RecordingRunner::new()
                .with_program("zsh")
                .respond("id -un", 0, "kea\n"),
            ScriptedTransport::new()
                .serve(&harness_installer(), "echo omz")
                .serve(ZSHRC, "export EDITOR=vim\n"),
        );
        harness.config.provision.home_dir = Some(temp_dir.path().to_path_buf());
        harness.config.shell.zshrc_url = Some(ZSHRC.to_string());

        let outcome = ShellFramework.run(&harness.ctx()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Success("login shell for kea is now /usr/bin/zsh".to_string())
        );

        assert!(harness.runner.ran("apt-get -y install zsh git curl"));
        assert!(harness.runner.ran("sh -s -- --unattended"));
        assert!(harness.runner.ran("chsh -s /usr/bin/zsh kea"));
        let zshrc = std::fs::read_to_string(temp_dir.path().join(".zshrc")).unwrap();
        assert!(zshrc.contains("EDITOR"));
    }

    #[tokio::test]
    async fn test_existing_oh_my_zsh_is_not_reinstalled() {
        let temp_dir = tempdir().unwrap();
        std::fs::create_dir(temp_dir.path().join(".oh-my-zsh")).unwrap();
        let mut harness = harness_with(
            RecordingRunner::new().respond("id -un", 0, "kea\n"),
            ScriptedTransport::new(),
        );
        harness.config.provision.home_dir = Some(temp_dir.path().to_path_buf());

        ShellFramework.run(&harness.ctx()).await.unwrap();
        assert!(harness.transport.calls().is_empty());
        assert!(harness.runner.ran("chsh -s /bin/zsh kea"));
    }

    #[tokio::test]
    async fn test_alpine_installs_shadow() {
        let temp_dir = tempdir().unwrap();
        std::fs::create_dir(temp_dir.path().join(".oh-my-zsh")).unwrap();
        let mut env = debian_env();
        env.distro_id = "alpine".to_string();
        let mut harness = Harness::with_runner(env, RecordingRunner::new().respond("id -un", 0, "root\n"))
            .with_prompt(ScriptedPrompter::new().confirm_with(true));
        harness.config.provision.home_dir = Some(temp_dir.path().to_path_buf());

        ShellFramework.run(&harness.ctx()).await.unwrap();
        assert!(harness.runner.ran("apk add zsh git curl shadow"));
    }

    #[tokio::test]
    async fn test_dry_run_does_not_change_login_shell() {
        let temp_dir = tempdir().unwrap();
        let mut harness = harness_with(
            RecordingRunner::new()
                .in_dry_run()
                .respond("id -un", 0, "[DRY RUN] Would execute: id -un"),
            ScriptedTransport::new().serve(&harness_installer(), "echo omz"),
        );
        harness.config.provision.home_dir = Some(temp_dir.path().to_path_buf());

        let outcome = ShellFramework.run(&harness.ctx()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Success("dry run, login shell left unchanged".to_string())
        );
        assert!(!harness.runner.ran("id -un"));
        assert!(!harness.runner.ran("chsh"));
    }

    fn harness_installer() -> String {
        crate::config::ShellConfig::default().installer_url
    }
}
