// SPDX-License-Identifier: AGPL-3.0-or-later
//! Base system steps: distribution gate, timezone, packages

use async_trait::async_trait;

use crate::error::{NestError, Result};
use crate::host::HostCommand;
use crate::step::{Outcome, Step, StepContext};

/// Refuses to continue on distributions without a package-manager mapping
pub struct OsIdentity;

#[async_trait]
impl Step for OsIdentity {
    fn id(&self) -> &'static str {
        "os-identity"
    }

    fn display_name(&self) -> &'static str {
        "Verify operating system"
    }

    fn critical(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome> {
        let manager = ctx.env.package_manager().ok_or_else(|| NestError::UnsupportedDistro {
            distro: format!("{} {}", ctx.env.distro_id, ctx.env.distro_version),
        })?;

        Ok(Outcome::Success(format!(
            "{} {} managed with {:?}",
            ctx.env.distro_id, ctx.env.distro_version, manager
        )))
    }
}

/// Sets the configured timezone
pub struct Timezone;

#[async_trait]
impl Step for Timezone {
    fn id(&self) -> &'static str {
        "timezone"
    }

    fn display_name(&self) -> &'static str {
        "Set timezone"
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome> {
        let timezone = ctx.config.provision.timezone.as_str();

        if ctx.commands.exists("timedatectl") {
            let current = ctx
                .commands
                .run(&HostCommand::new("timedatectl").args(["show", "-p", "Timezone", "--value"]))
                .await?;
            if current.success() && current.stdout.trim() == timezone {
                return Ok(Outcome::Skipped(format!("timezone already {}", timezone)));
            }

            ctx.run_privileged(HostCommand::new("timedatectl").args(["set-timezone", timezone]))
                .await?;
        } else if ctx.commands.exists("setup-timezone") {
            ctx.run_privileged(HostCommand::new("setup-timezone").args(["-z", timezone]))
                .await?;
        } else {
            return Ok(Outcome::Skipped(
                "neither timedatectl nor setup-timezone is available".to_string(),
            ));
        }

        Ok(Outcome::Success(format!("timezone set to {}", timezone)))
    }
}

/// Refreshes the package index and upgrades installed packages
pub struct PackageUpdate;

#[async_trait]
impl Step for PackageUpdate {
    fn id(&self) -> &'static str {
        "package-update"
    }

    fn display_name(&self) -> &'static str {
        "Update system packages"
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome> {
        let manager = ctx.package_manager()?;
        for command in manager.update_commands() {
            ctx.run_privileged(command).await?;
        }
        Ok(Outcome::Success("package index refreshed, packages upgraded".to_string()))
    }
}

/// Installs the configured base toolset
pub struct BaseTools;

#[async_trait]
impl Step for BaseTools {
    fn id(&self) -> &'static str {
        "base-tools"
    }

    fn display_name(&self) -> &'static str {
        "Install base tools"
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome> {
        let packages = &ctx.config.provision.packages;
        if packages.is_empty() {
            return Ok(Outcome::Skipped("no packages configured".to_string()));
        }

        ctx.install_packages(packages).await?;
        Ok(Outcome::Success(format!("installed {}", packages.join(", "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_support::{debian_env, Harness};

    #[tokio::test]
    async fn test_os_identity_rejects_unknown_distro() {
        let mut env = debian_env();
        env.distro_id = "fedora".to_string();
        let harness = Harness::new(env);

        let err = OsIdentity.run(&harness.ctx()).await.unwrap_err();
        assert!(matches!(err, NestError::UnsupportedDistro { .. }));
    }

    #[tokio::test]
    async fn test_os_identity_accepts_debian() {
        let harness = Harness::new(debian_env());
        let outcome = OsIdentity.run(&harness.ctx()).await.unwrap();
        assert!(matches!(outcome, Outcome::Success(_)));
    }

    #[tokio::test]
    async fn test_timezone_uses_timedatectl() {
        let harness = Harness::with_runner(
            debian_env(),
            crate::testing::RecordingRunner::new()
                .with_program("timedatectl")
                .respond("timedatectl show", 0, "Etc/UTC\n"),
        );

        let outcome = Timezone.run(&harness.ctx()).await.unwrap();
        assert!(matches!(outcome, Outcome::Success(_)));
        assert!(harness.runner.ran("timedatectl set-timezone UTC"));
    }

    #[tokio::test]
    async fn test_timezone_already_set_is_skipped() {
        let harness = Harness::with_runner(
            debian_env(),
            crate::testing::RecordingRunner::new()
                .with_program("timedatectl")
                .respond("timedatectl show", 0, "UTC\n"),
        );

        let outcome = Timezone.run(&harness.ctx()).await.unwrap();
        assert!(matches!(outcome, Outcome::Skipped(_)));
        assert!(!harness.runner.ran("timedatectl set-timezone"));
    }

    #[tokio::test]
    async fn test_timezone_without_tools_is_skipped() {
        let harness = Harness::new(debian_env());
        let outcome = Timezone.run(&harness.ctx()).await.unwrap();
        assert!(matches!(outcome, Outcome::Skipped(_)));
        assert!(harness.runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_package_update_runs_apt_with_elevation() {
        let harness = Harness::new(debian_env());
        PackageUpdate.run(&harness.ctx()).await.unwrap();

        let commands = harness.runner.commands();
        assert_eq!(commands[0].display(), "sudo apt-get update");
        assert_eq!(
            commands[1].display(),
            "sudo env DEBIAN_FRONTEND=noninteractive apt-get -y upgrade"
        );
    }

    #[tokio::test]
    async fn test_package_update_failure_propagates() {
        let harness = Harness::with_runner(
            debian_env(),
            crate::testing::RecordingRunner::new().respond("apt-get update", 100, ""),
        );

        let err = PackageUpdate.run(&harness.ctx()).await.unwrap_err();
        assert!(matches!(err, NestError::CommandFailed { status: 100, .. }));
        // Upgrade is not attempted after a failed refresh
        assert_eq!(harness.runner.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_base_tools_on_alpine() {
        let mut env = debian_env();
        env.distro_id = "alpine".to_string();
        env.has_privilege_elevation = false;
        let mut harness = Harness::new(env);
        harness.config.provision.packages = vec!["curl".to_string(), "htop".to_string()];

        BaseTools.run(&harness.ctx()).await.unwrap();
        assert_eq!(harness.runner.rendered(), vec!["apk add curl htop"]);
    }
}
