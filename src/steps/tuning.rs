// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kernel and storage tuning steps

use std::path::Path;

use async_trait::async_trait;
use tracing::warn;

use crate::environment::{Environment, PackageManager, ServiceManager};
use crate::error::Result;
use crate::host::HostCommand;
use crate::step::{Outcome, Step, StepContext};

const SYSCTL_CONF: &str = "/etc/sysctl.d/99-nest-network.conf";
const LOGROTATE_CONF: &str = "/etc/logrotate.d/nest-small-disk";
const JOURNALD_DIR: &str = "/etc/systemd/journald.conf.d";
const JOURNALD_CONF: &str = "/etc/systemd/journald.conf.d/nest.conf";

/// Disks below this size get aggressive log rotation
pub const SMALL_DISK_GB: u64 = 8;

const NETWORK_SYSCTL: &str = "# Managed by kea-nest\n\
net.core.default_qdisc = fq\n\
net.ipv4.tcp_congestion_control = bbr\n\
net.ipv4.tcp_fastopen = 3\n\
net.ipv4.tcp_mtu_probing = 1\n\
net.core.rmem_max = 16777216\n\
net.core.wmem_max = 16777216\n\
net.ipv4.tcp_rmem = 4096 87380 16777216\n\
net.ipv4.tcp_wmem = 4096 65536 16777216\n";

const ZRAMSWAP_DEFAULTS: &str = "# Managed by kea-nest\nALGO=zstd\nPERCENT=50\nPRIORITY=100\n";

const ZRAM_INIT_CONF: &str = "# Managed by kea-nest\n\
load_on_start=yes\n\
unload_on_stop=yes\n\
num_devices=1\n\
type0=swap\n\
size0=`LC_ALL=C free -m | awk '/^Mem:/{print int($2/2)}'`\n\
algo0=zstd\n";

const LOGROTATE_POLICY: &str = r#"# Managed by kea-nest
/var/log/*.log {
    weekly
    rotate 2
    maxsize 20M
    compress
    delaycompress
    missingok
    notifempty
    copytruncate
}
"#;

const JOURNALD_LIMITS: &str = "# Managed by kea-nest\n[Journal]\nSystemMaxUse=50M\nRuntimeMaxUse=20M\n";

fn container_reason(env: &Environment, what: &str) -> Option<Outcome> {
    env.virtualization.is_container().then(|| {
        Outcome::Skipped(format!(
            "{} container environment: {} is managed by the host",
            env.virtualization, what
        ))
    })
}

/// BBR congestion control and socket buffer sizing
pub struct NetworkTuning;

#[async_trait]
impl Step for NetworkTuning {
    fn id(&self) -> &'static str {
        "network-tuning"
    }

    fn display_name(&self) -> &'static str {
        "Tune network stack (BBR)"
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome> {
        if let Some(skipped) = container_reason(ctx.env, "kernel network tuning") {
            return Ok(skipped);
        }

        // Built-in on most kernels, so a failed load is not fatal
        let modprobe = ctx.env.privileged(HostCommand::new("modprobe").arg("tcp_bbr"));
        match ctx.commands.run(&modprobe).await {
            Ok(output) if !output.success() => {
                warn!(status = output.status, "modprobe tcp_bbr failed, assuming built-in")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not run modprobe, assuming tcp_bbr is built-in"),
        }

        ctx.write_privileged(Path::new(SYSCTL_CONF), NETWORK_SYSCTL).await?;
        ctx.run_privileged(HostCommand::new("sysctl").args(["-p", SYSCTL_CONF]))
            .await?;

        Ok(Outcome::Success("BBR congestion control enabled".to_string()))
    }
}

/// Compressed swap in RAM
pub struct ZramSwap;

#[async_trait]
impl Step for ZramSwap {
    fn id(&self) -> &'static str {
        "zram-swap"
    }

    fn display_name(&self) -> &'static str {
        "Enable zram swap"
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome> {
        if let Some(skipped) = container_reason(ctx.env, "swap") {
            return Ok(skipped);
        }

        let swaps = ctx
            .commands
            .run(&HostCommand::new("cat").arg("/proc/swaps"))
            .await?;
        if swaps.stdout.lines().any(|line| line.starts_with("/dev/zram")) {
            return Ok(Outcome::Skipped("zram swap already active".to_string()));
        }

        match ctx.package_manager()? {
            PackageManager::Apt => {
                ctx.install_packages(&["zram-tools"]).await?;
                ctx.write_privileged(Path::new("/etc/default/zramswap"), ZRAMSWAP_DEFAULTS)
                    .await?;
                ctx.run_privileged(ServiceManager::Systemd.restart_command("zramswap"))
                    .await?;
            }
            PackageManager::Apk => {
                ctx.install_packages(&["zram-init"]).await?;
                ctx.write_privileged(Path::new("/etc/conf.d/zram-init"), ZRAM_INIT_CONF)
                    .await?;
                for command in ServiceManager::OpenRc.enable_commands("zram-init") {
                    ctx.run_privileged(command).await?;
                }
            }
        }

        Ok(Outcome::Success("zram swap enabled (zstd, half of RAM)".to_string()))
    }
}

/// Tight log retention for small root disks
pub struct LogRotation;

#[async_trait]
impl Step for LogRotation {
    fn id(&self) -> &'static str {
        "log-rotation"
    }

    fn display_name(&self) -> &'static str {
        "Limit log growth on small disks"
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome> {
        let disk_gb = ctx.env.root_disk_gb();
        if disk_gb >= SMALL_DISK_GB {
            return Ok(Outcome::Skipped(format!(
                "root disk is {} GB, default rotation is sufficient",
                disk_gb
            )));
        }

        ctx.install_packages(&["logrotate"]).await?;
        ctx.write_privileged(Path::new(LOGROTATE_CONF), LOGROTATE_POLICY)
            .await?;

        if ctx.env.service_manager() == ServiceManager::Systemd {
            ctx.run_privileged(HostCommand::new("mkdir").args(["-p", JOURNALD_DIR]))
                .await?;
            ctx.write_privileged(Path::new(JOURNALD_CONF), JOURNALD_LIMITS)
                .await?;
            ctx.run_privileged(ServiceManager::Systemd.restart_command("systemd-journald"))
                .await?;
        }

        Ok(Outcome::Success(format!(
            "rotation tightened for {} GB root disk",
            disk_gb
        )))
    }
}
