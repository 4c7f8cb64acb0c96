// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host environment detection
//!
//! The probe runs once before any step. Its result is an immutable
//! [`Environment`] every step reads instead of sharing mutable globals.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ProbeError;
use crate::host::{CommandRunner, HostCommand, ELEVATION_COMMAND};

const OS_RELEASE_PATH: &str = "/etc/os-release";
const INIT_ENVIRON_PATH: &str = "/proc/1/environ";
const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Virtualization technology the host runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualizationKind {
    Kvm,
    Lxc,
    Container,
    Unknown,
}

impl VirtualizationKind {
    /// Whether the kernel belongs to someone else (no sysctl, no swap devices)
    pub fn is_container(&self) -> bool {
        matches!(self, VirtualizationKind::Lxc | VirtualizationKind::Container)
    }

    /// Classify the output of `systemd-detect-virt`
    pub fn from_detect_virt(output: &str) -> Self {
        match output.trim() {
            // Bare metal gets the same treatment as a full VM
            "kvm" | "qemu" | "none" => VirtualizationKind::Kvm,
            "lxc" | "lxc-libvirt" => VirtualizationKind::Lxc,
            "docker" | "podman" | "openvz" | "systemd-nspawn" | "rkt" | "wsl"
            | "container-other" => VirtualizationKind::Container,
            _ => VirtualizationKind::Unknown,
        }
    }
}

impl fmt::Display for VirtualizationKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtualizationKind::Kvm => write!(formatter, "kvm"),
            VirtualizationKind::Lxc => write!(formatter, "lxc"),
            VirtualizationKind::Container => write!(formatter, "container"),
            VirtualizationKind::Unknown => write!(formatter, "unknown"),
        }
    }
}

/// Package manager family of the distribution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Apk,
}

impl PackageManager {
    /// Commands that refresh the index and upgrade installed packages
    pub fn update_commands(&self) -> Vec<HostCommand> {
        match self {
            PackageManager::Apt => vec![
                HostCommand::new("apt-get").arg("update"),
                HostCommand::new("apt-get")
                    .args(["-y", "upgrade"])
                    .env("DEBIAN_FRONTEND", "noninteractive"),
            ],
            PackageManager::Apk => vec![
                HostCommand::new("apk").arg("update"),
                HostCommand::new("apk").arg("upgrade"),
            ],
        }
    }

    pub fn install_command<S: AsRef<str>>(&self, packages: &[S]) -> HostCommand {
        let packages = packages.iter().map(|package| package.as_ref().to_string());
        match self {
            PackageManager::Apt => HostCommand::new("apt-get")
                .args(["-y", "install"])
                .args(packages)
                .env("DEBIAN_FRONTEND", "noninteractive"),
            PackageManager::Apk => HostCommand::new("apk").arg("add").args(packages),
        }
    }
}

/// Init system used to manage services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceManager {
    Systemd,
    OpenRc,
}

impl ServiceManager {
    pub fn restart_command(&self, service: &str) -> HostCommand {
        match self {
            ServiceManager::Systemd => HostCommand::new("systemctl").args(["restart", service]),
            ServiceManager::OpenRc => HostCommand::new("rc-service").args([service, "restart"]),
        }
    }

    /// Enable at boot and start now
    pub fn enable_commands(&self, service: &str) -> Vec<HostCommand> {
        match self {
            ServiceManager::Systemd => {
                vec![HostCommand::new("systemctl").args(["enable", "--now", service])]
            }
            ServiceManager::OpenRc => vec![
                HostCommand::new("rc-update").args(["add", service, "boot"]),
                HostCommand::new("rc-service").args([service, "start"]),
            ],
        }
    }
}

/// Immutable snapshot of host facts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub distro_id: String,
    pub distro_version: String,
    /// `ID_LIKE` entries, used when `distro_id` is a derivative
    pub distro_like: Vec<String>,
    pub virtualization: VirtualizationKind,
    pub root_disk_size_bytes: u64,
    pub has_privilege_elevation: bool,
    pub architecture: String,
}

impl Environment {
    /// Root disk size in whole gigabytes, truncated
    pub fn root_disk_gb(&self) -> u64 {
        self.root_disk_size_bytes / BYTES_PER_GB
    }

    pub fn package_manager(&self) -> Option<PackageManager> {
        std::iter::once(self.distro_id.as_str())
            .chain(self.distro_like.iter().map(String::as_str))
            .find_map(|id| match id {
                "ubuntu" | "debian" => Some(PackageManager::Apt),
                "alpine" => Some(PackageManager::Apk),
                _ => None,
            })
    }

    pub fn service_manager(&self) -> ServiceManager {
        match self.package_manager() {
            Some(PackageManager::Apk) => ServiceManager::OpenRc,
            _ => ServiceManager::Systemd,
        }
    }

    /// Apply elevation when the host has it
    pub fn privileged(&self, command: HostCommand) -> HostCommand {
        command.elevated(self.has_privilege_elevation)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{} {} ({}, {}, {} GB root disk, elevation: {})",
            self.distro_id,
            self.distro_version,
            self.architecture,
            self.virtualization,
            self.root_disk_gb(),
            if self.has_privilege_elevation { "sudo" } else { "none" }
        )
    }
}

/// Reads host facts
pub struct EnvironmentProbe {
    os_release_path: PathBuf,
    init_environ_path: PathBuf,
    commands: Arc<dyn CommandRunner>,
}

impl EnvironmentProbe {
    pub fn new(commands: Arc<dyn CommandRunner>) -> Self {
        Self {
            os_release_path: PathBuf::from(OS_RELEASE_PATH),
            init_environ_path: PathBuf::from(INIT_ENVIRON_PATH),
            commands,
        }
    }

    /// Override the host files read by the probe
    pub fn with_paths<P: Into<PathBuf>, Q: Into<PathBuf>>(
        mut self,
        os_release: P,
        init_environ: Q,
    ) -> Self {
        self.os_release_path = os_release.into();
        self.init_environ_path = init_environ.into();
        self
    }

    pub async fn probe(&self) -> Result<Environment, ProbeError> {
        let release = read_os_release(&self.os_release_path)?;
        let virtualization = self.detect_virtualization().await;
        let root_disk_size_bytes = self.root_disk_size_bytes().await;

        let has_privilege_elevation = self.commands.exists(ELEVATION_COMMAND);
        if !has_privilege_elevation {
            warn!(
                "'{}' not found on PATH, privileged commands will run unprivileged",
                ELEVATION_COMMAND
            );
        }

        let environment = Environment {
            distro_id: release.id,
            distro_version: release.version,
            distro_like: release.like,
            virtualization,
            root_disk_size_bytes,
            has_privilege_elevation,
            architecture: std::env::consts::ARCH.to_string(),
        };

        info!(environment = %environment, "Environment probed");
        Ok(environment)
    }

    async fn detect_virtualization(&self) -> VirtualizationKind {
        if self.commands.exists("systemd-detect-virt") {
            // Exits non-zero for "none", so only the output matters
            match self.commands.run(&HostCommand::new("systemd-detect-virt")).await {
                Ok(output) if !output.stdout.trim().is_empty() => {
                    let kind = VirtualizationKind::from_detect_virt(&output.stdout);
                    debug!(output = %output.stdout.trim(), kind = %kind, "systemd-detect-virt");
                    return kind;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "systemd-detect-virt failed"),
            }
        }

        if let Ok(environ) = std::fs::read(&self.init_environ_path) {
            if let Some(kind) = container_from_environ(&environ) {
                debug!(kind = %kind, "Container marker found in init environment");
                return kind;
            }
        }

        VirtualizationKind::Kvm
    }

    async fn root_disk_size_bytes(&self) -> u64 {
        let df = HostCommand::new("df").args(["-Pk", "/"]);
        match self.commands.run_checked(&df).await {
            Ok(output) => match parse_df_kib_blocks(&output.stdout) {
                Some(blocks) => blocks.saturating_mul(1024),
                None => {
                    warn!(output = %output.stdout, "Unrecognised df output, assuming empty disk");
                    0
                }
            },
            Err(e) => {
                warn!(error = %e, "Could not read root filesystem size, assuming empty disk");
                0
            }
        }
    }
}

/// Identity fields from os-release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub version: String,
    pub like: Vec<String>,
}

pub fn read_os_release(path: &Path) -> Result<OsRelease, ProbeError> {
    if !path.exists() {
        return Err(ProbeError::MissingOsRelease {
            path: path.to_path_buf(),
        });
    }

    let contents = std::fs::read_to_string(path).map_err(|source| ProbeError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    parse_os_release(&contents).ok_or_else(|| ProbeError::MissingOsId {
        path: path.to_path_buf(),
    })
}

pub fn parse_os_release(contents: &str) -> Option<OsRelease> {
    let mut id = None;
    let mut version = String::new();
    let mut like = Vec::new();

    for line in contents.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'');
        match key {
            "ID" if !value.is_empty() => id = Some(value.to_lowercase()),
            "VERSION_ID" => version = value.to_string(),
            "ID_LIKE" => like = value.split_whitespace().map(str::to_lowercase).collect(),
            _ => {}
        }
    }

    Some(OsRelease {
        id: id?,
        version,
        like,
    })
}

/// Inspect a NUL-separated environment block for a `container=` marker
pub fn container_from_environ(environ: &[u8]) -> Option<VirtualizationKind> {
    environ
        .split(|byte| *byte == 0)
        .filter_map(|entry| entry.strip_prefix(b"container="))
        .map(|value| {
            if value == b"lxc" {
                VirtualizationKind::Lxc
            } else {
                VirtualizationKind::Container
            }
        })
        .next()
}

/// 1024-byte block count of the root filesystem from `df -Pk /`
pub fn parse_df_kib_blocks(output: &str) -> Option<u64> {
    output
        .lines()
        .nth(1)?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}
