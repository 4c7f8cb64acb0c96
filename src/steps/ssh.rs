// SPDX-License-Identifier: AGPL-3.0-or-later
//! SSH access steps

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use tracing::warn;

use crate::environment::PackageManager;
use crate::error::{NestError, Result};
use crate::host::{CommandRunner, HostCommand};
use crate::step::{Outcome, Step, StepContext};

// sshd keeps the first value it reads for a keyword and includes drop-ins in
// lexical order, so this has to sort before cloud-init's 50-cloud-init.conf
const HARDENING_CONF: &str = "/etc/ssh/sshd_config.d/00-nest-hardening.conf";
const SSHD: &str = "/usr/sbin/sshd";

const KEY_TYPES: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

/// Authorizes a public key pasted by the operator
pub struct SshKeys;

#[async_trait]
impl Step for SshKeys {
    fn id(&self) -> &'static str {
        "ssh-keys"
    }

    fn display_name(&self) -> &'static str {
        "Authorize SSH public key"
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome> {
        let Some(key) = ctx
            .prompt
            .ask("Paste an SSH public key to authorize (leave empty to skip):")
            .await
        else {
            return Ok(Outcome::Skipped("no public key provided".to_string()));
        };

        if !is_public_key(&key) {
            return Ok(Outcome::Failed(
                "input is not an OpenSSH public key".to_string(),
            ));
        }

        let path = ctx
            .config
            .authorized_keys_path()
            .ok_or_else(|| NestError::InvalidConfig {
                message: "cannot determine home directory for authorized_keys".to_string(),
            })?;

        if authorize_key(ctx.commands, &path, &key).await? {
            Ok(Outcome::Success(format!("key added to {}", path.display())))
        } else {
            Ok(Outcome::Success("key was already authorized".to_string()))
        }
    }
}

/// Key-only login via an sshd drop-in
pub struct SshHardening;

#[async_trait]
impl Step for SshHardening {
    fn id(&self) -> &'static str {
        "ssh-hardening"
    }

    fn display_name(&self) -> &'static str {
        "Harden SSH daemon"
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome> {
        let port = ctx.config.ssh.port;
        let question = if port == 22 {
            "Disable SSH password login and allow key-only access?".to_string()
        } else {
            format!("Disable SSH password login and move sshd to port {}?", port)
        };

        if !ctx.prompt.confirm(&question, false).await {
            return Ok(Outcome::Skipped("operator declined SSH hardening".to_string()));
        }

        let has_keys = ctx
            .config
            .authorized_keys_path()
            .map(|path| has_authorized_keys(&path))
            .unwrap_or(false);
        if !has_keys {
            return Ok(Outcome::Skipped(
                "no authorized keys present, keeping password login".to_string(),
            ));
        }

        let conf = Path::new(HARDENING_CONF);
        if let Some(dir) = conf.parent() {
            ctx.run_privileged(HostCommand::new("mkdir").arg("-p").arg(dir.display().to_string()))
                .await?;
        }
        ctx.write_privileged(conf, &hardening_config(port)).await?;

        if let Err(e) = ctx.run_privileged(HostCommand::new(SSHD).arg("-t")).await {
            warn!(error = %e, "sshd rejected the hardening config, removing it");
            ctx.run_privileged(HostCommand::new("rm").args(["-f", HARDENING_CONF]))
                .await?;
            return Err(e);
        }

        let effective = ctx.run_privileged(HostCommand::new(SSHD).arg("-T")).await?;
        if accepts_passwords(&effective.stdout) {
            return Ok(Outcome::Failed(
                "sshd still accepts password login, another sshd_config entry takes precedence"
                    .to_string(),
            ));
        }

        let service = match ctx.package_manager()? {
            PackageManager::Apt => "ssh",
            PackageManager::Apk => "sshd",
        };
        ctx.run_privileged(ctx.env.service_manager().restart_command(service))
            .await?;

        Ok(Outcome::Success(format!(
            "password login disabled, sshd listening on port {}",
            port
        )))
    }
}

fn hardening_config(port: u16) -> String {
    let mut conf = String::from(
        "# Managed by kea-nest\n\
         PermitRootLogin prohibit-password\n\
         PasswordAuthentication no\n\
         KbdInteractiveAuthentication no\n\
         PubkeyAuthentication yes\n\
         X11Forwarding no\n\
         MaxAuthTries 3\n",
    );
    if port != 22 {
        conf.push_str(&format!("Port {}\n", port));
    }
    conf
}

/// Whether `sshd -T` output leaves password authentication on
fn accepts_passwords(effective_config: &str) -> bool {
    effective_config.lines().any(|line| {
        let mut fields = line.split_whitespace();
        matches!(
            (fields.next(), fields.next()),
            (Some(key), Some(value))
                if key.eq_ignore_ascii_case("passwordauthentication")
                    && value.eq_ignore_ascii_case("yes")
        )
    })
}

pub fn is_public_key(line: &str) -> bool {
    let mut fields = line.split_whitespace();
    match (fields.next(), fields.next()) {
        (Some(kind), Some(material)) => KEY_TYPES.contains(&kind) && !material.is_empty(),
        _ => false,
    }
}

fn has_authorized_keys(path: &Path) -> bool {
    fs::read_to_string(path)
        .map(|contents| contents.lines().any(is_public_key))
        .unwrap_or(false)
}

/// Append `key` unless its key material is already present. Returns whether
/// the file was changed.
///
/// The file belongs to the operator, so the writes run unelevated through the
/// command runner.
async fn authorize_key(commands: &dyn CommandRunner, path: &Path, key: &str) -> Result<bool> {
    let material = key.split_whitespace().nth(1).unwrap_or_default();
    let existing = fs::read_to_string(path).unwrap_or_default();
    if existing
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(material))
    {
        return Ok(false);
    }

    if let Some(dir) = path.parent() {
        let dir = dir.display().to_string();
        commands
            .run_checked(&HostCommand::new("mkdir").args(["-p", dir.as_str()]))
            .await?;
        commands
            .run_checked(&HostCommand::new("chmod").args(["700", dir.as_str()]))
            .await?;
    }

    let mut line = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        line.push('\n');
    }
    line.push_str(key.trim());
    line.push('\n');

    let file = path.display().to_string();
    commands
        .run_checked(
            &HostCommand::new("tee")
                .args(["-a", file.as_str()])
                .stdin(line),
        )
        .await?;
    commands
        .run_checked(&HostCommand::new("chmod").args(["600", file.as_str()]))
        .await?;
    Ok(true)
}
