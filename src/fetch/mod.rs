// SPDX-License-Identifier: AGPL-3.0-or-later
//! Network retrieval with retries and mirror fallback
//!
//! Every fetch runs up to `max_attempts` cycles. A cycle tries the primary
//! URL and, for code-hosting URLs, the mirror right after it. Cycles are
//! separated by a constant backoff.

mod transport;

pub use transport::{HttpTransport, Transport};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::host::{CommandRunner, HostCommand};

/// Retry, mirror and trust policy
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub mirror_base: String,
    pub code_hosts: Vec<String>,
    pub trusted_hosts: Vec<String>,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl From<&FetchConfig> for FetchPolicy {
    fn from(config: &FetchConfig) -> Self {
        Self {
            mirror_base: config.mirror_base.clone(),
            code_hosts: config.code_hosts.clone(),
            trusted_hosts: config.trusted_hosts.clone(),
            max_attempts: config.max_attempts,
            backoff: config.backoff(),
        }
    }
}

impl FetchPolicy {
    /// Mirror URL for `url`, if its host is a code-hosting domain
    pub fn mirror_url(&self, url: &str) -> Option<String> {
        if self.mirror_base.is_empty() {
            return None;
        }

        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        if !host_matches(host, &self.code_hosts) {
            return None;
        }

        let base = if self.mirror_base.ends_with('/') {
            self.mirror_base.clone()
        } else {
            format!("{}/", self.mirror_base)
        };
        Some(format!("{}{}", base, url))
    }
}

fn host_matches(host: &str, domains: &[String]) -> bool {
    domains.iter().any(|domain| {
        host == domain
            || host
                .strip_suffix(domain.as_str())
                .map(|rest| rest.ends_with('.'))
                .unwrap_or(false)
    })
}

/// A remote script cleared for execution: https, allow-listed host, fixed argv
#[derive(Debug, Clone)]
pub struct TrustedScript {
    url: String,
    args: Vec<String>,
    elevate: bool,
}

impl TrustedScript {
    pub fn new<I, S>(url: &str, args: I, policy: &FetchPolicy) -> Result<Self, FetchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let trusted = parsed.scheme() == "https"
            && parsed
                .host_str()
                .map(|host| host_matches(host, &policy.trusted_hosts))
                .unwrap_or(false);
        if !trusted {
            return Err(FetchError::UntrustedSource {
                url: url.to_string(),
            });
        }

        Ok(Self {
            url: url.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            elevate: false,
        })
    }

    /// Run the script through the elevation program
    pub fn elevated(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn command(&self, body: Vec<u8>) -> HostCommand {
        HostCommand::new("sh")
            .args(["-s", "--"])
            .args(self.args.iter().cloned())
            .stdin(body)
            .elevated(self.elevate)
    }
}

/// One attempt cycle over the primary and optional mirror URL
#[derive(Debug, Clone)]
pub struct FetchAttempt<'a> {
    pub url: &'a str,
    pub mirror_url: Option<&'a str>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl<'a> FetchAttempt<'a> {
    fn sources(&self) -> impl Iterator<Item = &'a str> {
        std::iter::once(self.url).chain(self.mirror_url)
    }

    fn is_last(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

enum FetchAction<'a> {
    File(&'a Path),
    Execute(&'a TrustedScript),
}

/// Fetches files and remote scripts
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    commands: Arc<dyn CommandRunner>,
    policy: FetchPolicy,
    dry_run: bool,
}

impl Fetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        commands: Arc<dyn CommandRunner>,
        policy: FetchPolicy,
    ) -> Self {
        Self {
            transport,
            commands,
            policy,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Download `url` to `destination`
    pub async fn fetch_file(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
        if self.dry_run {
            info!(url = %url, destination = %destination.display(), "[DRY RUN] Would download");
            return Ok(());
        }
        self.with_retries(url, FetchAction::File(destination)).await
    }

    /// Download a trusted script and run it with its fixed arguments
    pub async fn fetch_and_execute(&self, script: &TrustedScript) -> Result<(), FetchError> {
        if self.dry_run {
            info!(url = %script.url, args = ?script.args, "[DRY RUN] Would execute remote script");
            return Ok(());
        }
        self.with_retries(&script.url, FetchAction::Execute(script)).await
    }

    async fn with_retries(&self, url: &str, action: FetchAction<'_>) -> Result<(), FetchError> {
        let mirror_url = self.policy.mirror_url(url);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.policy.max_attempts {
            let cycle = FetchAttempt {
                url,
                mirror_url: mirror_url.as_deref(),
                attempt,
                max_attempts: self.policy.max_attempts,
                backoff: self.policy.backoff,
            };

            for source in cycle.sources() {
                debug!(url = %source, attempt = cycle.attempt, "Fetching");
                match self.try_once(source, &action).await {
                    Ok(()) => {
                        info!(url = %source, attempt = cycle.attempt, "Fetch succeeded");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(url = %source, attempt = cycle.attempt, error = %e, "Fetch failed");
                        last_error = e;
                    }
                }
            }

            if !cycle.is_last() {
                debug!(backoff_secs = cycle.backoff.as_secs(), "Waiting before next attempt");
                tokio::time::sleep(cycle.backoff).await;
            }
        }

        Err(FetchError::AllAttemptsFailed {
            url: url.to_string(),
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    async fn try_once(&self, url: &str, action: &FetchAction<'_>) -> Result<(), String> {
        let body = self.transport.get(url).await?;

        match action {
            FetchAction::File(destination) => {
                if let Some(parent) = destination.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| format!("creating {}: {e}", parent.display()))?;
                }
                tokio::fs::write(destination, body)
                    .await
                    .map_err(|e| format!("writing {}: {e}", destination.display()))
            }
            FetchAction::Execute(script) => {
                let output = self
                    .commands
                    .run(&script.command(body))
                    .await
                    .map_err(|e| e.to_string())?;
                if output.success() {
                    Ok(())
                } else {
                    Err(format!(
                        "script exited with status {}: {}",
                        output.status,
                        output.stderr.trim()
                    ))
                }
            }
        }
    }
}
