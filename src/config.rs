// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration management for Kea-Nest

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{NestError, Result};

/// Main configuration structure for Nest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Nest instance name
    pub name: String,

    /// Version of the configuration format
    #[serde(default = "default_version")]
    pub version: String,

    /// Network retrieval policy
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Progress ledger locations
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Provisioning pipeline settings
    #[serde(default)]
    pub provision: ProvisionConfig,

    /// SSH settings
    #[serde(default)]
    pub ssh: SshConfig,

    /// Monitoring agent installer (optional)
    #[serde(default)]
    pub monitoring: Option<MonitoringConfig>,

    /// Interactive shell framework
    #[serde(default)]
    pub shell: ShellConfig,
}

/// Retry, mirror and trust policy for network fetches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Prefix prepended to code-hosting URLs to form the mirror URL
    #[serde(default = "default_mirror_base")]
    pub mirror_base: String,

    /// Hosts (and their subdomains) that get a mirror URL
    #[serde(default = "default_code_hosts")]
    pub code_hosts: Vec<String>,

    /// Hosts remote scripts may be executed from
    #[serde(default = "default_code_hosts")]
    pub trusted_hosts: Vec<String>,

    /// Attempt cycles per fetch
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Constant sleep between attempt cycles
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,

    /// Per-request timeout
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
}

/// Where the progress ledger is persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Markdown checklist
    #[serde(default = "default_progress_file")]
    pub progress_file: PathBuf,

    /// Machine-readable state used by `status` and `--resume`
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Console output format (text, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Execution log file, truncated at the start of every run
    #[serde(default = "default_log_file")]
    pub file: Option<PathBuf>,
}

/// Provisioning pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Timezone applied by the `timezone` step
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Packages installed by the `base-tools` step
    #[serde(default = "default_packages")]
    pub packages: Vec<String>,

    /// Step ids whose failure aborts the run, on top of the built-in ones
    #[serde(default)]
    pub critical_steps: Vec<String>,

    /// Step ids that are recorded as skipped without running
    #[serde(default)]
    pub skip_steps: Vec<String>,

    /// Timeout for a single external command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Home directory of the operator account; defaults to `$HOME`
    #[serde(default)]
    pub home_dir: Option<PathBuf>,
}

/// SSH settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Port sshd listens on after hardening
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// authorized_keys file; defaults to `~/.ssh/authorized_keys`
    #[serde(default)]
    pub authorized_keys: Option<PathBuf>,
}

/// Monitoring agent installer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Installer script URL (must be on `fetch.trusted_hosts`)
    pub install_url: String,

    /// Arguments passed verbatim to the installer
    #[serde(default)]
    pub args: Vec<String>,

    /// Run the installer with privilege elevation
    #[serde(default = "default_true")]
    pub elevated: bool,
}

/// Interactive shell framework
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// oh-my-zsh installer script
    #[serde(default = "default_shell_installer")]
    pub installer_url: String,

    /// Optional `.zshrc` downloaded after installation
    #[serde(default)]
    pub zshrc_url: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            mirror_base: default_mirror_base(),
            code_hosts: default_code_hosts(),
            trusted_hosts: default_code_hosts(),
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            timeout_secs: default_fetch_timeout(),
        }
    }
}

impl FetchConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            progress_file: default_progress_file(),
            state_file: default_state_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: default_log_file(),
        }
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            packages: default_packages(),
            critical_steps: Vec::new(),
            skip_steps: Vec::new(),
            command_timeout_secs: default_command_timeout(),
            home_dir: None,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            authorized_keys: None,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            installer_url: default_shell_installer(),
            zshrc_url: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "nest".to_string(),
            version: default_version(),
            fetch: FetchConfig::default(),
            ledger: LedgerConfig::default(),
            logging: LoggingConfig::default(),
            provision: ProvisionConfig::default(),
            ssh: SshConfig::default(),
            monitoring: None,
            shell: ShellConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The parsed configuration or an error
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(NestError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Render as TOML, the format `from_file` reads
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(NestError::InvalidConfig {
                message: "Nest name cannot be empty".to_string(),
            });
        }

        if self.fetch.max_attempts == 0 {
            return Err(NestError::InvalidConfig {
                message: "fetch.max_attempts must be at least 1".to_string(),
            });
        }

        if !self.fetch.mirror_base.is_empty() && !self.fetch.mirror_base.starts_with("https://") {
            return Err(NestError::InvalidConfig {
                message: format!(
                    "fetch.mirror_base must be an https URL, got '{}'",
                    self.fetch.mirror_base
                ),
            });
        }

        if !matches!(self.logging.format.as_str(), "text" | "compact") {
            return Err(NestError::InvalidConfig {
                message: format!(
                    "logging.format must be 'text' or 'compact', got '{}'",
                    self.logging.format
                ),
            });
        }

        if self.provision.timezone.trim().is_empty() {
            return Err(NestError::InvalidConfig {
                message: "provision.timezone cannot be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Whether configuration escalates `step_id` to critical
    pub fn is_escalated(&self, step_id: &str) -> bool {
        self.provision.critical_steps.iter().any(|id| id == step_id)
    }

    /// Whether configuration disables `step_id`
    pub fn is_skipped(&self, step_id: &str) -> bool {
        self.provision.skip_steps.iter().any(|id| id == step_id)
    }

    /// Home directory of the operator account
    pub fn home_dir(&self) -> Option<PathBuf> {
        self.provision.home_dir.clone().or_else(dirs::home_dir)
    }

    /// authorized_keys file the SSH steps manage
    pub fn authorized_keys_path(&self) -> Option<PathBuf> {
        self.ssh
            .authorized_keys
            .clone()
            .or_else(|| self.home_dir().map(|home| home.join(".ssh/authorized_keys")))
    }

    /// Keep all run artefacts under `dir` (used by tests and unprivileged runs)
    pub fn with_state_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        let dir = dir.as_ref();
        self.ledger.progress_file = dir.join("progress.md");
        self.ledger.state_file = dir.join("progress.json");
        self.logging.file = Some(dir.join("nest.log"));
        self
    }
}

// Default value functions

fn default_version() -> String {
    "1.0".to_string()
}

fn default_mirror_base() -> String {
    "https://ghfast.top/".to_string()
}

fn default_code_hosts() -> Vec<String> {
    [
        "github.com",
        "raw.githubusercontent.com",
        "gist.githubusercontent.com",
        "objects.githubusercontent.com",
        "codeload.github.com",
    ]
    .iter()
    .map(|host| host.to_string())
    .collect()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_secs() -> u64 {
    3
}

fn default_fetch_timeout() -> u64 {
    60
}

fn default_progress_file() -> PathBuf {
    PathBuf::from("/var/log/nest/progress.md")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/log/nest/progress.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("/var/log/nest/nest.log"))
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_packages() -> Vec<String> {
    [
        "curl",
        "wget",
        "git",
        "vim",
        "htop",
        "unzip",
        "ca-certificates",
    ]
    .iter()
    .map(|package| package.to_string())
    .collect()
}

fn default_command_timeout() -> u64 {
    1800 // 30 minutes, package upgrades can be slow
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

fn default_shell_installer() -> String {
    "https://raw.githubusercontent.com/ohmyzsh/ohmyzsh/master/tools/install.sh".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.name, "nest");
        assert_eq!(config.version, "1.0");
        assert_eq!(config.fetch.max_attempts, 3);
        assert_eq!(config.fetch.backoff(), Duration::from_secs(3));
        assert!(config.monitoring.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_empty_name() {
        let mut config = Config::default();
        config.name = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_attempts() {
        let mut config = Config::default();
        config.fetch.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_plain_http_mirror() {
        let mut config = Config::default();
        config.fetch.mirror_base = "http://mirror.example/".to_string();
        assert!(config.validate().is_err());

        // An empty mirror base disables mirroring and is allowed
        config.fetch.mirror_base = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_escalation_and_skip_lists() {
        let mut config = Config::default();
        config.provision.critical_steps = vec!["package-update".to_string()];
        config.provision.skip_steps = vec!["zram-swap".to_string()];

        assert!(config.is_escalated("package-update"));
        assert!(!config.is_escalated("package"));
        assert!(config.is_skipped("zram-swap"));
        assert!(!config.is_skipped("zram"));
    }

    #[test]
    fn test_parse_toml_config() {
        let toml_content = r#"
            name = "edge-node"

            [fetch]
            mirror_base = "https://mirror.example/"
            max_attempts = 5

            [provision]
            timezone = "Europe/Berlin"
            packages = ["curl", "jq"]
            critical_steps = ["package-update"]

            [ssh]
            port = 2222

            [monitoring]
            install_url = "https://raw.githubusercontent.com/acme/agent/main/install.sh"
            args = ["--server", "monitor.example:443"]

            [logging]
            level = "debug"
        "#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.name, "edge-node");
        assert_eq!(config.fetch.max_attempts, 5);
        assert_eq!(config.fetch.backoff_secs, 3);
        assert_eq!(config.provision.timezone, "Europe/Berlin");
        assert_eq!(config.provision.packages, vec!["curl", "jq"]);
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.logging.level, "debug");

        let monitoring = config.monitoring.unwrap();
        assert!(monitoring.elevated);
        assert_eq!(monitoring.args.len(), 2);
    }

    #[test]
    fn test_authorized_keys_follow_home_dir() {
        let mut config = Config::default();
        config.provision.home_dir = Some(PathBuf::from("/home/kea"));
        assert_eq!(
            config.authorized_keys_path(),
            Some(PathBuf::from("/home/kea/.ssh/authorized_keys"))
        );

        config.ssh.authorized_keys = Some(PathBuf::from("/etc/ssh/keys/kea"));
        assert_eq!(
            config.authorized_keys_path(),
            Some(PathBuf::from("/etc/ssh/keys/kea"))
        );
    }

    #[test]
    fn test_to_toml_reads_back() {
        let mut config = Config::default();
        config.provision.critical_steps = vec!["package-update".to_string()];

        let rendered = config.to_toml().unwrap();
        let reloaded: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(reloaded.provision.critical_steps, vec!["package-update"]);
        assert_eq!(reloaded.fetch.mirror_base, config.fetch.mirror_base);
    }

    #[test]
    fn test_with_state_dir() {
        let config = Config::default().with_state_dir("/tmp/nest-test");
        assert_eq!(
            config.ledger.progress_file,
            PathBuf::from("/tmp/nest-test/progress.md")
        );
        assert_eq!(
            config.logging.file,
            Some(PathBuf::from("/tmp/nest-test/nest.log"))
        );
    }
}
