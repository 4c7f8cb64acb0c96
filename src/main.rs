// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kea-Nest: first-boot provisioning for fresh Linux hosts

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use kea_nest::config::LoggingConfig;
use kea_nest::fetch::{FetchPolicy, Fetcher, HttpTransport};
use kea_nest::host::{CommandRunner, FixedPrompter, Prompter, SystemCommandRunner, TerminalPrompter};
use kea_nest::ledger::LedgerStatus;
use kea_nest::steps::default_steps;
use kea_nest::{Config, EnvironmentProbe, Ledger, Orchestrator, RunSummary};

/// Kea-Nest: The First Roost
///
/// Provisions a freshly installed Linux host: packages, SSH access, kernel
/// tuning, swap, log retention, monitoring and the operator's shell.
#[derive(Parser, Debug)]
#[command(name = "nest")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (defaults are used when it does not exist)
    #[arg(short, long, default_value = "nest.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Dry run mode (no changes to the host)
    #[arg(long)]
    dry_run: bool,

    /// Skip the welcome confirmation
    #[arg(short, long)]
    yes: bool,

    /// Decline every optional prompt
    #[arg(long)]
    non_interactive: bool,

    /// Do not re-run steps the previous run completed
    #[arg(long)]
    resume: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision this host (the default)
    Run,

    /// List the provisioning steps in execution order
    #[command(alias = "ls")]
    Steps,

    /// Probe the host and print what was found
    Probe,

    /// Show the progress ledger of the last run
    Status,

    /// Show configuration
    Config,

    /// Initialize a new nest configuration
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show version information
    Version,
}

const DEFAULT_CONFIG: &str = r#"# SPDX-License-Identifier: AGPL-3.0-or-later
# Kea-Nest Configuration

name = "nest"
version = "1.0"

[fetch]
# Prepended to github.com style URLs when the primary download fails
mirror_base = "https://ghfast.top/"
max_attempts = 3
backoff_secs = 3
timeout_secs = 60

[ledger]
progress_file = "/var/log/nest/progress.md"
state_file = "/var/log/nest/progress.json"

[logging]
level = "info"
format = "text"
file = "/var/log/nest/nest.log"

[provision]
timezone = "UTC"
packages = ["curl", "wget", "git", "vim", "htop", "unzip", "ca-certificates"]
# Step ids whose failure aborts the run (os-identity always does)
critical_steps = []
# Step ids recorded as skipped without running
skip_steps = []
command_timeout_secs = 1800

[ssh]
port = 22
# authorized_keys = "/root/.ssh/authorized_keys"

[shell]
installer_url = "https://raw.githubusercontent.com/ohmyzsh/ohmyzsh/master/tools/install.sh"
# zshrc_url = "https://raw.githubusercontent.com/you/dotfiles/main/.zshrc"

# [monitoring]
# install_url = "https://raw.githubusercontent.com/acme/agent/main/install.sh"
# args = ["--server", "monitor.example:443"]
# elevated = true
"#;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match &cli.command {
        None | Some(Commands::Run) => run(&cli).await,

        Some(Commands::Version) => {
            println!("Kea-Nest v{}", env!("CARGO_PKG_VERSION"));
            println!("First-boot provisioning for the Kea ecosystem");
            Ok(ExitCode::SUCCESS)
        }

        Some(Commands::Init { force }) => {
            let _guard = init_logging(&cli, &console_only());
            init_config(&cli.config, *force)?;
            Ok(ExitCode::SUCCESS)
        }

        Some(Commands::Config) => {
            let _guard = init_logging(&cli, &console_only());
            show_config(&cli.config)?;
            Ok(ExitCode::SUCCESS)
        }

        Some(Commands::Steps) => {
            let _guard = init_logging(&cli, &console_only());
            list_steps(&cli.config)?;
            Ok(ExitCode::SUCCESS)
        }

        Some(Commands::Probe) => {
            let _guard = init_logging(&cli, &console_only());
            probe_host(&cli.config).await
        }

        Some(Commands::Status) => {
            let _guard = init_logging(&cli, &console_only());
            show_status(&cli.config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Logging for commands that do not write the execution log
fn console_only() -> LoggingConfig {
    LoggingConfig {
        level: "warn".to_string(),
        file: None,
        ..LoggingConfig::default()
    }
}

/// Console logging plus, when configured, a plain-text execution log.
///
/// The returned guard flushes the log file when dropped.
fn init_logging(cli: &Cli, logging: &LoggingConfig) -> Option<WorkerGuard> {
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        logging.level.as_str()
    };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let mut file_error = None;
    let (file_writer, guard) = match logging.file.as_deref().map(open_log_file) {
        Some(Ok(file)) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            (Some(writer), Some(guard))
        }
        Some(Err(e)) => {
            file_error = Some(e);
            (None, None)
        }
        None => (None, None),
    };

    let compact = logging.format == "compact";
    let text_layer = (!compact).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(cli.debug)
    });
    let compact_layer = compact.then(|| {
        fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(cli.debug)
    });
    let file_layer = file_writer.map(|writer| fmt::layer().with_ansi(false).with_writer(writer));

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(compact_layer)
        .with(file_layer)
        .init();

    if let (Some(path), Some(e)) = (logging.file.as_deref(), file_error) {
        warn!(
            path = %path.display(),
            error = %e,
            "Cannot write execution log, logging to the console only"
        );
    }

    guard
}

/// Create (truncating) the execution log
fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    File::create(path)
}

fn load_config(config_path: &Path) -> anyhow::Result<Config> {
    Config::load_or_default(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))
}

/// Initialize a new configuration file
fn init_config(config_path: &Path, force: bool) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::write(config_path, DEFAULT_CONFIG)?;
    info!("Created configuration file: {}", config_path.display());
    println!("Created configuration file: {}", config_path.display());
    Ok(())
}

/// Show the effective configuration
fn show_config(config_path: &Path) -> anyhow::Result<()> {
    if !config_path.exists() {
        println!("No configuration file found. Using defaults:");
        println!();
        println!("{}", Config::default().to_toml()?);
        return Ok(());
    }

    let config = load_config(config_path)?;
    println!("{}", config.to_toml()?);
    Ok(())
}

/// List the pipeline with the effective criticality of each step
fn list_steps(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    println!("Provisioning steps, in execution order:");
    println!();
    for (index, step) in default_steps().iter().enumerate() {
        let mut notes = Vec::new();
        if step.critical() || config.is_escalated(step.id()) {
            notes.push("critical");
        }
        if config.is_skipped(step.id()) {
            notes.push("disabled");
        }

        let notes = if notes.is_empty() {
            String::new()
        } else {
            format!(" [{}]", notes.join(", "))
        };
        println!(
            "  {:>2}. {:<18} {}{}",
            index + 1,
            step.id(),
            step.display_name(),
            notes
        );
    }

    Ok(())
}

/// Print the probed environment
async fn probe_host(config_path: &Path) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    let commands = Arc::new(SystemCommandRunner::new(
        false,
        Duration::from_secs(config.provision.command_timeout_secs),
    ));

    let environment = EnvironmentProbe::new(commands)
        .probe()
        .await
        .context("Environment probe failed")?;

    println!("Distribution:     {} {}", environment.distro_id, environment.distro_version);
    if !environment.distro_like.is_empty() {
        println!("Derived from:     {}", environment.distro_like.join(" "));
    }
    println!("Architecture:     {}", environment.architecture);
    println!("Virtualization:   {}", environment.virtualization);
    println!("Root disk:        {} GB", environment.root_disk_gb());
    println!(
        "Elevation:        {}",
        if environment.has_privilege_elevation {
            "sudo"
        } else {
            "none"
        }
    );
    match environment.package_manager() {
        Some(manager) => println!("Package manager:  {:?}", manager),
        None => println!("Package manager:  unsupported"),
    }

    Ok(ExitCode::SUCCESS)
}

/// Print the ledger persisted by the last run
fn show_status(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let state_file = &config.ledger.state_file;

    if !state_file.exists() {
        println!("No provisioning run recorded at {}", state_file.display());
        return Ok(());
    }

    let ledger = Ledger::load(state_file)
        .with_context(|| format!("Failed to read ledger from {}", state_file.display()))?;

    print!("{}", ledger.render_markdown());
    println!();
    println!(
        "Done: {}, skipped: {}, failed: {}, pending: {}",
        ledger.count(LedgerStatus::Done),
        ledger.count(LedgerStatus::Skipped),
        ledger.count(LedgerStatus::Failed),
        ledger.count(LedgerStatus::Pending)
    );
    Ok(())
}

/// Provision the host
async fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli.config)?;
    let _guard = init_logging(cli, &config.logging);

    print_welcome(cli.dry_run);
    let terminal = TerminalPrompter::new();
    if !cli.yes && !terminal.confirm("Proceed with provisioning?", false).await {
        println!("No changes made.");
        return Ok(ExitCode::SUCCESS);
    }

    let previous = if cli.resume {
        match Ledger::load(&config.ledger.state_file) {
            Ok(ledger) => Some(ledger),
            Err(e) => {
                warn!(
                    path = %config.ledger.state_file.display(),
                    error = %e,
                    "No usable previous ledger, running every step"
                );
                None
            }
        }
    } else {
        None
    };

    let timeout = Duration::from_secs(config.provision.command_timeout_secs);
    let commands: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new(cli.dry_run, timeout));
    // The probe only reads, so it sees the real host even in dry-run mode
    let probe = EnvironmentProbe::new(Arc::new(SystemCommandRunner::new(false, timeout)));

    let transport = HttpTransport::new(Duration::from_secs(config.fetch.timeout_secs))
        .context("Failed to set up HTTP transport")?;
    let fetcher = Fetcher::new(
        Arc::new(transport),
        commands.clone(),
        FetchPolicy::from(&config.fetch),
    )
    .with_dry_run(cli.dry_run);

    let prompt: Box<dyn Prompter> = if cli.non_interactive {
        Box::new(FixedPrompter::new(false))
    } else {
        Box::new(terminal)
    };

    let progress_file = (!cli.dry_run).then(|| config.ledger.progress_file.clone());
    let mut orchestrator = Orchestrator::new(config, commands, fetcher, prompt).with_probe(probe);
    if let Some(previous) = &previous {
        orchestrator = orchestrator.resume_from(previous);
    }

    let summary = orchestrator.execute().await;
    print_summary(&summary, progress_file.as_deref());

    Ok(if summary.is_aborted() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_welcome(dry_run: bool) {
    println!("Kea-Nest v{}", env!("CARGO_PKG_VERSION"));
    if dry_run {
        println!("[DRY RUN] Commands are logged, not executed.");
    }
    println!();
    println!("This will provision the host with the following steps:");
    for (index, step) in default_steps().iter().enumerate() {
        println!("  {:>2}. {}", index + 1, step.display_name());
    }
    println!();
}

fn print_summary(summary: &RunSummary, progress_file: Option<&Path>) {
    println!();
    match &summary.abort_reason {
        Some(reason) => println!("Provisioning aborted: {}", reason),
        None if summary.failed > 0 => println!("Provisioning completed with failures"),
        None => println!("Provisioning completed successfully"),
    }

    if let Some(environment) = &summary.environment {
        println!();
        println!("Host: {}", environment);
    }

    if !summary.steps.is_empty() {
        println!();
        for report in &summary.steps {
            println!(
                "  {} {}: {}",
                LedgerStatus::from(&report.outcome).glyph(),
                report.display_name,
                report.outcome.message()
            );
        }
    }

    println!();
    println!("Results:");
    println!("  Duration: {} ms", summary.duration_ms);
    println!("  Steps succeeded: {}", summary.succeeded);
    println!("  Steps skipped: {}", summary.skipped);
    println!("  Steps failed: {}", summary.failed);
    match progress_file {
        Some(path) => println!("  Progress: {}", path.display()),
        None => println!("  Progress: not recorded (dry run)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["nest"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("nest.toml"));
    }

    #[test]
    fn test_cli_run_flags() {
        let cli = Cli::try_parse_from([
            "nest",
            "--dry-run",
            "-y",
            "--non-interactive",
            "--resume",
            "run",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert!(cli.yes);
        assert!(cli.non_interactive);
        assert!(cli.resume);
        assert!(matches!(cli.command, Some(Commands::Run)));
    }

    #[test]
    fn test_cli_init_force() {
        let cli = Cli::try_parse_from(["nest", "init", "--force"]).unwrap();
        match cli.command {
            Some(Commands::Init { force }) => assert!(force),
            _ => panic!("Expected Init command"),
        }
    }

    #[test]
    fn test_cli_verbose_flag() {
        let cli = Cli::try_parse_from(["nest", "-v", "steps"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Some(Commands::Steps)));
    }

    #[test]
    fn test_default_config_template_is_valid() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.name, "nest");
        assert!(config.monitoring.is_none());
        assert_eq!(config.fetch.max_attempts, 3);
    }
}
