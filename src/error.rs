// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for Kea-Nest

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for Kea-Nest operations
pub type Result<T> = std::result::Result<T, NestError>;

/// Errors raised while probing the host. All of them are fatal for a run.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The release metadata file does not exist
    #[error("OS release file not found: {path}")]
    MissingOsRelease { path: PathBuf },

    /// The release metadata file exists but carries no `ID`
    #[error("OS release file {path} does not declare an ID")]
    MissingOsId { path: PathBuf },

    /// The release metadata file could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the fetcher
#[derive(Error, Debug)]
pub enum FetchError {
    /// Every primary and mirror try failed
    #[error("Fetching {url} failed after {attempts} attempts: {last_error}")]
    AllAttemptsFailed {
        url: String,
        attempts: u32,
        last_error: String,
    },

    /// A remote script was requested from a host outside the allow-list
    #[error("Refusing to execute script from untrusted source: {url}")]
    UntrustedSource { url: String },

    /// The URL could not be parsed
    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },
}

/// Errors that can occur during Nest operations
#[derive(Error, Debug)]
pub enum NestError {
    /// Environment probe failed
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// Network retrieval failed
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// External command exited unsuccessfully
    #[error("Command '{command}' failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// External command did not finish in time
    #[error("Command '{command}' timed out after {timeout_secs} seconds")]
    CommandTimedOut { command: String, timeout_secs: u64 },

    /// A step flagged critical failed; the run is aborted
    #[error("Critical step '{step}' failed: {message}")]
    CriticalStepFailed { step: String, message: String },

    /// Distribution has no package-manager mapping
    #[error("Unsupported distribution: {distro}")]
    UnsupportedDistro { distro: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Invalid configuration format
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// TOML rendering error
    #[error("TOML serialize error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
