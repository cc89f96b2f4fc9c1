//! Error types shared across the driver.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used by every fallible driver operation.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors produced while configuring, installing, or running the SDK.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Unknown config key: {key}")]
    UnknownConfigKey { key: String },

    #[error("Environment variable {name} is managed by the driver and cannot be set")]
    LockedEnvironmentVariable { name: String },

    #[error("Invalid config file {}: {reason}", path.display())]
    ConfigFile { path: PathBuf, reason: String },

    #[error("Invalid value for config key {key}: {reason}")]
    ConfigValue { key: String, reason: String },

    #[error("Config source must be a mapping, got {found}")]
    ConfigSource { found: &'static str },

    #[error("An installation is already active in this process")]
    AlreadyInitialized,

    #[error("No active installation")]
    NotInitialized,

    #[error("Download failed for {url}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Download of {url} returned HTTP status {status}")]
    DownloadStatus { url: String, status: u16 },

    #[error("Checksum mismatch for downloaded tar: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Tar file not found: {}", path.display())]
    MissingTar { path: PathBuf },

    #[error("Failed to unpack {}", path.display())]
    Unpack {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Installer exited with code {exit_code}: {stderr}")]
    Installer { exit_code: i32, stderr: String },

    #[error("Failed to launch {program}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Command output is not valid JSON")]
    OutputParse {
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
