//! Cloud SDK Driver Library
//!
//! This crate drives disposable Google Cloud SDK installations for tests.
//! It includes:
//!
//! - Installation lifecycle (download, unpack, run the bundled installer,
//!   destroy), one installation per process
//! - Layered configuration from defaults, files, and in-memory values,
//!   frozen into immutable per-handle snapshots
//! - Environment composition mapping configuration onto the `CLOUDSDK_*`
//!   variables with an isolated configuration directory per handle
//! - A command execution engine with full output capture and group-kill
//!   timeouts
//! - A `gcloud` front end that parses JSON output into structured results

pub mod config;
pub mod error;
pub mod exec;
pub mod install;
pub mod sdk;

// Re-export configuration
pub use config::{Config, ImmutableConfig};

// Re-export errors
pub use error::{DriverError, Result};

// Re-export execution
pub use exec::{CommandResult, ExecRequest, PROCESS_GROUP_KILL, TIMEOUT_EXIT_CODE};

// Re-export installation lifecycle
pub use install::{InitOptions, Installation, InstallationGuard, RELEASE_TAR};

// Re-export SDK handles
pub use sdk::{GcloudOptions, GcloudResult, RunOptions, Sdk};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
