//! SDK handles binding immutable configuration to the installation.
//!
//! A handle freezes its configuration at construction, composes the full
//! child environment once, and from then on only dispatches commands.
//! Handles are cheap to clone and safe to share; all of them run against
//! the one live installation. Each handle owns a distinct gcloud
//! configuration directory, so differently credentialed handles never
//! leak state into each other.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::config::{Config, ImmutableConfig};
use crate::error::{DriverError, Result};
use crate::exec::{self, CommandResult, ExecRequest};
use crate::install::Installation;

// =============================================================================
// Options
// =============================================================================

/// Per-call options for [`Sdk::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Wall-clock limit for the command.
    pub timeout: Option<Duration>,
    /// Extra environment entries, overriding the handle's composed ones.
    pub env: BTreeMap<String, String>,
}

/// Per-call options for [`Sdk::run_gcloud`].
#[derive(Debug, Clone, Default)]
pub struct GcloudOptions {
    /// Projection keys for the JSON output, `--format=json(k1,k2)`.
    /// Empty means the full `--format=json`.
    pub format_keys: Vec<String>,
    /// Resource filter, passed as `--filter=...`.
    pub filter: Option<String>,
    /// Wall-clock limit for the command.
    pub timeout: Option<Duration>,
    /// Extra environment entries, overriding the handle's composed ones.
    pub env: BTreeMap<String, String>,
}

/// Outcome of one `gcloud` invocation.
#[derive(Debug, Clone, Serialize)]
pub struct GcloudResult {
    /// Parsed JSON output. Present only when the command succeeded and
    /// printed something.
    pub output: Option<Value>,
    pub stderr: String,
    pub exit_code: i32,
}

impl GcloudResult {
    /// True when gcloud exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// =============================================================================
// SDK Handle
// =============================================================================

/// A configured view of the installed SDK.
#[derive(Debug, Clone)]
pub struct Sdk {
    config: ImmutableConfig,
    installation: Arc<Installation>,
    env: BTreeMap<String, String>,
    config_dir_name: String,
}

impl Sdk {
    /// Binds `config` to the installation, freezing it.
    ///
    /// The child environment is composed here, once: the driver's current
    /// environment, overlaid with the configured variables, the variables
    /// derived from credentials and properties, and the handle's isolated
    /// `CLOUDSDK_CONFIG` directory. Later changes to the driver's
    /// environment do not reach this handle.
    pub fn new(installation: &Arc<Installation>, config: Config) -> Result<Self> {
        installation.ensure_active()?;

        let config = config.freeze();
        let config_dir_name = unique_config_dir_name();
        let ambient: BTreeMap<String, String> = std::env::vars().collect();
        let env = exec::compose_environment(
            &ambient,
            &config,
            installation.sdk_dir(),
            &config_dir_name,
        );

        debug!(config_dir = %config_dir_name, "Created SDK handle");
        Ok(Self {
            config,
            installation: Arc::clone(installation),
            env,
            config_dir_name,
        })
    }

    /// Handle carrying only the default prompt-suppressing environment.
    pub fn with_defaults(installation: &Arc<Installation>) -> Result<Self> {
        Self::new(installation, Config::new())
    }

    /// Handle configured from a YAML or JSON file.
    pub fn from_file(installation: &Arc<Installation>, path: &Path) -> Result<Self> {
        Self::new(installation, Config::from_file(path)?)
    }

    /// Handle configured from an in-memory mapping.
    pub fn from_value(installation: &Arc<Installation>, value: &Value) -> Result<Self> {
        Self::new(installation, Config::from_value(value)?)
    }

    /// The frozen configuration this handle runs with.
    pub fn config(&self) -> &ImmutableConfig {
        &self.config
    }

    /// The installation this handle runs against.
    pub fn installation(&self) -> &Arc<Installation> {
        &self.installation
    }

    /// Name of this handle's gcloud configuration directory under the SDK
    /// directory.
    pub fn config_dir_name(&self) -> &str {
        &self.config_dir_name
    }

    /// Runs an arbitrary command in the handle's environment.
    pub async fn run<I, S>(&self, command: I, options: RunOptions) -> Result<CommandResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = ExecRequest {
            command: command.into_iter().map(Into::into).collect(),
            timeout: options.timeout,
            env: options.env,
        };
        exec::execute(&self.installation, &self.env, request).await
    }

    /// Runs the installed `gcloud` with JSON output and parses it.
    ///
    /// The format and filter flags are appended after the caller's
    /// arguments. Output is parsed only for a successful invocation that
    /// printed something; failures report through `stderr` and the exit
    /// code, with no output value.
    pub async fn run_gcloud<I, S>(&self, args: I, options: GcloudOptions) -> Result<GcloudResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command = vec![self.installation.gcloud_path().display().to_string()];
        command.extend(args.into_iter().map(Into::into));
        command.push(format_flag(&options.format_keys));
        if let Some(filter) = &options.filter {
            command.push(format!("--filter={}", filter));
        }

        let result = self
            .run(
                command,
                RunOptions {
                    timeout: options.timeout,
                    env: options.env,
                },
            )
            .await?;

        let output = if result.success() && !result.stdout.is_empty() {
            let value = serde_json::from_str(&result.stdout)
                .map_err(|source| DriverError::OutputParse { source })?;
            Some(value)
        } else {
            None
        };

        Ok(GcloudResult {
            output,
            stderr: result.stderr,
            exit_code: result.exit_code,
        })
    }
}

/// Names a handle's gcloud configuration directory. The random suffix
/// keeps concurrently created handles apart.
fn unique_config_dir_name() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("config{}", &suffix[..8])
}

fn format_flag(format_keys: &[String]) -> String {
    if format_keys.is_empty() {
        "--format=json".to_string()
    } else {
        format!("--format=json({})", format_keys.join(","))
    }
}
