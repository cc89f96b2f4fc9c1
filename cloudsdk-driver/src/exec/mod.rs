//! Command execution against an installed SDK.
//!
//! Commands never inherit the driver's environment. Each dispatch gets a
//! fully composed environment, runs in its own process group with the
//! installation root as working directory, and is captured to completion.
//! A timeout kills the whole group and is reported as a synthetic exit
//! code rather than an error, so callers always get a [`CommandResult`]
//! for a command that launched.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::keys;
use crate::config::ImmutableConfig;
use crate::error::{DriverError, Result};
use crate::install::Installation;

// =============================================================================
// Types
// =============================================================================

/// Exit code reported when a command is killed on timeout, matching the
/// convention of `timeout(1)`.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Whether a timed-out command's whole process group can be killed here.
/// Where this is false only the direct child is killed, and descendants it
/// spawned may outlive the timeout.
pub const PROCESS_GROUP_KILL: bool = cfg!(unix);

const PATH_ENV: &str = "PATH";

/// Returns the PATH separator for the current platform.
#[inline]
fn path_separator() -> &'static str {
    #[cfg(windows)]
    {
        ";"
    }
    #[cfg(not(windows))]
    {
        ":"
    }
}

/// A single command dispatch.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// Program and arguments. The first element is the program.
    pub command: Vec<String>,
    /// Wall-clock limit. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Per-call environment entries, overriding everything else.
    pub env: BTreeMap<String, String>,
}

/// Captured output of one finished command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    /// True when the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// =============================================================================
// Environment Composition
// =============================================================================

/// Composes the environment SDK commands run with.
///
/// Later layers win: the ambient snapshot, then configured environment
/// variables, then variables derived from the config's credential scalars
/// and properties, then the isolated `CLOUDSDK_CONFIG` directory and the
/// composed `PATH`.
pub(crate) fn compose_environment(
    ambient: &BTreeMap<String, String>,
    config: &ImmutableConfig,
    sdk_dir: &Path,
    config_dir_name: &str,
) -> BTreeMap<String, String> {
    let mut env = ambient.clone();
    for (name, value) in config.environment_variables() {
        env.insert(name.clone(), value.clone());
    }

    if let Some(project) = config.project() {
        env.insert(keys::PROJECT_ENV.to_string(), project.to_string());
    }
    if let Some(email) = config.service_account_email() {
        env.insert(keys::ACCOUNT_ENV.to_string(), email.to_string());
    }
    if let Some(keyfile) = config.service_account_keyfile() {
        env.insert(keys::CREDENTIALS_ENV.to_string(), keyfile.to_string());
    }
    // Properties map onto CLOUDSDK_* variables and override the scalars
    // above when they name the same setting.
    for (property, value) in config.properties() {
        env.insert(keys::property_env_name(property), value.clone());
    }

    env.insert(
        keys::CONFIG_DIR_ENV.to_string(),
        sdk_dir.join(config_dir_name).display().to_string(),
    );

    let config_path = config.environment_variables().get(PATH_ENV);
    let ambient_path = ambient.get(PATH_ENV);
    env.insert(
        PATH_ENV.to_string(),
        compose_path(
            &sdk_dir.join("bin"),
            config_path.map(String::as_str),
            ambient_path.map(String::as_str),
        ),
    );

    env
}

/// Builds `PATH` as SDK binaries, then the configured `PATH`, then the
/// ambient one. The ambient `PATH` is dropped when the configured value
/// already contains it.
fn compose_path(bin_dir: &Path, config_path: Option<&str>, ambient_path: Option<&str>) -> String {
    let mut parts = vec![bin_dir.display().to_string()];
    if let Some(config_path) = config_path {
        parts.push(config_path.to_string());
    }
    if let Some(ambient_path) = ambient_path {
        let duplicated = config_path.is_some_and(|config| config.contains(ambient_path));
        if !duplicated {
            parts.push(ambient_path.to_string());
        }
    }
    parts.join(path_separator())
}

// =============================================================================
// Execution
// =============================================================================

/// Runs one command to completion against the installation.
///
/// `base_env` is the composed environment of the issuing handle, usually
/// from [`compose_environment`]. The process starts in the installation
/// root with exactly that environment plus the request's per-call entries.
/// Timeouts report through the result, not the error path; see
/// [`TIMEOUT_EXIT_CODE`] and [`PROCESS_GROUP_KILL`].
pub async fn execute(
    installation: &Installation,
    base_env: &BTreeMap<String, String>,
    request: ExecRequest,
) -> Result<CommandResult> {
    installation.ensure_active()?;

    let (program, args) = request
        .command
        .split_first()
        .ok_or_else(|| DriverError::Launch {
            program: String::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "command is empty"),
        })?;
    let program = program.clone();

    let mut env = base_env.clone();
    env.extend(request.env.clone());

    let mut command = Command::new(&program);
    command
        .args(args)
        .env_clear()
        .envs(&env)
        .current_dir(installation.root_dir())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    debug!(program = %program, args = ?args, "Executing SDK command");

    let child = command.spawn().map_err(|source| DriverError::Launch {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();

    let waited = match request.timeout {
        Some(limit) => match timeout(limit, child.wait_with_output()).await {
            Ok(waited) => waited,
            Err(_) => {
                // The dropped future already killed the direct child, the
                // group kill reaches anything it spawned.
                warn!(program = %program, ?limit, "Command timed out, killing process group");
                kill_process_group(pid);
                return Ok(CommandResult {
                    stdout: String::new(),
                    stderr: format!("Command timed out after {:?}", limit),
                    exit_code: TIMEOUT_EXIT_CODE,
                });
            }
        },
        None => child.wait_with_output().await,
    };

    let output = waited.map_err(|source| DriverError::Launch {
        program: program.clone(),
        source,
    })?;

    let result = CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    };
    debug!(program = %program, exit_code = result.exit_code, "Command finished");
    Ok(result)
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {
    warn!("Process group kill is unsupported on this platform, only the direct child was killed");
}
