//! The closed set of config keys and the environment variable names the
//! driver derives from them.

use std::collections::BTreeMap;

use crate::error::{DriverError, Result};

// =============================================================================
// Config Keys
// =============================================================================

/// Key for the environment variable map.
pub const KEY_ENVIRONMENT_VARIABLES: &str = "environment_variables";

/// Key for the service account email scalar.
pub const KEY_SERVICE_ACCOUNT_EMAIL: &str = "service_account_email";

/// Key for the service account keyfile scalar.
pub const KEY_SERVICE_ACCOUNT_KEYFILE: &str = "service_account_keyfile";

/// Key for the project scalar.
pub const KEY_PROJECT: &str = "project";

/// Key for the gcloud properties map.
pub const KEY_PROPERTIES: &str = "properties";

/// Every key a config source may contain. Anything else is rejected.
pub const CONFIG_KEYS: &[&str] = &[
    KEY_ENVIRONMENT_VARIABLES,
    KEY_SERVICE_ACCOUNT_EMAIL,
    KEY_SERVICE_ACCOUNT_KEYFILE,
    KEY_PROJECT,
    KEY_PROPERTIES,
];

// =============================================================================
// Environment Variable Names
// =============================================================================

/// Suppresses gcloud's interactive prompts. Set in every default config.
pub const DISABLE_PROMPTS_ENV: &str = "CLOUDSDK_CORE_DISABLE_PROMPTS";

/// Points gcloud at a named configuration directory. Managed by the driver
/// so that every handle gets its own isolated directory.
pub const CONFIG_DIR_ENV: &str = "CLOUDSDK_CONFIG";

/// Derived from the `project` config key.
pub const PROJECT_ENV: &str = "CLOUDSDK_CORE_PROJECT";

/// Derived from the `service_account_email` config key.
pub const ACCOUNT_ENV: &str = "CLOUDSDK_CORE_ACCOUNT";

/// Derived from the `service_account_keyfile` config key.
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Component snapshot override consulted by the SDK installer.
pub const SNAPSHOT_ENV: &str = "CLOUDSDK_COMPONENT_MANAGER_SNAPSHOT_URL";

/// Variables the driver manages internally. Configs may not set these.
pub const LOCKED_ENVIRONMENT_VARIABLES: &[&str] = &[CONFIG_DIR_ENV];

// =============================================================================
// Defaults and Validation
// =============================================================================

/// The environment variable map of a fresh config.
pub fn default_environment() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(DISABLE_PROMPTS_ENV.to_string(), "1".to_string());
    env
}

/// Rejects keys outside [`CONFIG_KEYS`].
pub fn validate_key(key: &str) -> Result<()> {
    if CONFIG_KEYS.contains(&key) {
        Ok(())
    } else {
        Err(DriverError::UnknownConfigKey {
            key: key.to_string(),
        })
    }
}

/// Rejects the environment variable names the driver reserves for itself.
pub fn validate_environment_name(name: &str) -> Result<()> {
    if LOCKED_ENVIRONMENT_VARIABLES.contains(&name) {
        Err(DriverError::LockedEnvironmentVariable {
            name: name.to_string(),
        })
    } else {
        Ok(())
    }
}

/// Maps a gcloud property path to the environment variable gcloud reads for
/// it.
///
/// A `section/name` path becomes `CLOUDSDK_SECTION_NAME`; a bare `name` is
/// assumed to live in the core section.
pub fn property_env_name(property: &str) -> String {
    let (section, name) = match property.split_once('/') {
        Some((section, name)) => (section, name),
        None => ("core", property),
    };
    format!(
        "CLOUDSDK_{}_{}",
        normalize_segment(section),
        normalize_segment(name)
    )
}

fn normalize_segment(segment: &str) -> String {
    segment.to_ascii_uppercase().replace('-', "_")
}
