//! Layered SDK configuration and its frozen form.
//!
//! A [`Config`] starts from the driver defaults and accumulates overlays:
//! YAML files, JSON-style mappings, and builder calls, later sources winning
//! key by key. Freezing yields an [`ImmutableConfig`] snapshot; SDK handles
//! bind to a snapshot so concurrent tests can customize configuration
//! without affecting each other.
//!
//! # Example
//!
//! ```ignore
//! use cloudsdk_driver::Config;
//!
//! let config = Config::from_file("testdata/ci.yaml")?
//!     .with_project("my-test-project")
//!     .with_env_var("CLOUDSDK_CORE_DISABLE_USAGE_REPORTING", "1")?;
//! let frozen = config.freeze();
//! ```

pub mod keys;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{DriverError, Result};

// =============================================================================
// Config
// =============================================================================

/// Mutable configuration under construction.
///
/// The key set is closed: sources may only mention the keys listed in
/// [`keys::CONFIG_KEYS`]. Mapping keys merge entry by entry, scalar keys
/// replace outright, and a YAML `null` clears an optional scalar.
#[derive(Debug, Clone)]
pub struct Config {
    environment_variables: BTreeMap<String, String>,
    service_account_email: Option<String>,
    service_account_keyfile: Option<String>,
    project: Option<String>,
    properties: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Creates a config holding only the driver defaults.
    pub fn new() -> Self {
        Self {
            environment_variables: keys::default_environment(),
            service_account_email: None,
            service_account_keyfile: None,
            project: None,
            properties: BTreeMap::new(),
        }
    }

    /// Creates a config from the defaults plus a YAML file overlay.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::new();
        config.apply_file(path)?;
        Ok(config)
    }

    /// Creates a config from the defaults plus a JSON-style mapping overlay.
    pub fn from_value(value: &Value) -> Result<Self> {
        let mut config = Self::new();
        config.apply_value(value)?;
        Ok(config)
    }

    /// Overlays a YAML file onto this config.
    ///
    /// The overlay is atomic: on any error this config is left unchanged.
    pub fn apply_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| DriverError::ConfigFile {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let value: Value =
            serde_yaml_ng::from_str(&text).map_err(|err| DriverError::ConfigFile {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        let map = value.as_object().ok_or_else(|| DriverError::ConfigFile {
            path: path.to_path_buf(),
            reason: format!("top level must be a mapping, got {}", value_kind(&value)),
        })?;
        self.overlay(map)?;
        debug!("Applied config overlay from {}", path.display());
        Ok(())
    }

    /// Overlays a JSON-style mapping onto this config.
    ///
    /// The overlay is atomic: on any error this config is left unchanged.
    pub fn apply_value(&mut self, value: &Value) -> Result<()> {
        let map = value.as_object().ok_or_else(|| DriverError::ConfigSource {
            found: value_kind(value),
        })?;
        self.overlay(map)
    }

    /// Sets the project, replacing any previous value.
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Sets the service account email, replacing any previous value.
    pub fn with_service_account_email(mut self, email: impl Into<String>) -> Self {
        self.service_account_email = Some(email.into());
        self
    }

    /// Sets the service account keyfile path, replacing any previous value.
    pub fn with_service_account_keyfile(mut self, keyfile: impl Into<String>) -> Self {
        self.service_account_keyfile = Some(keyfile.into());
        self
    }

    /// Adds one environment variable. Fails for driver-managed names.
    pub fn with_env_var(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self> {
        self.set_env_var(name, value)?;
        Ok(self)
    }

    /// Adds one gcloud property (`section/name` or bare `name`).
    pub fn with_property(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_property(property, value);
        self
    }

    /// Sets or clears the project.
    pub fn set_project(&mut self, project: Option<String>) {
        self.project = project;
    }

    /// Sets or clears the service account email.
    pub fn set_service_account_email(&mut self, email: Option<String>) {
        self.service_account_email = email;
    }

    /// Sets or clears the service account keyfile path.
    pub fn set_service_account_keyfile(&mut self, keyfile: Option<String>) {
        self.service_account_keyfile = keyfile;
    }

    /// Adds one environment variable. Fails for driver-managed names.
    pub fn set_env_var(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let name = name.into();
        keys::validate_environment_name(&name)?;
        self.environment_variables.insert(name, value.into());
        Ok(())
    }

    /// Adds one gcloud property (`section/name` or bare `name`).
    pub fn set_property(&mut self, property: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(property.into(), value.into());
    }

    pub fn environment_variables(&self) -> &BTreeMap<String, String> {
        &self.environment_variables
    }

    pub fn service_account_email(&self) -> Option<&str> {
        self.service_account_email.as_deref()
    }

    pub fn service_account_keyfile(&self) -> Option<&str> {
        self.service_account_keyfile.as_deref()
    }

    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Takes a deep-copied snapshot of the current state.
    ///
    /// Later mutation of this config never affects the snapshot.
    pub fn freeze(&self) -> ImmutableConfig {
        ImmutableConfig {
            environment_variables: self.environment_variables.clone(),
            service_account_email: self.service_account_email.clone(),
            service_account_keyfile: self.service_account_keyfile.clone(),
            project: self.project.clone(),
            properties: self.properties.clone(),
        }
    }

    /// Applies a validated mapping. Mutates `self` only when every entry is
    /// acceptable.
    fn overlay(&mut self, map: &serde_json::Map<String, Value>) -> Result<()> {
        let mut next = self.clone();
        for (key, value) in map {
            match key.as_str() {
                keys::KEY_ENVIRONMENT_VARIABLES => next.merge_environment(value)?,
                keys::KEY_PROPERTIES => next.merge_properties(value)?,
                keys::KEY_PROJECT => {
                    next.project = optional_string(keys::KEY_PROJECT, value)?;
                }
                keys::KEY_SERVICE_ACCOUNT_EMAIL => {
                    next.service_account_email =
                        optional_string(keys::KEY_SERVICE_ACCOUNT_EMAIL, value)?;
                }
                keys::KEY_SERVICE_ACCOUNT_KEYFILE => {
                    next.service_account_keyfile =
                        optional_string(keys::KEY_SERVICE_ACCOUNT_KEYFILE, value)?;
                }
                other => {
                    return Err(DriverError::UnknownConfigKey {
                        key: other.to_string(),
                    })
                }
            }
        }
        *self = next;
        Ok(())
    }

    fn merge_environment(&mut self, value: &Value) -> Result<()> {
        for (name, value) in mapping_entries(keys::KEY_ENVIRONMENT_VARIABLES, value)? {
            keys::validate_environment_name(&name)?;
            self.environment_variables.insert(name, value);
        }
        Ok(())
    }

    fn merge_properties(&mut self, value: &Value) -> Result<()> {
        for (property, value) in mapping_entries(keys::KEY_PROPERTIES, value)? {
            self.properties.insert(property, value);
        }
        Ok(())
    }
}

// =============================================================================
// ImmutableConfig
// =============================================================================

/// Frozen snapshot of a [`Config`].
///
/// Structurally immutable: read accessors only. Snapshots frozen from equal
/// inputs compare equal and hash equal, so tests can use them as map keys or
/// dedup identical handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ImmutableConfig {
    environment_variables: BTreeMap<String, String>,
    service_account_email: Option<String>,
    service_account_keyfile: Option<String>,
    project: Option<String>,
    properties: BTreeMap<String, String>,
}

impl ImmutableConfig {
    pub fn environment_variables(&self) -> &BTreeMap<String, String> {
        &self.environment_variables
    }

    pub fn service_account_email(&self) -> Option<&str> {
        self.service_account_email.as_deref()
    }

    pub fn service_account_keyfile(&self) -> Option<&str> {
        self.service_account_keyfile.as_deref()
    }

    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

// =============================================================================
// Value Coercion
// =============================================================================

fn mapping_entries(key: &str, value: &Value) -> Result<Vec<(String, String)>> {
    let map = value.as_object().ok_or_else(|| DriverError::ConfigValue {
        key: key.to_string(),
        reason: format!("expected a mapping, got {}", value_kind(value)),
    })?;
    map.iter()
        .map(|(name, entry)| {
            let coerced = scalar_string(&format!("{key}.{name}"), entry)?;
            Ok((name.clone(), coerced))
        })
        .collect()
}

/// Coerces a scalar to its string form. YAML sources routinely hand over
/// numbers and booleans where gcloud expects strings.
fn scalar_string(key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(DriverError::ConfigValue {
            key: key.to_string(),
            reason: format!("expected a string, got {}", value_kind(other)),
        }),
    }
}

fn optional_string(key: &str, value: &Value) -> Result<Option<String>> {
    if value.is_null() {
        Ok(None)
    } else {
        scalar_string(key, value).map(Some)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn hash_of(config: &ImmutableConfig) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        config.hash(&mut hasher);
        hasher.finish()
    }

    fn write_config(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    // -------------------------------------------------------------------------
    // Defaults and overlays
    // -------------------------------------------------------------------------

    #[test]
    fn test_new_carries_defaults() {
        let config = Config::new();
        assert_eq!(
            config
                .environment_variables()
                .get(keys::DISABLE_PROMPTS_ENV)
                .map(String::as_str),
            Some("1")
        );
        assert_eq!(config.project(), None);
        assert_eq!(config.service_account_email(), None);
        assert_eq!(config.service_account_keyfile(), None);
        assert!(config.properties().is_empty());
    }

    #[test]
    fn test_from_value_merges_over_defaults() {
        let config = Config::from_value(&json!({
            "project": "p1",
            "environment_variables": {"FOO": "bar"},
        }))
        .unwrap();

        assert_eq!(config.project(), Some("p1"));
        assert_eq!(
            config.environment_variables().get("FOO").map(String::as_str),
            Some("bar")
        );
        // The default entry survives a merge that does not mention it.
        assert_eq!(
            config
                .environment_variables()
                .get(keys::DISABLE_PROMPTS_ENV)
                .map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn test_overlay_can_replace_default_entry() {
        let config = Config::from_value(&json!({
            "environment_variables": {"CLOUDSDK_CORE_DISABLE_PROMPTS": "0"},
        }))
        .unwrap();
        assert_eq!(
            config
                .environment_variables()
                .get(keys::DISABLE_PROMPTS_ENV)
                .map(String::as_str),
            Some("0")
        );
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = Config::from_value(&json!({"projject": "p1"})).unwrap_err();
        assert!(matches!(err, DriverError::UnknownConfigKey { key } if key == "projject"));
    }

    #[test]
    fn test_failed_overlay_leaves_config_unchanged() {
        let mut config = Config::new().with_project("before");
        let err = config
            .apply_value(&json!({"project": "after", "bogus": 1}))
            .unwrap_err();
        assert!(matches!(err, DriverError::UnknownConfigKey { .. }));
        assert_eq!(config.project(), Some("before"));
    }

    #[test]
    fn test_non_mapping_source_is_rejected() {
        let err = Config::from_value(&json!(["project"])).unwrap_err();
        assert!(matches!(err, DriverError::ConfigSource { found: "an array" }));
    }

    #[test]
    fn test_null_clears_scalar() {
        let mut config = Config::new().with_project("p1");
        config.apply_value(&json!({"project": null})).unwrap();
        assert_eq!(config.project(), None);
    }

    #[test]
    fn test_numbers_and_bools_stringify() {
        let config = Config::from_value(&json!({
            "project": 123,
            "environment_variables": {"FLAG": true},
            "properties": {"core/disable_usage_reporting": false},
        }))
        .unwrap();
        assert_eq!(config.project(), Some("123"));
        assert_eq!(
            config.environment_variables().get("FLAG").map(String::as_str),
            Some("true")
        );
        assert_eq!(
            config
                .properties()
                .get("core/disable_usage_reporting")
                .map(String::as_str),
            Some("false")
        );
    }

    #[test]
    fn test_wrong_typed_mapping_value_is_rejected() {
        let err = Config::from_value(&json!({"environment_variables": ["FOO"]})).unwrap_err();
        assert!(
            matches!(err, DriverError::ConfigValue { ref key, .. } if key == "environment_variables")
        );

        let err = Config::from_value(&json!({"environment_variables": {"FOO": ["x"]}}))
            .unwrap_err();
        assert!(
            matches!(err, DriverError::ConfigValue { ref key, .. } if key == "environment_variables.FOO")
        );
    }

    // -------------------------------------------------------------------------
    // Locked environment variables
    // -------------------------------------------------------------------------

    #[test]
    fn test_locked_variable_rejected_from_value() {
        let err = Config::from_value(&json!({
            "environment_variables": {"CLOUDSDK_CONFIG": "/tmp/elsewhere"},
        }))
        .unwrap_err();
        assert!(
            matches!(err, DriverError::LockedEnvironmentVariable { name } if name == "CLOUDSDK_CONFIG")
        );
    }

    #[test]
    fn test_locked_variable_rejected_from_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "config.yaml",
            "environment_variables:\n  CLOUDSDK_CONFIG: /tmp/elsewhere\n",
        );
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, DriverError::LockedEnvironmentVariable { .. }));
    }

    #[test]
    fn test_locked_variable_rejected_from_setter() {
        let err = Config::new()
            .with_env_var("CLOUDSDK_CONFIG", "/tmp/elsewhere")
            .unwrap_err();
        assert!(matches!(err, DriverError::LockedEnvironmentVariable { .. }));
    }

    // -------------------------------------------------------------------------
    // File loading
    // -------------------------------------------------------------------------

    #[test]
    fn test_from_file_partial_overlay() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "config.yaml",
            "project: p1\nproperties:\n  compute/zone: us-central1-a\n",
        );
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.project(), Some("p1"));
        assert_eq!(
            config
                .properties()
                .get("compute/zone")
                .map(String::as_str),
            Some("us-central1-a")
        );
        // Untouched keys keep their defaults.
        assert_eq!(
            config
                .environment_variables()
                .get(keys::DISABLE_PROMPTS_ENV)
                .map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn test_from_file_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = Config::from_file(dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, DriverError::ConfigFile { .. }));
    }

    #[test]
    fn test_from_file_unparsable_yaml() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "config.yaml", "project: [unclosed\n");
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, DriverError::ConfigFile { .. }));
    }

    #[test]
    fn test_from_file_top_level_not_a_mapping() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "config.yaml", "- project\n- p1\n");
        let err = Config::from_file(&path).unwrap_err();
        match err {
            DriverError::ConfigFile { reason, .. } => {
                assert!(reason.contains("mapping"), "reason: {reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_apply_file_layers_over_existing_state() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "config.yaml", "environment_variables:\n  FOO: file\n");

        let mut config = Config::new().with_project("kept");
        config.apply_file(&path).unwrap();
        assert_eq!(config.project(), Some("kept"));
        assert_eq!(
            config.environment_variables().get("FOO").map(String::as_str),
            Some("file")
        );
    }

    // -------------------------------------------------------------------------
    // Freezing
    // -------------------------------------------------------------------------

    #[test]
    fn test_freeze_is_independent_of_later_mutation() {
        let mut config = Config::new().with_project("p1");
        let frozen = config.freeze();

        config.set_project(Some("p2".to_string()));
        config.set_env_var("FOO", "bar").unwrap();

        assert_eq!(frozen.project(), Some("p1"));
        assert!(!frozen.environment_variables().contains_key("FOO"));
    }

    #[test]
    fn test_equal_inputs_freeze_equal() {
        let a = Config::new().with_project("p1").freeze();
        let b = Config::new().with_project("p1").freeze();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_different_inputs_freeze_unequal() {
        let a = Config::new().with_project("p1").freeze();
        let b = Config::new().with_project("p2").freeze();
        assert_ne!(a, b);
    }

    #[test]
    fn test_frozen_form_serializes_with_config_key_names() {
        let frozen = Config::new().with_project("p1").freeze();
        let value = serde_json::to_value(&frozen).unwrap();
        assert_eq!(value["project"], json!("p1"));
        assert!(value.get("environment_variables").is_some());
        assert!(value.get("properties").is_some());
    }
}
