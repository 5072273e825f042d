//! Process configuration for a guardian.
//!
//! [`GuardianConfig`] is a plain value assembled from three layers, each
//! overriding the previous: the process environment, an optional JSON
//! file (`conf/guardian.conf` under the working directory), and the
//! remote `<root>/config` node in the coordination store. It is wired
//! into the [`Guardian`](crate::guardian::Guardian) by its builder; there
//! is no process-wide singleton.
//!
//! [`GuardianPaths`] derives the coordination-store namespace for one
//! guardian id from [`PERSISTENT_BASEPATH`] (template default `/{}`).

use std::path::Path;
use std::time::Duration;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::store::{StateStore, StoreError};

/// Namespacing root in the coordination store.
pub const GUARDIAN_ID: &str = "GUARDIAN_ID";
/// This replica's election identity.
pub const INSTANCE_ID: &str = "INSTANCE_ID";
/// Coordination-store endpoint (driver-specific interpretation).
pub const STATE_SERVICE_HOSTS: &str = "STATE_SERVICE_HOSTS";
/// Override of the default root template (`/{}`).
pub const PERSISTENT_BASEPATH: &str = "PERSISTENT_BASEPATH";
/// Ephemeral-node refresh interval, seconds (default 0.4).
pub const PERSIST_INTERVAL: &str = "PERSIST_INTERVAL";
/// Ephemeral-node liveness timeout, seconds (default 3).
pub const PERSIST_TIMEOUT: &str = "PERSIST_TIMEOUT";
/// Driver-specific options, JSON blob.
pub const PERSIST_PARAMETERS: &str = "PERSIST_PARAMETERS";
/// HTTP status endpoint port. Recognized but unused by the core.
pub const ARK_SERVER_PORT: &str = "ARK_SERVER_PORT";
/// Log routing directory.
pub const LOG_DIR: &str = "LOG_DIR";
/// Log configuration directory.
pub const LOG_CONF_DIR: &str = "LOG_CONF_DIR";

/// Default store-namespace template; `{}` is replaced by the guardian id.
pub const DEFAULT_PERSISTENT_BASEPATH: &str = "/{}";

const DEFAULT_CONF_FILE: &str = "conf/guardian.conf";

/// Errors from configuration assembly and lookup.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    /// A mandatory key is absent from every layer.
    #[error("missing configuration key: {key}")]
    #[diagnostic(
        code(wardmill::config::missing_key),
        help("Set `{key}` in the environment, conf/guardian.conf, or the remote config node.")
    )]
    MissingKey { key: String },

    /// A present value could not be parsed as the requested type.
    #[error("configuration key {key} has unparsable value: {message}")]
    #[diagnostic(code(wardmill::config::parse))]
    Parse { key: String, message: String },

    /// The configuration file exists but could not be read.
    #[error("failed to read configuration file: {0}")]
    #[diagnostic(code(wardmill::config::io))]
    Io(#[from] std::io::Error),

    /// The configuration file or remote node is not a JSON object.
    #[error("configuration payload is not a JSON object: {0}")]
    #[diagnostic(code(wardmill::config::format))]
    Format(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// Read-mostly configuration KV for one guardian process.
#[derive(Clone, Debug, Default)]
pub struct GuardianConfig {
    values: FxHashMap<String, String>,
}

impl GuardianConfig {
    /// An empty configuration; useful for tests and programmatic wiring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the environment layer (after `dotenvy` has had its chance).
    #[must_use]
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::new();
        for (key, value) in std::env::vars() {
            config.values.insert(key, value);
        }
        config
    }

    /// Merge the JSON object at `path` over the current values.
    ///
    /// A missing file is not an error (the file layer is optional).
    pub fn merge_file(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(path)?;
        self.merge_json(&raw)
    }

    /// Merge the default configuration file under the working directory.
    pub fn merge_default_file(&mut self) -> Result<(), ConfigError> {
        self.merge_file(DEFAULT_CONF_FILE)
    }

    /// Merge the remote `<root>/config` store node over the current values.
    ///
    /// An absent node is not an error (the remote layer is optional).
    pub async fn merge_remote(
        &mut self,
        store: &dyn StateStore,
        paths: &GuardianPaths,
    ) -> Result<(), ConfigError> {
        match store.get(&paths.config()).await {
            Ok(data) if !data.is_empty() => {
                let raw = String::from_utf8_lossy(&data).into_owned();
                self.merge_json(&raw)
            }
            Ok(_) => Ok(()),
            Err(StoreError::NoNode { .. }) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn merge_json(&mut self, raw: &str) -> Result<(), ConfigError> {
        let object: FxHashMap<String, Value> = serde_json::from_str(raw)?;
        for (key, value) in object {
            let rendered = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            self.values.insert(key, rendered);
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<&str, ConfigError> {
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingKey { key: key.into() })
    }

    #[must_use]
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.values.get(key).map(String::as_str).unwrap_or(default)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn delete(&mut self, key: &str) {
        self.values.remove(key);
    }

    /// Parse a key holding fractional seconds into a [`Duration`].
    pub fn duration_secs(&self, key: &str, default_secs: f64) -> Result<Duration, ConfigError> {
        let raw = match self.values.get(key) {
            Some(raw) => raw.as_str(),
            None => return Ok(Duration::from_secs_f64(default_secs)),
        };
        raw.parse::<f64>()
            .map(Duration::from_secs_f64)
            .map_err(|e| ConfigError::Parse {
                key: key.into(),
                message: e.to_string(),
            })
    }

    /// The store namespace for this guardian, from [`GUARDIAN_ID`] and
    /// [`PERSISTENT_BASEPATH`].
    pub fn paths(&self) -> Result<GuardianPaths, ConfigError> {
        let guardian_id = self.get(GUARDIAN_ID)?;
        let template = self.get_or(PERSISTENT_BASEPATH, DEFAULT_PERSISTENT_BASEPATH);
        Ok(GuardianPaths::new(template, guardian_id))
    }
}

/// Coordination-store paths for one guardian id.
///
/// ```text
/// /G/                                  root (persistent)
/// /G/alive_clients/<inst>#NNNNNNNNN    election markers
/// /G/context                           serialized guardian context
/// /G/operations/<op_id>                serialized operation records
/// /G/config                            remote configuration layer
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardianPaths {
    root: String,
}

impl GuardianPaths {
    #[must_use]
    pub fn new(template: &str, guardian_id: &str) -> Self {
        Self {
            root: template.replace("{}", guardian_id),
        }
    }

    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    #[must_use]
    pub fn alive_clients(&self) -> String {
        format!("{}/alive_clients", self.root)
    }

    #[must_use]
    pub fn context(&self) -> String {
        format!("{}/context", self.root)
    }

    #[must_use]
    pub fn operations(&self) -> String {
        format!("{}/operations", self.root)
    }

    #[must_use]
    pub fn operation(&self, operation_id: &str) -> String {
        format!("{}/operations/{operation_id}", self.root)
    }

    #[must_use]
    pub fn config(&self) -> String {
        format!("{}/config", self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_the_namespace_layout() {
        let paths = GuardianPaths::new(DEFAULT_PERSISTENT_BASEPATH, "demo");
        assert_eq!(paths.root(), "/demo");
        assert_eq!(paths.alive_clients(), "/demo/alive_clients");
        assert_eq!(paths.context(), "/demo/context");
        assert_eq!(paths.operation("op1"), "/demo/operations/op1");
    }

    #[test]
    fn later_layers_override_earlier_ones() {
        let mut config = GuardianConfig::new();
        config.set(GUARDIAN_ID, "one");
        config
            .merge_json(r#"{"GUARDIAN_ID": "two", "ARK_SERVER_PORT": 8080}"#)
            .unwrap();
        assert_eq!(config.get(GUARDIAN_ID).unwrap(), "two");
        assert_eq!(config.get(ARK_SERVER_PORT).unwrap(), "8080");
        assert!(matches!(
            config.get("NOPE"),
            Err(ConfigError::MissingKey { .. })
        ));
    }

    #[test]
    fn duration_parsing() {
        let mut config = GuardianConfig::new();
        config.set(PERSIST_INTERVAL, "0.4");
        assert_eq!(
            config.duration_secs(PERSIST_INTERVAL, 1.0).unwrap(),
            Duration::from_millis(400)
        );
        assert_eq!(
            config.duration_secs(PERSIST_TIMEOUT, 3.0).unwrap(),
            Duration::from_secs(3)
        );
    }
}
