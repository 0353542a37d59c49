use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use texplorer_core::host::ConfigStore;
use texplorer_core::level::LogLevel;

use crate::errors::{Result, SettingsError};
use crate::loader::deep_merge;

/// Top-level configuration section; keys are read as `texplorer.<field>`.
pub const SECTION: &str = "texplorer";

/// Settings snapshot a subsystem generation is built from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExplorerSettings {
    pub log_level: LogLevel,
    /// Working directory, relative to the workspace. `None` = workspace root.
    pub cwd: Option<String>,
    /// JSON test manifest, relative to `cwd`.
    pub manifest: String,
    pub runner: RunnerSettings,
    pub debug: DebugSettings,
    pub watch: WatchSettings,
}

impl Default for ExplorerSettings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            cwd: None,
            manifest: "tests.json".into(),
            runner: RunnerSettings::default(),
            debug: DebugSettings::default(),
            watch: WatchSettings::default(),
        }
    }
}

/// How a single test is executed. `{test}` and `{file}` are substituted in args.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerSettings {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout_ms: Option<u64>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            command: "cargo".into(),
            args: vec![
                "test".into(),
                "--".into(),
                "--exact".into(),
                "{test}".into(),
            ],
            env: BTreeMap::new(),
            timeout_ms: None,
        }
    }
}

/// Extra runner args when debugging. `{port}` is substituted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugSettings {
    pub host: String,
    pub args: Vec<String>,
    /// Environment variable that receives the acquired port.
    pub port_env: Option<String>,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            args: Vec::new(),
            port_env: Some("TEXPLORER_DEBUG_PORT".into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchSettings {
    pub enabled: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// How long to collect changes before retiring results.
    pub debounce_ms: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            include: vec!["**/*".into()],
            exclude: vec!["**/target/**".into(), "**/.git/**".into()],
            debounce_ms: 100,
        }
    }
}

impl ExplorerSettings {
    /// Read every top-level field from `store` under [`SECTION`], deep-merged
    /// over compiled defaults.
    pub fn from_store(store: &dyn ConfigStore) -> Result<Self> {
        let defaults = serde_json::to_value(Self::default())?;
        let serde_json::Value::Object(mut fields) = defaults else {
            return Err(SettingsError::InvalidValue("defaults are not an object".into()));
        };

        let keys: Vec<String> = fields.keys().cloned().collect();
        for key in keys {
            if let Some(user) = store.get(&format!("{SECTION}.{key}")) {
                let current = fields.remove(&key).unwrap_or(serde_json::Value::Null);
                let merged = if current.is_null() {
                    user
                } else {
                    deep_merge(current, user)
                };
                let _ = fields.insert(key, merged);
            }
        }

        let settings: Self = serde_json::from_value(serde_json::Value::Object(fields))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.runner.command.trim().is_empty() {
            return Err(SettingsError::InvalidValue("runner.command is empty".into()));
        }
        if self.manifest.trim().is_empty() {
            return Err(SettingsError::InvalidValue("manifest is empty".into()));
        }
        if self.debug.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("debug.host is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SettingsStore;

    #[test]
    fn defaults_are_valid() {
        let settings = ExplorerSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.manifest, "tests.json");
        assert_eq!(settings.runner.command, "cargo");
        assert!(settings.watch.enabled);
    }

    #[test]
    fn from_empty_store_yields_defaults() {
        let store = SettingsStore::new();
        let settings = ExplorerSettings::from_store(&store).unwrap();
        assert_eq!(settings, ExplorerSettings::default());
    }

    #[test]
    fn from_store_merges_nested_objects() {
        let store = SettingsStore::new();
        store.set("texplorer.runner", serde_json::json!({"command": "pytest"}));
        store.set("texplorer.logLevel", serde_json::json!("debug"));

        let settings = ExplorerSettings::from_store(&store).unwrap();
        assert_eq!(settings.runner.command, "pytest");
        // Untouched nested fields keep their defaults
        assert_eq!(settings.runner.args, RunnerSettings::default().args);
        assert_eq!(settings.log_level, LogLevel::Debug);
    }

    #[test]
    fn from_store_sets_optional_cwd() {
        let store = SettingsStore::new();
        store.set("texplorer.cwd", serde_json::json!("packages/app"));
        let settings = ExplorerSettings::from_store(&store).unwrap();
        assert_eq!(settings.cwd.as_deref(), Some("packages/app"));
    }

    #[test]
    fn from_store_rejects_empty_command() {
        let store = SettingsStore::new();
        store.set("texplorer.runner.command", serde_json::json!("  "));
        let err = ExplorerSettings::from_store(&store).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue(_)));
    }

    #[test]
    fn from_store_rejects_wrong_types() {
        let store = SettingsStore::new();
        store.set("texplorer.watch", serde_json::json!({"enabled": "yes please"}));
        let err = ExplorerSettings::from_store(&store).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }
}
