//! Settings document loading with deep merge and environment overrides.
//!
//! Loading flow:
//! 1. Start from an empty document (compiled defaults are applied when the
//!    typed settings are read, see [`crate::ExplorerSettings::from_store`])
//! 2. If the settings file exists, use its JSON as the document
//! 3. Apply `TEXPLORER_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::store::SettingsStore;

/// Resolve the default settings file (`~/.texplorer/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".texplorer").join("settings.json")
}

/// Load a settings store from `path`, applying process environment overrides.
pub fn load_store_from_path(path: &Path) -> Result<SettingsStore> {
    load_store_with(path, |name| std::env::var(name).ok())
}

/// Load a settings store from `path`, reading overrides through `read`.
///
/// A missing file yields an empty document. Invalid JSON is an error.
pub fn load_store_with<F>(path: &Path, read: F) -> Result<SettingsStore>
where
    F: Fn(&str) -> Option<String>,
{
    let document = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        if !value.is_object() {
            return Err(SettingsError::InvalidValue(
                "settings file must contain a JSON object".into(),
            ));
        }
        value
    } else {
        debug!(?path, "settings file not found, using defaults");
        Value::Object(serde_json::Map::new())
    };

    let store = SettingsStore::from_value(document);
    apply_env_overrides(&store, read);
    Ok(store)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to a store.
///
/// Invalid values are ignored (fall back to file/default).
pub fn apply_env_overrides<F>(store: &SettingsStore, read: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = read_string(&read, "TEXPLORER_LOG_LEVEL") {
        if v.parse::<texplorer_core::level::LogLevel>().is_ok() {
            store.set("texplorer.logLevel", Value::String(v.to_lowercase()));
        }
    }
    if let Some(v) = read_string(&read, "TEXPLORER_MANIFEST") {
        store.set("texplorer.manifest", Value::String(v));
    }
    if let Some(v) = read_string(&read, "TEXPLORER_CWD") {
        store.set("texplorer.cwd", Value::String(v));
    }
    if let Some(v) = read_string(&read, "TEXPLORER_RUNNER_COMMAND") {
        store.set("texplorer.runner.command", Value::String(v));
    }
    if let Some(v) = read_bool(&read, "TEXPLORER_WATCH") {
        store.set("texplorer.watch.enabled", Value::Bool(v));
    }
}

fn read_string<F: Fn(&str) -> Option<String>>(read: &F, name: &str) -> Option<String> {
    read(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn read_bool<F: Fn(&str) -> Option<String>>(read: &F, name: &str) -> Option<bool> {
    match read_string(read, name)?.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
