//! Plugin-scoped settings as seen by the patch pipeline.
//!
//! Persistence and cross-process sync live outside this crate. What the
//! pipeline needs is a synchronous key-value view that always returns the
//! last committed value, plus cheap immutable snapshots so that predicates
//! evaluated while patching one module see a consistent state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Reserved per-plugin key holding the user's enable toggle.
pub const ENABLED_KEY: &str = "enabled";

/// A single setting value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl SettingValue {
    /// Loose truthiness used by predicates that only name a key.
    pub fn is_truthy(&self) -> bool {
        match self {
            SettingValue::Bool(b) => *b,
            SettingValue::Number(n) => *n != 0.0 && !n.is_nan(),
            SettingValue::Text(s) => !s.is_empty(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(b) => write!(f, "{b}"),
            SettingValue::Number(n) => write!(f, "{n}"),
            SettingValue::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Bool(value)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        SettingValue::Number(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::Text(value)
    }
}

type SettingsMap = BTreeMap<String, BTreeMap<String, SettingValue>>;

/// Immutable view of every plugin's settings at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsSnapshot {
    values: Arc<SettingsMap>,
}

impl SettingsSnapshot {
    pub fn get(&self, plugin: &str, key: &str) -> Option<&SettingValue> {
        self.values.get(plugin).and_then(|table| table.get(key))
    }

    /// The plugin's enable toggle, if the user ever set one.
    pub fn plugin_enabled(&self, plugin: &str) -> Option<bool> {
        self.get(plugin, ENABLED_KEY).and_then(SettingValue::as_bool)
    }

    pub fn plugins(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read settings from {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse settings TOML: {0}")]
    Toml(#[from] toml_edit::de::Error),
}

/// In-memory settings store. Reads are synchronous and reflect the last
/// `set`; snapshots share storage until the next write.
#[derive(Debug, Clone, Default)]
pub struct SettingsStore {
    values: Arc<SettingsMap>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a settings file: one table per plugin.
    ///
    /// ```toml
    /// [NoTrack]
    /// enabled = true
    /// blockTelemetry = false
    /// ```
    pub fn load_from_str(input: &str) -> Result<Self, SettingsError> {
        let values: SettingsMap = toml_edit::de::from_str(input)?;
        Ok(Self {
            values: Arc::new(values),
        })
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::load_from_str(&contents)
    }

    pub fn get(&self, plugin: &str, key: &str) -> Option<&SettingValue> {
        self.values.get(plugin).and_then(|table| table.get(key))
    }

    /// Commit a value, returning the previous one.
    pub fn set(
        &mut self,
        plugin: &str,
        key: &str,
        value: impl Into<SettingValue>,
    ) -> Option<SettingValue> {
        Arc::make_mut(&mut self.values)
            .entry(plugin.to_string())
            .or_default()
            .insert(key.to_string(), value.into())
    }

    /// Insert a default without overwriting a user-committed value.
    pub fn seed_default(&mut self, plugin: &str, key: &str, value: SettingValue) {
        if self.get(plugin, key).is_none() {
            self.set(plugin, key, value);
        }
    }

    pub fn plugin_enabled(&self, plugin: &str) -> Option<bool> {
        self.get(plugin, ENABLED_KEY).and_then(SettingValue::as_bool)
    }

    pub fn set_plugin_enabled(&mut self, plugin: &str, enabled: bool) {
        self.set(plugin, ENABLED_KEY, enabled);
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            values: Arc::clone(&self.values),
        }
    }

    pub fn clear(&mut self) {
        self.values = Arc::default();
    }
}
