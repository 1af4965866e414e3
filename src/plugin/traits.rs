use crate::patch::Patch;
use crate::settings::{SettingValue, SettingsSnapshot};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Shape of a plugin option, used to validate and describe it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptionKind {
    Boolean,
    Select { options: Vec<String> },
    Slider { min: f64, max: f64 },
    Text,
}

/// One user-facing plugin option.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SettingOption {
    pub key: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub kind: OptionKind,
    pub default: SettingValue,
    /// Changing the option only takes effect after the host restarts.
    #[serde(default)]
    pub restart_needed: bool,
}

impl SettingOption {
    fn new(key: impl Into<String>, kind: OptionKind, default: SettingValue) -> Self {
        Self {
            key: key.into(),
            description: String::new(),
            kind,
            default,
            restart_needed: false,
        }
    }

    pub fn boolean(key: impl Into<String>, default: bool) -> Self {
        Self::new(key, OptionKind::Boolean, SettingValue::Bool(default))
    }

    pub fn select(key: impl Into<String>, options: &[&str], default: &str) -> Self {
        let options = options.iter().map(|o| o.to_string()).collect();
        Self::new(key, OptionKind::Select { options }, SettingValue::from(default))
    }

    pub fn slider(key: impl Into<String>, min: f64, max: f64, default: f64) -> Self {
        Self::new(key, OptionKind::Slider { min, max }, SettingValue::Number(default))
    }

    pub fn text(key: impl Into<String>, default: &str) -> Self {
        Self::new(key, OptionKind::Text, SettingValue::from(default))
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn restart_needed(mut self) -> Self {
        self.restart_needed = true;
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("{0}")]
    Message(String),
}

impl HookError {
    pub fn msg(message: impl Into<String>) -> Self {
        HookError::Message(message.into())
    }
}

/// What a lifecycle hook can see.
#[derive(Debug, Clone)]
pub struct PluginContext {
    name: String,
    settings: SettingsSnapshot,
}

impl PluginContext {
    pub fn new(name: impl Into<String>, settings: SettingsSnapshot) -> Self {
        Self {
            name: name.into(),
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &SettingsSnapshot {
        &self.settings
    }

    /// This plugin's value for `key`.
    pub fn setting(&self, key: &str) -> Option<&SettingValue> {
        self.settings.get(&self.name, key)
    }
}

/// A unit of host customisation: patches plus lifecycle hooks.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique name; also the settings namespace and patch owner.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Names of plugins that must be started first.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Always enabled, and its patches failing is startup-fatal.
    fn required(&self) -> bool {
        false
    }

    /// Enabled when the user has not toggled it either way.
    fn enabled_by_default(&self) -> bool {
        false
    }

    /// Semver requirement on the host version, e.g. `">=1.2, <2"`.
    fn host_version(&self) -> Option<&str> {
        None
    }

    fn patches(&self) -> Vec<Patch> {
        Vec::new()
    }

    fn settings(&self) -> Vec<SettingOption> {
        Vec::new()
    }

    async fn start(&self, _ctx: &PluginContext) -> Result<(), HookError> {
        Ok(())
    }

    async fn stop(&self, _ctx: &PluginContext) -> Result<(), HookError> {
        Ok(())
    }
}
