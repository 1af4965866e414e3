//! Enablement predicates for patches and replacements.
//!
//! Predicates are pure functions of a [`SettingsSnapshot`] and the name of
//! the plugin that owns the rule, so the same snapshot always yields the same
//! decision. They are re-evaluated for every module, never cached.

use crate::settings::{SettingValue, SettingsSnapshot};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

pub type PredicateFn = Arc<dyn Fn(&SettingsSnapshot) -> bool + Send + Sync>;

#[derive(Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Always,
    Never,
    /// True when the setting is present and truthy, or equal to `equals`.
    /// `plugin` defaults to the rule's owner.
    Setting {
        #[serde(default)]
        plugin: Option<String>,
        key: String,
        #[serde(default)]
        equals: Option<SettingValue>,
    },
    Not(Box<Predicate>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    #[serde(skip)]
    Custom(PredicateFn),
}

impl Predicate {
    pub fn setting(key: impl Into<String>) -> Self {
        Predicate::Setting {
            plugin: None,
            key: key.into(),
            equals: None,
        }
    }

    pub fn setting_equals(key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        Predicate::Setting {
            plugin: None,
            key: key.into(),
            equals: Some(value.into()),
        }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&SettingsSnapshot) -> bool + Send + Sync + 'static,
    {
        Predicate::Custom(Arc::new(f))
    }

    pub fn evaluate(&self, settings: &SettingsSnapshot, owner: &str) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Never => false,
            Predicate::Setting {
                plugin,
                key,
                equals,
            } => {
                let plugin = plugin.as_deref().unwrap_or(owner);
                match (settings.get(plugin, key), equals) {
                    (Some(value), Some(expected)) => value == expected,
                    (Some(value), None) => value.is_truthy(),
                    (None, _) => false,
                }
            }
            Predicate::Not(inner) => !inner.evaluate(settings, owner),
            Predicate::All(all) => all.iter().all(|p| p.evaluate(settings, owner)),
            Predicate::Any(any) => any.iter().any(|p| p.evaluate(settings, owner)),
            Predicate::Custom(f) => f(settings),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Always => write!(f, "Always"),
            Predicate::Never => write!(f, "Never"),
            Predicate::Setting {
                plugin,
                key,
                equals,
            } => f
                .debug_struct("Setting")
                .field("plugin", plugin)
                .field("key", key)
                .field("equals", equals)
                .finish(),
            Predicate::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
            Predicate::All(all) => f.debug_tuple("All").field(all).finish(),
            Predicate::Any(any) => f.debug_tuple("Any").field(any).finish(),
            Predicate::Custom(_) => write!(f, "Custom(<fn>)"),
        }
    }
}
