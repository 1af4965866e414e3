//! Declarative plugins loaded from TOML.
//!
//! ```toml
//! [plugin]
//! name = "NoTrack"
//! description = "Disable analytics"
//! dependencies = ["Core"]
//! host_version = ">=1.2.0"
//!
//! [[settings]]
//! key = "mode"
//! type = "select"
//! options = ["drop", "log"]
//! default = "drop"
//!
//! [[patches]]
//! find = ".track("
//! predicate = { setting = { key = "mode", equals = "drop" } }
//!
//! [[patches.replacements]]
//! regex = '(\i)\.track\('
//! replace = "$1.noop("
//! global = true
//! ```
//!
//! A manifest implements [`Plugin`] with no-op hooks.

use crate::find::FindCriterion;
use crate::patch::Patch;
use crate::plugin::traits::{OptionKind, Plugin, SettingOption};
use crate::plugin::version::parse_requirement;
use crate::predicate::Predicate;
use crate::rewrite::{Matcher, Replacement};
use crate::settings::SettingValue;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub plugin: PluginMeta,
    #[serde(default)]
    pub settings: Vec<SettingOption>,
    #[serde(default)]
    pub patches: Vec<PatchSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginMeta {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub enabled_by_default: bool,
    #[serde(default)]
    pub host_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatchSpec {
    pub find: FindCriterion,
    #[serde(default)]
    pub replacements: Vec<ReplacementSpec>,
    #[serde(default)]
    pub predicate: Option<Predicate>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub group: bool,
    #[serde(default)]
    pub no_warn: bool,
}

/// Exactly one of `match`, `regex` or `structural` must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplacementSpec {
    #[serde(default, rename = "match")]
    pub literal: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub structural: Option<String>,
    pub replace: String,
    #[serde(default)]
    pub global: bool,
    #[serde(default)]
    pub applies_if: Option<Predicate>,
}

impl ReplacementSpec {
    fn build(&self) -> Result<Replacement, String> {
        let matcher = match (&self.literal, &self.regex, &self.structural) {
            (Some(text), None, None) => Matcher::literal(text.as_str()),
            (None, Some(pattern), None) => Matcher::regex(pattern),
            (None, None, Some(pattern)) => Matcher::structural(pattern),
            (None, None, None) => {
                return Err("one of match, regex or structural is required".to_string())
            }
            _ => return Err("match, regex and structural are mutually exclusive".to_string()),
        }
        .map_err(|e| e.to_string())?;

        let mut replacement = Replacement::new(matcher, self.replace.clone());
        replacement.global = self.global;
        replacement.applies_if = self.applies_if.clone();
        Ok(replacement)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    MissingField {
        patch: Option<usize>,
        field: &'static str,
    },
    InvalidCombo {
        patch: Option<usize>,
        message: String,
    },
    DuplicateSetting {
        key: String,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::MissingField { patch, field } => match patch {
                Some(index) => write!(f, "patch #{index}: missing required field '{field}'"),
                None => write!(f, "missing required field '{field}'"),
            },
            ValidationIssue::InvalidCombo { patch, message } => match patch {
                Some(index) => write!(f, "patch #{index}: {message}"),
                None => write!(f, "{message}"),
            },
            ValidationIssue::DuplicateSetting { key } => {
                write!(f, "setting '{key}' is declared more than once")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.issues.iter().map(ToString::to_string).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ValidationError {}

impl PluginManifest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        if self.plugin.name.trim().is_empty() {
            issues.push(ValidationIssue::MissingField {
                patch: None,
                field: "plugin.name",
            });
        }
        if self.plugin.dependencies.iter().any(|d| d == &self.plugin.name) {
            issues.push(ValidationIssue::InvalidCombo {
                patch: None,
                message: "plugin cannot depend on itself".to_string(),
            });
        }
        if let Some(req) = &self.plugin.host_version {
            if let Err(e) = parse_requirement(req) {
                issues.push(ValidationIssue::InvalidCombo {
                    patch: None,
                    message: e.to_string(),
                });
            }
        }

        let mut keys = BTreeSet::new();
        for option in &self.settings {
            if !keys.insert(option.key.as_str()) {
                issues.push(ValidationIssue::DuplicateSetting {
                    key: option.key.clone(),
                });
            }
            if let Some(message) = option_problem(option) {
                issues.push(ValidationIssue::InvalidCombo {
                    patch: None,
                    message: format!("setting '{}': {message}", option.key),
                });
            }
        }

        for (index, spec) in self.patches.iter().enumerate() {
            if let Err(e) = spec.find.validate() {
                issues.push(ValidationIssue::InvalidCombo {
                    patch: Some(index),
                    message: e.to_string(),
                });
            }
            if spec.replacements.is_empty() {
                issues.push(ValidationIssue::MissingField {
                    patch: Some(index),
                    field: "replacements",
                });
            }
            for (r, replacement) in spec.replacements.iter().enumerate() {
                if let Err(message) = replacement.build() {
                    issues.push(ValidationIssue::InvalidCombo {
                        patch: Some(index),
                        message: format!("replacement #{r}: {message}"),
                    });
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }

    /// Build runtime patches. Only meaningful after [`validate`](Self::validate).
    pub fn build_patches(&self) -> Vec<Patch> {
        self.patches
            .iter()
            .map(|spec| {
                let mut patch = Patch::new(self.plugin.name.clone(), spec.find.clone());
                patch.replacements = spec
                    .replacements
                    .iter()
                    .filter_map(|r| r.build().ok())
                    .collect();
                patch.predicate = spec.predicate.clone();
                patch.required = spec.required || self.plugin.required;
                patch.all = spec.all;
                patch.group = spec.group;
                patch.no_warn = spec.no_warn;
                patch
            })
            .collect()
    }
}

fn option_problem(option: &SettingOption) -> Option<String> {
    match (&option.kind, &option.default) {
        (OptionKind::Boolean, SettingValue::Bool(_)) => None,
        (OptionKind::Boolean, _) => Some("boolean default must be true or false".to_string()),
        (OptionKind::Select { options }, _) if options.is_empty() => {
            Some("select needs at least one option".to_string())
        }
        (OptionKind::Select { options }, SettingValue::Text(value)) => (!options.contains(value))
            .then(|| format!("default '{value}' is not one of the options")),
        (OptionKind::Select { .. }, _) => Some("select default must be a string".to_string()),
        (OptionKind::Slider { min, max }, _) if min > max => {
            Some(format!("slider min {min} exceeds max {max}"))
        }
        (OptionKind::Slider { min, max }, SettingValue::Number(value)) => (value < min
            || value > max)
            .then(|| format!("default {value} is outside {min}..={max}")),
        (OptionKind::Slider { .. }, _) => Some("slider default must be a number".to_string()),
        (OptionKind::Text, SettingValue::Text(_)) => None,
        (OptionKind::Text, _) => Some("text default must be a string".to_string()),
    }
}

#[derive(Debug)]
pub enum ManifestError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Toml {
        path: Option<PathBuf>,
        source: toml_edit::de::Error,
    },
    Validation {
        path: Option<PathBuf>,
        source: ValidationError,
    },
}

impl ManifestError {
    fn with_path(self, path: &Path) -> Self {
        let path = path.to_path_buf();
        match self {
            ManifestError::Toml { path: None, source } => ManifestError::Toml {
                path: Some(path),
                source,
            },
            ManifestError::Validation { path: None, source } => ManifestError::Validation {
                path: Some(path),
                source,
            },
            other => other,
        }
    }
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestError::Io { path, source } => {
                write!(f, "failed to read plugin manifest {}: {}", path.display(), source)
            }
            ManifestError::Toml { path, source } => match path {
                Some(path) => write!(
                    f,
                    "failed to parse plugin manifest TOML ({}): {}",
                    path.display(),
                    source
                ),
                None => write!(f, "failed to parse plugin manifest TOML: {}", source),
            },
            ManifestError::Validation { path, source } => match path {
                Some(path) => write!(f, "invalid plugin manifest ({}): {}", path.display(), source),
                None => write!(f, "invalid plugin manifest: {}", source),
            },
        }
    }
}

impl std::error::Error for ManifestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ManifestError::Io { source, .. } => Some(source),
            ManifestError::Toml { source, .. } => Some(source),
            ManifestError::Validation { source, .. } => Some(source),
        }
    }
}

pub fn load_from_str(input: &str) -> Result<PluginManifest, ManifestError> {
    let manifest: PluginManifest = toml_edit::de::from_str(input)
        .map_err(|source| ManifestError::Toml { path: None, source })?;
    manifest
        .validate()
        .map_err(|source| ManifestError::Validation { path: None, source })?;
    Ok(manifest)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<PluginManifest, ManifestError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_from_str(&contents).map_err(|error| error.with_path(path))
}

/// [`Plugin`] backed by a validated manifest.
#[derive(Debug, Clone)]
pub struct ManifestPlugin {
    manifest: PluginManifest,
}

impl ManifestPlugin {
    pub fn new(manifest: PluginManifest) -> Self {
        Self { manifest }
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }
}

#[async_trait::async_trait]
impl Plugin for ManifestPlugin {
    fn name(&self) -> &str {
        &self.manifest.plugin.name
    }

    fn description(&self) -> &str {
        &self.manifest.plugin.description
    }

    fn dependencies(&self) -> Vec<String> {
        self.manifest.plugin.dependencies.clone()
    }

    fn required(&self) -> bool {
        self.manifest.plugin.required
    }

    fn enabled_by_default(&self) -> bool {
        self.manifest.plugin.enabled_by_default
    }

    fn host_version(&self) -> Option<&str> {
        self.manifest.plugin.host_version.as_deref()
    }

    fn patches(&self) -> Vec<Patch> {
        self.manifest.build_patches()
    }

    fn settings(&self) -> Vec<SettingOption> {
        self.manifest.settings.clone()
    }
}
