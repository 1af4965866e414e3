//! Plugins: the contract, declarative manifests, and lifecycle management.

pub mod graph;
pub mod manager;
pub mod manifest;
pub mod traits;
pub mod version;

pub use graph::{DependencyGraph, GraphOrder};
pub use manager::{
    BootSummary, LifecycleError, LifecycleResult, PluginManager, PluginRecord, PluginState,
    SettingChange, StopOutcome,
};
pub use manifest::{ManifestError, ManifestPlugin, PluginManifest};
pub use traits::{HookError, OptionKind, Plugin, PluginContext, SettingOption};
pub use version::{matches_requirement, VersionError};
