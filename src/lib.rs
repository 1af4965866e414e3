//! modpatch: load-time patching of bundled module factories
//!
//! Plugins contribute find/replace patches. As the host registers each module
//! factory, every patch whose find criterion occurs in the factory source is
//! applied in registration order, the result is recompiled, and the patched
//! factory is handed back to the host. Broken patches are isolated: a failing
//! patch is skipped, a failing recompile falls back to the last good source.
//!
//! # Architecture
//!
//! - [`rewrite`]: matchers (literal, regex, structural) and the replacement
//!   pipeline.
//! - [`patch`]: patch definitions and the ordered [`PatchRegistry`].
//! - [`module`]: factories, the [`FactoryCompiler`] seam and the
//!   [`ModuleInterceptor`].
//! - [`resolver`]: lazy lookup of modules by exported shape.
//! - [`plugin`]: the [`Plugin`] contract, TOML manifests and the lifecycle
//!   manager.
//! - [`runtime`]: the process-scoped [`Runtime`] tying it all together.
//!
//! # Example
//!
//! ```no_run
//! use modpatch::{ModuleFactory, ModuleExports, Runtime, RuntimeConfig};
//!
//! let mut rt = Runtime::new(RuntimeConfig::default());
//! let factory = rt.define_module(
//!     "42",
//!     ModuleFactory::constant("function(e, t) { t.x = 1 }", ModuleExports::new()),
//! );
//! assert_eq!(factory.source(), "function(e, t) { t.x = 1 }");
//! let report = rt.finish_boot().expect("no required patch failed");
//! assert_eq!(report.modules, 1);
//! ```

pub mod cache;
pub mod find;
pub mod module;
pub mod patch;
pub mod plugin;
pub mod pool;
pub mod predicate;
pub mod resolver;
pub mod rewrite;
pub mod runtime;
pub mod safety;
pub mod settings;
pub mod snapshot;

pub use find::{FindCriterion, FindError};
pub use module::{
    FactoryCompiler, ModuleExports, ModuleFactory, ModuleId, ModuleInterceptor, ModuleLoaded,
    ScriptCompiler, StartupFatal,
};
pub use patch::{Patch, PatchId, PatchRegistry};
pub use plugin::{ManifestPlugin, Plugin, PluginContext, PluginManager, SettingOption};
pub use predicate::Predicate;
pub use resolver::{Filter, LazyModuleResolver};
pub use rewrite::{Matcher, Replacement};
pub use runtime::{BootError, BootReport, Runtime, RuntimeConfig};
pub use settings::{SettingValue, SettingsSnapshot, SettingsStore};
