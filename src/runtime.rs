//! Process-scoped wiring of registry, interceptor, resolver and plugins.
//!
//! A [`Runtime`] is created once per host process and passed by reference to
//! the loader hooks; there is no global state. [`Runtime::clear`] resets it
//! for tests.

use crate::module::{
    FactoryCompiler, FactoryError, Intercepted, ModuleExports, ModuleFactory, ModuleId,
    ModuleInterceptor, ModuleLoaded, ScriptCompiler, StartupFatal, DEFAULT_SELF_REF_ROOT,
};
use crate::patch::{PatchId, PatchRegistry};
use crate::plugin::{BootSummary, LifecycleResult, Plugin, PluginManager, SettingChange, StopOutcome};
use crate::resolver::{Filter, FindHandle, Found, LazyModuleResolver, PendingFind};
use crate::rewrite::replacer::panic_message;
use crate::settings::{SettingValue, SettingsStore};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Start no plugins and register no patches; the host runs unpatched.
    pub safe_mode: bool,
    /// Checked against plugins' `host_version` requirements.
    pub host_version: Option<String>,
    /// Root of the expression `$self` expands to.
    pub self_ref_root: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            safe_mode: false,
            host_version: None,
            self_ref_root: DEFAULT_SELF_REF_ROOT.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BootError {
    #[error("{} startup-fatal failure(s): {}", .fatals.len(), join_fatals(.fatals))]
    Fatal { fatals: Vec<StartupFatal> },
}

fn join_fatals(fatals: &[StartupFatal]) -> String {
    fatals
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequireError {
    #[error("module {0} was never defined")]
    UnknownModule(ModuleId),

    #[error("module {id} failed to execute: {source}")]
    Factory { id: ModuleId, source: FactoryError },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmatchedPatch {
    pub id: PatchId,
    pub plugin: String,
    pub find: String,
    pub required: bool,
}

/// Summary of plugin start-up and module patching so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootReport {
    pub safe_mode: bool,
    pub started: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub disabled: Vec<String>,
    pub modules: usize,
    pub patched_modules: Vec<ModuleId>,
    pub unmatched_patches: Vec<UnmatchedPatch>,
    pub fatals: Vec<StartupFatal>,
}

pub struct Runtime {
    config: RuntimeConfig,
    registry: PatchRegistry,
    interceptor: ModuleInterceptor,
    resolver: LazyModuleResolver,
    settings: SettingsStore,
    plugins: PluginManager,
    boot: BootSummary,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_compiler(config, Arc::new(ScriptCompiler))
    }

    pub fn with_compiler(config: RuntimeConfig, compiler: Arc<dyn FactoryCompiler>) -> Self {
        let interceptor =
            ModuleInterceptor::new(compiler).with_self_ref_root(config.self_ref_root.clone());
        let mut plugins = PluginManager::new();
        if let Some(version) = &config.host_version {
            plugins = plugins.with_host_version(version.clone());
        }
        Self {
            config,
            registry: PatchRegistry::new(),
            interceptor,
            resolver: LazyModuleResolver::new(),
            settings: SettingsStore::new(),
            plugins,
            boot: BootSummary::default(),
        }
    }

    pub fn with_settings(mut self, settings: SettingsStore) -> Self {
        self.settings = settings;
        self
    }

    pub fn add_plugin(&mut self, plugin: Arc<dyn Plugin>) -> LifecycleResult<()> {
        self.plugins.add(plugin, &mut self.settings)
    }

    /// Boot all added plugins, unless in safe mode.
    pub async fn start_plugins(&mut self) -> &BootSummary {
        if self.config.safe_mode {
            tracing::warn!("safe mode: no plugins started, host runs unpatched");
            self.boot = BootSummary {
                disabled: self.plugins.records().map(|r| r.name.clone()).collect(),
                ..BootSummary::default()
            };
        } else {
            self.boot = self.plugins.boot(&mut self.registry, &mut self.settings).await;
        }
        &self.boot
    }

    /// Host loader hook: returns the factory the host must store for `id`.
    pub fn define_module(&mut self, id: impl Into<ModuleId>, factory: ModuleFactory) -> ModuleFactory {
        self.intercept(id, factory).factory
    }

    /// Like [`define_module`](Self::define_module), also returning the
    /// module-loaded event.
    pub fn intercept(&mut self, id: impl Into<ModuleId>, factory: ModuleFactory) -> Intercepted {
        let snapshot = self.settings.snapshot();
        self.interceptor
            .intercept(id.into(), factory, &mut self.registry, &snapshot)
    }

    /// Module-loaded events for every module defined after this call.
    pub fn subscribe_module_events(&self) -> broadcast::Receiver<ModuleLoaded> {
        self.interceptor.subscribe()
    }

    /// Execute a module once and cache its exports. The first execution
    /// notifies pending finds.
    pub fn require(&mut self, id: impl Into<ModuleId>) -> Result<Arc<ModuleExports>, RequireError> {
        let id = id.into();
        let record = self
            .interceptor
            .record_mut(&id)
            .ok_or_else(|| RequireError::UnknownModule(id.clone()))?;
        if let Some(exports) = &record.exports {
            return Ok(Arc::clone(exports));
        }

        let factory = record.factory().clone();
        let result = catch_unwind(AssertUnwindSafe(|| factory.invoke()))
            .unwrap_or_else(|payload| Err(FactoryError::Panicked(panic_message(payload.as_ref()))));
        let exports = match result {
            Ok(exports) => Arc::new(exports),
            Err(source) => {
                tracing::error!(module = %id, error = %source, "module factory failed");
                return Err(RequireError::Factory { id, source });
            }
        };

        record.exports = Some(Arc::clone(&exports));
        self.resolver.on_module_loaded(id, Arc::clone(&exports));
        Ok(exports)
    }

    pub fn find(&mut self, filter: Filter) -> (FindHandle, PendingFind) {
        self.resolver.find(filter)
    }

    pub fn find_now(&self, filter: &Filter) -> Option<Found> {
        self.resolver.find_now(filter)
    }

    pub fn cancel_find(&mut self, handle: FindHandle) -> bool {
        self.resolver.cancel(handle)
    }

    pub async fn stop_plugin(&mut self, name: &str) -> LifecycleResult<StopOutcome> {
        self.plugins
            .stop(name, &mut self.registry, &self.settings)
            .await
    }

    pub async fn start_plugin(&mut self, name: &str) -> LifecycleResult<()> {
        self.plugins
            .start(name, &mut self.registry, &mut self.settings)
            .await
    }

    pub fn update_setting(
        &mut self,
        plugin: &str,
        key: &str,
        value: impl Into<SettingValue>,
    ) -> LifecycleResult<SettingChange> {
        self.plugins
            .update_setting(plugin, key, value, &mut self.settings)
    }

    /// Current report, including fatals found so far.
    pub fn report(&self) -> BootReport {
        let unmatched_patches: Vec<UnmatchedPatch> = self
            .registry
            .unmatched()
            .into_iter()
            .map(|(id, patch)| UnmatchedPatch {
                id,
                plugin: patch.owner.clone(),
                find: patch.find.describe(),
                required: patch.required,
            })
            .collect();

        let mut fatals = self.boot.fatals.clone();
        fatals.extend(self.required_patch_fatals());

        BootReport {
            safe_mode: self.config.safe_mode,
            started: self.boot.started.clone(),
            failed: self
                .boot
                .failed
                .iter()
                .map(|(name, err)| (name.clone(), err.to_string()))
                .collect(),
            disabled: self.boot.disabled.clone(),
            modules: self.interceptor.len(),
            patched_modules: self
                .interceptor
                .records()
                .filter(|r| r.patched.is_some())
                .map(|r| r.id.clone())
                .collect(),
            unmatched_patches,
            fatals,
        }
    }

    /// Required patches that, as of now, have not applied to any module.
    ///
    /// Judged on end state: a find-once patch that missed one module may
    /// still land on a later one. A patch whose predicate turned it off on
    /// every module it was offered to is not a failure.
    fn required_patch_fatals(&self) -> Vec<StartupFatal> {
        let mut fatals = Vec::new();
        for (id, patch) in self.registry.unmatched() {
            if !patch.required {
                continue;
            }
            if self.registry.skipped_everywhere(id) {
                tracing::debug!(patch = %id, plugin = %patch.owner, "required patch disabled by its predicate");
                continue;
            }
            let failures: Vec<String> = self
                .interceptor
                .records()
                .flat_map(|record| {
                    record
                        .diagnostics
                        .iter()
                        .filter(|d| d.patch == id)
                        .map(move |d| format!("module {}: {}", record.id, d.kind))
                })
                .collect();
            let reason = if failures.is_empty() {
                format!("required patch never matched any module (find {})", patch.find.describe())
            } else {
                format!("required patch never applied ({})", failures.join("; "))
            };
            fatals.push(StartupFatal {
                plugin: patch.owner.clone(),
                patch: Some(id),
                module: None,
                reason,
            });
        }
        fatals
    }

    /// Called once the host has defined its startup modules. Fails when any
    /// required plugin or patch did not take effect; the host should then
    /// restart with `safe_mode`.
    pub fn finish_boot(&self) -> Result<BootReport, BootError> {
        let report = self.report();
        for patch in &report.unmatched_patches {
            tracing::warn!(patch = %patch.id, plugin = %patch.plugin, find = %patch.find, "patch never matched a module");
        }
        if report.fatals.is_empty() {
            Ok(report)
        } else {
            for fatal in &report.fatals {
                tracing::error!("{fatal}");
            }
            Err(BootError::Fatal {
                fatals: report.fatals,
            })
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &PatchRegistry {
        &self.registry
    }

    pub fn interceptor(&self) -> &ModuleInterceptor {
        &self.interceptor
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    /// Drop all plugins, patches, modules, settings and pending finds.
    pub fn clear(&mut self) {
        self.registry.clear();
        self.interceptor.clear();
        self.resolver.clear();
        self.plugins.clear();
        self.settings.clear();
        self.boot = BootSummary::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ExportValue;

    #[test]
    fn require_executes_once_and_caches() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        rt.define_module(
            "1",
            ModuleFactory::new("function(){}", move || {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(ModuleExports::new().with("x", ExportValue::expression("1")))
            }),
        );

        let a = rt.require("1").unwrap();
        let b = rt.require("1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn require_unknown_and_panicking_modules() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        assert_eq!(
            rt.require("nope").unwrap_err(),
            RequireError::UnknownModule("nope".into())
        );

        rt.define_module("boom", ModuleFactory::new("x", || panic!("exploded")));
        assert!(matches!(
            rt.require("boom"),
            Err(RequireError::Factory {
                source: FactoryError::Panicked(_),
                ..
            })
        ));
    }

    #[test]
    fn module_events_reach_subscribers() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let mut events = rt.subscribe_module_events();
        rt.define_module("1", ModuleFactory::constant("function(e,t){}", ModuleExports::new()));

        let event = events.try_recv().unwrap();
        assert_eq!(event.id, ModuleId::from("1"));
        assert!(!event.patched);
    }

    #[test]
    fn clean_boot_reports_ok() {
        let rt = Runtime::new(RuntimeConfig::default());
        let report = rt.finish_boot().unwrap();
        assert_eq!(report.modules, 0);
        assert!(report.fatals.is_empty());
    }
}
