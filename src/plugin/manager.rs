use crate::module::StartupFatal;
use crate::patch::{PatchError, PatchId, PatchRegistry};
use crate::plugin::graph::DependencyGraph;
use crate::plugin::traits::{HookError, Plugin, PluginContext, SettingOption};
use crate::plugin::version::{matches_requirement, VersionError};
use crate::settings::{SettingValue, SettingsStore, ENABLED_KEY};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Discovered,
    DependencyChecked,
    Registered,
    DependencyFailed,
    Incompatible,
    Disabled,
    Started,
    StartFailed,
    Stopped,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin already added: {0}")]
    AlreadyAdded(String),

    #[error("{plugin} requires {dependency}, which is not installed{}", did_you_mean(.suggestion))]
    UnknownDependency {
        plugin: String,
        dependency: String,
        suggestion: Option<String>,
    },

    #[error("{plugin} requires {dependency}, which is not running ({state:?})")]
    DependencyNotStarted {
        plugin: String,
        dependency: String,
        state: PluginState,
    },

    #[error("circular dependency: {}", .members.join(" <-> "))]
    CircularDependency { members: Vec<String> },

    #[error("{plugin} requires host {requirement}, running {host}")]
    Incompatible {
        plugin: String,
        requirement: String,
        host: String,
    },

    #[error("{plugin}: {source}")]
    Version {
        plugin: String,
        source: VersionError,
    },

    #[error("{plugin} has an invalid patch: {source}")]
    InvalidPatch { plugin: String, source: PatchError },

    #[error("{plugin} failed to start: {source}")]
    StartFailed { plugin: String, source: HookError },

    #[error("cannot stop {plugin}: required by {}", .dependents.join(", "))]
    HasDependents {
        plugin: String,
        dependents: Vec<String>,
    },

    #[error("plugin is not running: {0}")]
    NotRunning(String),

    #[error("plugin is already running: {0}")]
    AlreadyRunning(String),

    #[error("{plugin} has no setting '{key}'")]
    UnknownSetting { plugin: String, key: String },
}

fn did_you_mean(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean '{s}'?)"))
        .unwrap_or_default()
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRecord {
    pub name: String,
    pub dependencies: Vec<String>,
    pub patches: Vec<PatchId>,
    pub enabled: bool,
    pub started: bool,
    pub state: PluginState,
    pub required: bool,
    /// Why the plugin is not running, if it failed.
    pub failure: Option<LifecycleError>,
}

struct Entry {
    plugin: Arc<dyn Plugin>,
    options: Vec<SettingOption>,
    record: PluginRecord,
}

/// Outcome of [`PluginManager::boot`].
#[derive(Debug, Clone, Default)]
pub struct BootSummary {
    pub started: Vec<String>,
    pub failed: Vec<(String, LifecycleError)>,
    pub disabled: Vec<String>,
    /// Failures of `required` plugins.
    pub fatals: Vec<StartupFatal>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    /// Some of the plugin's patches were already applied; modules are never
    /// un-patched, so the host must restart for them to disappear.
    pub restart_needed: bool,
    pub unregistered: Vec<PatchId>,
    pub hook_error: Option<HookError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettingChange {
    pub previous: Option<SettingValue>,
    pub restart_needed: bool,
}

/// Owns plugins and walks them through their lifecycle.
pub struct PluginManager {
    entries: Vec<Entry>,
    host_version: Option<String>,
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.entries.iter().map(|e| &e.record).collect::<Vec<_>>())
            .field("host_version", &self.host_version)
            .finish()
    }
}

impl PluginManager {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            host_version: None,
        }
    }

    /// Version plugins' `host_version` ranges are checked against.
    pub fn with_host_version(mut self, version: impl Into<String>) -> Self {
        self.host_version = Some(version.into());
        self
    }

    /// Discover a plugin and seed its option defaults.
    pub fn add(&mut self, plugin: Arc<dyn Plugin>, settings: &mut SettingsStore) -> LifecycleResult<()> {
        let name = plugin.name().to_string();
        if self.position(&name).is_some() {
            return Err(LifecycleError::AlreadyAdded(name));
        }

        let options = plugin.settings();
        for option in &options {
            settings.seed_default(&name, &option.key, option.default.clone());
        }

        debug!(plugin = %name, "discovered plugin");
        self.entries.push(Entry {
            record: PluginRecord {
                name,
                dependencies: plugin.dependencies(),
                patches: Vec::new(),
                enabled: false,
                started: false,
                state: PluginState::Discovered,
                required: plugin.required(),
                failure: None,
            },
            plugin,
            options,
        });
        Ok(())
    }

    /// Start every discovered plugin in dependency order.
    ///
    /// Each plugin's patches are registered dormant and armed only once its
    /// start hook succeeds. Failures are contained to the plugin (and its
    /// dependents); failures of required plugins are reported as fatal.
    pub async fn boot(&mut self, registry: &mut PatchRegistry, settings: &mut SettingsStore) -> BootSummary {
        let mut graph = DependencyGraph::new();
        for entry in &self.entries {
            graph.add_node(&entry.record.name);
        }
        for entry in &self.entries {
            for dep in &entry.record.dependencies {
                graph.add_edge(&entry.record.name, dep);
            }
        }
        let order = graph.order();

        let mut summary = BootSummary::default();
        for name in &order.order {
            let Some(index) = self.position(name) else {
                continue;
            };
            if self.entries[index].record.state != PluginState::Discovered {
                continue;
            }

            let enabled = self.is_enabled(index, settings);
            self.entries[index].record.enabled = enabled;
            if !enabled {
                debug!(plugin = %name, "plugin disabled");
                self.entries[index].record.state = PluginState::Disabled;
                summary.disabled.push(name.clone());
                continue;
            }

            if let Some(cycle) = order.in_cycle(name) {
                let error = LifecycleError::CircularDependency {
                    members: cycle.to_vec(),
                };
                self.fail(index, PluginState::DependencyFailed, error, &mut summary);
                continue;
            }

            match self.bring_up(index, registry, settings).await {
                Ok(()) => summary.started.push(name.clone()),
                Err((state, error)) => self.fail(index, state, error, &mut summary),
            }
        }

        info!(
            started = summary.started.len(),
            failed = summary.failed.len(),
            disabled = summary.disabled.len(),
            "plugins booted"
        );
        summary
    }

    /// Start a single plugin that is stopped, disabled or failed, e.g. after
    /// the user enables it. Its patches only reach modules loaded afterwards.
    pub async fn start(
        &mut self,
        name: &str,
        registry: &mut PatchRegistry,
        settings: &mut SettingsStore,
    ) -> LifecycleResult<()> {
        let index = self
            .position(name)
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        if self.entries[index].record.started {
            return Err(LifecycleError::AlreadyRunning(name.to_string()));
        }
        self.entries[index].record.enabled = true;
        self.entries[index].record.failure = None;

        match self.bring_up(index, registry, settings).await {
            Ok(()) => Ok(()),
            Err((state, error)) => {
                warn!(plugin = %name, "{error}");
                let record = &mut self.entries[index].record;
                record.state = state;
                record.failure = Some(error.clone());
                Err(error)
            }
        }
    }

    async fn bring_up(
        &mut self,
        index: usize,
        registry: &mut PatchRegistry,
        settings: &mut SettingsStore,
    ) -> Result<(), (PluginState, LifecycleError)> {
        let plugin = Arc::clone(&self.entries[index].plugin);
        let name = plugin.name().to_string();

        if let (Some(host), Some(requirement)) = (&self.host_version, plugin.host_version()) {
            match matches_requirement(host, Some(requirement)) {
                Ok(true) => {}
                Ok(false) => {
                    return Err((
                        PluginState::Incompatible,
                        LifecycleError::Incompatible {
                            plugin: name,
                            requirement: requirement.to_string(),
                            host: host.clone(),
                        },
                    ))
                }
                Err(source) => {
                    return Err((
                        PluginState::Incompatible,
                        LifecycleError::Version { plugin: name, source },
                    ))
                }
            }
        }

        self.check_dependencies(index)
            .map_err(|e| (PluginState::DependencyFailed, e))?;
        self.entries[index].record.state = PluginState::DependencyChecked;

        let mut ids = Vec::new();
        let required = plugin.required();
        for mut patch in plugin.patches() {
            patch.owner = name.clone();
            patch.required |= required;
            match registry.register_inactive(patch) {
                Ok(id) => ids.push(id),
                Err(source) => {
                    registry.unregister_owner(&name);
                    return Err((
                        PluginState::StartFailed,
                        LifecycleError::InvalidPatch { plugin: name, source },
                    ));
                }
            }
        }
        self.entries[index].record.patches = ids;
        self.entries[index].record.state = PluginState::Registered;

        let ctx = PluginContext::new(name.clone(), settings.snapshot());
        if let Err(source) = plugin.start(&ctx).await {
            registry.unregister_owner(&name);
            self.entries[index].record.patches.clear();
            return Err((
                PluginState::StartFailed,
                LifecycleError::StartFailed { plugin: name, source },
            ));
        }

        let armed = registry.arm_owner(&name, true);
        let record = &mut self.entries[index].record;
        record.state = PluginState::Started;
        record.started = true;
        info!(plugin = %name, patches = armed, "plugin started");
        Ok(())
    }

    fn check_dependencies(&self, index: usize) -> LifecycleResult<()> {
        let record = &self.entries[index].record;
        for dep in &record.dependencies {
            match self.position(dep) {
                None => {
                    return Err(LifecycleError::UnknownDependency {
                        plugin: record.name.clone(),
                        dependency: dep.clone(),
                        suggestion: self.suggest(dep),
                    })
                }
                Some(dep_index) => {
                    let dep_record = &self.entries[dep_index].record;
                    if dep_record.state != PluginState::Started {
                        return Err(LifecycleError::DependencyNotStarted {
                            plugin: record.name.clone(),
                            dependency: dep.clone(),
                            state: dep_record.state,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn suggest(&self, unknown: &str) -> Option<String> {
        self.entries
            .iter()
            .map(|e| (strsim::levenshtein(unknown, &e.record.name), &e.record.name))
            .filter(|(distance, _)| *distance <= 2)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, name)| name.clone())
    }

    fn fail(&mut self, index: usize, state: PluginState, error: LifecycleError, summary: &mut BootSummary) {
        let record = &mut self.entries[index].record;
        warn!(plugin = %record.name, ?state, "{error}");
        record.state = state;
        record.started = false;
        record.failure = Some(error.clone());
        if record.required {
            summary.fatals.push(StartupFatal {
                plugin: record.name.clone(),
                patch: None,
                module: None,
                reason: error.to_string(),
            });
        }
        summary.failed.push((record.name.clone(), error));
    }

    fn is_enabled(&self, index: usize, settings: &SettingsStore) -> bool {
        let entry = &self.entries[index];
        entry.record.required
            || settings
                .plugin_enabled(&entry.record.name)
                .unwrap_or_else(|| entry.plugin.enabled_by_default())
    }

    /// Stop a running plugin and withdraw its patches.
    ///
    /// Refused while a started plugin depends on it.
    pub async fn stop(
        &mut self,
        name: &str,
        registry: &mut PatchRegistry,
        settings: &SettingsStore,
    ) -> LifecycleResult<StopOutcome> {
        let index = self
            .position(name)
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        if !self.entries[index].record.started {
            return Err(LifecycleError::NotRunning(name.to_string()));
        }

        let dependents: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.record.started && e.record.dependencies.iter().any(|d| d == name))
            .map(|e| e.record.name.clone())
            .collect();
        if !dependents.is_empty() {
            return Err(LifecycleError::HasDependents {
                plugin: name.to_string(),
                dependents,
            });
        }

        let (unregistered, restart_needed) = registry.unregister_owner(name);
        let plugin = Arc::clone(&self.entries[index].plugin);
        let ctx = PluginContext::new(name, settings.snapshot());
        let hook_error = plugin.stop(&ctx).await.err();
        if let Some(err) = &hook_error {
            warn!(plugin = %name, "stop hook failed: {err}");
        }

        let record = &mut self.entries[index].record;
        record.state = PluginState::Stopped;
        record.started = false;
        record.patches.clear();
        if restart_needed {
            info!(plugin = %name, "plugin stopped; restart required to undo applied patches");
        } else {
            info!(plugin = %name, "plugin stopped");
        }

        Ok(StopOutcome {
            restart_needed,
            unregistered,
            hook_error,
        })
    }

    /// Commit an option value (or the `enabled` toggle) for a plugin.
    pub fn update_setting(
        &mut self,
        plugin: &str,
        key: &str,
        value: impl Into<SettingValue>,
        settings: &mut SettingsStore,
    ) -> LifecycleResult<SettingChange> {
        let index = self
            .position(plugin)
            .ok_or_else(|| LifecycleError::NotFound(plugin.to_string()))?;

        let restart_needed = if key == ENABLED_KEY {
            true
        } else {
            self.entries[index]
                .options
                .iter()
                .find(|o| o.key == key)
                .map(|o| o.restart_needed)
                .ok_or_else(|| LifecycleError::UnknownSetting {
                    plugin: plugin.to_string(),
                    key: key.to_string(),
                })?
        };

        let previous = settings.set(plugin, key, value);
        debug!(plugin = %plugin, key = %key, restart_needed, "setting updated");
        Ok(SettingChange {
            previous,
            restart_needed,
        })
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.record.name == name)
    }

    pub fn record(&self, name: &str) -> Option<&PluginRecord> {
        self.position(name).map(|i| &self.entries[i].record)
    }

    pub fn records(&self) -> impl Iterator<Item = &PluginRecord> {
        self.entries.iter().map(|e| &e.record)
    }

    pub fn plugin(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.position(name).map(|i| &self.entries[i].plugin)
    }

    pub fn options(&self, name: &str) -> Option<&[SettingOption]> {
        self.position(name).map(|i| self.entries[i].options.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Patch;
    use crate::rewrite::{Matcher, Replacement};
    use async_trait::async_trait;

    struct TestPlugin {
        name: &'static str,
        deps: Vec<String>,
        required: bool,
        host: Option<&'static str>,
        fail_start: bool,
    }

    impl TestPlugin {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                deps: Vec::new(),
                required: false,
                host: None,
                fail_start: false,
            }
        }

        fn deps(mut self, deps: &[&str]) -> Self {
            self.deps = deps.iter().map(|d| d.to_string()).collect();
            self
        }
    }

    #[async_trait]
    impl Plugin for TestPlugin {
        fn name(&self) -> &str {
            self.name
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        fn required(&self) -> bool {
            self.required
        }

        fn enabled_by_default(&self) -> bool {
            true
        }

        fn host_version(&self) -> Option<&str> {
            self.host
        }

        fn patches(&self) -> Vec<Patch> {
            vec![Patch::new(self.name, "foo")
                .replace(Replacement::new(Matcher::literal("foo").unwrap(), "bar"))]
        }

        fn settings(&self) -> Vec<SettingOption> {
            vec![
                SettingOption::boolean("verbose", false),
                SettingOption::slider("level", 0.0, 5.0, 1.0).restart_needed(),
            ]
        }

        async fn start(&self, _ctx: &PluginContext) -> Result<(), HookError> {
            if self.fail_start {
                Err(HookError::msg("refused"))
            } else {
                Ok(())
            }
        }
    }

    fn manager(plugins: Vec<TestPlugin>, settings: &mut SettingsStore) -> PluginManager {
        let mut m = PluginManager::new().with_host_version("1.5.0");
        for p in plugins {
            m.add(Arc::new(p), settings).unwrap();
        }
        m
    }

    #[tokio::test]
    async fn starts_in_dependency_order_and_arms_patches() {
        let mut settings = SettingsStore::new();
        let mut registry = PatchRegistry::new();
        let mut m = manager(
            vec![TestPlugin::new("App").deps(&["Core"]), TestPlugin::new("Core")],
            &mut settings,
        );

        let summary = m.boot(&mut registry, &mut settings).await;
        assert_eq!(summary.started, vec!["Core", "App"]);
        assert_eq!(registry.patches_for("foo").len(), 2);
        assert_eq!(m.record("App").unwrap().patches.len(), 1);
        assert_eq!(settings.get("Core", "level"), Some(&SettingValue::Number(1.0)));
    }

    #[tokio::test]
    async fn disabled_dependency_fails_dependent() {
        let mut settings = SettingsStore::new();
        settings.set_plugin_enabled("Core", false);
        let mut registry = PatchRegistry::new();
        let mut m = manager(
            vec![TestPlugin::new("App").deps(&["Core"]), TestPlugin::new("Core")],
            &mut settings,
        );

        let summary = m.boot(&mut registry, &mut settings).await;
        assert!(summary.started.is_empty());
        assert_eq!(m.record("Core").unwrap().state, PluginState::Disabled);
        let app = m.record("App").unwrap();
        assert_eq!(app.state, PluginState::DependencyFailed);
        assert!(app.patches.is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unknown_dependency_suggests_a_name() {
        let mut settings = SettingsStore::new();
        let mut registry = PatchRegistry::new();
        let mut m = manager(
            vec![TestPlugin::new("App").deps(&["Cor"]), TestPlugin::new("Core")],
            &mut settings,
        );

        m.boot(&mut registry, &mut settings).await;
        let failure = m.record("App").unwrap().failure.clone().unwrap();
        assert!(failure.to_string().contains("did you mean 'Core'"));
    }

    #[tokio::test]
    async fn cycle_fails_only_its_members() {
        let mut settings = SettingsStore::new();
        let mut registry = PatchRegistry::new();
        let mut m = manager(
            vec![
                TestPlugin::new("X").deps(&["Y"]),
                TestPlugin::new("Y").deps(&["X"]),
                TestPlugin::new("Free"),
            ],
            &mut settings,
        );

        let summary = m.boot(&mut registry, &mut settings).await;
        assert_eq!(summary.started, vec!["Free"]);
        assert!(matches!(
            m.record("X").unwrap().failure,
            Some(LifecycleError::CircularDependency { .. })
        ));
        assert_eq!(m.record("Y").unwrap().state, PluginState::DependencyFailed);
    }

    #[tokio::test]
    async fn start_failure_unregisters_patches() {
        let mut settings = SettingsStore::new();
        let mut registry = PatchRegistry::new();
        let mut broken = TestPlugin::new("Broken");
        broken.fail_start = true;
        let mut m = manager(vec![broken], &mut settings);

        let summary = m.boot(&mut registry, &mut settings).await;
        assert_eq!(m.record("Broken").unwrap().state, PluginState::StartFailed);
        assert!(registry.is_empty());
        assert!(summary.fatals.is_empty());
    }

    #[tokio::test]
    async fn required_plugin_failure_is_fatal_and_always_enabled() {
        let mut settings = SettingsStore::new();
        settings.set_plugin_enabled("Core", false);
        let mut registry = PatchRegistry::new();
        let mut core = TestPlugin::new("Core");
        core.required = true;
        core.fail_start = true;
        let mut m = manager(vec![core], &mut settings);

        let summary = m.boot(&mut registry, &mut settings).await;
        assert!(m.record("Core").unwrap().enabled);
        assert_eq!(summary.fatals.len(), 1);
        assert_eq!(summary.fatals[0].plugin, "Core");
    }

    #[tokio::test]
    async fn incompatible_host_version() {
        let mut settings = SettingsStore::new();
        let mut registry = PatchRegistry::new();
        let mut old = TestPlugin::new("Old");
        old.host = Some("<1.0.0");
        let mut m = manager(vec![old], &mut settings);

        m.boot(&mut registry, &mut settings).await;
        assert_eq!(m.record("Old").unwrap().state, PluginState::Incompatible);
    }

    #[tokio::test]
    async fn stop_reports_restart_and_guards_dependents() {
        let mut settings = SettingsStore::new();
        let mut registry = PatchRegistry::new();
        let mut m = manager(
            vec![TestPlugin::new("App").deps(&["Core"]), TestPlugin::new("Core")],
            &mut settings,
        );
        m.boot(&mut registry, &mut settings).await;

        let err = m.stop("Core", &mut registry, &settings).await.unwrap_err();
        assert!(matches!(err, LifecycleError::HasDependents { .. }));

        let app_patch = m.record("App").unwrap().patches[0];
        registry.record_applied(app_patch, "42");
        let outcome = m.stop("App", &mut registry, &settings).await.unwrap();
        assert!(outcome.restart_needed);
        assert_eq!(m.record("App").unwrap().state, PluginState::Stopped);

        let outcome = m.stop("Core", &mut registry, &settings).await.unwrap();
        assert!(!outcome.restart_needed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let mut settings = SettingsStore::new();
        let mut registry = PatchRegistry::new();
        let mut m = manager(vec![TestPlugin::new("Solo")], &mut settings);
        m.boot(&mut registry, &mut settings).await;
        m.stop("Solo", &mut registry, &settings).await.unwrap();

        m.start("Solo", &mut registry, &mut settings).await.unwrap();
        assert_eq!(m.record("Solo").unwrap().state, PluginState::Started);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn update_setting_reports_restart_needed() {
        let mut settings = SettingsStore::new();
        let mut m = manager(vec![TestPlugin::new("P")], &mut settings);

        let change = m.update_setting("P", "verbose", true, &mut settings).unwrap();
        assert!(!change.restart_needed);
        assert_eq!(change.previous, Some(SettingValue::Bool(false)));

        let change = m.update_setting("P", "level", 3.0, &mut settings).unwrap();
        assert!(change.restart_needed);

        assert!(matches!(
            m.update_setting("P", "nope", 1.0, &mut settings),
            Err(LifecycleError::UnknownSetting { .. })
        ));
    }
}
