use crate::module::compile::{CompileError, FactoryCompiler};
use crate::module::factory::{ModuleExports, ModuleFactory, ModuleId};
use crate::patch::{Patch, PatchId, PatchRegistry};
use crate::rewrite::{MatchMiss, ReplaceContext, ReplacementThrow};
use crate::settings::SettingsSnapshot;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use xxhash_rust::xxh3::xxh3_64;

/// Default expression plugin references (`$self`) are rooted at.
pub const DEFAULT_SELF_REF_ROOT: &str = "modpatch.plugins";

/// Events a slow subscriber may fall behind by before it starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Where a module is in its interception lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Registered,
    /// At least one armed patch's find criterion matched.
    Matched,
    Patched,
    /// Patches matched but none could be applied.
    PatchFailed,
    Stored,
}

/// Why a patch did not (fully) apply to a module.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticKind {
    Miss(MatchMiss),
    Threw(ReplacementThrow),
    GroupReverted,
    NoEffect,
    Recompile(CompileError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchDiagnostic {
    pub patch: PatchId,
    pub plugin: String,
    pub kind: DiagnosticKind,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::Miss(miss) => write!(f, "{miss}"),
            DiagnosticKind::Threw(err) => write!(f, "{err}"),
            DiagnosticKind::GroupReverted => write!(f, "group reverted"),
            DiagnosticKind::NoEffect => write!(f, "no replacement had any effect"),
            DiagnosticKind::Recompile(err) => write!(f, "patched source failed to compile: {err}"),
        }
    }
}

impl fmt::Display for PatchDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "patch {} by {}: {}", self.patch, self.plugin, self.kind)
    }
}

/// Failure of a `required` patch. The host cannot be trusted to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartupFatal {
    pub plugin: String,
    pub patch: Option<PatchId>,
    pub module: Option<ModuleId>,
    pub reason: String,
}

impl fmt::Display for StartupFatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.plugin)?;
        if let Some(patch) = self.patch {
            write!(f, " patch {patch}")?;
        }
        if let Some(module) = &self.module {
            write!(f, " in module {module}")?;
        }
        write!(f, ": {}", self.reason)
    }
}

/// Emitted once per module when its factory is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleLoaded {
    pub id: ModuleId,
    pub patched: bool,
    pub plugins: Vec<String>,
    pub patch_ids: Vec<PatchId>,
    pub errors: Vec<String>,
}

#[derive(Debug)]
pub struct ModuleRecord {
    pub id: ModuleId,
    pub original: ModuleFactory,
    pub patched: Option<ModuleFactory>,
    pub applied_patch_ids: BTreeSet<PatchId>,
    pub patched_source: Option<String>,
    /// xxh3 of the original source; detects a changed re-registration.
    pub source_hash: u64,
    pub state: ModuleState,
    pub history: Vec<ModuleState>,
    pub diagnostics: Vec<PatchDiagnostic>,
    pub event: ModuleLoaded,
    /// Cached result of the first successful execution.
    pub exports: Option<Arc<ModuleExports>>,
}

impl ModuleRecord {
    /// The factory handed back to the host.
    pub fn factory(&self) -> &ModuleFactory {
        self.patched.as_ref().unwrap_or(&self.original)
    }

    fn transition(&mut self, state: ModuleState) {
        tracing::trace!(module = %self.id, ?state, "module state");
        self.state = state;
        self.history.push(state);
    }
}

/// Return value of [`ModuleInterceptor::intercept`].
#[derive(Debug, Clone)]
pub struct Intercepted {
    pub factory: ModuleFactory,
    pub event: ModuleLoaded,
    /// The id was already known; the stored factory was returned untouched.
    pub reused: bool,
}

/// Rewrites module factories as the host registers them.
pub struct ModuleInterceptor {
    compiler: Arc<dyn FactoryCompiler>,
    self_ref_root: String,
    records: BTreeMap<ModuleId, ModuleRecord>,
    order: Vec<ModuleId>,
    events: broadcast::Sender<ModuleLoaded>,
}

impl ModuleInterceptor {
    pub fn new(compiler: Arc<dyn FactoryCompiler>) -> Self {
        Self {
            compiler,
            self_ref_root: DEFAULT_SELF_REF_ROOT.to_string(),
            records: BTreeMap::new(),
            order: Vec::new(),
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    pub fn with_self_ref_root(mut self, root: impl Into<String>) -> Self {
        self.self_ref_root = root.into();
        self
    }

    /// Expression `$self` expands to for `plugin`.
    pub fn self_reference(&self, plugin: &str) -> String {
        format!("{}[{:?}]", self.self_ref_root, plugin)
    }

    /// Patch `factory` and store exactly one factory for `id`.
    ///
    /// Each applicable patch runs against the output of the previous ones and
    /// the result is recompiled; a patch whose output does not compile is
    /// rolled back to the last good text. Never fails: problems end up in the
    /// record's diagnostics. Every newly stored module is announced to
    /// [`subscribe`](Self::subscribe) receivers.
    pub fn intercept(
        &mut self,
        id: ModuleId,
        factory: ModuleFactory,
        registry: &mut PatchRegistry,
        settings: &SettingsSnapshot,
    ) -> Intercepted {
        let source_hash = xxh3_64(factory.source().as_bytes());

        if let Some(existing) = self.records.get(&id) {
            if existing.source_hash != source_hash {
                tracing::warn!(module = %id, "module re-registered with different source; keeping the stored factory");
            } else {
                tracing::debug!(module = %id, "module re-registered; returning stored factory");
            }
            return Intercepted {
                factory: existing.factory().clone(),
                event: existing.event.clone(),
                reused: true,
            };
        }

        let mut record = ModuleRecord {
            id: id.clone(),
            original: factory,
            patched: None,
            applied_patch_ids: BTreeSet::new(),
            patched_source: None,
            source_hash,
            state: ModuleState::Registered,
            history: vec![ModuleState::Registered],
            diagnostics: Vec::new(),
            event: ModuleLoaded {
                id: id.clone(),
                patched: false,
                plugins: Vec::new(),
                patch_ids: Vec::new(),
                errors: Vec::new(),
            },
            exports: None,
        };

        let candidates: Vec<_> = registry
            .patches_for(record.original.source())
            .into_iter()
            .map(|(pid, patch)| (pid, patch.clone()))
            .collect();

        if !candidates.is_empty() {
            record.transition(ModuleState::Matched);
            self.run_patches(&mut record, candidates, registry, settings);
        }
        record.transition(ModuleState::Stored);

        record.event.patched = record.patched.is_some();
        record.event.patch_ids = record.applied_patch_ids.iter().copied().collect();
        record.event.errors = record.diagnostics.iter().map(ToString::to_string).collect();

        let intercepted = Intercepted {
            factory: record.factory().clone(),
            event: record.event.clone(),
            reused: false,
        };
        self.order.push(id.clone());
        self.records.insert(id, record);
        // No subscribers is fine.
        let _ = self.events.send(intercepted.event.clone());
        intercepted
    }

    /// Stream of [`ModuleLoaded`] events for modules stored from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ModuleLoaded> {
        self.events.subscribe()
    }

    fn run_patches(
        &mut self,
        record: &mut ModuleRecord,
        candidates: Vec<(PatchId, Patch)>,
        registry: &mut PatchRegistry,
        settings: &SettingsSnapshot,
    ) {
        let mut checkpoint = record.original.source().to_string();
        let mut plugins = BTreeSet::new();
        let mut attempted = false;

        for (pid, patch) in candidates {
            if let Some(predicate) = &patch.predicate {
                if !predicate.evaluate(settings, &patch.owner) {
                    tracing::debug!(module = %record.id, patch = %pid, plugin = %patch.owner, "patch predicate false; skipped");
                    registry.record_skipped(pid);
                    continue;
                }
            }
            attempted = true;
            registry.record_attempt(pid);

            let self_ref = self.self_reference(&patch.owner);
            let ctx = ReplaceContext {
                settings,
                plugin: &patch.owner,
                self_ref: Some(&self_ref),
            };
            let application = patch.apply(&checkpoint, &ctx);
            let outcome = &application.outcome;

            for miss in &outcome.warnings {
                if patch.no_warn {
                    tracing::debug!(module = %record.id, patch = %pid, plugin = %patch.owner, "{miss}");
                } else {
                    tracing::warn!(module = %record.id, patch = %pid, plugin = %patch.owner, "{miss}");
                }
                record.diagnostics.push(PatchDiagnostic {
                    patch: pid,
                    plugin: patch.owner.clone(),
                    kind: DiagnosticKind::Miss(miss.clone()),
                });
            }
            for err in &outcome.errors {
                tracing::warn!(module = %record.id, patch = %pid, plugin = %patch.owner, "{err}");
                record.diagnostics.push(PatchDiagnostic {
                    patch: pid,
                    plugin: patch.owner.clone(),
                    kind: DiagnosticKind::Threw(err.clone()),
                });
            }

            let failure = if application.reverted {
                Some(DiagnosticKind::GroupReverted)
            } else if !application.had_effect() {
                Some(DiagnosticKind::NoEffect)
            } else {
                match self.compiler.compile(&record.id, &outcome.result) {
                    Ok(compiled) => {
                        checkpoint = outcome.result.clone();
                        record.patched = Some(compiled);
                        record.applied_patch_ids.insert(pid);
                        plugins.insert(patch.owner.clone());
                        registry.record_applied(pid, record.id.as_str());
                        registry.mark_consumed(pid);
                        tracing::debug!(module = %record.id, patch = %pid, plugin = %patch.owner, "patch applied");
                        None
                    }
                    Err(err) => {
                        tracing::error!(module = %record.id, patch = %pid, plugin = %patch.owner, error = %err, "patched module failed to compile; patch reverted");
                        Some(DiagnosticKind::Recompile(err))
                    }
                }
            };

            if let Some(kind) = failure {
                let diagnostic = PatchDiagnostic {
                    patch: pid,
                    plugin: patch.owner.clone(),
                    kind,
                };
                // Misses and throws were already recorded above.
                let redundant = matches!(diagnostic.kind, DiagnosticKind::NoEffect)
                    && !(outcome.warnings.is_empty() && outcome.errors.is_empty());
                if !redundant {
                    record.diagnostics.push(diagnostic);
                }
            }
        }

        if record.patched.is_some() {
            record.patched_source = Some(checkpoint);
            record.transition(ModuleState::Patched);
        } else if attempted {
            record.transition(ModuleState::PatchFailed);
        }
        record.event.plugins = plugins.into_iter().collect();
    }

    pub fn record(&self, id: &ModuleId) -> Option<&ModuleRecord> {
        self.records.get(id)
    }

    pub(crate) fn record_mut(&mut self, id: &ModuleId) -> Option<&mut ModuleRecord> {
        self.records.get_mut(id)
    }

    /// Records in registration order.
    pub fn records(&self) -> impl Iterator<Item = &ModuleRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
    }
}
