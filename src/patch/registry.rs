use crate::patch::schema::{Patch, PatchError};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Opaque, monotonically increasing patch handle. Never reused, even after
/// [`PatchRegistry::clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PatchId(u64);

impl PatchId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct Entry {
    id: PatchId,
    patch: Patch,
    armed: bool,
    consumed: bool,
    applied_to: BTreeSet<String>,
    /// Set when a module offered this patch found its predicate true
    /// (`attempted`) or false (`skipped`).
    attempted: bool,
    skipped: bool,
}

/// Ordered set of registered patches.
///
/// Registration order is application order; a `Vec` keeps that order without
/// a secondary index.
#[derive(Debug)]
pub struct PatchRegistry {
    entries: Vec<Entry>,
    next_id: u64,
}

impl Default for PatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Register an armed patch, offered to modules immediately.
    pub fn register(&mut self, patch: Patch) -> Result<PatchId, PatchError> {
        self.insert(patch, true)
    }

    /// Register a patch that stays dormant until [`arm_owner`](Self::arm_owner).
    pub fn register_inactive(&mut self, patch: Patch) -> Result<PatchId, PatchError> {
        self.insert(patch, false)
    }

    fn insert(&mut self, patch: Patch, armed: bool) -> Result<PatchId, PatchError> {
        patch.validate()?;
        let id = PatchId(self.next_id);
        self.next_id += 1;
        tracing::debug!(patch = %id, plugin = %patch.owner, find = %patch.find.describe(), "registered patch");
        self.entries.push(Entry {
            id,
            patch,
            armed,
            consumed: false,
            applied_to: BTreeSet::new(),
            attempted: false,
            skipped: false,
        });
        Ok(id)
    }

    /// Remove a patch. Returns it if it was registered.
    pub fn unregister(&mut self, id: PatchId) -> Option<Patch> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos).patch)
    }

    /// Remove every patch owned by `owner`, returning the ids removed and
    /// whether any of them had already patched a module.
    pub fn unregister_owner(&mut self, owner: &str) -> (Vec<PatchId>, bool) {
        let mut removed = Vec::new();
        let mut applied = false;
        self.entries.retain(|e| {
            if e.patch.owner == owner {
                removed.push(e.id);
                applied |= !e.applied_to.is_empty();
                false
            } else {
                true
            }
        });
        (removed, applied)
    }

    /// Arm or disarm every patch of `owner`. Returns how many changed.
    pub fn arm_owner(&mut self, owner: &str, armed: bool) -> usize {
        let mut changed = 0;
        for entry in self.entries.iter_mut().filter(|e| e.patch.owner == owner) {
            if entry.armed != armed {
                entry.armed = armed;
                changed += 1;
            }
        }
        changed
    }

    /// Retire a find-once patch. No-op for `all` patches.
    pub fn mark_consumed(&mut self, id: PatchId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            if !entry.patch.all {
                entry.consumed = true;
            }
        }
    }

    pub fn record_applied(&mut self, id: PatchId, module: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.applied_to.insert(module.to_string());
        }
    }

    /// Note that a module offered this patch actually ran it.
    pub fn record_attempt(&mut self, id: PatchId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.attempted = true;
        }
    }

    /// Note that the patch's predicate turned it off for one module.
    pub fn record_skipped(&mut self, id: PatchId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.skipped = true;
        }
    }

    /// Offered to at least one module, and its predicate was false every time.
    pub fn skipped_everywhere(&self, id: PatchId) -> bool {
        self.entries
            .iter()
            .any(|e| e.id == id && e.skipped && !e.attempted)
    }

    /// Patches offered to `source`: armed, not consumed, whose find criterion
    /// matches, in registration order.
    pub fn patches_for(&self, source: &str) -> Vec<(PatchId, &Patch)> {
        self.entries
            .iter()
            .filter(|e| e.armed && !e.consumed && e.patch.find.matches(source))
            .map(|e| (e.id, &e.patch))
            .collect()
    }

    pub fn get(&self, id: PatchId) -> Option<&Patch> {
        self.entries.iter().find(|e| e.id == id).map(|e| &e.patch)
    }

    pub fn is_armed(&self, id: PatchId) -> bool {
        self.entries.iter().any(|e| e.id == id && e.armed)
    }

    pub fn is_consumed(&self, id: PatchId) -> bool {
        self.entries.iter().any(|e| e.id == id && e.consumed)
    }

    /// Modules a patch has been applied to, sorted by id.
    pub fn applied_modules(&self, id: PatchId) -> Vec<&str> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.applied_to.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Armed patches that have never been applied to any module.
    pub fn unmatched(&self) -> Vec<(PatchId, &Patch)> {
        self.entries
            .iter()
            .filter(|e| e.armed && e.applied_to.is_empty())
            .map(|e| (e.id, &e.patch))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PatchId, &Patch)> {
        self.entries.iter().map(|e| (e.id, &e.patch))
    }

    pub fn ids_for_owner(&self, owner: &str) -> Vec<PatchId> {
        self.entries
            .iter()
            .filter(|e| e.patch.owner == owner)
            .map(|e| e.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every patch. Ids keep increasing afterwards.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
