//! On-disk snapshots of patched module source, for diagnosing patches.

use crate::module::{ModuleId, ModuleInterceptor};
use crate::safety::{OutputGuard, SafetyError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error(transparent)]
    Unsafe(#[from] SafetyError),

    #[error("failed to write snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum SnapshotResult {
    Written { path: PathBuf, bytes: usize },
    /// File already held identical content.
    Unchanged { path: PathBuf },
}

impl SnapshotResult {
    pub fn path(&self) -> &Path {
        match self {
            SnapshotResult::Written { path, .. } | SnapshotResult::Unchanged { path } => path,
        }
    }
}

/// File name for a module's snapshot. Anything outside `[A-Za-z0-9._-]`
/// becomes `_`, and an id changed that way gets a hash of the original id
/// appended so that `a/b` and `a_b` land in different files.
pub fn snapshot_file_name(id: &ModuleId) -> String {
    let sanitized: String = id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches('.');
    let hash = xxh3_64(id.as_str().as_bytes());
    if sanitized.is_empty() {
        format!("module_{hash:016x}.js")
    } else if sanitized != id.as_str() {
        format!("{sanitized}_{hash:016x}.js")
    } else {
        format!("{sanitized}.js")
    }
}

/// Write one snapshot, skipping the write when content is unchanged.
pub fn write_snapshot(
    guard: &OutputGuard,
    id: &ModuleId,
    source: &str,
) -> Result<SnapshotResult, SnapshotError> {
    let path = guard.resolve(snapshot_file_name(id))?;

    if let Ok(existing) = fs::read(&path) {
        if xxh3_64(&existing) == xxh3_64(source.as_bytes()) {
            return Ok(SnapshotResult::Unchanged { path });
        }
    }

    atomic_write(&path, source.as_bytes()).map_err(|source| SnapshotError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(SnapshotResult::Written {
        path,
        bytes: source.len(),
    })
}

/// Snapshot every patched module held by `interceptor` into `dir`.
pub fn write_patched_sources(
    interceptor: &ModuleInterceptor,
    dir: impl AsRef<Path>,
) -> Result<Vec<SnapshotResult>, SnapshotError> {
    let guard = OutputGuard::new(dir)?;
    let mut results = Vec::new();
    for record in interceptor.records() {
        if let Some(source) = &record.patched_source {
            results.push(write_snapshot(&guard, &record.id, source)?);
        }
    }
    tracing::debug!(count = results.len(), dir = %guard.root().display(), "wrote patched module snapshots");
    Ok(results)
}

/// Atomic file write: tempfile in the same directory, fsync, rename.
fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
