use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Confines diagnostic output to one directory.
///
/// Snapshot file names derive from host-assigned module ids, which are not
/// trusted to be well-formed paths.
#[derive(Debug, Clone)]
pub struct OutputGuard {
    /// Canonical output directory
    root: PathBuf,
}

#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("path escapes output directory: {path} (output: {root})")]
    OutsideOutput { path: PathBuf, root: PathBuf },

    #[error("path must be relative to the output directory: {0}")]
    NotRelative(PathBuf),

    #[error("failed to canonicalize path: {0}")]
    Canonicalize(#[from] std::io::Error),
}

impl OutputGuard {
    /// Create the directory if needed and guard it.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, SafetyError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    /// Resolve `relative` inside the output directory.
    ///
    /// The file need not exist yet; its parent must, and must canonicalize
    /// to somewhere under the root (symlinks included).
    pub fn resolve(&self, relative: impl AsRef<Path>) -> Result<PathBuf, SafetyError> {
        let relative = relative.as_ref();
        let lexically_safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !lexically_safe || relative.as_os_str().is_empty() {
            return Err(SafetyError::NotRelative(relative.to_path_buf()));
        }

        let joined = self.root.join(relative);
        let parent = joined
            .parent()
            .map(Path::canonicalize)
            .transpose()?
            .unwrap_or_else(|| self.root.clone());
        if !parent.starts_with(&self.root) {
            return Err(SafetyError::OutsideOutput {
                path: joined,
                root: self.root.clone(),
            });
        }
        match joined.file_name() {
            Some(name) => Ok(parent.join(name)),
            None => Err(SafetyError::NotRelative(relative.to_path_buf())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
