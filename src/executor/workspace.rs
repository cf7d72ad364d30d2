//! Work path allocation under a single root directory.
//!
//! Every delegation owns a unique child of `work_root`; allocation is
//! mediated by an in-memory set so two delegations can never share a path.
//! Validation rejects traversal and symlink escapes so no caller-supplied
//! id can reach outside the root.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::{AwcpError, Result};

/// Allocates, prepares, and releases executor work paths.
pub struct WorkspaceManager {
    root: PathBuf,
    allocated: Mutex<HashSet<String>>,
}

impl WorkspaceManager {
    /// Create a manager over `root`, creating and canonicalizing it.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Workspace` if the root cannot be created or
    /// canonicalized.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .map_err(|err| AwcpError::Workspace(format!("cannot create work root: {err}")))?;
        let root = root
            .canonicalize()
            .map_err(|err| AwcpError::Workspace(format!("work root invalid: {err}")))?;
        Ok(Self {
            root,
            allocated: Mutex::new(HashSet::new()),
        })
    }

    /// The canonicalized root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reserve a work path for a delegation id.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::PathViolation` if the id would escape the root,
    /// or `AwcpError::Workspace` if the id is already allocated.
    pub fn allocate(&self, delegation_id: &str) -> Result<PathBuf> {
        let path = self.validate(delegation_id)?;
        let mut allocated = self
            .allocated
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !allocated.insert(delegation_id.to_owned()) {
            return Err(AwcpError::Workspace(format!(
                "work path for delegation {delegation_id} is already allocated"
            )));
        }
        Ok(path)
    }

    /// Create the directory for an allocated path, refusing non-empty ones.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Workspace` if creation fails or the directory
    /// already contains entries.
    pub fn prepare(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)
            .map_err(|err| AwcpError::Workspace(format!("cannot create work path: {err}")))?;
        let mut entries = std::fs::read_dir(path)
            .map_err(|err| AwcpError::Workspace(format!("cannot read work path: {err}")))?;
        if entries.next().is_some() {
            return Err(AwcpError::Workspace(format!(
                "work path {} is not empty",
                path.display()
            )));
        }
        Ok(())
    }

    /// Delete a work path and free its allocation. Idempotent and
    /// fault-tolerant: a missing directory is not an error, and deletion
    /// failures are logged without masking the caller's flow.
    pub fn release(&self, delegation_id: &str, path: &Path) {
        match std::fs::remove_dir_all(path) {
            Ok(()) => info!(delegation_id, path = %path.display(), "work path released"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(delegation_id, path = %path.display(), %err, "work path deletion failed");
            }
        }
        self.allocated
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(delegation_id);
    }

    /// Delete children of the root that are not currently allocated,
    /// reclaiming space left by prior crashes. Returns the removed count.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Workspace` if the root cannot be listed.
    pub fn cleanup_stale(&self) -> Result<usize> {
        let allocated = self
            .allocated
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let entries = std::fs::read_dir(&self.root)
            .map_err(|err| AwcpError::Workspace(format!("cannot read work root: {err}")))?;

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if allocated.contains(&name) {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "stale work directory removed");
                    removed += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to remove stale work directory");
                }
            }
        }
        Ok(removed)
    }

    /// Resolve a delegation id to a path strictly under the root.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::PathViolation` for absolute ids, traversal
    /// segments, or symlink targets escaping the root.
    pub fn validate(&self, delegation_id: &str) -> Result<PathBuf> {
        let candidate = Path::new(delegation_id);
        let mut normalized = PathBuf::new();
        for component in candidate.components() {
            match component {
                Component::ParentDir => {
                    return Err(AwcpError::PathViolation(
                        "delegation id attempts to escape work root".into(),
                    ));
                }
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) => {
                    return Err(AwcpError::PathViolation(
                        "delegation id must not be an absolute path".into(),
                    ));
                }
                Component::Normal(part) => normalized.push(part),
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(AwcpError::PathViolation("delegation id is empty".into()));
        }

        let absolute = self.root.join(normalized);
        if !absolute.starts_with(&self.root) {
            return Err(AwcpError::PathViolation(
                "work path outside work root".into(),
            ));
        }

        // Symlink escape detection for pre-existing paths.
        if absolute.exists() {
            let canonical = absolute.canonicalize().map_err(|err| {
                AwcpError::PathViolation(format!("cannot resolve work path: {err}"))
            })?;
            if !canonical.starts_with(&self.root) {
                return Err(AwcpError::PathViolation(
                    "symlink target escapes work root".into(),
                ));
            }
            return Ok(canonical);
        }
        Ok(absolute)
    }
}
