//! Export tree construction from logical resources.
//!
//! Each resource surfaces under `<export>/<name>/…`, filtered by its
//! selection rules; a manifest at `<export>/.awcp/manifest.json` makes the
//! tree self-describing. A failed materialization rolls the whole tree back
//! so admission failures never leave half-built exports behind.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::models::resource::{AccessMode, Resource};
use crate::protocol::PROTOCOL_VERSION;
use crate::{AwcpError, Result};

/// How resource content reaches the export tree.
///
/// Correctness is identical across strategies; copy is the safe default,
/// symlink avoids duplication when the transport tolerates it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MaterializeStrategy {
    /// Copy selected files into the export tree.
    #[default]
    Copy,
    /// Symlink the resource root into the export tree.
    Symlink,
}

/// Manifest written at the export root.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExportManifest {
    /// Protocol version of the engine that produced the tree.
    pub version: String,
    /// Owning delegation.
    pub delegation_id: String,
    /// When the tree was materialized.
    pub created_at: DateTime<Utc>,
    /// Declared resources and modes.
    pub resources: Vec<ManifestResource>,
}

/// One resource entry in the manifest.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ManifestResource {
    /// Resource name, also the top-level directory.
    pub name: String,
    /// Declared access mode.
    pub mode: AccessMode,
}

/// Builds and removes per-delegation export trees.
pub struct ResourceMaterializer {
    environments_dir: PathBuf,
    strategy: MaterializeStrategy,
}

impl ResourceMaterializer {
    /// Create a materializer rooted at the environments directory.
    #[must_use]
    pub fn new(environments_dir: impl Into<PathBuf>, strategy: MaterializeStrategy) -> Self {
        Self {
            environments_dir: environments_dir.into(),
            strategy,
        }
    }

    /// Build the export tree for a delegation.
    ///
    /// Rolls back the entire tree on any failure.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Io` or `AwcpError::Config` on filesystem or
    /// selection-rule failures.
    pub fn materialize(&self, delegation_id: &str, resources: &[Resource]) -> Result<PathBuf> {
        let export = self.environments_dir.join(delegation_id);
        if export.exists() {
            return Err(AwcpError::Io(format!(
                "export tree {} already exists",
                export.display()
            )));
        }

        let outcome = self.build(delegation_id, resources, &export);
        if let Err(err) = &outcome {
            warn!(delegation_id, %err, "materialization failed; rolling back export tree");
            if let Err(cleanup_err) = std::fs::remove_dir_all(&export) {
                if cleanup_err.kind() != std::io::ErrorKind::NotFound {
                    warn!(delegation_id, %cleanup_err, "export rollback failed");
                }
            }
        }
        outcome?;

        info!(delegation_id, export = %export.display(), "export tree materialized");
        Ok(export)
    }

    /// Remove a delegation's export tree. Missing trees are not an error.
    pub fn remove(&self, delegation_id: &str) {
        let export = self.environments_dir.join(delegation_id);
        match std::fs::remove_dir_all(&export) {
            Ok(()) => info!(delegation_id, "export tree removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(delegation_id, %err, "export tree removal failed"),
        }
    }

    /// Delete export trees with no backing delegation record.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Io` if the environments directory cannot be read.
    pub fn sweep_stale(&self, known_ids: &[String]) -> Result<usize> {
        if !self.environments_dir.is_dir() {
            return Ok(0);
        }
        let entries = std::fs::read_dir(&self.environments_dir)
            .map_err(|err| AwcpError::Io(format!("environments list: {err}")))?;

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if known_ids.iter().any(|id| *id == name) {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "stale export tree removed");
                    removed += 1;
                }
                Err(err) => warn!(path = %path.display(), %err, "stale export removal failed"),
            }
        }
        Ok(removed)
    }

    fn build(&self, delegation_id: &str, resources: &[Resource], export: &Path) -> Result<()> {
        std::fs::create_dir_all(export)?;

        for resource in resources {
            let source = Path::new(&resource.source);
            if !source.is_dir() {
                return Err(AwcpError::Io(format!(
                    "resource '{}' source {} is not a directory",
                    resource.name,
                    source.display()
                )));
            }
            let target = export.join(&resource.name);

            match self.strategy {
                MaterializeStrategy::Copy => {
                    let rules = resource.selection()?;
                    copy_selected(source, &target, &rules)?;
                }
                MaterializeStrategy::Symlink => {
                    link_resource(source, &target)?;
                }
            }
        }

        let manifest = ExportManifest {
            version: PROTOCOL_VERSION.into(),
            delegation_id: delegation_id.to_owned(),
            created_at: Utc::now(),
            resources: resources
                .iter()
                .map(|r| ManifestResource {
                    name: r.name.clone(),
                    mode: r.mode,
                })
                .collect(),
        };
        let meta_dir = export.join(".awcp");
        std::fs::create_dir_all(&meta_dir)?;
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| AwcpError::Io(format!("manifest encode: {err}")))?;
        std::fs::write(meta_dir.join("manifest.json"), json)?;

        Ok(())
    }
}

/// Copy files under `source` into `target`, honoring selection rules and
/// the never-shipped directory list the admission scan uses.
fn copy_selected(
    source: &Path,
    target: &Path,
    rules: &crate::models::resource::SelectionRules,
) -> Result<()> {
    std::fs::create_dir_all(target)?;
    let walker = WalkDir::new(source).into_iter().filter_entry(|entry| {
        !(entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| super::admission::SKIPPED_DIRS.contains(&name)))
    });
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| AwcpError::Io(format!("materialize prefix: {err}")))?;
        if !rules.matches(rel) {
            continue;
        }
        let dest = target.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(entry.path(), &dest)?;
    }
    Ok(())
}

#[cfg(unix)]
fn link_resource(source: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(source, target)
        .map_err(|err| AwcpError::Io(format!("symlink: {err}")))
}

#[cfg(not(unix))]
fn link_resource(source: &Path, target: &Path) -> Result<()> {
    std::os::windows::fs::symlink_dir(source, target)
        .map_err(|err| AwcpError::Io(format!("symlink: {err}")))
}
