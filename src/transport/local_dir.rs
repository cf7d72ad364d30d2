//! Built-in local-directory transport adapter.
//!
//! Works when both parties share a filesystem (single-host deployments and
//! the test harness). The handle is a plain path to the delegator's export
//! tree; setup copies it into the executor work path, and the snapshot
//! payload is a JSON file map of the work path at capture time.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::models::resource::Resource;
use crate::{AwcpError, Result};

use super::{
    DelegatorTransport, DependencyCheck, ExecutorTransport, SnapshotPayload, TransportCapabilities,
    TransportHandle,
};

/// Adapter discriminator used in handles.
pub const KIND: &str = "local_dir";

/// Directory name for the export manifest; never part of a snapshot.
const META_DIR: &str = ".awcp";

/// Handle body for the local-directory adapter.
#[derive(Debug, Serialize, Deserialize)]
struct LocalHandle {
    /// Delegator-side export tree to copy from.
    path: PathBuf,
}

/// Snapshot payload body: resource-relative path to base64 file content.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalSnapshot {
    files: BTreeMap<String, String>,
}

/// Copy-based adapter implementing both halves of the contract.
#[derive(Debug, Default)]
pub struct LocalDirTransport;

impl LocalDirTransport {
    /// Construct the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn caps() -> TransportCapabilities {
        TransportCapabilities {
            supports_snapshots: true,
            live_sync: false,
        }
    }
}

impl DelegatorTransport for LocalDirTransport {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn capabilities(&self) -> TransportCapabilities {
        Self::caps()
    }

    fn initialize(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn prepare<'a>(
        &'a self,
        delegation_id: &'a str,
        export_path: &'a Path,
        _ttl_seconds: u64,
    ) -> Pin<Box<dyn Future<Output = Result<TransportHandle>> + Send + 'a>> {
        Box::pin(async move {
            if !export_path.is_dir() {
                return Err(AwcpError::Transport(format!(
                    "export path missing for delegation {delegation_id}"
                )));
            }
            TransportHandle::new(
                KIND,
                &LocalHandle {
                    path: export_path.to_path_buf(),
                },
            )
        })
    }

    fn apply_snapshot<'a>(
        &'a self,
        delegation_id: &'a str,
        payload: &'a SnapshotPayload,
        rw_resources: &'a [Resource],
        export_path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if !payload.verify() {
                return Err(AwcpError::Transport(format!(
                    "snapshot payload checksum mismatch for delegation {delegation_id}"
                )));
            }
            let snapshot: LocalSnapshot = serde_json::from_slice(&payload.data)
                .map_err(|err| AwcpError::Transport(format!("snapshot decode: {err}")))?;

            for resource in rw_resources {
                let rules = resource.selection()?;
                let prefix = format!("{}/", resource.name);

                // The export tree is the reconciliation target; when it was
                // materialized as a copy, the declared source receives the
                // same merge so every strategy observes identical results.
                let roots = sync_roots(export_path, resource);

                for root in &roots {
                    // Write or overwrite every payload file selected for
                    // this resource; the payload is the whole
                    // materialization, so files it no longer contains are
                    // removed afterwards.
                    let mut kept: Vec<PathBuf> = Vec::new();
                    for (rel, encoded) in &snapshot.files {
                        let Some(inner) = rel.strip_prefix(&prefix) else {
                            continue;
                        };
                        if !rules.matches(Path::new(inner)) {
                            continue;
                        }
                        let bytes = B64.decode(encoded.as_bytes()).map_err(|err| {
                            AwcpError::Transport(format!("payload decode: {err}"))
                        })?;
                        let target = root.join(inner);
                        if let Some(parent) = target.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(&target, bytes)?;
                        kept.push(target);
                    }

                    remove_unlisted(root, &rules, &kept)?;
                }
            }

            debug!(
                delegation_id,
                files = snapshot.files.len(),
                "snapshot applied to export tree"
            );
            Ok(())
        })
    }

    fn release<'a>(
        &'a self,
        _delegation_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        // Nothing to revoke: the handle is a plain path and the export tree
        // lifetime belongs to the materializer.
        Box::pin(async { Ok(()) })
    }
}

impl ExecutorTransport for LocalDirTransport {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn capabilities(&self) -> TransportCapabilities {
        Self::caps()
    }

    fn initialize<'a>(
        &'a self,
        _work_root: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn check_dependency(&self) -> Pin<Box<dyn Future<Output = Result<DependencyCheck>> + Send + '_>> {
        Box::pin(async { Ok(DependencyCheck::available()) })
    }

    fn setup<'a>(
        &'a self,
        delegation_id: &'a str,
        handle: &'a TransportHandle,
        work_path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<PathBuf>> + Send + 'a>> {
        Box::pin(async move {
            if handle.kind != KIND {
                return Err(AwcpError::Transport(format!(
                    "handle kind '{}' does not match adapter '{KIND}'",
                    handle.kind
                )));
            }
            let local: LocalHandle = handle.decode()?;
            if !local.path.is_dir() {
                return Err(AwcpError::Transport(format!(
                    "source tree {} is not a directory",
                    local.path.display()
                )));
            }
            copy_tree(&local.path, work_path)?;
            debug!(delegation_id, work_path = %work_path.display(), "work path materialized");
            Ok(work_path.to_path_buf())
        })
    }

    fn capture_snapshot<'a>(
        &'a self,
        delegation_id: &'a str,
        work_path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SnapshotPayload>>> + Send + 'a>> {
        Box::pin(async move {
            let mut snapshot = LocalSnapshot::default();
            for entry in WalkDir::new(work_path).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(work_path)
                    .map_err(|err| AwcpError::Transport(format!("capture prefix: {err}")))?;
                if rel.components().next().is_some_and(|c| c.as_os_str() == META_DIR) {
                    continue;
                }
                let content = std::fs::read(entry.path())?;
                snapshot
                    .files
                    .insert(path_to_slash(rel), B64.encode(&content));
            }
            let data = serde_json::to_vec(&snapshot)
                .map_err(|err| AwcpError::Transport(format!("snapshot encode: {err}")))?;
            debug!(
                delegation_id,
                files = snapshot.files.len(),
                "snapshot captured"
            );
            Ok(Some(SnapshotPayload::from_bytes(data)))
        })
    }

    fn release<'a>(
        &'a self,
        _delegation_id: &'a str,
        _work_path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        // Work path deletion belongs to the workspace manager.
        Box::pin(async { Ok(()) })
    }
}

/// Recursively copy `src` into `dst`, preserving the directory shape.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).into_iter().filter_map(|e| e.ok()) {
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|err| AwcpError::Transport(format!("copy prefix: {err}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Reconciliation targets for one read-write resource.
///
/// Always the export subtree; additionally the declared source directory
/// when it resolves to a distinct location (copy-materialized exports).
fn sync_roots(export_path: &Path, resource: &Resource) -> Vec<PathBuf> {
    let export_root = export_path.join(&resource.name);
    let mut roots = vec![export_root.clone()];

    let source = PathBuf::from(&resource.source);
    let same = match (export_root.canonicalize(), source.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if !same && source.is_dir() {
        roots.push(source);
    }
    roots
}

/// Delete files under `root` that match `rules` but are not in `kept`.
fn remove_unlisted(
    root: &Path,
    rules: &crate::models::resource::SelectionRules,
    kept: &[PathBuf],
) -> Result<()> {
    if !root.is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|err| AwcpError::Transport(format!("prune prefix: {err}")))?;
        if !rules.matches(rel) {
            continue;
        }
        if kept.iter().any(|k| k == entry.path()) {
            continue;
        }
        if let Err(err) = std::fs::remove_file(entry.path()) {
            warn!(path = %entry.path().display(), %err, "failed to prune file during apply");
        }
    }
    Ok(())
}

/// Render a relative path with forward slashes for payload keys.
fn path_to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
