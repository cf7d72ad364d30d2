//! Snapshot reception, staging, and reconciliation.
//!
//! Disposition follows the delegation's policy: `auto` applies on receipt,
//! `staged` persists the payload for an explicit apply, `discard` keeps
//! metadata only. At most one snapshot per delegation is ever applied; a
//! second apply is refused rather than guessing reversion semantics.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

use crate::errors::ErrorCode;
use crate::models::delegation::DelegationRecord;
use crate::models::snapshot::{SnapshotPolicy, SnapshotRecord, SnapshotStatus};
use crate::transport::{DelegatorTransport, SnapshotPayload};
use crate::{AwcpError, Result};

/// Sidecar metadata stored next to a staged payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
struct StagedMetadata {
    snapshot_id: String,
    delegation_id: String,
    summary: String,
    checksum: String,
    recommended: bool,
    created_at: DateTime<Utc>,
}

/// Fields of a received `snapshot` event, minus the payload.
#[derive(Debug, Clone)]
pub struct ReceivedSnapshot {
    /// Identifier, unique within the delegation.
    pub snapshot_id: String,
    /// Executor's change summary.
    pub summary: String,
    /// Optional notable-change highlights.
    pub highlights: Option<Vec<String>>,
    /// Whether the executor recommends applying.
    pub recommended: bool,
}

/// Manages snapshot disposition and persistence for the delegator.
pub struct SnapshotManager {
    snapshots_dir: PathBuf,
    max_snapshots: u32,
}

impl SnapshotManager {
    /// Create a manager rooted at the staged-snapshot directory.
    #[must_use]
    pub fn new(snapshots_dir: impl Into<PathBuf>, max_snapshots: u32) -> Self {
        Self {
            snapshots_dir: snapshots_dir.into(),
            max_snapshots: max_snapshots.max(1),
        }
    }

    /// Dispatch a received snapshot per the delegation's policy, mutating
    /// the record in place. Re-delivery of an already-known snapshot id
    /// (an SSE reconnect) is a no-op returning the existing status.
    ///
    /// # Errors
    ///
    /// Returns transport or I/O errors from the apply or staging path.
    pub async fn on_received(
        &self,
        record: &mut DelegationRecord,
        received: ReceivedSnapshot,
        payload: &SnapshotPayload,
        transport: &Arc<dyn DelegatorTransport>,
    ) -> Result<SnapshotStatus> {
        let span = info_span!(
            "snapshot_received",
            delegation_id = %record.id,
            snapshot_id = %received.snapshot_id
        );
        let _guard = span.enter();

        // Reconnects replay events; the manager keys by snapshot id.
        if let Some(existing) = record.snapshot(&received.snapshot_id) {
            return Ok(existing.status);
        }

        if record.snapshots.len() >= self.max_snapshots as usize {
            warn!(
                max = self.max_snapshots,
                "snapshot cap reached; recording metadata only"
            );
            record.snapshots.push(SnapshotRecord::new(
                received.snapshot_id,
                received.summary,
                received.highlights,
                received.recommended,
                SnapshotStatus::Discarded,
            ));
            record.touch();
            return Ok(SnapshotStatus::Discarded);
        }

        let status = match record.snapshot_policy {
            SnapshotPolicy::Auto => {
                if record.applied_snapshot_id.is_some() {
                    // A snapshot is already applied; keep this one pending
                    // rather than silently re-reconciling the export tree.
                    warn!("snapshot already applied; staging subsequent snapshot as pending");
                    let local_path =
                        self.persist(&record.id, &received, payload)?;
                    let mut snapshot = SnapshotRecord::new(
                        received.snapshot_id.clone(),
                        received.summary.clone(),
                        received.highlights.clone(),
                        received.recommended,
                        SnapshotStatus::Pending,
                    );
                    snapshot.local_path = Some(local_path);
                    record.snapshots.push(snapshot);
                    SnapshotStatus::Pending
                } else {
                    self.apply_payload(record, &received, payload, transport)
                        .await?;
                    SnapshotStatus::Applied
                }
            }
            SnapshotPolicy::Staged => {
                let local_path = self.persist(&record.id, &received, payload)?;
                let mut snapshot = SnapshotRecord::new(
                    received.snapshot_id.clone(),
                    received.summary.clone(),
                    received.highlights.clone(),
                    received.recommended,
                    SnapshotStatus::Pending,
                );
                snapshot.local_path = Some(local_path);
                record.snapshots.push(snapshot);
                info!("snapshot staged for review");
                SnapshotStatus::Pending
            }
            SnapshotPolicy::Discard => {
                record.snapshots.push(SnapshotRecord::new(
                    received.snapshot_id.clone(),
                    received.summary.clone(),
                    received.highlights.clone(),
                    received.recommended,
                    SnapshotStatus::Discarded,
                ));
                info!("snapshot discarded per policy");
                SnapshotStatus::Discarded
            }
        };

        record.touch();
        Ok(status)
    }

    /// Apply a staged snapshot.
    ///
    /// Legal only for `pending` snapshots on delegations with no other
    /// applied snapshot. Applying the already-applied snapshot again is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::NotFound` for unknown ids, `AwcpError::Protocol`
    /// (`DECLINED`) when another snapshot is applied or the snapshot is not
    /// pending, and transport errors from the apply itself.
    pub async fn apply(
        &self,
        record: &mut DelegationRecord,
        snapshot_id: &str,
        transport: &Arc<dyn DelegatorTransport>,
    ) -> Result<()> {
        let span = info_span!("snapshot_apply", delegation_id = %record.id, snapshot_id);
        let _guard = span.enter();

        let Some(snapshot) = record.snapshot(snapshot_id) else {
            return Err(AwcpError::NotFound(format!(
                "snapshot {snapshot_id} not found"
            )));
        };

        match snapshot.status {
            SnapshotStatus::Applied => return Ok(()),
            SnapshotStatus::Discarded => {
                return Err(AwcpError::protocol(
                    ErrorCode::Declined,
                    format!("snapshot {snapshot_id} was discarded"),
                ));
            }
            SnapshotStatus::Pending => {}
        }

        if let Some(applied) = &record.applied_snapshot_id {
            return Err(AwcpError::Protocol(
                crate::errors::ProtocolError::new(
                    ErrorCode::Declined,
                    format!("snapshot {applied} is already applied to this delegation"),
                )
                .with_hint("at most one snapshot may be applied per delegation"),
            ));
        }

        let local_path = snapshot.local_path.clone().ok_or_else(|| {
            AwcpError::Store(format!("snapshot {snapshot_id} has no persisted payload"))
        })?;
        let payload = load_payload(&local_path)?;

        let received = ReceivedSnapshot {
            snapshot_id: snapshot_id.to_owned(),
            summary: snapshot.summary.clone(),
            highlights: snapshot.highlights.clone(),
            recommended: snapshot.recommended,
        };
        self.apply_payload(record, &received, &payload, transport)
            .await?;
        record.touch();
        Ok(())
    }

    /// Discard a pending snapshot, removing its persisted payload.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::NotFound` for unknown ids and `DECLINED` for
    /// snapshots that are not pending.
    pub fn discard(&self, record: &mut DelegationRecord, snapshot_id: &str) -> Result<()> {
        let Some(snapshot) = record.snapshot_mut(snapshot_id) else {
            return Err(AwcpError::NotFound(format!(
                "snapshot {snapshot_id} not found"
            )));
        };
        match snapshot.status {
            SnapshotStatus::Pending => {}
            SnapshotStatus::Applied => {
                return Err(AwcpError::protocol(
                    ErrorCode::Declined,
                    format!("snapshot {snapshot_id} is applied and cannot be discarded"),
                ));
            }
            SnapshotStatus::Discarded => return Ok(()),
        }

        snapshot.status = SnapshotStatus::Discarded;
        if let Some(path) = snapshot.local_path.take() {
            if let Some(dir) = path.parent() {
                if let Err(err) = std::fs::remove_dir_all(dir) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(snapshot_id, %err, "staged payload removal failed");
                    }
                }
            }
        }
        record.touch();
        info!(delegation_id = %record.id, snapshot_id, "snapshot discarded");
        Ok(())
    }

    /// Remove every staged payload for one delegation.
    pub fn remove_for(&self, delegation_id: &str) {
        let dir = self.snapshots_dir.join(delegation_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => info!(delegation_id, "staged snapshots removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(delegation_id, %err, "staged snapshot removal failed"),
        }
    }

    /// Delete staged snapshot directories with no backing delegation.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Io` if the snapshots directory cannot be read.
    pub fn sweep_stale(&self, known_ids: &[String]) -> Result<usize> {
        if !self.snapshots_dir.is_dir() {
            return Ok(0);
        }
        let entries = std::fs::read_dir(&self.snapshots_dir)
            .map_err(|err| AwcpError::Io(format!("snapshots list: {err}")))?;

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
                    info!(path = %path.display(), "stale snapshot directory removed");
                    removed += 1;
                }
                Err(err) => warn!(path = %path.display(), %err, "stale snapshot removal failed"),
            }
        }
        Ok(removed)
    }

    async fn apply_payload(
        &self,
        record: &mut DelegationRecord,
        received: &ReceivedSnapshot,
        payload: &SnapshotPayload,
        transport: &Arc<dyn DelegatorTransport>,
    ) -> Result<()> {
        let export_path = record.export_path.clone().ok_or_else(|| {
            AwcpError::Store(format!("delegation {} has no export tree", record.id))
        })?;
        let rw_resources = record.rw_resources();

        transport
            .apply_snapshot(&record.id, payload, &rw_resources, &export_path)
            .await?;

        let now = Utc::now();
        match record.snapshot_mut(&received.snapshot_id) {
            Some(snapshot) => {
                snapshot.status = SnapshotStatus::Applied;
                snapshot.applied_at = Some(now);
            }
            None => {
                let mut snapshot = SnapshotRecord::new(
                    received.snapshot_id.clone(),
                    received.summary.clone(),
                    received.highlights.clone(),
                    received.recommended,
                    SnapshotStatus::Applied,
                );
                snapshot.applied_at = Some(now);
                record.snapshots.push(snapshot);
            }
        }
        record.applied_snapshot_id = Some(received.snapshot_id.clone());
        info!(
            delegation_id = %record.id,
            snapshot_id = %received.snapshot_id,
            "snapshot applied"
        );
        Ok(())
    }

    fn persist(
        &self,
        delegation_id: &str,
        received: &ReceivedSnapshot,
        payload: &SnapshotPayload,
    ) -> Result<PathBuf> {
        let dir = self
            .snapshots_dir
            .join(delegation_id)
            .join(&received.snapshot_id);
        std::fs::create_dir_all(&dir)
            .map_err(|err| AwcpError::Store(format!("snapshot dir: {err}")))?;

        let payload_path = dir.join("payload");
        std::fs::write(&payload_path, &payload.data)
            .map_err(|err| AwcpError::Store(format!("payload write: {err}")))?;

        let metadata = StagedMetadata {
            snapshot_id: received.snapshot_id.clone(),
            delegation_id: delegation_id.to_owned(),
            summary: received.summary.clone(),
            checksum: payload.checksum.clone(),
            recommended: received.recommended,
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|err| AwcpError::Store(format!("metadata encode: {err}")))?;
        std::fs::write(dir.join("metadata.json"), json)
            .map_err(|err| AwcpError::Store(format!("metadata write: {err}")))?;

        Ok(payload_path)
    }
}

/// Load a staged payload, verifying its checksum against the metadata.
fn load_payload(payload_path: &std::path::Path) -> Result<SnapshotPayload> {
    let data = std::fs::read(payload_path)
        .map_err(|err| AwcpError::Store(format!("payload read: {err}")))?;

    let metadata_path = payload_path.with_file_name("metadata.json");
    let raw = std::fs::read(&metadata_path)
        .map_err(|err| AwcpError::Store(format!("metadata read: {err}")))?;
    let metadata: StagedMetadata = serde_json::from_slice(&raw)
        .map_err(|err| AwcpError::Store(format!("metadata decode: {err}")))?;

    let payload = SnapshotPayload {
        data,
        checksum: metadata.checksum,
    };
    if !payload.verify() {
        return Err(AwcpError::Store(format!(
            "staged payload checksum mismatch for snapshot {}",
            metadata.snapshot_id
        )));
    }
    Ok(payload)
}
