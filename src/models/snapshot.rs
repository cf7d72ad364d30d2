//! Snapshot records and the reception policy that governs them.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the delegator does when a snapshot event arrives.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotPolicy {
    /// Apply immediately on receipt.
    #[default]
    Auto,
    /// Persist the payload and wait for an explicit apply.
    Staged,
    /// Record metadata only; drop the payload.
    Discard,
}

/// Disposition of a received snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    /// Persisted, awaiting an explicit apply or discard.
    Pending,
    /// Merged into the delegator's export tree.
    Applied,
    /// Metadata retained, payload dropped.
    Discarded,
}

/// A snapshot as tracked on the delegator side.
///
/// At most one snapshot per delegation ever holds `Applied` status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SnapshotRecord {
    /// Identifier, unique within the owning delegation.
    pub id: String,
    /// Executor-provided summary of what changed.
    pub summary: String,
    /// Optional notable-change highlights.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlights: Option<Vec<String>>,
    /// Whether the executor recommends applying this snapshot.
    #[serde(default)]
    pub recommended: bool,
    /// Current disposition.
    pub status: SnapshotStatus,
    /// Where the payload is persisted, when staged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    /// When the snapshot event was received.
    pub created_at: DateTime<Utc>,
    /// When the snapshot was applied, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
}

impl SnapshotRecord {
    /// Construct a record in the given initial status.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        summary: impl Into<String>,
        highlights: Option<Vec<String>>,
        recommended: bool,
        status: SnapshotStatus,
    ) -> Self {
        Self {
            id: id.into(),
            summary: summary.into(),
            highlights,
            recommended,
            status,
            local_path: None,
            created_at: Utc::now(),
            applied_at: None,
        }
    }
}
