//! Delegation record, lifecycle states, and task/result value types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ProtocolError;
use crate::transport::TransportHandle;

use super::lease::{ActiveLease, LeaseRequest};
use super::resource::Resource;
use super::snapshot::{SnapshotPolicy, SnapshotRecord};

/// Delegator-side lifecycle state. Transitions are monotonic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DelegationState {
    /// Record persisted, admission passed, export materialized.
    Created,
    /// INVITE sent, awaiting the synchronous ACCEPT/ERROR response.
    Invited,
    /// ACCEPT received, executor constraints merged.
    Accepted,
    /// START sent and acknowledged.
    Started,
    /// Executor reported progress via the event stream.
    Running,
    /// Terminal: task finished, result recorded.
    Completed,
    /// Terminal: a typed error was recorded.
    Error,
    /// Terminal: cancelled by the owner.
    Cancelled,
    /// Terminal: lease deadline fired before completion.
    Expired,
}

impl DelegationState {
    /// Whether this state admits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Cancelled | Self::Expired
        )
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Created => false,
            Self::Invited => self == Self::Created,
            Self::Accepted => self == Self::Invited,
            Self::Started => self == Self::Accepted,
            Self::Running => matches!(self, Self::Started | Self::Running),
            // Any live state may fail, expire, or be cancelled; completion
            // requires the event stream to have been opened.
            Self::Completed => matches!(self, Self::Started | Self::Running),
            Self::Error | Self::Cancelled | Self::Expired => true,
        }
    }
}

/// Executor-side lifecycle phase for a delegation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorPhase {
    /// INVITE admitted; work path allocated, START not yet received.
    PendingAdmission,
    /// START accepted; workspace preparation and transport setup underway.
    Starting,
    /// Task runner executing.
    Running,
    /// Terminal: task finished and events emitted.
    Completed,
    /// Terminal: setup or task failure.
    Failed,
    /// Terminal: delegator cancelled.
    Cancelled,
}

impl ExecutorPhase {
    /// Whether this phase admits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// The unit of work handed to the executor; opaque to the protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSpec {
    /// Short human-readable description.
    pub description: String,
    /// Full instruction text passed to the task runner.
    pub prompt: String,
}

/// Success payload recorded when a delegation completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DelegationResult {
    /// Executor's summary of the work performed.
    pub summary: String,
    /// Optional notable outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlights: Option<Vec<String>>,
    /// Optional free-form notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Sandbox restrictions the executor applies to the task runner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxProfile {
    /// Task may only touch the allocated work path.
    pub cwd_only: bool,
    /// Task may reach the network.
    pub allow_network: bool,
    /// Task may execute subprocesses.
    pub allow_exec: bool,
}

impl Default for SandboxProfile {
    fn default() -> Self {
        Self {
            cwd_only: true,
            allow_network: false,
            allow_exec: false,
        }
    }
}

/// Constraints the executor communicates in its ACCEPT response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConstraints {
    /// Access mode the executor granted (may be a downgrade).
    pub accepted_access_mode: super::resource::AccessMode,
    /// Executor's TTL ceiling; the delegator clamps to it.
    pub max_ttl_seconds: u64,
    /// Sandbox restrictions in force for the task runner.
    pub sandbox_profile: SandboxProfile,
}

/// Measured workspace bounds recorded by the admission scan.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AdmissionReport {
    /// Total bytes across all selected files.
    pub total_bytes: u64,
    /// Number of selected files.
    pub file_count: u64,
    /// Size of the largest selected file.
    pub largest_file_bytes: u64,
}

/// The durable per-delegation record owned by the delegator.
///
/// Persisted as JSON under `<base_dir>/delegations/<id>.json`; survives
/// process restarts. In a terminal state exactly one of `result` / `error`
/// is set and the active lease is frozen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct DelegationRecord {
    /// Opaque identifier, unique per delegator.
    pub id: String,
    /// Base URL of the executor.
    pub peer_url: String,
    /// The work to delegate.
    pub task: TaskSpec,
    /// Ordered set of named resources.
    pub environment: Vec<Resource>,
    /// Lease terms requested at creation.
    pub lease_requested: LeaseRequest,
    /// Lease granted when START was issued; frozen at terminal states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_active: Option<ActiveLease>,
    /// Snapshot reception policy.
    pub snapshot_policy: SnapshotPolicy,
    /// Current lifecycle state.
    pub state: DelegationState,
    /// Materialized export tree root; removed on release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_path: Option<PathBuf>,
    /// Opaque per-transport handle produced by `prepare`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_handle: Option<TransportHandle>,
    /// Executor constraints merged from the ACCEPT response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_constraints: Option<ExecutorConstraints>,
    /// Snapshots received so far, in arrival order.
    #[serde(default)]
    pub snapshots: Vec<SnapshotRecord>,
    /// The single applied snapshot, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_snapshot_id: Option<String>,
    /// Success payload; set exactly when state is `completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<DelegationResult>,
    /// Failure payload; set exactly when state is a failure terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProtocolError>,
    /// Admission scan measurements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<AdmissionReport>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp; monotonic.
    pub updated_at: DateTime<Utc>,
}

impl DelegationRecord {
    /// Construct a new record in `Created` state with a generated id.
    #[must_use]
    pub fn new(
        peer_url: String,
        task: TaskSpec,
        environment: Vec<Resource>,
        lease_requested: LeaseRequest,
        snapshot_policy: SnapshotPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            peer_url,
            task,
            environment,
            lease_requested,
            lease_active: None,
            snapshot_policy,
            state: DelegationState::Created,
            export_path: None,
            transport_handle: None,
            executor_constraints: None,
            snapshots: Vec::new(),
            applied_snapshot_id: None,
            result: None,
            error: None,
            admission: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Resources declared read-write.
    #[must_use]
    pub fn rw_resources(&self) -> Vec<Resource> {
        self.environment
            .iter()
            .filter(|r| r.mode == super::resource::AccessMode::Rw)
            .cloned()
            .collect()
    }

    /// Whether the delegation has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Transition to `next`, bumping `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Store` if the transition is not permitted.
    pub fn transition_to(&mut self, next: DelegationState) -> crate::Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(crate::AwcpError::Store(format!(
                "invalid delegation state transition {:?} -> {next:?}",
                self.state
            )));
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    /// Record the success terminal.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Store` if the transition is not permitted.
    pub fn complete(&mut self, result: DelegationResult) -> crate::Result<()> {
        self.transition_to(DelegationState::Completed)?;
        self.result = Some(result);
        self.error = None;
        Ok(())
    }

    /// Record a failure terminal in the given state.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Store` if the transition is not permitted.
    pub fn fail(&mut self, state: DelegationState, error: ProtocolError) -> crate::Result<()> {
        debug_assert!(state.is_terminal());
        self.transition_to(state)?;
        self.error = Some(error);
        self.result = None;
        Ok(())
    }

    /// Look up a snapshot record by id.
    #[must_use]
    pub fn snapshot(&self, snapshot_id: &str) -> Option<&SnapshotRecord> {
        self.snapshots.iter().find(|s| s.id == snapshot_id)
    }

    /// Mutable lookup of a snapshot record by id.
    pub fn snapshot_mut(&mut self, snapshot_id: &str) -> Option<&mut SnapshotRecord> {
        self.snapshots.iter_mut().find(|s| s.id == snapshot_id)
    }

    /// Bump the `updated_at` timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
