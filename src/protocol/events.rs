//! The executor-to-delegator event stream.
//!
//! Events for one delegation are totally ordered: any number of `status`
//! events, zero or more `snapshot` events, then exactly one terminal
//! (`done` or `error`). A snapshot referenced by a later `done` always
//! precedes it.

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorCode, ProtocolError};
use crate::transport::SnapshotPayload;

/// One event on a delegation's stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DelegationEvent {
    /// Informational progress; may repeat.
    Status {
        /// Human-readable progress message.
        message: String,
        /// Optional machine-readable sub-state.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        substate: Option<String>,
    },
    /// Post-execution workspace state offered for reconciliation.
    Snapshot {
        /// Identifier, unique within the delegation.
        snapshot_id: String,
        /// Executor's summary of the changes.
        summary: String,
        /// Optional notable-change highlights.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        highlights: Option<Vec<String>>,
        /// Opaque payload for the transport adapter.
        payload: SnapshotPayload,
        /// Whether the executor recommends applying this snapshot.
        #[serde(default)]
        recommended: bool,
    },
    /// Terminal: the task finished successfully.
    Done {
        /// Executor's summary of the work performed.
        summary: String,
        /// Optional notable outcomes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        highlights: Option<Vec<String>>,
        /// Ids of the snapshots emitted before this terminal.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot_ids: Option<Vec<String>>,
        /// The snapshot the executor recommends, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recommended_snapshot_id: Option<String>,
    },
    /// Terminal: the delegation failed.
    Error {
        /// Machine-readable error code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
        /// Optional remediation hint.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
}

impl DelegationEvent {
    /// Whether this event closes the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Build a `status` event.
    #[must_use]
    pub fn status(message: impl Into<String>, substate: Option<String>) -> Self {
        Self::Status {
            message: message.into(),
            substate,
        }
    }

    /// Build an `error` terminal from a structured protocol error.
    #[must_use]
    pub fn from_error(error: ProtocolError) -> Self {
        Self::Error {
            code: error.code,
            message: error.message,
            hint: error.hint,
        }
    }

    /// Extract the structured error when this is an `error` terminal.
    #[must_use]
    pub fn as_error(&self) -> Option<ProtocolError> {
        match self {
            Self::Error {
                code,
                message,
                hint,
            } => Some(ProtocolError {
                code: *code,
                message: message.clone(),
                hint: hint.clone(),
            }),
            _ => None,
        }
    }
}
