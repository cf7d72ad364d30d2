//! Request/response messages exchanged over `POST /`.

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorCode, ProtocolError};
use crate::models::delegation::{ExecutorConstraints, TaskSpec};
use crate::models::lease::{ActiveLease, LeaseRequest};
use crate::models::resource::Resource;
use crate::transport::TransportHandle;

use super::PROTOCOL_VERSION;

/// Tagged envelope for the executor's single POST endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ProtocolMessage {
    /// Delegator proposes a delegation.
    #[serde(rename = "INVITE")]
    Invite(InviteMessage),
    /// Executor accepts an INVITE.
    #[serde(rename = "ACCEPT")]
    Accept(AcceptMessage),
    /// Delegator starts an accepted delegation.
    #[serde(rename = "START")]
    Start(StartMessage),
    /// Either side reports a refusal or cancellation.
    #[serde(rename = "ERROR")]
    Error(ErrorMessage),
}

/// The delegated environment: an ordered set of named resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentSpec {
    /// Resources in declaration order; names are unique.
    pub resources: Vec<Resource>,
}

/// INVITE: propose a delegation and announce the transport in use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InviteMessage {
    /// Protocol version; mismatches are declined.
    pub version: String,
    /// Delegation identifier chosen by the delegator.
    pub delegation_id: String,
    /// The work to perform, opaque to the protocol.
    pub task: TaskSpec,
    /// Requested lease terms.
    pub lease: LeaseRequest,
    /// The environment that will be materialized.
    pub environment: EnvironmentSpec,
    /// Transport announcement; the body is adapter-specific and may be
    /// empty at this stage.
    pub transport: TransportHandle,
}

/// Executor work directory information returned with ACCEPT.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkDirInfo {
    /// Allocated work path on the executor host.
    pub path: String,
}

/// ACCEPT: the executor admitted the INVITE.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcceptMessage {
    /// Protocol version.
    pub version: String,
    /// Echoed delegation identifier.
    pub delegation_id: String,
    /// Allocated work directory.
    pub executor_work_dir: WorkDirInfo,
    /// Constraints the delegator must merge before START.
    pub executor_constraints: ExecutorConstraints,
}

/// START: the delegator grants the lease and hands over the transport handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartMessage {
    /// Protocol version.
    pub version: String,
    /// Delegation identifier; must match a pending admission.
    pub delegation_id: String,
    /// Granted lease with an absolute expiry.
    pub lease: ActiveLease,
    /// The handle the executor materializes from.
    pub work_dir: TransportHandle,
}

/// ERROR: typed refusal or unilateral cancellation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    /// Protocol version.
    pub version: String,
    /// Delegation identifier the error refers to.
    pub delegation_id: String,
    /// Structured error body.
    #[serde(flatten)]
    pub error: ProtocolError,
}

impl ErrorMessage {
    /// Build an ERROR message for a delegation.
    #[must_use]
    pub fn new(delegation_id: impl Into<String>, error: ProtocolError) -> Self {
        Self {
            version: PROTOCOL_VERSION.into(),
            delegation_id: delegation_id.into(),
            error,
        }
    }
}

/// Trivial acknowledgement for START and ERROR posts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    /// Always `true` on success.
    pub ok: bool,
}

impl Ack {
    /// The affirmative acknowledgement.
    #[must_use]
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

/// Reject messages whose version does not match ours.
///
/// # Errors
///
/// Returns a `DECLINED` protocol error on mismatch.
pub fn check_version(version: &str) -> Result<(), ProtocolError> {
    if version == PROTOCOL_VERSION {
        Ok(())
    } else {
        Err(ProtocolError::new(
            ErrorCode::Declined,
            format!("unsupported protocol version '{version}'"),
        )
        .with_hint(format!("this peer speaks version {PROTOCOL_VERSION}")))
    }
}
