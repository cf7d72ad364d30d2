//! Transport adapter contract.
//!
//! Adapters are the only components permitted to touch workspace bytes on
//! the wire; the protocol engines never perform I/O on them directly. The
//! contract is symmetric: a delegator half that exports and reconciles, and
//! an executor half that materializes and captures. Engine logic branches on
//! [`TransportCapabilities`], never on concrete adapter types.

pub mod local_dir;

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::resource::Resource;
use crate::Result;

/// Static capability set an adapter declares.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransportCapabilities {
    /// Adapter conveys post-execution state via snapshot payloads.
    pub supports_snapshots: bool,
    /// Changes appear under the delegator's export tree continuously;
    /// snapshot reception is skipped.
    pub live_sync: bool,
}

/// Result of an executor-side dependency probe, gating INVITE acceptance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyCheck {
    /// Whether the adapter can materialize on this host.
    pub available: bool,
    /// Remediation hint when unavailable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl DependencyCheck {
    /// An unconditionally available dependency.
    #[must_use]
    pub fn available() -> Self {
        Self {
            available: true,
            hint: None,
        }
    }

    /// A missing dependency with a hint.
    #[must_use]
    pub fn missing(hint: impl Into<String>) -> Self {
        Self {
            available: false,
            hint: Some(hint.into()),
        }
    }
}

/// Opaque value the executor uses to materialize the delegator's resources.
///
/// The engine treats the body as an opaque tagged value; only the adapter
/// that produced it interprets `data`. Examples: an inline base64 archive
/// plus checksum, an SSH endpoint with a time-bounded credential, an
/// object-store pre-signed URL, a Git remote plus base commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportHandle {
    /// Adapter discriminator, e.g. `"local_dir"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Adapter-interpreted body.
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl TransportHandle {
    /// Build a handle from an adapter kind and serializable body.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Transport` if the body fails to serialize.
    pub fn new<T: Serialize>(kind: impl Into<String>, body: &T) -> Result<Self> {
        let data = serde_json::to_value(body)
            .map_err(|err| crate::AwcpError::Transport(format!("handle encode: {err}")))?;
        Ok(Self {
            kind: kind.into(),
            data,
        })
    }

    /// Decode the body into an adapter-specific type.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Transport` if the body does not match `T`.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|err| crate::AwcpError::Transport(format!("handle decode: {err}")))
    }
}

impl Display for TransportHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport handle ({})", self.kind)
    }
}

/// Opaque snapshot payload conveyed from executor to delegator.
///
/// The byte content is adapter-defined; the engine only moves, persists,
/// and checksums it. On the wire the bytes travel base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPayload {
    /// Adapter-defined payload bytes.
    pub data: Vec<u8>,
    /// SHA-256 hex digest of `data`.
    pub checksum: String,
}

impl SnapshotPayload {
    /// Wrap raw bytes, computing the checksum.
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let checksum = sha256_hex(&data);
        Self { data, checksum }
    }

    /// Verify the stored checksum against the payload bytes.
    #[must_use]
    pub fn verify(&self) -> bool {
        sha256_hex(&self.data) == self.checksum
    }
}

impl Serialize for SnapshotPayload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("SnapshotPayload", 2)?;
        state.serialize_field("data", &B64.encode(&self.data))?;
        state.serialize_field("checksum", &self.checksum)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for SnapshotPayload {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            data: String,
            checksum: String,
        }
        let wire = Wire::deserialize(deserializer)?;
        let data = B64
            .decode(wire.data.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(Self {
            data,
            checksum: wire.checksum,
        })
    }
}

/// Compute a SHA-256 hex digest.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Delegator half of the transport contract.
///
/// `prepare` and `release` must be safe to call twice for the same
/// delegation; `apply_snapshot` must be idempotent for the same payload.
pub trait DelegatorTransport: Send + Sync {
    /// Adapter discriminator matching the handles it produces.
    fn kind(&self) -> &'static str;

    /// Static capability set.
    fn capabilities(&self) -> TransportCapabilities;

    /// One-time startup initialization; idempotent.
    fn initialize(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// After ACCEPT: produce the handle the executor needs to materialize
    /// the export tree, valid for `ttl_seconds`.
    fn prepare<'a>(
        &'a self,
        delegation_id: &'a str,
        export_path: &'a Path,
        ttl_seconds: u64,
    ) -> Pin<Box<dyn Future<Output = Result<TransportHandle>> + Send + 'a>>;

    /// Merge an executor-delivered snapshot back into the export tree,
    /// touching only `rw` resources and respecting their selection rules.
    fn apply_snapshot<'a>(
        &'a self,
        delegation_id: &'a str,
        payload: &'a SnapshotPayload,
        rw_resources: &'a [Resource],
        export_path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Revoke credentials and delete transport-side artifacts. Safe to retry.
    fn release<'a>(
        &'a self,
        delegation_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Executor half of the transport contract.
///
/// `setup` and `release` must be safe to call twice for the same delegation.
pub trait ExecutorTransport: Send + Sync {
    /// Adapter discriminator matching the handles it consumes.
    fn kind(&self) -> &'static str;

    /// Static capability set.
    fn capabilities(&self) -> TransportCapabilities;

    /// One-time startup initialization with the workspace root.
    fn initialize<'a>(
        &'a self,
        work_root: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Tear down adapter-global state at shutdown.
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Probe whether this host can materialize; gates INVITE acceptance.
    fn check_dependency(&self) -> Pin<Box<dyn Future<Output = Result<DependencyCheck>> + Send + '_>>;

    /// Materialize the delegated environment into `work_path`. May return a
    /// slightly different actual path.
    fn setup<'a>(
        &'a self,
        delegation_id: &'a str,
        handle: &'a TransportHandle,
        work_path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<PathBuf>> + Send + 'a>>;

    /// Capture the post-execution work path state. `None` when the adapter
    /// live-syncs and has nothing to convey.
    fn capture_snapshot<'a>(
        &'a self,
        delegation_id: &'a str,
        work_path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SnapshotPayload>>> + Send + 'a>>;

    /// Unmount, drop credentials, delete clones. Safe to retry.
    fn release<'a>(
        &'a self,
        delegation_id: &'a str,
        work_path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}
