//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::models::resource::AccessMode;
use crate::models::snapshot::SnapshotPolicy;
use crate::{AwcpError, Result};

/// Admission bounds applied before an INVITE is sent.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct AdmissionConfig {
    /// Total byte ceiling across all selected files.
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,
    /// Selected file count ceiling.
    #[serde(default = "default_max_file_count")]
    pub max_file_count: u64,
    /// Per-file byte ceiling.
    #[serde(default = "default_max_single_file_bytes")]
    pub max_single_file_bytes: u64,
    /// Glob patterns identifying credential-like paths.
    #[serde(default = "default_sensitive_patterns")]
    pub sensitive_patterns: Vec<String>,
    /// Skip the sensitive-path scan entirely.
    #[serde(default)]
    pub skip_sensitive_check: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_total_bytes: default_max_total_bytes(),
            max_file_count: default_max_file_count(),
            max_single_file_bytes: default_max_single_file_bytes(),
            sensitive_patterns: default_sensitive_patterns(),
            skip_sensitive_check: false,
        }
    }
}

fn default_max_total_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_max_file_count() -> u64 {
    10_000
}

fn default_max_single_file_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_sensitive_patterns() -> Vec<String> {
    [
        "**/.env",
        "**/.env.*",
        "**/*.pem",
        "**/*.key",
        "**/id_rsa*",
        "**/id_ed25519*",
        "**/.aws/credentials",
        "**/.netrc",
        "**/credentials.json",
    ]
    .into_iter()
    .map(ToOwned::to_owned)
    .collect()
}

/// Defaults applied to new delegations when the caller omits them.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DelegationDefaults {
    /// Default lease lifetime in seconds.
    #[serde(default = "default_lease_ttl_seconds")]
    pub lease_ttl_seconds: u64,
    /// Default requested access mode.
    #[serde(default = "default_lease_access_mode")]
    pub lease_access_mode: AccessMode,
    /// Default snapshot reception policy.
    #[serde(default)]
    pub snapshot_mode: SnapshotPolicy,
    /// Staged snapshot retention window in milliseconds.
    #[serde(default = "default_snapshot_retention_ms")]
    pub snapshot_retention_ms: u64,
    /// Ceiling on snapshots tracked per delegation.
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: u32,
}

impl Default for DelegationDefaults {
    fn default() -> Self {
        Self {
            lease_ttl_seconds: default_lease_ttl_seconds(),
            lease_access_mode: default_lease_access_mode(),
            snapshot_mode: SnapshotPolicy::default(),
            snapshot_retention_ms: default_snapshot_retention_ms(),
            max_snapshots: default_max_snapshots(),
        }
    }
}

fn default_lease_ttl_seconds() -> u64 {
    3600
}

fn default_lease_access_mode() -> AccessMode {
    AccessMode::Rw
}

fn default_snapshot_retention_ms() -> u64 {
    30 * 60 * 1000
}

fn default_max_snapshots() -> u32 {
    10
}

/// Outbound connection behavior for the delegator.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Per-request deadline in seconds.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Reconnect attempts before the subscription surfaces `SSE_FAILED`.
    #[serde(default = "default_sse_max_retries")]
    pub sse_max_retries: u32,
    /// Linear backoff unit: attempt N waits `N * sse_retry_delay_ms`.
    #[serde(default = "default_sse_retry_delay_ms")]
    pub sse_retry_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout_seconds(),
            sse_max_retries: default_sse_max_retries(),
            sse_retry_delay_ms: default_sse_retry_delay_ms(),
        }
    }
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_sse_max_retries() -> u32 {
    3
}

fn default_sse_retry_delay_ms() -> u64 {
    2000
}

/// Delegator role configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DelegatorConfig {
    /// Control-plane listen port.
    #[serde(default = "default_delegator_port")]
    pub listen_port: u16,
    /// Default executor base URL when a request omits one.
    #[serde(default)]
    pub peer_url: Option<String>,
    /// Bearer token attached to executor requests.
    #[serde(default)]
    pub peer_auth_token: Option<String>,
    /// Pre-INVITE admission bounds.
    #[serde(default)]
    pub admission: AdmissionConfig,
    /// Per-delegation defaults.
    #[serde(default)]
    pub defaults: DelegationDefaults,
    /// Outbound connection behavior.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Hours a terminal delegation is retained before the reaper deletes it.
    #[serde(default = "default_delegation_retention_hours")]
    pub delegation_retention_hours: u32,
}

impl Default for DelegatorConfig {
    fn default() -> Self {
        Self {
            listen_port: default_delegator_port(),
            peer_url: None,
            peer_auth_token: None,
            admission: AdmissionConfig::default(),
            defaults: DelegationDefaults::default(),
            connection: ConnectionConfig::default(),
            delegation_retention_hours: default_delegation_retention_hours(),
        }
    }
}

fn default_delegator_port() -> u16 {
    7710
}

fn default_delegation_retention_hours() -> u32 {
    72
}

/// Executor role configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Listen port for the protocol endpoint.
    #[serde(default = "default_executor_port")]
    pub listen_port: u16,
    /// Root directory under which all work paths are allocated.
    pub work_root: PathBuf,
    /// Concurrent delegation ceiling; the next INVITE is declined.
    #[serde(default = "default_max_concurrent_delegations")]
    pub max_concurrent_delegations: u32,
    /// TTL ceiling communicated in ACCEPT.
    #[serde(default = "default_max_ttl_seconds")]
    pub max_ttl_seconds: u64,
    /// Access modes this executor grants.
    #[serde(default = "default_allowed_access_modes")]
    pub allowed_access_modes: Vec<AccessMode>,
    /// Admit INVITEs without consulting the user hook.
    #[serde(default = "default_true")]
    pub auto_accept: bool,
    /// Completed-delegation retention window for SSE replay and recovery.
    #[serde(default = "default_result_retention_ms")]
    pub result_retention_ms: u64,
    /// Subscriber queue watermark; laggards past it are dropped.
    #[serde(default = "default_subscriber_watermark")]
    pub subscriber_watermark: usize,
    /// Shared secret required on inbound requests when set.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Command the built-in task runner executes in the work path; the
    /// task prompt is passed via `AWCP_TASK_PROMPT`. Absent means the
    /// logging runner is used.
    #[serde(default)]
    pub task_command: Option<Vec<String>>,
}

fn default_executor_port() -> u16 {
    7700
}

fn default_max_concurrent_delegations() -> u32 {
    5
}

fn default_max_ttl_seconds() -> u64 {
    3600
}

fn default_allowed_access_modes() -> Vec<AccessMode> {
    vec![AccessMode::Ro, AccessMode::Rw]
}

fn default_result_retention_ms() -> u64 {
    30 * 60 * 1000
}

fn default_subscriber_watermark() -> usize {
    256
}

fn default_true() -> bool {
    true
}

/// Startup and shutdown hygiene.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct LifecycleConfig {
    /// Release every active delegation at shutdown.
    #[serde(default = "default_true")]
    pub cleanup_on_shutdown: bool,
    /// Sweep stale work and export directories at startup.
    #[serde(default = "default_true")]
    pub cleanup_stale_on_startup: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            cleanup_on_shutdown: true,
            cleanup_stale_on_startup: true,
        }
    }
}

/// Global configuration parsed from `awcp.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct GlobalConfig {
    /// Delegator-side state root: delegation records, materialized
    /// environments, staged snapshots.
    pub base_dir: PathBuf,
    /// Delegator role settings.
    #[serde(default)]
    pub delegator: DelegatorConfig,
    /// Executor role settings; required to run the executor role.
    #[serde(default)]
    pub executor: Option<ExecutorConfig>,
    /// Startup/shutdown hygiene.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AwcpError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Directory holding per-delegation JSON records.
    #[must_use]
    pub fn delegations_dir(&self) -> PathBuf {
        self.base_dir.join("delegations")
    }

    /// Directory holding materialized export trees.
    #[must_use]
    pub fn environments_dir(&self) -> PathBuf {
        self.base_dir.join("environments")
    }

    /// Directory holding staged snapshot payloads.
    #[must_use]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.base_dir.join("snapshots")
    }

    fn validate(&self) -> Result<()> {
        if let Some(executor) = &self.executor {
            if executor.max_concurrent_delegations == 0 {
                return Err(AwcpError::Config(
                    "executor.max_concurrent_delegations must be greater than zero".into(),
                ));
            }
            if executor.allowed_access_modes.is_empty() {
                return Err(AwcpError::Config(
                    "executor.allowed_access_modes must not be empty".into(),
                ));
            }
            if executor.work_root.as_os_str().is_empty() {
                return Err(AwcpError::Config("executor.work_root must be set".into()));
            }
        }
        if self.delegator.connection.request_timeout_seconds == 0 {
            return Err(AwcpError::Config(
                "delegator.connection.request_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.base_dir.as_os_str().is_empty() {
            return Err(AwcpError::Config("base_dir must be set".into()));
        }
        Ok(())
    }
}
