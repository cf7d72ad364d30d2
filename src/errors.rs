//! Error types shared across both protocol roles.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AwcpError>;

/// Closed set of protocol error codes carried on the wire.
///
/// Every refusal, setup failure, and terminal error is identified by one of
/// these codes; free-form detail goes into the accompanying message and hint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Peer refused the delegation outright.
    Declined,
    /// Executor-side transport dependency is unavailable.
    DepMissing,
    /// Admission bounds (size, file count, largest file) exceeded.
    WorkspaceTooLarge,
    /// Executor could not allocate a work directory.
    WorkdirDenied,
    /// START arrived for an unknown or lapsed admission.
    StartExpired,
    /// Lease deadline passed before the delegation reached a terminal state.
    Expired,
    /// Authentication with the peer failed.
    AuthFailed,
    /// Transport preparation or materialization failed.
    SetupFailed,
    /// The injected task runner failed.
    TaskFailed,
    /// Delegation cancelled by the delegator.
    Cancelled,
    /// Referenced delegation or snapshot does not exist.
    NotFound,
    /// Event subscription failed after exhausting reconnect attempts.
    SseFailed,
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            Self::Declined => "DECLINED",
            Self::DepMissing => "DEP_MISSING",
            Self::WorkspaceTooLarge => "WORKSPACE_TOO_LARGE",
            Self::WorkdirDenied => "WORKDIR_DENIED",
            Self::StartExpired => "START_EXPIRED",
            Self::Expired => "EXPIRED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::SetupFailed => "SETUP_FAILED",
            Self::TaskFailed => "TASK_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::NotFound => "NOT_FOUND",
            Self::SseFailed => "SSE_FAILED",
        };
        f.write_str(code)
    }
}

/// Structured protocol error: code plus human-readable detail.
///
/// Travels on the wire as the `ERROR` message body and as the terminal
/// `error` event; also recorded on the delegation when it fails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolError {
    /// Machine-readable error code from the closed set.
    pub code: ErrorCode,
    /// Human-readable description of what failed.
    pub message: String,
    /// Optional operator-facing remediation hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ProtocolError {
    /// Construct an error with a code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
        }
    }

    /// Attach a remediation hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " ({hint})")?;
        }
        Ok(())
    }
}

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AwcpError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Typed protocol refusal or terminal error.
    Protocol(ProtocolError),
    /// Transport adapter failure outside the protocol code set.
    Transport(String),
    /// Delegation record persistence failure.
    Store(String),
    /// Work path allocation, preparation, or release failure.
    Workspace(String),
    /// Admission scan failure outside the typed refusal set.
    Admission(String),
    /// HTTP client or server failure.
    Http(String),
    /// File system or I/O operation failure.
    Io(String),
    /// File system path failed validation against its root boundary.
    PathViolation(String),
    /// Requested entity does not exist.
    NotFound(String),
}

impl AwcpError {
    /// Shorthand for a typed protocol error.
    #[must_use]
    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Protocol(ProtocolError::new(code, message))
    }

    /// Borrow the inner protocol error when this is a typed refusal.
    #[must_use]
    pub fn as_protocol(&self) -> Option<&ProtocolError> {
        match self {
            Self::Protocol(err) => Some(err),
            _ => None,
        }
    }

    /// Convert into a wire-ready protocol error, coercing untyped failure
    /// domains to `fallback` with the original message preserved.
    #[must_use]
    pub fn into_protocol(self, fallback: ErrorCode) -> ProtocolError {
        match self {
            Self::Protocol(err) => err,
            other => ProtocolError::new(fallback, other.to_string()),
        }
    }
}

impl Display for AwcpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Protocol(err) => write!(f, "protocol: {err}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Store(msg) => write!(f, "store: {msg}"),
            Self::Workspace(msg) => write!(f, "workspace: {msg}"),
            Self::Admission(msg) => write!(f, "admission: {msg}"),
            Self::Http(msg) => write!(f, "http: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for AwcpError {}

impl From<ProtocolError> for AwcpError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl From<toml::de::Error> for AwcpError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AwcpError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AwcpError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(format!("json: {err}"))
    }
}

impl From<reqwest::Error> for AwcpError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}
