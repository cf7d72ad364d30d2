//! Lease bounds on a delegation's lifetime and permissions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::resource::AccessMode;

/// What the delegator asks for when inviting an executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRequest {
    /// Requested lifetime in seconds.
    pub ttl_seconds: u64,
    /// Requested access mode.
    pub access_mode: AccessMode,
}

impl LeaseRequest {
    /// Clamp the requested TTL to the executor's maximum and adopt the
    /// (possibly downgraded) access mode the executor accepted.
    #[must_use]
    pub fn constrain(self, max_ttl_seconds: u64, accepted_mode: AccessMode) -> Self {
        Self {
            ttl_seconds: self.ttl_seconds.min(max_ttl_seconds),
            access_mode: accepted_mode,
        }
    }
}

/// The lease granted when START is issued: an absolute deadline plus mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveLease {
    /// Absolute expiry instant (delegator clock).
    pub expires_at: DateTime<Utc>,
    /// Granted access mode.
    pub access_mode: AccessMode,
}

impl ActiveLease {
    /// Grant a lease starting now for the request's TTL.
    #[must_use]
    pub fn grant(request: LeaseRequest, now: DateTime<Utc>) -> Self {
        let ttl = i64::try_from(request.ttl_seconds).unwrap_or(i64::MAX);
        Self {
            expires_at: now + Duration::seconds(ttl),
            access_mode: request.access_mode,
        }
    }

    /// Whether the lease deadline has passed at `now`.
    ///
    /// Each side reads its own clock; bounded skew is tolerated implicitly.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
