//! Executor-side protocol engine.
//!
//! Drives each delegation through
//! `pending_admission → starting → running → (completed | failed | cancelled)`.
//! INVITE admission is strict: the (N+1)th concurrent delegation is declined,
//! never queued. START launches the asynchronous execution pipeline; ERROR is
//! a unilateral cancellation from the delegator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::ExecutorConfig;
use crate::errors::{ErrorCode, ProtocolError};
use crate::models::delegation::{ExecutorConstraints, ExecutorPhase, SandboxProfile};
use crate::models::lease::ActiveLease;
use crate::models::resource::AccessMode;
use crate::protocol::events::DelegationEvent;
use crate::protocol::messages::{
    check_version, AcceptMessage, Ack, ErrorMessage, InviteMessage, StartMessage, WorkDirInfo,
};
use crate::protocol::PROTOCOL_VERSION;
use crate::transport::{ExecutorTransport, SnapshotPayload};
use crate::{AwcpError, Result};

use super::bus::EventBus;
use super::runner::{StatusSink, TaskInput, TaskRunner, CANCEL_GRACE};
use super::workspace::WorkspaceManager;

/// Optional user gate consulted during INVITE admission.
pub type AdmissionHook = Box<dyn Fn(&InviteMessage) -> bool + Send + Sync>;

/// An admitted INVITE awaiting START.
struct PendingAdmission {
    invite: InviteMessage,
    work_path: PathBuf,
    admitted_at: DateTime<Utc>,
}

/// A delegation currently executing.
struct ActiveDelegation {
    work_path: PathBuf,
    phase: ExecutorPhase,
    cancel: CancellationToken,
}

/// How a finished delegation ended.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    /// Task succeeded.
    Completed {
        /// Runner summary.
        summary: String,
        /// Optional notable outcomes.
        highlights: Option<Vec<String>>,
    },
    /// Task or setup failed, or the delegation was cancelled/expired.
    Failed(ProtocolError),
}

/// Retained terminal record served by `GET /tasks/{id}/result`.
#[derive(Debug, Clone)]
pub struct ResultRecord {
    /// Terminal outcome.
    pub outcome: CompletionOutcome,
    /// Captured snapshot payload, kept for post-SSE recovery.
    pub snapshot_payload: Option<SnapshotPayload>,
    /// When the delegation finished.
    pub completed_at: DateTime<Utc>,
}

/// Aggregate counters served by `GET /status`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatusCounters {
    /// Admitted, not yet started.
    pub pending: usize,
    /// Currently executing.
    pub active: usize,
    /// Retained terminal records.
    pub completed: usize,
    /// Configured concurrency ceiling.
    pub capacity: u32,
}

/// Engine state shared by every handle clone.
struct Inner {
    config: ExecutorConfig,
    workspace: WorkspaceManager,
    transport: Arc<dyn ExecutorTransport>,
    runner: Arc<dyn TaskRunner>,
    bus: Arc<EventBus>,
    pending: Mutex<HashMap<String, PendingAdmission>>,
    active: Mutex<HashMap<String, ActiveDelegation>>,
    completed: Mutex<HashMap<String, ResultRecord>>,
    admission_hook: Mutex<Option<AdmissionHook>>,
    shutdown: CancellationToken,
}

/// The executor protocol engine: a cheap-to-clone handle over shared state.
#[derive(Clone)]
pub struct ExecutorEngine {
    inner: Arc<Inner>,
}

impl ExecutorEngine {
    /// Build an engine over its collaborators.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Workspace` if the work root cannot be prepared.
    pub fn new(
        config: ExecutorConfig,
        transport: Arc<dyn ExecutorTransport>,
        runner: Arc<dyn TaskRunner>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let workspace = WorkspaceManager::new(&config.work_root)?;
        let bus = Arc::new(EventBus::new(
            config.subscriber_watermark,
            config.result_retention_ms,
        ));
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                workspace,
                transport,
                runner,
                bus,
                pending: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                completed: Mutex::new(HashMap::new()),
                admission_hook: Mutex::new(None),
                shutdown,
            }),
        })
    }

    /// Install the user admission gate consulted after the mechanical
    /// checks pass.
    pub fn set_admission_hook(&self, hook: AdmissionHook) {
        *self
            .inner
            .admission_hook
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(hook);
    }

    /// The event fan-out hub.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Executor configuration in force.
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Initialize the transport and optionally sweep stale work paths.
    ///
    /// # Errors
    ///
    /// Returns the transport or workspace error on failure.
    pub async fn initialize(&self, sweep_stale: bool) -> Result<()> {
        self.inner
            .transport
            .initialize(self.inner.workspace.root())
            .await?;
        if sweep_stale {
            let removed = self.inner.workspace.cleanup_stale()?;
            if removed > 0 {
                info!(removed, "stale work directories reclaimed at startup");
            }
        }
        Ok(())
    }

    /// Evaluate an INVITE against the admission gates.
    ///
    /// Gate order: version, duplicate id, concurrency, access mode,
    /// transport dependency, user hook, work path allocation. On success
    /// the work path is reserved and the event channel opened.
    pub async fn handle_invite(
        &self,
        invite: InviteMessage,
    ) -> std::result::Result<AcceptMessage, ProtocolError> {
        let span = info_span!("handle_invite", delegation_id = %invite.delegation_id);
        let _guard = span.enter();

        check_version(&invite.version)?;

        let delegation_id = invite.delegation_id.clone();
        if self.is_in_flight(&delegation_id) {
            return Err(ProtocolError::new(
                ErrorCode::Declined,
                format!("delegation {delegation_id} already admitted"),
            ));
        }

        // Strict concurrency gate: decline, never queue.
        let in_flight = self.in_flight_count();
        if in_flight >= self.inner.config.max_concurrent_delegations as usize {
            return Err(ProtocolError::new(
                ErrorCode::Declined,
                format!(
                    "executor at capacity ({in_flight}/{})",
                    self.inner.config.max_concurrent_delegations
                ),
            )
            .with_hint("retry after an active delegation completes"));
        }

        let accepted_access_mode = self.accept_access_mode(invite.lease.access_mode)?;

        let dependency = self
            .inner
            .transport
            .check_dependency()
            .await
            .map_err(|err| err.into_protocol(ErrorCode::DepMissing))?;
        if !dependency.available {
            let mut refusal = ProtocolError::new(
                ErrorCode::DepMissing,
                format!("transport '{}' unavailable", self.inner.transport.kind()),
            );
            if let Some(hint) = dependency.hint {
                refusal = refusal.with_hint(hint);
            }
            return Err(refusal);
        }

        // User gate runs last so mechanical refusals take precedence.
        let admitted_by_hook = {
            let hook = self
                .inner
                .admission_hook
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match hook.as_ref() {
                Some(hook) => hook(&invite),
                None => self.inner.config.auto_accept,
            }
        };
        if !admitted_by_hook {
            return Err(ProtocolError::new(
                ErrorCode::Declined,
                "delegation declined by executor policy",
            ));
        }

        let work_path = self
            .inner
            .workspace
            .allocate(&delegation_id)
            .map_err(|err| ProtocolError::new(ErrorCode::WorkdirDenied, err.to_string()))?;

        // The event channel exists from admission onward so SSE subscribers
        // can never race START.
        self.inner.bus.open(&delegation_id);

        let accept = AcceptMessage {
            version: PROTOCOL_VERSION.into(),
            delegation_id: delegation_id.clone(),
            executor_work_dir: WorkDirInfo {
                path: work_path.to_string_lossy().into_owned(),
            },
            executor_constraints: ExecutorConstraints {
                accepted_access_mode,
                max_ttl_seconds: self.inner.config.max_ttl_seconds,
                sandbox_profile: SandboxProfile::default(),
            },
        };

        self.inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                delegation_id.clone(),
                PendingAdmission {
                    invite,
                    work_path,
                    admitted_at: Utc::now(),
                },
            );

        info!(delegation_id, mode = %accepted_access_mode, "INVITE admitted");
        Ok(accept)
    }

    /// Accept a START for a previously admitted delegation and launch the
    /// asynchronous execution pipeline.
    pub fn handle_start(&self, start: StartMessage) -> std::result::Result<Ack, ProtocolError> {
        let span = info_span!("handle_start", delegation_id = %start.delegation_id);
        let _guard = span.enter();

        check_version(&start.version)?;

        let delegation_id = start.delegation_id.clone();
        let Some(admission) = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&delegation_id)
        else {
            return Err(ProtocolError::new(
                ErrorCode::StartExpired,
                format!("no pending admission for delegation {delegation_id}"),
            ));
        };

        if start.lease.is_expired(Utc::now()) {
            self.inner
                .workspace
                .release(&delegation_id, &admission.work_path);
            self.inner.bus.discard(&delegation_id);
            return Err(ProtocolError::new(
                ErrorCode::StartExpired,
                "lease already expired at START",
            ));
        }

        let cancel = self.inner.shutdown.child_token();
        self.inner
            .active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                delegation_id.clone(),
                ActiveDelegation {
                    work_path: admission.work_path.clone(),
                    phase: ExecutorPhase::Starting,
                    cancel: cancel.clone(),
                },
            );

        let engine = self.clone();
        let run_span = info_span!("run_delegation", delegation_id = %delegation_id);
        tokio::spawn(
            async move {
                engine
                    .run_delegation(admission.invite, start, admission.work_path, cancel)
                    .await;
            }
            .instrument(run_span),
        );

        info!(
            delegation_id,
            admitted_at = %admission.admitted_at,
            "delegation started"
        );
        Ok(Ack::ok())
    }

    /// Unilateral cancellation (or refusal notice) from the delegator.
    pub fn handle_error(&self, message: ErrorMessage) -> std::result::Result<Ack, ProtocolError> {
        let span = info_span!("handle_error", delegation_id = %message.delegation_id);
        let _guard = span.enter();

        let delegation_id = &message.delegation_id;

        // Running: cooperative cancellation; the run task emits the
        // CANCELLED terminal and releases.
        if let Some(active) = self
            .inner
            .active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(delegation_id)
        {
            info!(delegation_id, code = %message.error.code, "cancelling running delegation");
            active.cancel.cancel();
            return Ok(Ack::ok());
        }

        // Admitted but not started: discard the admission quietly.
        if let Some(admission) = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(delegation_id)
        {
            info!(delegation_id, "discarding unstarted admission");
            self.inner
                .workspace
                .release(delegation_id, &admission.work_path);
            self.inner.bus.discard(delegation_id);
            return Ok(Ack::ok());
        }

        Err(ProtocolError::new(
            ErrorCode::NotFound,
            format!("unknown delegation {delegation_id}"),
        ))
    }

    /// Terminal record lookup for `GET /tasks/{id}/result`.
    #[must_use]
    pub fn result_record(&self, delegation_id: &str) -> Option<ResultRecord> {
        self.prune_completed();
        self.inner
            .completed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(delegation_id)
            .cloned()
    }

    /// Whether the delegation is currently admitted or executing.
    #[must_use]
    pub fn is_in_flight(&self, delegation_id: &str) -> bool {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(delegation_id)
            || self
                .inner
                .active
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .contains_key(delegation_id)
    }

    /// Aggregate counters for `GET /status`.
    #[must_use]
    pub fn status_counters(&self) -> StatusCounters {
        self.prune_completed();
        StatusCounters {
            pending: self
                .inner
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .len(),
            active: self
                .inner
                .active
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .len(),
            completed: self
                .inner
                .completed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .len(),
            capacity: self.inner.config.max_concurrent_delegations,
        }
    }

    /// Cancel every in-flight delegation and release their work paths.
    ///
    /// Called at shutdown when `cleanup_on_shutdown` is set; also invoked
    /// implicitly through the shared cancellation token.
    pub async fn shutdown_cleanup(&self) {
        self.inner.shutdown.cancel();

        let pending: Vec<(String, PathBuf)> = {
            let mut map = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.drain().map(|(id, adm)| (id, adm.work_path)).collect()
        };
        for (id, path) in pending {
            self.inner.bus.discard(&id);
            self.inner.workspace.release(&id, &path);
        }

        // Give running tasks a moment to observe cancellation and emit
        // their terminals before the process exits.
        let deadline = tokio::time::Instant::now() + CANCEL_GRACE;
        loop {
            let active = self
                .inner
                .active
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .len();
            if active == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Err(err) = self.inner.transport.shutdown().await {
            warn!(%err, "transport shutdown failed");
        }
    }

    fn in_flight_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
            + self
                .inner
                .active
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .len()
    }

    fn accept_access_mode(
        &self,
        requested: AccessMode,
    ) -> std::result::Result<AccessMode, ProtocolError> {
        if self.inner.config.allowed_access_modes.contains(&requested) {
            return Ok(requested);
        }
        // A read-write request may be downgraded when only read-only is
        // granted; the delegator adopts the downgrade from ACCEPT.
        if requested == AccessMode::Rw
            && self
                .inner
                .config
                .allowed_access_modes
                .contains(&AccessMode::Ro)
        {
            return Ok(AccessMode::Ro);
        }
        Err(ProtocolError::new(
            ErrorCode::Declined,
            format!("access mode '{requested}' is not granted by this executor"),
        ))
    }

    fn set_phase(&self, delegation_id: &str, phase: ExecutorPhase) {
        if let Some(active) = self
            .inner
            .active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get_mut(delegation_id)
        {
            active.phase = phase;
        }
    }

    fn prune_completed(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(
                i64::try_from(self.inner.config.result_retention_ms).unwrap_or(i64::MAX),
            );
        self.inner
            .completed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|_, record| record.completed_at > cutoff);
    }

    /// The asynchronous execution pipeline for one started delegation.
    async fn run_delegation(
        self,
        invite: InviteMessage,
        start: StartMessage,
        work_path: PathBuf,
        cancel: CancellationToken,
    ) {
        let delegation_id = start.delegation_id.clone();
        let lease = start.lease;

        let result = self
            .execute(&invite, &start, &work_path, lease, &cancel)
            .await;

        let (terminal, record) = match result {
            Ok((outcome, payload)) => {
                let snapshot_id = payload.as_ref().map(|_| uuid::Uuid::new_v4().to_string());
                if let (Some(sid), Some(payload)) = (&snapshot_id, &payload) {
                    let snapshot_event = DelegationEvent::Snapshot {
                        snapshot_id: sid.clone(),
                        summary: outcome.summary.clone(),
                        highlights: outcome.highlights.clone(),
                        payload: payload.clone(),
                        recommended: true,
                    };
                    if let Err(err) = self.inner.bus.publish(&delegation_id, snapshot_event) {
                        warn!(delegation_id, %err, "snapshot event delivery failed");
                    }
                }
                let done = DelegationEvent::Done {
                    summary: outcome.summary.clone(),
                    highlights: outcome.highlights.clone(),
                    snapshot_ids: snapshot_id.clone().map(|sid| vec![sid]),
                    recommended_snapshot_id: snapshot_id,
                };
                self.set_phase(&delegation_id, ExecutorPhase::Completed);
                (
                    done,
                    ResultRecord {
                        outcome: CompletionOutcome::Completed {
                            summary: outcome.summary,
                            highlights: outcome.highlights,
                        },
                        snapshot_payload: payload,
                        completed_at: Utc::now(),
                    },
                )
            }
            Err(err) => {
                let protocol = err.into_protocol(ErrorCode::TaskFailed);
                let phase = match protocol.code {
                    ErrorCode::Cancelled => ExecutorPhase::Cancelled,
                    _ => ExecutorPhase::Failed,
                };
                self.set_phase(&delegation_id, phase);
                error!(
                    delegation_id,
                    code = %protocol.code,
                    message = %protocol.message,
                    "delegation failed"
                );
                (
                    DelegationEvent::from_error(protocol.clone()),
                    ResultRecord {
                        outcome: CompletionOutcome::Failed(protocol),
                        snapshot_payload: None,
                        completed_at: Utc::now(),
                    },
                )
            }
        };

        if let Err(err) = self.inner.bus.publish(&delegation_id, terminal) {
            warn!(delegation_id, %err, "terminal event delivery failed");
        }

        // Cleanup failures are logged, never masking the terminal already
        // published above.
        if let Err(err) = self
            .inner
            .transport
            .release(&delegation_id, &work_path)
            .await
        {
            warn!(delegation_id, %err, "transport release failed");
        }
        self.inner.workspace.release(&delegation_id, &work_path);

        self.inner
            .active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&delegation_id);
        self.inner
            .completed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(delegation_id.clone(), record);

        info!(delegation_id, "delegation finished and released");
    }

    async fn execute(
        &self,
        invite: &InviteMessage,
        start: &StartMessage,
        work_path: &std::path::Path,
        lease: ActiveLease,
        cancel: &CancellationToken,
    ) -> Result<(super::runner::TaskOutcome, Option<SnapshotPayload>)> {
        let delegation_id = &start.delegation_id;

        self.inner
            .workspace
            .prepare(work_path)
            .map_err(|err| AwcpError::protocol(ErrorCode::SetupFailed, err.to_string()))?;

        let actual_work_path = self
            .inner
            .transport
            .setup(delegation_id, &start.work_dir, work_path)
            .await
            .map_err(|err| AwcpError::Protocol(err.into_protocol(ErrorCode::SetupFailed)))?;

        self.set_phase(delegation_id, ExecutorPhase::Running);
        self.inner.bus.publish(
            delegation_id,
            DelegationEvent::status("task running", Some("running".into())),
        )?;

        let input = TaskInput {
            delegation_id: delegation_id.clone(),
            work_path: actual_work_path.clone(),
            task: invite.task.clone(),
            environment: invite.environment.resources.clone(),
        };
        let sink = StatusSink::new(Arc::clone(&self.inner.bus), delegation_id.clone());

        let deadline = lease_deadline(lease.expires_at);
        let run_fut = self.inner.runner.run(input, sink, cancel.clone());
        tokio::pin!(run_fut);

        let outcome = tokio::select! {
            result = &mut run_fut => result?,
            () = cancel.cancelled() => {
                // Give the runner a grace period to observe cancellation.
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut run_fut).await;
                return Err(AwcpError::protocol(
                    ErrorCode::Cancelled,
                    "delegation cancelled by delegator",
                ));
            }
            () = tokio::time::sleep(deadline) => {
                cancel.cancel();
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut run_fut).await;
                return Err(AwcpError::protocol(
                    ErrorCode::Expired,
                    "lease expired during execution",
                ));
            }
        };

        let capabilities = self.inner.transport.capabilities();
        let payload = if capabilities.supports_snapshots
            && !capabilities.live_sync
            && lease.access_mode == AccessMode::Rw
        {
            self.inner
                .transport
                .capture_snapshot(delegation_id, &actual_work_path)
                .await
                .map_err(|err| AwcpError::Protocol(err.into_protocol(ErrorCode::SetupFailed)))?
        } else {
            None
        };

        Ok((outcome, payload))
    }
}

/// Time until the lease deadline, saturating at zero.
fn lease_deadline(expires_at: DateTime<Utc>) -> Duration {
    (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
