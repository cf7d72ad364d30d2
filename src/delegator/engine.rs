//! Delegator-side protocol engine.
//!
//! Drives each delegation through
//! `created → invited → accepted → started → running → terminal`, sending
//! INVITE/START, consuming the executor's event stream with reconnect, and
//! reconciling snapshots per policy. Records are durable: every mutation is
//! persisted through the delegation store before control returns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{DelegatorConfig, GlobalConfig};
use crate::errors::{ErrorCode, ProtocolError};
use crate::models::delegation::{DelegationRecord, DelegationResult, DelegationState, TaskSpec};
use crate::models::lease::{ActiveLease, LeaseRequest};
use crate::models::resource::Resource;
use crate::models::snapshot::{SnapshotPolicy, SnapshotRecord, SnapshotStatus};
use crate::protocol::events::DelegationEvent;
use crate::protocol::messages::{
    EnvironmentSpec, ErrorMessage, InviteMessage, ProtocolMessage, StartMessage,
};
use crate::protocol::PROTOCOL_VERSION;
use crate::transport::{DelegatorTransport, SnapshotPayload, TransportHandle};
use crate::{AwcpError, Result};

use super::admission::AdmissionController;
use super::materializer::{MaterializeStrategy, ResourceMaterializer};
use super::snapshots::{ReceivedSnapshot, SnapshotManager};
use super::sse_client::{run_subscription, SseClientConfig};
use super::store::DelegationStore;

/// Parameters accepted by [`DelegatorEngine::create`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CreateDelegation {
    /// Executor base URL; falls back to the configured default peer.
    #[serde(default)]
    pub peer_url: Option<String>,
    /// The work to delegate.
    pub task: TaskSpec,
    /// Named resources forming the delegated environment.
    pub resources: Vec<Resource>,
    /// Lease override; defaults come from configuration.
    #[serde(default)]
    pub lease: Option<LeaseRequest>,
    /// Snapshot policy override.
    #[serde(default)]
    pub snapshot_policy: Option<SnapshotPolicy>,
}

/// Engine lifecycle notifications for embedders and observability.
#[derive(Debug, Clone)]
pub enum DelegatorNotification {
    /// A delegation record was created and materialized.
    Created {
        /// The new delegation id.
        delegation_id: String,
    },
    /// The delegation changed lifecycle state.
    StateChanged {
        /// The delegation id.
        delegation_id: String,
        /// The state entered.
        state: DelegationState,
    },
    /// A snapshot arrived and was dispatched per policy.
    SnapshotReceived {
        /// The delegation id.
        delegation_id: String,
        /// The snapshot id.
        snapshot_id: String,
        /// Disposition after dispatch.
        status: SnapshotStatus,
    },
    /// A snapshot was merged into the export tree.
    SnapshotApplied {
        /// The delegation id.
        delegation_id: String,
        /// The snapshot id.
        snapshot_id: String,
    },
}

/// Mirror of the executor's result-recovery response body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecoveredResult {
    status: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    highlights: Option<Vec<String>>,
    #[serde(default)]
    snapshot_payload: Option<SnapshotPayload>,
    #[serde(default)]
    error: Option<ProtocolError>,
}

type RecordHandle = Arc<Mutex<DelegationRecord>>;

/// Engine state shared by every handle clone.
struct Inner {
    config: DelegatorConfig,
    store: DelegationStore,
    materializer: ResourceMaterializer,
    admission: AdmissionController,
    snapshots: SnapshotManager,
    transport: Arc<dyn DelegatorTransport>,
    http: reqwest::Client,
    records: Mutex<HashMap<String, RecordHandle>>,
    tasks: std::sync::Mutex<HashMap<String, CancellationToken>>,
    notifications: std::sync::Mutex<Option<mpsc::UnboundedSender<DelegatorNotification>>>,
    shutdown: CancellationToken,
}

/// The delegator protocol engine: a cheap-to-clone handle over shared state.
#[derive(Clone)]
pub struct DelegatorEngine {
    inner: Arc<Inner>,
}

impl DelegatorEngine {
    /// Build an engine over the configured base directory and transport.
    ///
    /// # Errors
    ///
    /// Returns configuration or store errors from collaborator setup.
    pub fn new(
        config: &GlobalConfig,
        transport: Arc<dyn DelegatorTransport>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let delegator = config.delegator.clone();
        let store = DelegationStore::open(config.delegations_dir())?;
        let materializer =
            ResourceMaterializer::new(config.environments_dir(), MaterializeStrategy::default());
        let admission = AdmissionController::new(delegator.admission.clone())?;
        let snapshots =
            SnapshotManager::new(config.snapshots_dir(), delegator.defaults.max_snapshots);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(
                delegator.connection.request_timeout_seconds,
            ))
            .build()
            .map_err(|err| AwcpError::Http(format!("http client build: {err}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                config: delegator,
                store,
                materializer,
                admission,
                snapshots,
                transport,
                http,
                records: Mutex::new(HashMap::new()),
                tasks: std::sync::Mutex::new(HashMap::new()),
                notifications: std::sync::Mutex::new(None),
                shutdown,
            }),
        })
    }

    /// Delegator configuration in force.
    #[must_use]
    pub fn config(&self) -> &DelegatorConfig {
        &self.inner.config
    }

    /// Subscribe to engine notifications. The previous subscriber, if any,
    /// is replaced.
    pub fn subscribe_notifications(&self) -> mpsc::UnboundedReceiver<DelegatorNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .inner
            .notifications
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Initialize the transport and reconcile on-disk state after a
    /// restart: in-flight delegations from a prior process become
    /// recoverable `SSE_FAILED` errors, and orphaned export/snapshot
    /// directories are swept.
    ///
    /// # Errors
    ///
    /// Returns store or transport errors; sweep failures are logged only.
    pub async fn startup(&self, sweep_stale: bool) -> Result<()> {
        self.inner.transport.initialize().await?;

        let records = self.inner.store.list().await?;
        let mut known_ids = Vec::with_capacity(records.len());
        for mut record in records {
            known_ids.push(record.id.clone());
            if !record.is_terminal() {
                warn!(
                    delegation_id = %record.id,
                    state = ?record.state,
                    "delegation interrupted by restart; marking recoverable"
                );
                let interrupted = ProtocolError::new(
                    ErrorCode::SseFailed,
                    "delegator restarted while the delegation was in flight",
                )
                .with_hint("use recover() to fetch the executor's cached result");
                record.fail(DelegationState::Error, interrupted)?;
                self.inner.store.save(&record).await?;
            }
        }

        if sweep_stale {
            if let Err(err) = self.inner.materializer.sweep_stale(&known_ids) {
                warn!(%err, "export sweep failed");
            }
            if let Err(err) = self.inner.snapshots.sweep_stale(&known_ids) {
                warn!(%err, "snapshot sweep failed");
            }
        }
        Ok(())
    }

    /// Create a delegation: admission scan, record persistence, export
    /// materialization. Nothing is sent to the executor yet.
    ///
    /// # Errors
    ///
    /// Returns the admission refusal (`WORKSPACE_TOO_LARGE`, `DECLINED`)
    /// or materialization failure; neither leaves a record or a partial
    /// export behind.
    pub async fn create(&self, params: CreateDelegation) -> Result<DelegationRecord> {
        let peer_url = params
            .peer_url
            .or_else(|| self.inner.config.peer_url.clone())
            .ok_or_else(|| {
                AwcpError::Config("no peer_url given and no default configured".into())
            })?;

        validate_environment(&params.resources)?;

        let lease = params.lease.unwrap_or(LeaseRequest {
            ttl_seconds: self.inner.config.defaults.lease_ttl_seconds,
            access_mode: self.inner.config.defaults.lease_access_mode,
        });
        let policy = params
            .snapshot_policy
            .unwrap_or(self.inner.config.defaults.snapshot_mode);

        let mut record =
            DelegationRecord::new(peer_url, params.task, params.resources, lease, policy);
        let span = info_span!("create_delegation", delegation_id = %record.id);
        let _guard = span.enter();

        // Admission runs against the sources before anything is built, so
        // a refusal cannot leave a half-constructed export.
        let report = self.inner.admission.admit(&record.id, &record.environment)?;
        record.admission = Some(report);

        let export = self
            .inner
            .materializer
            .materialize(&record.id, &record.environment)?;
        record.export_path = Some(export);
        record.touch();

        self.inner.store.save(&record).await?;
        self.inner
            .records
            .lock()
            .await
            .insert(record.id.clone(), Arc::new(Mutex::new(record.clone())));

        self.notify(DelegatorNotification::Created {
            delegation_id: record.id.clone(),
        });
        info!("delegation created");
        Ok(record)
    }

    /// Launch the background task that drives a created delegation to a
    /// terminal state.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::NotFound` for unknown ids.
    pub async fn launch(&self, delegation_id: &str) -> Result<()> {
        let handle = self.record_handle(delegation_id).await?;
        let cancel = self.inner.shutdown.child_token();
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(delegation_id.to_owned(), cancel.clone());

        let engine = self.clone();
        let id = delegation_id.to_owned();
        let span = info_span!("drive_delegation", delegation_id = %id);
        tokio::spawn(
            async move {
                engine.drive(id, handle, cancel).await;
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Convenience: create then launch.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::create`] and [`Self::launch`] failures.
    pub async fn delegate(&self, params: CreateDelegation) -> Result<DelegationRecord> {
        let record = self.create(params).await?;
        self.launch(&record.id).await?;
        Ok(record)
    }

    /// Current record state.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::NotFound` for unknown ids.
    pub async fn get(&self, delegation_id: &str) -> Result<DelegationRecord> {
        let handle = self.record_handle(delegation_id).await?;
        let record = handle.lock().await;
        Ok(record.clone())
    }

    /// Snapshot records for a delegation.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::NotFound` for unknown ids.
    pub async fn list_snapshots(&self, delegation_id: &str) -> Result<Vec<SnapshotRecord>> {
        Ok(self.get(delegation_id).await?.snapshots)
    }

    /// Apply a staged snapshot.
    ///
    /// # Errors
    ///
    /// Propagates [`SnapshotManager::apply`] refusals and transport errors.
    pub async fn apply_snapshot(&self, delegation_id: &str, snapshot_id: &str) -> Result<()> {
        let handle = self.record_handle(delegation_id).await?;
        let mut record = handle.lock().await;
        self.inner
            .snapshots
            .apply(&mut record, snapshot_id, &self.inner.transport)
            .await?;
        self.inner.store.save(&record).await?;
        self.notify(DelegatorNotification::SnapshotApplied {
            delegation_id: delegation_id.to_owned(),
            snapshot_id: snapshot_id.to_owned(),
        });
        Ok(())
    }

    /// Discard a pending snapshot.
    ///
    /// # Errors
    ///
    /// Propagates [`SnapshotManager::discard`] refusals.
    pub async fn discard_snapshot(&self, delegation_id: &str, snapshot_id: &str) -> Result<()> {
        let handle = self.record_handle(delegation_id).await?;
        let mut record = handle.lock().await;
        self.inner.snapshots.discard(&mut record, snapshot_id)?;
        self.inner.store.save(&record).await?;
        Ok(())
    }

    /// Cancel a delegation: notify the executor, transition to
    /// `cancelled`, and release transport state.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::NotFound` for unknown ids; peer notification
    /// failures are logged, not propagated.
    pub async fn cancel(&self, delegation_id: &str) -> Result<()> {
        let span = info_span!("cancel_delegation", delegation_id);
        let _guard = span.enter();

        let handle = self.record_handle(delegation_id).await?;
        let mut record = handle.lock().await;
        if record.is_terminal() {
            return Ok(());
        }

        self.stop_background(delegation_id);

        // Best-effort executor notice; local cancellation proceeds anyway.
        let notice = ProtocolMessage::Error(ErrorMessage::new(
            delegation_id,
            ProtocolError::new(ErrorCode::Cancelled, "delegation cancelled by delegator"),
        ));
        if let Err(err) = self.post_message(&record.peer_url, &notice).await {
            warn!(%err, "executor cancellation notice failed");
        }

        record.fail(
            DelegationState::Cancelled,
            ProtocolError::new(ErrorCode::Cancelled, "cancelled by owner"),
        )?;
        self.inner.store.save(&record).await?;
        self.notify_state(&record);

        if let Err(err) = self.inner.transport.release(delegation_id).await {
            warn!(%err, "transport release failed during cancel");
        }
        info!("delegation cancelled");
        Ok(())
    }

    /// Release a delegation entirely: cancel if still live, then delete
    /// the record, export tree, and staged snapshots.
    ///
    /// # Errors
    ///
    /// Returns store errors; filesystem cleanup failures are logged only.
    pub async fn release(&self, delegation_id: &str) -> Result<()> {
        if let Ok(record) = self.get(delegation_id).await {
            if !record.is_terminal() {
                self.cancel(delegation_id).await?;
            }
        }
        self.purge(delegation_id).await
    }

    /// Fetch the executor's cached terminal result after an `SSE_FAILED`
    /// terminal, rewriting the delegation to its true outcome.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::NotFound` when the executor no longer holds a
    /// result, HTTP errors from the fetch, or `DECLINED` when the
    /// delegation is not in a recoverable state.
    pub async fn recover(&self, delegation_id: &str, peer_url: &str) -> Result<DelegationRecord> {
        let span = info_span!("recover_delegation", delegation_id);
        let _guard = span.enter();

        let handle = self.record_handle(delegation_id).await?;
        let mut record = handle.lock().await;

        let recoverable = record.state == DelegationState::Error
            && record
                .error
                .as_ref()
                .is_some_and(|err| err.code == ErrorCode::SseFailed);
        if !recoverable {
            return Err(AwcpError::protocol(
                ErrorCode::Declined,
                "delegation is not awaiting recovery",
            ));
        }

        let url = format!(
            "{}/tasks/{delegation_id}/result",
            peer_url.trim_end_matches('/')
        );
        let mut request = self.inner.http.get(&url);
        if let Some(token) = &self.inner.config.peer_auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AwcpError::Http(format!(
                "result fetch returned {}",
                response.status()
            )));
        }
        let recovered: RecoveredResult = response.json().await?;

        match recovered.status.as_str() {
            "completed" => {
                if let Some(payload) = &recovered.snapshot_payload {
                    let received = ReceivedSnapshot {
                        snapshot_id: uuid::Uuid::new_v4().to_string(),
                        summary: recovered
                            .summary
                            .clone()
                            .unwrap_or_else(|| "recovered snapshot".into()),
                        highlights: recovered.highlights.clone(),
                        recommended: true,
                    };
                    let status = self
                        .inner
                        .snapshots
                        .on_received(&mut record, received.clone(), payload, &self.inner.transport)
                        .await?;
                    self.notify(DelegatorNotification::SnapshotReceived {
                        delegation_id: delegation_id.to_owned(),
                        snapshot_id: received.snapshot_id,
                        status,
                    });
                }
                // The SSE_FAILED terminal is superseded by the executor's
                // authoritative outcome.
                record.state = DelegationState::Completed;
                record.error = None;
                record.result = Some(DelegationResult {
                    summary: recovered
                        .summary
                        .unwrap_or_else(|| "recovered result".into()),
                    highlights: recovered.highlights,
                    notes: None,
                });
                record.touch();
            }
            "error" => {
                record.state = DelegationState::Error;
                record.error = Some(recovered.error.unwrap_or_else(|| {
                    ProtocolError::new(ErrorCode::TaskFailed, "executor reported failure")
                }));
                record.result = None;
                record.touch();
            }
            "running" => {
                return Err(AwcpError::protocol(
                    ErrorCode::Declined,
                    "delegation is still running on the executor",
                ));
            }
            other => {
                return Err(AwcpError::NotFound(format!(
                    "executor holds no result (status '{other}')"
                )));
            }
        }

        self.inner.store.save(&record).await?;
        self.notify_state(&record);

        if let Err(err) = self.inner.transport.release(delegation_id).await {
            warn!(%err, "transport release failed after recovery");
        }
        info!(state = ?record.state, "delegation recovered");
        Ok(record.clone())
    }

    /// All known records, for listing and the retention reaper.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn list(&self) -> Result<Vec<DelegationRecord>> {
        self.inner.store.list().await
    }

    /// Delete terminal delegations older than the retention window.
    pub async fn reap_expired(&self) {
        let retention =
            chrono::Duration::hours(i64::from(self.inner.config.delegation_retention_hours));
        let cutoff = Utc::now() - retention;

        let records = match self.inner.store.list().await {
            Ok(records) => records,
            Err(err) => {
                error!(%err, "retention reap could not list records");
                return;
            }
        };
        for record in records {
            if record.is_terminal() && record.updated_at < cutoff {
                info!(delegation_id = %record.id, "reaping expired delegation");
                if let Err(err) = self.purge(&record.id).await {
                    warn!(delegation_id = %record.id, %err, "retention purge failed");
                }
            }
        }
    }

    // ── Internal lifecycle ──────────────────────────────────────────────

    /// Drive one delegation from `created` to a terminal state.
    async fn drive(self, delegation_id: String, handle: RecordHandle, cancel: CancellationToken) {
        if let Err(err) = self.drive_inner(&delegation_id, &handle, cancel).await {
            let protocol = err.into_protocol(ErrorCode::SetupFailed);
            let release_transport = protocol.code != ErrorCode::SseFailed;

            let mut record = handle.lock().await;
            if !record.is_terminal() {
                error!(code = %protocol.code, message = %protocol.message, "delegation failed");
                if let Err(err) = record.fail(DelegationState::Error, protocol) {
                    error!(%err, "failed to record delegation error");
                }
                if let Err(err) = self.inner.store.save(&record).await {
                    error!(%err, "failed to persist failed delegation");
                }
                self.notify_state(&record);
            }
            drop(record);

            // An exhausted event stream keeps transport state alive for
            // the recovery window; every other failure releases now.
            if release_transport {
                if let Err(err) = self.inner.transport.release(&delegation_id).await {
                    warn!(%err, "transport release failed after error");
                }
            }
        }
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&delegation_id);
    }

    async fn drive_inner(
        &self,
        delegation_id: &str,
        handle: &RecordHandle,
        cancel: CancellationToken,
    ) -> Result<()> {
        // ── INVITE ──────────────────────────────────────────
        let (peer_url, invite) = {
            let mut record = handle.lock().await;
            record.transition_to(DelegationState::Invited)?;
            self.inner.store.save(&record).await?;
            self.notify_state(&record);
            (record.peer_url.clone(), self.build_invite(&record))
        };

        let response = self
            .post_message(&peer_url, &ProtocolMessage::Invite(invite))
            .await?;
        let accept = match serde_json::from_value::<ProtocolMessage>(response.clone()) {
            Ok(ProtocolMessage::Accept(accept)) => accept,
            Ok(ProtocolMessage::Error(err_msg)) => {
                return Err(AwcpError::Protocol(err_msg.error));
            }
            _ => {
                return Err(AwcpError::Http(format!(
                    "unexpected INVITE response: {response}"
                )));
            }
        };

        // ── Merge executor constraints, prepare transport ───
        let (export_path, ttl_seconds) = {
            let mut record = handle.lock().await;
            let constraints = accept.executor_constraints.clone();
            record.lease_requested = record
                .lease_requested
                .constrain(constraints.max_ttl_seconds, constraints.accepted_access_mode);
            record.executor_constraints = Some(constraints);
            record.transition_to(DelegationState::Accepted)?;
            self.inner.store.save(&record).await?;
            self.notify_state(&record);
            let export = record
                .export_path
                .clone()
                .ok_or_else(|| AwcpError::Store("delegation has no export tree".into()))?;
            (export, record.lease_requested.ttl_seconds)
        };

        let transport_handle = self
            .inner
            .transport
            .prepare(delegation_id, &export_path, ttl_seconds)
            .await
            .map_err(|err| AwcpError::Protocol(err.into_protocol(ErrorCode::SetupFailed)))?;

        // ── Grant the lease ─────────────────────────────────
        let lease = {
            let mut record = handle.lock().await;
            let lease = ActiveLease::grant(record.lease_requested, Utc::now());
            record.lease_active = Some(lease);
            record.transport_handle = Some(transport_handle.clone());
            self.inner.store.save(&record).await?;
            lease
        };

        // ── Event subscription ──────────────────────────────
        // The bus exists on the executor from admission time; attaching
        // before START means no event of the eventual execution is missed.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = tokio::sync::oneshot::channel();
        let sse_config = SseClientConfig {
            max_retries: self.inner.config.connection.sse_max_retries,
            retry_delay: Duration::from_millis(self.inner.config.connection.sse_retry_delay_ms),
            connect_timeout: Duration::from_secs(
                self.inner.config.connection.request_timeout_seconds,
            ),
            auth_token: self.inner.config.peer_auth_token.clone(),
        };
        let peer_for_sse = peer_url.clone();
        let id_for_sse = delegation_id.to_owned();
        let sse_cancel = cancel.clone();
        let mut subscription = tokio::spawn(async move {
            run_subscription(
                &peer_for_sse,
                &id_for_sse,
                sse_config,
                tx,
                sse_cancel,
                connected_tx,
            )
            .await
        });
        let connect_deadline =
            Duration::from_secs(self.inner.config.connection.request_timeout_seconds);
        if tokio::time::timeout(connect_deadline, connected_rx)
            .await
            .is_err()
        {
            warn!("event stream not attached before START; relying on terminal replay");
        }

        // ── START ───────────────────────────────────────────
        let start = ProtocolMessage::Start(StartMessage {
            version: PROTOCOL_VERSION.into(),
            delegation_id: delegation_id.to_owned(),
            lease,
            work_dir: transport_handle,
        });
        let start_response = self.post_message(&peer_url, &start).await?;
        if let Ok(ProtocolMessage::Error(err_msg)) =
            serde_json::from_value::<ProtocolMessage>(start_response.clone())
        {
            return Err(AwcpError::Protocol(err_msg.error));
        }
        if start_response.get("ok").and_then(serde_json::Value::as_bool) != Some(true) {
            return Err(AwcpError::protocol(
                ErrorCode::SetupFailed,
                format!("START was not acknowledged: {start_response}"),
            ));
        }

        {
            let mut record = handle.lock().await;
            record.transition_to(DelegationState::Started)?;
            self.inner.store.save(&record).await?;
            self.notify_state(&record);
        }

        // ── Lease expiry timer ──────────────────────────────
        self.spawn_lease_timer(delegation_id.to_owned(), handle.clone(), lease, cancel.clone());

        // ── Consume events until the terminal ───────────────
        let mut saw_terminal = false;
        let mut subscription_result = None;
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            if self.handle_event(delegation_id, handle, event).await? {
                                saw_terminal = true;
                                break;
                            }
                        }
                        None => {
                            // Sender gone: the subscription finished;
                            // collect its verdict below.
                            subscription_result = Some(join_subscription(&mut subscription).await);
                            break;
                        }
                    }
                }
                result = &mut subscription => {
                    // Drain events decoded before the subscription ended,
                    // the terminal included.
                    while let Ok(event) = rx.try_recv() {
                        if self.handle_event(delegation_id, handle, event).await? {
                            saw_terminal = true;
                        }
                    }
                    subscription_result = Some(flatten_join(result));
                    break;
                }
            }
        }

        // A subscription failure only surfaces when no terminal made it
        // through; a delivered terminal supersedes the stream's fate.
        if !saw_terminal {
            if let Some(Err(err)) = subscription_result {
                return Err(err);
            }
        }

        // Terminal handled inside handle_event; release transport state.
        if saw_terminal {
            if let Err(err) = self.inner.transport.release(delegation_id).await {
                warn!(%err, "transport release failed after terminal");
            }
        }
        Ok(())
    }

    /// Apply one event to the record. Returns `true` on a terminal.
    async fn handle_event(
        &self,
        delegation_id: &str,
        handle: &RecordHandle,
        event: DelegationEvent,
    ) -> Result<bool> {
        let mut record = handle.lock().await;
        if record.is_terminal() {
            return Ok(true);
        }

        match event {
            DelegationEvent::Status { message, substate } => {
                info!(delegation_id, %message, ?substate, "executor status");
                if record.state == DelegationState::Started {
                    record.transition_to(DelegationState::Running)?;
                    self.inner.store.save(&record).await?;
                    self.notify_state(&record);
                }
                Ok(false)
            }
            DelegationEvent::Snapshot {
                snapshot_id,
                summary,
                highlights,
                payload,
                recommended,
            } => {
                if self.inner.transport.capabilities().live_sync {
                    // Live-sync transports reflect changes continuously;
                    // snapshot reception is skipped by contract.
                    return Ok(false);
                }
                let received = ReceivedSnapshot {
                    snapshot_id: snapshot_id.clone(),
                    summary,
                    highlights,
                    recommended,
                };
                let status = self
                    .inner
                    .snapshots
                    .on_received(&mut record, received, &payload, &self.inner.transport)
                    .await?;
                self.inner.store.save(&record).await?;
                self.notify(DelegatorNotification::SnapshotReceived {
                    delegation_id: delegation_id.to_owned(),
                    snapshot_id: snapshot_id.clone(),
                    status,
                });
                if status == SnapshotStatus::Applied {
                    self.notify(DelegatorNotification::SnapshotApplied {
                        delegation_id: delegation_id.to_owned(),
                        snapshot_id,
                    });
                }
                Ok(false)
            }
            DelegationEvent::Done {
                summary,
                highlights,
                snapshot_ids: _,
                recommended_snapshot_id: _,
            } => {
                record.complete(DelegationResult {
                    summary,
                    highlights,
                    notes: None,
                })?;
                self.inner.store.save(&record).await?;
                self.notify_state(&record);
                info!(delegation_id, "delegation completed");
                Ok(true)
            }
            DelegationEvent::Error {
                code,
                message,
                hint,
            } => {
                let error = ProtocolError {
                    code,
                    message,
                    hint,
                };
                let state = match code {
                    ErrorCode::Cancelled => DelegationState::Cancelled,
                    ErrorCode::Expired => DelegationState::Expired,
                    _ => DelegationState::Error,
                };
                record.fail(state, error)?;
                self.inner.store.save(&record).await?;
                self.notify_state(&record);
                Ok(true)
            }
        }
    }

    fn spawn_lease_timer(
        &self,
        delegation_id: String,
        handle: RecordHandle,
        lease: ActiveLease,
        cancel: CancellationToken,
    ) {
        let engine = self.clone();
        let wait = (lease.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = cancel.cancelled() => return,
            }

            let mut record = handle.lock().await;
            if record.is_terminal() {
                return;
            }
            warn!(delegation_id, "lease expired; cancelling delegation");

            let notice = ProtocolMessage::Error(ErrorMessage::new(
                &delegation_id,
                ProtocolError::new(ErrorCode::Expired, "lease expired"),
            ));
            if let Err(err) = engine.post_message(&record.peer_url, &notice).await {
                warn!(delegation_id, %err, "executor expiry notice failed");
            }

            if let Err(err) = record.fail(
                DelegationState::Expired,
                ProtocolError::new(ErrorCode::Expired, "lease deadline passed"),
            ) {
                error!(delegation_id, %err, "failed to mark delegation expired");
                return;
            }
            if let Err(err) = engine.inner.store.save(&record).await {
                error!(delegation_id, %err, "failed to persist expiry");
            }
            engine.notify_state(&record);
            drop(record);

            cancel.cancel();
            if let Err(err) = engine.inner.transport.release(&delegation_id).await {
                warn!(delegation_id, %err, "transport release failed after expiry");
            }
        });
    }

    fn build_invite(&self, record: &DelegationRecord) -> InviteMessage {
        InviteMessage {
            version: PROTOCOL_VERSION.into(),
            delegation_id: record.id.clone(),
            task: record.task.clone(),
            lease: record.lease_requested,
            environment: EnvironmentSpec {
                resources: record.environment.clone(),
            },
            transport: TransportHandle {
                kind: self.inner.transport.kind().to_owned(),
                data: serde_json::json!({}),
            },
        }
    }

    async fn post_message(
        &self,
        peer_url: &str,
        message: &ProtocolMessage,
    ) -> Result<serde_json::Value> {
        let url = peer_url.trim_end_matches('/');
        let mut request = self.inner.http.post(url).json(message);
        if let Some(token) = &self.inner.config.peer_auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AwcpError::protocol(
                ErrorCode::AuthFailed,
                "executor rejected credentials",
            ));
        }
        if !status.is_success() {
            return Err(AwcpError::Http(format!(
                "peer returned {status} for {} message",
                message_kind(message)
            )));
        }
        Ok(response.json().await?)
    }

    async fn record_handle(&self, delegation_id: &str) -> Result<RecordHandle> {
        let mut records = self.inner.records.lock().await;
        if let Some(handle) = records.get(delegation_id) {
            return Ok(Arc::clone(handle));
        }
        let record = self.inner.store.load(delegation_id).await?;
        let handle = Arc::new(Mutex::new(record));
        records.insert(delegation_id.to_owned(), Arc::clone(&handle));
        Ok(handle)
    }

    fn stop_background(&self, delegation_id: &str) {
        if let Some(token) = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(delegation_id)
        {
            token.cancel();
        }
    }

    async fn purge(&self, delegation_id: &str) -> Result<()> {
        self.stop_background(delegation_id);
        if let Err(err) = self.inner.transport.release(delegation_id).await {
            warn!(delegation_id, %err, "transport release failed during purge");
        }
        self.inner.materializer.remove(delegation_id);
        self.inner.snapshots.remove_for(delegation_id);

        self.inner.store.delete(delegation_id).await?;
        self.inner.records.lock().await.remove(delegation_id);
        info!(delegation_id, "delegation released");
        Ok(())
    }

    fn notify(&self, notification: DelegatorNotification) {
        let guard = self
            .inner
            .notifications
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(notification);
        }
    }

    fn notify_state(&self, record: &DelegationRecord) {
        self.notify(DelegatorNotification::StateChanged {
            delegation_id: record.id.clone(),
            state: record.state,
        });
    }
}

/// Await a subscription task and flatten its join outcome.
async fn join_subscription(
    subscription: &mut tokio::task::JoinHandle<Result<()>>,
) -> Result<()> {
    flatten_join(subscription.await)
}

fn flatten_join(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(inner) => inner,
        Err(join_err) => Err(AwcpError::Http(format!(
            "event subscription task failed: {join_err}"
        ))),
    }
}

fn message_kind(message: &ProtocolMessage) -> &'static str {
    match message {
        ProtocolMessage::Invite(_) => "INVITE",
        ProtocolMessage::Accept(_) => "ACCEPT",
        ProtocolMessage::Start(_) => "START",
        ProtocolMessage::Error(_) => "ERROR",
    }
}

fn validate_environment(resources: &[Resource]) -> Result<()> {
    if resources.is_empty() {
        return Err(AwcpError::Config(
            "delegation environment must declare at least one resource".into(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for resource in resources {
        if resource.name.is_empty() || resource.name.contains(['/', '\\', '.']) {
            return Err(AwcpError::Config(format!(
                "invalid resource name '{}'",
                resource.name
            )));
        }
        if !seen.insert(resource.name.as_str()) {
            return Err(AwcpError::Config(format!(
                "duplicate resource name '{}'",
                resource.name
            )));
        }
        // Selection rules are compiled eagerly so bad globs fail here,
        // not mid-materialization.
        resource.selection()?;
    }
    Ok(())
}
