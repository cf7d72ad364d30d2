//! Full protocol round-trips between a live delegator and executor.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use awcp::config::GlobalConfig;
use awcp::delegator::engine::CreateDelegation;
use awcp::delegator::sse_client::SseParser;
use awcp::executor::runner::{FnTaskRunner, StatusSink, TaskInput, TaskOutcome, TaskRunner};
use awcp::models::delegation::{DelegationState, TaskSpec};
use awcp::models::lease::LeaseRequest;
use awcp::models::resource::{AccessMode, Resource};
use awcp::models::snapshot::{SnapshotPolicy, SnapshotStatus};
use awcp::protocol::events::DelegationEvent;
use awcp::ErrorCode;

use super::test_helpers::{
    appending_runner, delegator_engine, executor_config, executor_engine, global_config, populate,
    spawn_executor, wait_terminal, Scratch, SlowRunner,
};

fn task() -> TaskSpec {
    TaskSpec {
        description: "append a greeting".into(),
        prompt: "append hi to greeting.txt".into(),
    }
}

fn create_params(resources: Vec<Resource>) -> CreateDelegation {
    CreateDelegation {
        peer_url: None,
        task: task(),
        resources,
        lease: Some(LeaseRequest {
            ttl_seconds: 120,
            access_mode: AccessMode::Rw,
        }),
        snapshot_policy: None,
    }
}

// ── Scenario: successful auto apply ─────────────────────────

#[tokio::test]
async fn auto_policy_round_trip_applies_changes_to_source() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();

    let engine = executor_engine(
        executor_config(&scratch.work()),
        appending_runner("ws/greeting.txt", "hi\n"),
        &ct,
    );
    let base = spawn_executor(engine, &ct).await;

    let config = global_config(&scratch.base(), Some(&base));
    let delegator = delegator_engine(&config, &ct).await;

    let record = delegator
        .delegate(create_params(vec![Resource::fs(
            "ws",
            scratch.source().to_string_lossy(),
            AccessMode::Rw,
        )]))
        .await
        .expect("delegate");

    let finished = wait_terminal(&delegator, &record.id, Duration::from_secs(10)).await;

    assert_eq!(finished.state, DelegationState::Completed);
    assert!(finished.result.is_some() && finished.error.is_none());
    assert!(finished.applied_snapshot_id.is_some());

    let content =
        std::fs::read_to_string(scratch.source().join("greeting.txt")).expect("source file");
    assert!(content.ends_with("hi\n"), "source must reflect the edit");

    ct.cancel();
}

// ── Scenario: admission rejection ───────────────────────────

#[tokio::test]
async fn oversized_workspace_is_rejected_before_any_invite() {
    let blob = "x".repeat(2048);
    let scratch = Scratch::with_source(&[("blob.bin", blob.as_str())]);

    let toml = format!(
        r#"
base_dir = '{base}'

[delegator]
peer_url = 'http://127.0.0.1:1'

[delegator.admission]
max_total_bytes = 1024
"#,
        base = scratch.base().display(),
    );
    let config = GlobalConfig::from_toml_str(&toml).expect("config");
    let ct = CancellationToken::new();
    let delegator = delegator_engine(&config, &ct).await;

    let err = delegator
        .create(create_params(vec![Resource::fs(
            "ws",
            scratch.source().to_string_lossy(),
            AccessMode::Rw,
        )]))
        .await
        .expect_err("must refuse");

    let protocol = err.as_protocol().cloned().expect("typed refusal");
    assert_eq!(protocol.code, ErrorCode::WorkspaceTooLarge);

    // No record persisted, no export materialized.
    assert!(delegator.list().await.expect("list").is_empty());
    let environments = scratch.base().join("environments");
    let children = std::fs::read_dir(&environments)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(children, 0, "no half-constructed export may remain");

    ct.cancel();
}

// ── Scenario: staged review ─────────────────────────────────

#[tokio::test]
async fn staged_policy_defers_apply_until_requested() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();

    let engine = executor_engine(
        executor_config(&scratch.work()),
        appending_runner("ws/greeting.txt", "hi\n"),
        &ct,
    );
    let base = spawn_executor(engine, &ct).await;

    let config = global_config(&scratch.base(), Some(&base));
    let delegator = delegator_engine(&config, &ct).await;

    let mut params = create_params(vec![Resource::fs(
        "ws",
        scratch.source().to_string_lossy(),
        AccessMode::Rw,
    )]);
    params.snapshot_policy = Some(SnapshotPolicy::Staged);
    let record = delegator.delegate(params).await.expect("delegate");

    let finished = wait_terminal(&delegator, &record.id, Duration::from_secs(10)).await;
    assert_eq!(finished.state, DelegationState::Completed);

    // The snapshot is pending; the source is untouched.
    let snapshots = delegator.list_snapshots(&record.id).await.expect("list");
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].status, SnapshotStatus::Pending);
    assert!(finished.applied_snapshot_id.is_none());
    assert_eq!(
        std::fs::read_to_string(scratch.source().join("greeting.txt")).expect("read"),
        "hello\n"
    );

    // Explicit apply reconciles the source.
    delegator
        .apply_snapshot(&record.id, &snapshots[0].id)
        .await
        .expect("apply");
    let content =
        std::fs::read_to_string(scratch.source().join("greeting.txt")).expect("read");
    assert!(content.ends_with("hi\n"));
    let after = delegator.get(&record.id).await.expect("record");
    assert_eq!(after.applied_snapshot_id.as_deref(), Some(snapshots[0].id.as_str()));

    ct.cancel();
}

// ── Scenario: SSE reconnect replay ──────────────────────────

#[tokio::test]
async fn reconnect_after_completion_replays_the_terminal_event() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();

    let engine = executor_engine(
        executor_config(&scratch.work()),
        appending_runner("ws/greeting.txt", "hi\n"),
        &ct,
    );
    let base = spawn_executor(engine, &ct).await;

    let config = global_config(&scratch.base(), Some(&base));
    let delegator = delegator_engine(&config, &ct).await;
    let record = delegator
        .delegate(create_params(vec![Resource::fs(
            "ws",
            scratch.source().to_string_lossy(),
            AccessMode::Rw,
        )]))
        .await
        .expect("delegate");
    let finished = wait_terminal(&delegator, &record.id, Duration::from_secs(10)).await;
    let original_summary = finished.result.expect("result").summary;

    // The delegation is done and its stream closed; reconnect within the
    // retention window.
    let body = reqwest::get(format!("{base}/tasks/{}/events", record.id))
        .await
        .expect("get")
        .text()
        .await
        .expect("body");

    let mut parser = SseParser::new();
    let payloads = parser.feed(body.as_bytes());
    assert_eq!(payloads.len(), 1, "exactly one replayed event");
    let event: DelegationEvent = serde_json::from_str(&payloads[0]).expect("decode");
    match event {
        DelegationEvent::Done { summary, .. } => assert_eq!(summary, original_summary),
        other => panic!("expected done replay, got {other:?}"),
    }

    ct.cancel();
}

// ── Scenario: read-only resource ────────────────────────────

#[tokio::test]
async fn read_only_resources_survive_executor_tampering() {
    let scratch = Scratch::with_source(&[("main.rs", "fn main() {}\n")]);
    let data_dir = scratch.dir.path().join("data-source");
    std::fs::create_dir_all(&data_dir).expect("data dir");
    populate(&data_dir, &[("facts.csv", "a,b\n1,2\n")]);

    // The task rewrites files under both resources in its work path.
    let tamper: Arc<dyn TaskRunner> = Arc::new(FnTaskRunner::new(
        |input: TaskInput, _sink: StatusSink| {
            std::fs::write(input.work_path.join("code/main.rs"), "fn main() { edited() }\n")
                .map_err(|err| awcp::AwcpError::Io(err.to_string()))?;
            std::fs::write(input.work_path.join("data/facts.csv"), "tampered\n")
                .map_err(|err| awcp::AwcpError::Io(err.to_string()))?;
            Ok(TaskOutcome {
                summary: "edited both resources".into(),
                highlights: None,
            })
        },
    ));

    let ct = CancellationToken::new();
    let engine = executor_engine(executor_config(&scratch.work()), tamper, &ct);
    let base = spawn_executor(engine, &ct).await;

    let config = global_config(&scratch.base(), Some(&base));
    let delegator = delegator_engine(&config, &ct).await;
    let record = delegator
        .delegate(create_params(vec![
            Resource::fs("code", scratch.source().to_string_lossy(), AccessMode::Rw),
            Resource::fs("data", data_dir.to_string_lossy(), AccessMode::Ro),
        ]))
        .await
        .expect("delegate");

    let finished = wait_terminal(&delegator, &record.id, Duration::from_secs(10)).await;
    assert_eq!(finished.state, DelegationState::Completed);

    assert_eq!(
        std::fs::read_to_string(scratch.source().join("main.rs")).expect("read"),
        "fn main() { edited() }\n",
        "read-write resource reflects the change"
    );
    assert_eq!(
        std::fs::read_to_string(data_dir.join("facts.csv")).expect("read"),
        "a,b\n1,2\n",
        "read-only resource is byte-for-byte unchanged"
    );

    ct.cancel();
}

// ── Boundary: TTL clamping ──────────────────────────────────

#[tokio::test]
async fn requested_ttl_is_clamped_to_the_executor_maximum() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();

    let mut exec_config = executor_config(&scratch.work());
    exec_config.max_ttl_seconds = 60;
    let engine = executor_engine(
        exec_config,
        appending_runner("ws/greeting.txt", "hi\n"),
        &ct,
    );
    let base = spawn_executor(engine, &ct).await;

    let config = global_config(&scratch.base(), Some(&base));
    let delegator = delegator_engine(&config, &ct).await;
    let mut params = create_params(vec![Resource::fs(
        "ws",
        scratch.source().to_string_lossy(),
        AccessMode::Rw,
    )]);
    params.lease = Some(LeaseRequest {
        ttl_seconds: 3600,
        access_mode: AccessMode::Rw,
    });
    let record = delegator.delegate(params).await.expect("delegate");

    let finished = wait_terminal(&delegator, &record.id, Duration::from_secs(10)).await;

    assert_eq!(finished.state, DelegationState::Completed);
    assert_eq!(
        finished
            .executor_constraints
            .expect("constraints")
            .max_ttl_seconds,
        60
    );
    assert_eq!(finished.lease_requested.ttl_seconds, 60, "delegator adopts the clamp");
    let lease = finished.lease_active.expect("lease");
    let granted = (lease.expires_at - finished.created_at).num_seconds();
    assert!(granted <= 61, "granted lease must respect the clamp, got {granted}s");

    ct.cancel();
}

// ── Boundary: read-only lease skips snapshot capture ────────

#[tokio::test]
async fn downgraded_read_only_lease_completes_without_a_snapshot() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();

    let mut exec_config = executor_config(&scratch.work());
    exec_config.allowed_access_modes = vec![AccessMode::Ro];
    let engine = executor_engine(
        exec_config,
        appending_runner("ws/greeting.txt", "hi\n"),
        &ct,
    );
    let base = spawn_executor(engine, &ct).await;

    let config = global_config(&scratch.base(), Some(&base));
    let delegator = delegator_engine(&config, &ct).await;
    let record = delegator
        .delegate(create_params(vec![Resource::fs(
            "ws",
            scratch.source().to_string_lossy(),
            AccessMode::Rw,
        )]))
        .await
        .expect("delegate");

    let finished = wait_terminal(&delegator, &record.id, Duration::from_secs(10)).await;

    assert_eq!(finished.state, DelegationState::Completed);
    assert_eq!(
        finished.lease_active.expect("lease").access_mode,
        AccessMode::Ro,
        "delegator adopts the downgraded mode"
    );
    assert!(finished.snapshots.is_empty());
    assert!(finished.applied_snapshot_id.is_none());
    assert_eq!(
        std::fs::read_to_string(scratch.source().join("greeting.txt")).expect("read"),
        "hello\n",
        "no change flows back under a read-only lease"
    );

    ct.cancel();
}

// ── Lifecycle: cancellation ─────────────────────────────────

#[tokio::test]
async fn cancel_interrupts_a_running_delegation() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();

    let engine = executor_engine(
        executor_config(&scratch.work()),
        Arc::new(SlowRunner {
            limit: Duration::from_secs(30),
        }),
        &ct,
    );
    let base = spawn_executor(engine.clone(), &ct).await;

    let config = global_config(&scratch.base(), Some(&base));
    let delegator = delegator_engine(&config, &ct).await;
    let record = delegator
        .delegate(create_params(vec![Resource::fs(
            "ws",
            scratch.source().to_string_lossy(),
            AccessMode::Rw,
        )]))
        .await
        .expect("delegate");

    // Wait for the task to actually start.
    let started = tokio::time::Instant::now();
    loop {
        let current = delegator.get(&record.id).await.expect("record");
        if current.state == DelegationState::Running {
            break;
        }
        assert!(started.elapsed() < Duration::from_secs(10), "never reached running");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    delegator.cancel(&record.id).await.expect("cancel");

    let finished = delegator.get(&record.id).await.expect("record");
    assert_eq!(finished.state, DelegationState::Cancelled);
    assert_eq!(finished.error.expect("error").code, ErrorCode::Cancelled);

    // The executor releases its side shortly after.
    let released = tokio::time::Instant::now();
    while engine.is_in_flight(&record.id) {
        assert!(
            released.elapsed() < Duration::from_secs(10),
            "executor never released the cancelled delegation"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    ct.cancel();
}

// ── Lifecycle: lease expiry ─────────────────────────────────

#[tokio::test]
async fn lease_expiry_terminates_a_stuck_delegation() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();

    let engine = executor_engine(
        executor_config(&scratch.work()),
        Arc::new(SlowRunner {
            limit: Duration::from_secs(60),
        }),
        &ct,
    );
    let base = spawn_executor(engine, &ct).await;

    let config = global_config(&scratch.base(), Some(&base));
    let delegator = delegator_engine(&config, &ct).await;
    let mut params = create_params(vec![Resource::fs(
        "ws",
        scratch.source().to_string_lossy(),
        AccessMode::Rw,
    )]);
    params.lease = Some(LeaseRequest {
        ttl_seconds: 1,
        access_mode: AccessMode::Rw,
    });
    let record = delegator.delegate(params).await.expect("delegate");

    let finished = wait_terminal(&delegator, &record.id, Duration::from_secs(15)).await;
    assert_eq!(finished.state, DelegationState::Expired);
    assert_eq!(finished.error.expect("error").code, ErrorCode::Expired);

    ct.cancel();
}

// ── Lifecycle: task failure ─────────────────────────────────

#[tokio::test]
async fn task_failure_surfaces_as_task_failed() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();

    let failing: Arc<dyn TaskRunner> = Arc::new(FnTaskRunner::new(
        |_input: TaskInput, _sink: StatusSink| {
            Err(awcp::AwcpError::protocol(
                ErrorCode::TaskFailed,
                "the tool crashed",
            ))
        },
    ));
    let engine = executor_engine(executor_config(&scratch.work()), failing, &ct);
    let base = spawn_executor(engine, &ct).await;

    let config = global_config(&scratch.base(), Some(&base));
    let delegator = delegator_engine(&config, &ct).await;
    let record = delegator
        .delegate(create_params(vec![Resource::fs(
            "ws",
            scratch.source().to_string_lossy(),
            AccessMode::Rw,
        )]))
        .await
        .expect("delegate");

    let finished = wait_terminal(&delegator, &record.id, Duration::from_secs(10)).await;
    assert_eq!(finished.state, DelegationState::Error);
    let error = finished.error.expect("error");
    assert_eq!(error.code, ErrorCode::TaskFailed);
    assert!(error.message.contains("the tool crashed"));

    ct.cancel();
}

// ── Recovery: restart then fetch the cached result ──────────

#[tokio::test]
async fn restart_marks_in_flight_recoverable_and_recover_fetches_the_result() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();

    let engine = executor_engine(
        executor_config(&scratch.work()),
        appending_runner("ws/greeting.txt", "hi\n"),
        &ct,
    );
    let base = spawn_executor(engine, &ct).await;

    // First engine instance creates the record but "crashes" before
    // driving it anywhere.
    let config = global_config(&scratch.base(), Some(&base));
    let first = delegator_engine(&config, &ct).await;
    let record = first
        .create(create_params(vec![Resource::fs(
            "ws",
            scratch.source().to_string_lossy(),
            AccessMode::Rw,
        )]))
        .await
        .expect("create");
    let delegation_id = record.id.clone();
    let export_path = record.export_path.clone().expect("export");
    drop(first);

    // Drive the executor by hand under the same delegation id so it holds
    // a cached completion for recovery.
    let client = reqwest::Client::new();
    let invite = serde_json::json!({
        "version": "1",
        "type": "INVITE",
        "delegationId": delegation_id,
        "task": { "description": "append", "prompt": "append hi" },
        "lease": { "ttlSeconds": 120, "accessMode": "rw" },
        "environment": { "resources": [
            { "name": "ws", "type": "fs", "source": scratch.source(), "mode": "rw" }
        ]},
        "transport": { "type": "local_dir" },
    });
    let accept: serde_json::Value = client
        .post(&base)
        .json(&invite)
        .send()
        .await
        .expect("invite")
        .json()
        .await
        .expect("json");
    assert_eq!(accept["type"], "ACCEPT");

    let start = serde_json::json!({
        "version": "1",
        "type": "START",
        "delegationId": delegation_id,
        "lease": {
            "expiresAt": (chrono::Utc::now() + chrono::Duration::seconds(120)).to_rfc3339(),
            "accessMode": "rw",
        },
        "workDir": { "type": "local_dir", "path": export_path },
    });
    let ack: serde_json::Value = client
        .post(&base)
        .json(&start)
        .send()
        .await
        .expect("start")
        .json()
        .await
        .expect("json");
    assert_eq!(ack["ok"], true);

    // Wait until the executor caches a completed result.
    let waiting = tokio::time::Instant::now();
    loop {
        let body: serde_json::Value = client
            .get(format!("{base}/tasks/{delegation_id}/result"))
            .send()
            .await
            .expect("result")
            .json()
            .await
            .expect("json");
        if body["status"] == "completed" {
            break;
        }
        assert!(
            waiting.elapsed() < Duration::from_secs(10),
            "executor never completed, last: {body}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // A restarted engine marks the interrupted record recoverable...
    let second = delegator_engine(&config, &ct).await;
    let interrupted = second.get(&delegation_id).await.expect("record");
    assert_eq!(interrupted.state, DelegationState::Error);
    assert_eq!(
        interrupted.error.as_ref().expect("error").code,
        ErrorCode::SseFailed
    );

    // ...and recover() fetches the cached terminal, applying the snapshot.
    let recovered = second
        .recover(&delegation_id, &base)
        .await
        .expect("recover");
    assert_eq!(recovered.state, DelegationState::Completed);
    assert!(recovered.result.is_some());
    let content =
        std::fs::read_to_string(scratch.source().join("greeting.txt")).expect("read");
    assert!(content.ends_with("hi\n"), "recovered snapshot must be applied");

    ct.cancel();
}

// ── Events: status precedes the terminal, in order ──────────

#[tokio::test]
async fn event_stream_is_ordered_with_single_terminal() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();

    let engine = executor_engine(
        executor_config(&scratch.work()),
        appending_runner("ws/greeting.txt", "hi\n"),
        &ct,
    );
    let base = spawn_executor(engine.clone(), &ct).await;

    let config = global_config(&scratch.base(), Some(&base));
    let delegator = delegator_engine(&config, &ct).await;

    // Observe the raw stream alongside the delegator's own subscription.
    let record = delegator
        .delegate(create_params(vec![Resource::fs(
            "ws",
            scratch.source().to_string_lossy(),
            AccessMode::Rw,
        )]))
        .await
        .expect("delegate");

    let body = reqwest::get(format!("{base}/tasks/{}/events", record.id))
        .await
        .expect("get")
        .text()
        .await
        .expect("stream until close");

    let mut parser = SseParser::new();
    let events: Vec<DelegationEvent> = parser
        .feed(body.as_bytes())
        .iter()
        .map(|payload| serde_json::from_str(payload).expect("decode"))
        .collect();

    assert!(!events.is_empty());
    let terminal_count = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminal_count, 1, "exactly one terminal event");
    assert!(
        events.last().expect("last").is_terminal(),
        "the terminal closes the stream"
    );

    // A snapshot referenced by done precedes it.
    let snapshot_pos = events
        .iter()
        .position(|e| matches!(e, DelegationEvent::Snapshot { .. }));
    if let Some(pos) = snapshot_pos {
        assert!(pos < events.len() - 1);
    }

    wait_terminal(&delegator, &record.id, Duration::from_secs(10)).await;
    ct.cancel();
}
