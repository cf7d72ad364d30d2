//! HTTP-level tests of the delegator control plane.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use awcp::delegator::api as delegator_api;
use awcp::delegator::engine::DelegatorEngine;
use awcp::models::resource::AccessMode;

use super::test_helpers::{
    appending_runner, delegator_engine, executor_config, executor_engine, global_config,
    spawn_executor, Scratch,
};

/// Serve a delegator control plane on an ephemeral port.
async fn spawn_control_plane(engine: DelegatorEngine, ct: &CancellationToken) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral");
    let addr = listener.local_addr().expect("local addr");

    let router = delegator_api::router(engine);
    let serve_ct = ct.clone();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(async move { serve_ct.cancelled().await })
            .await;
    });

    format!("http://127.0.0.1:{}", addr.port())
}

#[tokio::test]
async fn health_returns_ok() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();
    let config = global_config(&scratch.base(), None);
    let engine = delegator_engine(&config, &ct).await;
    let base = spawn_control_plane(engine, &ct).await;

    let resp = reqwest::get(format!("{base}/health")).await.expect("get");
    assert_eq!(resp.status(), 200);

    ct.cancel();
}

#[tokio::test]
async fn delegate_endpoint_runs_a_full_delegation() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();

    let exec = executor_engine(
        executor_config(&scratch.work()),
        appending_runner("ws/greeting.txt", "hi\n"),
        &ct,
    );
    let exec_base = spawn_executor(exec, &ct).await;

    let config = global_config(&scratch.base(), Some(&exec_base));
    let engine = delegator_engine(&config, &ct).await;
    let base = spawn_control_plane(engine, &ct).await;

    let client = reqwest::Client::new();
    let request = serde_json::json!({
        "task": { "description": "append", "prompt": "append hi" },
        "resources": [
            { "name": "ws", "type": "fs", "source": scratch.source(), "mode": "rw" }
        ],
        "lease": { "ttlSeconds": 120, "accessMode": "rw" },
    });
    let response = client
        .post(format!("{base}/delegate"))
        .json(&request)
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.expect("json");
    let delegation_id = body["delegationId"].as_str().expect("id").to_owned();

    // Poll the record endpoint until terminal.
    let started = tokio::time::Instant::now();
    loop {
        let record: serde_json::Value = client
            .get(format!("{base}/delegation/{delegation_id}"))
            .send()
            .await
            .expect("get")
            .json()
            .await
            .expect("json");
        let state = record["state"].as_str().expect("state");
        if state == "completed" {
            assert!(record["applied_snapshot_id"].is_string());
            break;
        }
        assert!(
            !matches!(state, "error" | "cancelled" | "expired"),
            "unexpected terminal: {record}"
        );
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "delegation stuck in {state}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let content =
        std::fs::read_to_string(scratch.source().join("greeting.txt")).expect("read");
    assert!(content.ends_with("hi\n"));

    ct.cancel();
}

#[tokio::test]
async fn unknown_delegation_returns_404() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();
    let config = global_config(&scratch.base(), None);
    let engine = delegator_engine(&config, &ct).await;
    let base = spawn_control_plane(engine, &ct).await;

    let resp = reqwest::get(format!("{base}/delegation/ghost"))
        .await
        .expect("get");
    assert_eq!(resp.status(), 404);

    let resp = reqwest::get(format!("{base}/delegation/ghost/snapshots"))
        .await
        .expect("get");
    assert_eq!(resp.status(), 404);

    ct.cancel();
}

#[tokio::test]
async fn create_without_peer_is_a_bad_request() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();
    let config = global_config(&scratch.base(), None);
    let engine = delegator_engine(&config, &ct).await;
    let base = spawn_control_plane(engine, &ct).await;

    let request = serde_json::json!({
        "task": { "description": "append", "prompt": "append hi" },
        "resources": [
            { "name": "ws", "type": "fs", "source": scratch.source(), "mode": "rw" }
        ],
    });
    let resp = reqwest::Client::new()
        .post(format!("{base}/delegate"))
        .json(&request)
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status(), 400);

    ct.cancel();
}

#[tokio::test]
async fn duplicate_resource_names_are_rejected() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();
    let config = global_config(&scratch.base(), Some("http://127.0.0.1:1"));
    let engine = delegator_engine(&config, &ct).await;
    let base = spawn_control_plane(engine, &ct).await;

    let request = serde_json::json!({
        "task": { "description": "append", "prompt": "append hi" },
        "resources": [
            { "name": "ws", "type": "fs", "source": scratch.source(), "mode": "rw" },
            { "name": "ws", "type": "fs", "source": scratch.source(), "mode": "ro" }
        ],
    });
    let resp = reqwest::Client::new()
        .post(format!("{base}/delegate"))
        .json(&request)
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status(), 400);

    ct.cancel();
}

#[tokio::test]
async fn snapshot_apply_on_unknown_snapshot_is_404() {
    let scratch = Scratch::with_source(&[("greeting.txt", "hello\n")]);
    let ct = CancellationToken::new();

    let exec = executor_engine(
        executor_config(&scratch.work()),
        appending_runner("ws/greeting.txt", "hi\n"),
        &ct,
    );
    let exec_base = spawn_executor(exec, &ct).await;

    let config = global_config(&scratch.base(), Some(&exec_base));
    let engine = delegator_engine(&config, &ct).await;
    let record = engine
        .create(awcp::delegator::engine::CreateDelegation {
            peer_url: None,
            task: awcp::models::delegation::TaskSpec {
                description: "t".into(),
                prompt: "p".into(),
            },
            resources: vec![awcp::models::resource::Resource::fs(
                "ws",
                scratch.source().to_string_lossy(),
                AccessMode::Rw,
            )],
            lease: None,
            snapshot_policy: None,
        })
        .await
        .expect("create");
    let base = spawn_control_plane(engine, &ct).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/delegation/{}/snapshots/ghost/apply", record.id))
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status(), 404);

    ct.cancel();
}
