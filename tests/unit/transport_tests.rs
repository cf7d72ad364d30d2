use awcp::models::resource::{AccessMode, Resource};
use awcp::transport::local_dir::LocalDirTransport;
use awcp::transport::{
    DelegatorTransport, ExecutorTransport, SnapshotPayload, TransportHandle,
};

#[test]
fn payload_checksum_round_trips() {
    let payload = SnapshotPayload::from_bytes(b"workspace bytes".to_vec());
    assert!(payload.verify());

    let mut tampered = payload.clone();
    tampered.data.push(b'!');
    assert!(!tampered.verify());
}

#[test]
fn payload_serializes_as_base64() {
    let payload = SnapshotPayload::from_bytes(vec![0, 159, 146, 150]);
    let json = serde_json::to_value(&payload).expect("encode");
    assert!(json["data"].is_string());
    assert!(json["checksum"].is_string());

    let decoded: SnapshotPayload = serde_json::from_value(json).expect("decode");
    assert_eq!(decoded, payload);
}

#[test]
fn handle_body_round_trips_through_opaque_value() {
    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Body {
        path: String,
        attempts: u32,
    }

    let handle = TransportHandle::new(
        "local_dir",
        &Body {
            path: "/exports/d-1".into(),
            attempts: 2,
        },
    )
    .expect("encode");

    let wire = serde_json::to_value(&handle).expect("wire");
    assert_eq!(wire["type"], "local_dir");
    assert_eq!(wire["path"], "/exports/d-1");

    let decoded: Body = handle.decode().expect("decode");
    assert_eq!(decoded.attempts, 2);
}

#[tokio::test]
async fn setup_copies_the_export_tree() {
    let export = tempfile::tempdir().expect("export");
    std::fs::create_dir_all(export.path().join("ws/sub")).expect("dirs");
    std::fs::write(export.path().join("ws/a.txt"), "alpha").expect("write");
    std::fs::write(export.path().join("ws/sub/b.txt"), "beta").expect("write");

    let adapter = LocalDirTransport::new();
    let handle = DelegatorTransport::prepare(&adapter, "d-1", export.path(), 600)
        .await
        .expect("prepare");

    let work = tempfile::tempdir().expect("work");
    let actual = ExecutorTransport::setup(&adapter, "d-1", &handle, work.path())
        .await
        .expect("setup");

    assert_eq!(actual, work.path());
    assert_eq!(
        std::fs::read_to_string(work.path().join("ws/a.txt")).expect("read"),
        "alpha"
    );
    assert_eq!(
        std::fs::read_to_string(work.path().join("ws/sub/b.txt")).expect("read"),
        "beta"
    );
}

#[tokio::test]
async fn setup_rejects_foreign_handles() {
    let adapter = LocalDirTransport::new();
    let handle = TransportHandle {
        kind: "object_store".into(),
        data: serde_json::json!({ "url": "https://bucket/blob" }),
    };
    let work = tempfile::tempdir().expect("work");

    assert!(
        ExecutorTransport::setup(&adapter, "d-1", &handle, work.path())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn capture_then_apply_round_trips_rw_files() {
    // Delegator side: export with one rw resource backed by a source dir.
    let base = tempfile::tempdir().expect("base");
    let source = base.path().join("source");
    std::fs::create_dir_all(&source).expect("source");
    std::fs::write(source.join("greeting.txt"), "hello\n").expect("write");
    let export = base.path().join("export");
    std::fs::create_dir_all(export.join("ws")).expect("export");
    std::fs::write(export.join("ws/greeting.txt"), "hello\n").expect("write");

    // Executor side: a work path the task mutated.
    let work = tempfile::tempdir().expect("work");
    std::fs::create_dir_all(work.path().join("ws")).expect("ws");
    std::fs::write(work.path().join("ws/greeting.txt"), "hello\nhi\n").expect("write");
    std::fs::write(work.path().join("ws/new_file.txt"), "fresh").expect("write");

    let adapter = LocalDirTransport::new();
    let payload = ExecutorTransport::capture_snapshot(&adapter, "d-1", work.path())
        .await
        .expect("capture")
        .expect("payload");

    let resources = vec![Resource::fs("ws", source.to_string_lossy(), AccessMode::Rw)];
    DelegatorTransport::apply_snapshot(&adapter, "d-1", &payload, &resources, &export)
        .await
        .expect("apply");

    // Every rw file present at capture time is byte-identical in the export.
    assert_eq!(
        std::fs::read_to_string(export.join("ws/greeting.txt")).expect("read"),
        "hello\nhi\n"
    );
    assert_eq!(
        std::fs::read_to_string(export.join("ws/new_file.txt")).expect("read"),
        "fresh"
    );
    // And mirrored into the copy-materialized source.
    assert_eq!(
        std::fs::read_to_string(source.join("greeting.txt")).expect("read"),
        "hello\nhi\n"
    );
}

#[tokio::test]
async fn apply_twice_with_same_payload_is_idempotent() {
    let base = tempfile::tempdir().expect("base");
    let source = base.path().join("source");
    std::fs::create_dir_all(&source).expect("source");
    std::fs::write(source.join("a.txt"), "v1").expect("write");
    let export = base.path().join("export");
    std::fs::create_dir_all(export.join("ws")).expect("export");
    std::fs::write(export.join("ws/a.txt"), "v1").expect("write");

    let work = tempfile::tempdir().expect("work");
    std::fs::create_dir_all(work.path().join("ws")).expect("ws");
    std::fs::write(work.path().join("ws/a.txt"), "v2").expect("write");

    let adapter = LocalDirTransport::new();
    let payload = ExecutorTransport::capture_snapshot(&adapter, "d-1", work.path())
        .await
        .expect("capture")
        .expect("payload");
    let resources = vec![Resource::fs("ws", source.to_string_lossy(), AccessMode::Rw)];

    DelegatorTransport::apply_snapshot(&adapter, "d-1", &payload, &resources, &export)
        .await
        .expect("first apply");
    DelegatorTransport::apply_snapshot(&adapter, "d-1", &payload, &resources, &export)
        .await
        .expect("second apply");

    assert_eq!(
        std::fs::read_to_string(export.join("ws/a.txt")).expect("read"),
        "v2"
    );
}

#[tokio::test]
async fn apply_removes_files_absent_from_the_snapshot() {
    let base = tempfile::tempdir().expect("base");
    let source = base.path().join("source");
    std::fs::create_dir_all(&source).expect("source");
    std::fs::write(source.join("kept.txt"), "kept").expect("write");
    std::fs::write(source.join("deleted.txt"), "gone").expect("write");
    let export = base.path().join("export");
    std::fs::create_dir_all(export.join("ws")).expect("export");
    std::fs::write(export.join("ws/kept.txt"), "kept").expect("write");
    std::fs::write(export.join("ws/deleted.txt"), "gone").expect("write");

    // The task deleted one file before capture.
    let work = tempfile::tempdir().expect("work");
    std::fs::create_dir_all(work.path().join("ws")).expect("ws");
    std::fs::write(work.path().join("ws/kept.txt"), "kept").expect("write");

    let adapter = LocalDirTransport::new();
    let payload = ExecutorTransport::capture_snapshot(&adapter, "d-1", work.path())
        .await
        .expect("capture")
        .expect("payload");
    let resources = vec![Resource::fs("ws", source.to_string_lossy(), AccessMode::Rw)];

    DelegatorTransport::apply_snapshot(&adapter, "d-1", &payload, &resources, &export)
        .await
        .expect("apply");

    assert!(export.join("ws/kept.txt").is_file());
    assert!(!export.join("ws/deleted.txt").exists());
    assert!(!source.join("deleted.txt").exists());
}

#[tokio::test]
async fn corrupted_payload_is_refused() {
    let export = tempfile::tempdir().expect("export");
    let adapter = LocalDirTransport::new();

    let mut payload = SnapshotPayload::from_bytes(b"{\"files\":{}}".to_vec());
    payload.checksum = "0".repeat(64);

    let resources = vec![Resource::fs("ws", "/tmp", AccessMode::Rw)];
    assert!(DelegatorTransport::apply_snapshot(
        &adapter,
        "d-1",
        &payload,
        &resources,
        export.path()
    )
    .await
    .is_err());
}

#[tokio::test]
async fn dependency_check_reports_available() {
    let adapter = LocalDirTransport::new();
    let check = ExecutorTransport::check_dependency(&adapter)
        .await
        .expect("check");
    assert!(check.available);
}
