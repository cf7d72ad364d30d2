use awcp::delegator::materializer::{ExportManifest, MaterializeStrategy, ResourceMaterializer};
use awcp::models::resource::{AccessMode, Resource};

fn source_with(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    for (name, content) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(&path, content).expect("write");
    }
    dir
}

#[test]
fn copy_strategy_builds_resource_subtrees() {
    let envs = tempfile::tempdir().expect("envs");
    let source = source_with(&[("main.rs", "fn main() {}"), ("docs/guide.md", "# hi")]);
    let materializer = ResourceMaterializer::new(envs.path(), MaterializeStrategy::Copy);

    let export = materializer
        .materialize(
            "d-1",
            &[Resource::fs("code", source.path().to_string_lossy(), AccessMode::Rw)],
        )
        .expect("materialize");

    assert_eq!(
        std::fs::read_to_string(export.join("code/main.rs")).expect("read"),
        "fn main() {}"
    );
    assert_eq!(
        std::fs::read_to_string(export.join("code/docs/guide.md")).expect("read"),
        "# hi"
    );
}

#[test]
fn manifest_records_resources_and_modes() {
    let envs = tempfile::tempdir().expect("envs");
    let code = source_with(&[("a.rs", "a")]);
    let data = source_with(&[("b.csv", "b")]);
    let materializer = ResourceMaterializer::new(envs.path(), MaterializeStrategy::Copy);

    let export = materializer
        .materialize(
            "d-1",
            &[
                Resource::fs("code", code.path().to_string_lossy(), AccessMode::Rw),
                Resource::fs("data", data.path().to_string_lossy(), AccessMode::Ro),
            ],
        )
        .expect("materialize");

    let raw = std::fs::read(export.join(".awcp/manifest.json")).expect("manifest");
    let manifest: ExportManifest = serde_json::from_slice(&raw).expect("decode");
    assert_eq!(manifest.delegation_id, "d-1");
    assert_eq!(manifest.version, "1");
    assert_eq!(manifest.resources.len(), 2);
    assert_eq!(manifest.resources[0].name, "code");
    assert_eq!(manifest.resources[0].mode, AccessMode::Rw);
    assert_eq!(manifest.resources[1].mode, AccessMode::Ro);
}

#[test]
fn selection_rules_filter_the_copy() {
    let envs = tempfile::tempdir().expect("envs");
    let source = source_with(&[("keep.rs", "k"), ("drop.log", "d")]);
    let materializer = ResourceMaterializer::new(envs.path(), MaterializeStrategy::Copy);

    let resource = Resource {
        exclude: Some(vec!["*.log".into()]),
        ..Resource::fs("code", source.path().to_string_lossy(), AccessMode::Rw)
    };
    let export = materializer
        .materialize("d-1", &[resource])
        .expect("materialize");

    assert!(export.join("code/keep.rs").is_file());
    assert!(!export.join("code/drop.log").exists());
}

#[test]
fn never_shipped_directories_are_left_behind() {
    let envs = tempfile::tempdir().expect("envs");
    let source = source_with(&[("main.rs", "fn main() {}"), (".git/HEAD", "ref: main")]);
    let materializer = ResourceMaterializer::new(envs.path(), MaterializeStrategy::Copy);

    let export = materializer
        .materialize(
            "d-1",
            &[Resource::fs("code", source.path().to_string_lossy(), AccessMode::Rw)],
        )
        .expect("materialize");

    assert!(export.join("code/main.rs").is_file());
    assert!(!export.join("code/.git").exists());
}

#[test]
fn failed_materialization_rolls_back() {
    let envs = tempfile::tempdir().expect("envs");
    let good = source_with(&[("a.txt", "a")]);
    let materializer = ResourceMaterializer::new(envs.path(), MaterializeStrategy::Copy);

    let err = materializer.materialize(
        "d-1",
        &[
            Resource::fs("good", good.path().to_string_lossy(), AccessMode::Rw),
            Resource::fs("bad", "/nonexistent/source", AccessMode::Rw),
        ],
    );

    assert!(err.is_err());
    assert!(!envs.path().join("d-1").exists(), "partial export must be rolled back");
}

#[test]
fn duplicate_export_is_refused() {
    let envs = tempfile::tempdir().expect("envs");
    let source = source_with(&[("a.txt", "a")]);
    let materializer = ResourceMaterializer::new(envs.path(), MaterializeStrategy::Copy);
    let resource = Resource::fs("code", source.path().to_string_lossy(), AccessMode::Rw);

    materializer
        .materialize("d-1", &[resource.clone()])
        .expect("first");
    assert!(materializer.materialize("d-1", &[resource]).is_err());
}

#[test]
fn remove_deletes_the_tree_and_tolerates_absence() {
    let envs = tempfile::tempdir().expect("envs");
    let source = source_with(&[("a.txt", "a")]);
    let materializer = ResourceMaterializer::new(envs.path(), MaterializeStrategy::Copy);

    materializer
        .materialize(
            "d-1",
            &[Resource::fs("code", source.path().to_string_lossy(), AccessMode::Rw)],
        )
        .expect("materialize");
    materializer.remove("d-1");
    assert!(!envs.path().join("d-1").exists());

    // Removing again is fine.
    materializer.remove("d-1");
}

#[test]
fn sweep_stale_spares_known_delegations() {
    let envs = tempfile::tempdir().expect("envs");
    let source = source_with(&[("a.txt", "a")]);
    let materializer = ResourceMaterializer::new(envs.path(), MaterializeStrategy::Copy);
    let resource = Resource::fs("code", source.path().to_string_lossy(), AccessMode::Rw);

    materializer
        .materialize("known", &[resource.clone()])
        .expect("known");
    materializer
        .materialize("orphan", &[resource])
        .expect("orphan");

    let removed = materializer
        .sweep_stale(&["known".to_owned()])
        .expect("sweep");

    assert_eq!(removed, 1);
    assert!(envs.path().join("known").is_dir());
    assert!(!envs.path().join("orphan").exists());
}

#[cfg(unix)]
#[test]
fn symlink_strategy_exposes_source_in_place() {
    let envs = tempfile::tempdir().expect("envs");
    let source = source_with(&[("a.txt", "original")]);
    let materializer = ResourceMaterializer::new(envs.path(), MaterializeStrategy::Symlink);

    let export = materializer
        .materialize(
            "d-1",
            &[Resource::fs("code", source.path().to_string_lossy(), AccessMode::Rw)],
        )
        .expect("materialize");

    // Writing through the export reaches the source directly.
    std::fs::write(export.join("code/a.txt"), "changed").expect("write");
    assert_eq!(
        std::fs::read_to_string(source.path().join("a.txt")).expect("read"),
        "changed"
    );
}
