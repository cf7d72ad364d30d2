use chrono::{Duration, Utc};

use awcp::models::delegation::{
    DelegationRecord, DelegationResult, DelegationState, TaskSpec,
};
use awcp::models::lease::{ActiveLease, LeaseRequest};
use awcp::models::resource::{AccessMode, Resource, SelectionRules};
use awcp::models::snapshot::SnapshotPolicy;
use awcp::{ErrorCode, ProtocolError};

fn record() -> DelegationRecord {
    DelegationRecord::new(
        "http://127.0.0.1:7700".into(),
        TaskSpec {
            description: "audit".into(),
            prompt: "check everything".into(),
        },
        vec![Resource::fs("ws", "/src/proj", AccessMode::Rw)],
        LeaseRequest {
            ttl_seconds: 600,
            access_mode: AccessMode::Rw,
        },
        SnapshotPolicy::Auto,
    )
}

#[test]
fn new_record_starts_created() {
    let record = record();
    assert_eq!(record.state, DelegationState::Created);
    assert!(!record.is_terminal());
    assert!(record.result.is_none());
    assert!(record.error.is_none());
}

#[test]
fn happy_path_transitions_are_permitted() {
    let mut record = record();
    for state in [
        DelegationState::Invited,
        DelegationState::Accepted,
        DelegationState::Started,
        DelegationState::Running,
    ] {
        record.transition_to(state).expect("transition");
    }
    record
        .complete(DelegationResult {
            summary: "done".into(),
            highlights: None,
            notes: None,
        })
        .expect("complete");
    assert!(record.is_terminal());
}

#[test]
fn skipping_states_is_rejected() {
    let mut record = record();
    assert!(record.transition_to(DelegationState::Started).is_err());
    assert!(record.transition_to(DelegationState::Running).is_err());
}

#[test]
fn terminal_states_are_frozen() {
    let mut record = record();
    record
        .fail(
            DelegationState::Cancelled,
            ProtocolError::new(ErrorCode::Cancelled, "stop"),
        )
        .expect("cancel");
    assert!(record.transition_to(DelegationState::Running).is_err());
    assert!(record.transition_to(DelegationState::Error).is_err());
}

#[test]
fn terminal_record_has_exactly_one_outcome() {
    let mut completed = record();
    completed.transition_to(DelegationState::Invited).expect("t");
    completed.transition_to(DelegationState::Accepted).expect("t");
    completed.transition_to(DelegationState::Started).expect("t");
    completed
        .complete(DelegationResult {
            summary: "ok".into(),
            highlights: None,
            notes: None,
        })
        .expect("complete");
    assert!(completed.result.is_some() && completed.error.is_none());

    let mut failed = record();
    failed
        .fail(
            DelegationState::Error,
            ProtocolError::new(ErrorCode::TaskFailed, "boom"),
        )
        .expect("fail");
    assert!(failed.error.is_some() && failed.result.is_none());
}

#[test]
fn any_live_state_may_fail_or_expire() {
    for terminal in [
        DelegationState::Error,
        DelegationState::Cancelled,
        DelegationState::Expired,
    ] {
        let mut record = record();
        record.transition_to(DelegationState::Invited).expect("t");
        assert!(record.state.can_transition_to(terminal));
    }
}

#[test]
fn rw_resources_filters_by_mode() {
    let mut record = record();
    record
        .environment
        .push(Resource::fs("data", "/data", AccessMode::Ro));
    let rw = record.rw_resources();
    assert_eq!(rw.len(), 1);
    assert_eq!(rw[0].name, "ws");
}

#[test]
fn lease_clamps_to_executor_maximum() {
    let request = LeaseRequest {
        ttl_seconds: 7200,
        access_mode: AccessMode::Rw,
    };
    let constrained = request.constrain(3600, AccessMode::Rw);
    assert_eq!(constrained.ttl_seconds, 3600);

    let shorter = LeaseRequest {
        ttl_seconds: 60,
        access_mode: AccessMode::Rw,
    };
    assert_eq!(shorter.constrain(3600, AccessMode::Rw).ttl_seconds, 60);
}

#[test]
fn lease_adopts_downgraded_mode() {
    let request = LeaseRequest {
        ttl_seconds: 600,
        access_mode: AccessMode::Rw,
    };
    let constrained = request.constrain(3600, AccessMode::Ro);
    assert_eq!(constrained.access_mode, AccessMode::Ro);
}

#[test]
fn active_lease_expiry_uses_local_clock() {
    let now = Utc::now();
    let lease = ActiveLease {
        expires_at: now + Duration::seconds(30),
        access_mode: AccessMode::Rw,
    };
    assert!(!lease.is_expired(now));
    assert!(lease.is_expired(now + Duration::seconds(31)));
}

#[test]
fn selection_rules_exclude_wins_over_include() {
    let rules = SelectionRules::compile(
        Some(&["**/*.rs".to_owned()]),
        Some(&["**/generated.rs".to_owned()]),
    )
    .expect("compile");

    assert!(rules.matches(std::path::Path::new("src/lib.rs")));
    assert!(!rules.matches(std::path::Path::new("src/generated.rs")));
    assert!(!rules.matches(std::path::Path::new("README.md")));
}

#[test]
fn empty_selection_admits_everything() {
    let rules = SelectionRules::allow_all();
    assert!(rules.matches(std::path::Path::new("anything/at/all.txt")));
}

#[test]
fn invalid_glob_is_a_config_error() {
    let resource = Resource {
        include: Some(vec!["[".into()]),
        ..Resource::fs("ws", "/src", AccessMode::Rw)
    };
    assert!(resource.selection().is_err());
}

#[test]
fn record_round_trips_through_json() {
    let mut record = record();
    record.transition_to(DelegationState::Invited).expect("t");
    let json = serde_json::to_string(&record).expect("encode");
    let decoded: DelegationRecord = serde_json::from_str(&json).expect("decode");
    assert_eq!(decoded, record);
}
