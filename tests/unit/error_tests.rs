use awcp::{AwcpError, ErrorCode, ProtocolError};

#[test]
fn error_codes_serialize_in_wire_form() {
    let cases = [
        (ErrorCode::Declined, "\"DECLINED\""),
        (ErrorCode::DepMissing, "\"DEP_MISSING\""),
        (ErrorCode::WorkspaceTooLarge, "\"WORKSPACE_TOO_LARGE\""),
        (ErrorCode::WorkdirDenied, "\"WORKDIR_DENIED\""),
        (ErrorCode::StartExpired, "\"START_EXPIRED\""),
        (ErrorCode::Expired, "\"EXPIRED\""),
        (ErrorCode::AuthFailed, "\"AUTH_FAILED\""),
        (ErrorCode::SetupFailed, "\"SETUP_FAILED\""),
        (ErrorCode::TaskFailed, "\"TASK_FAILED\""),
        (ErrorCode::Cancelled, "\"CANCELLED\""),
        (ErrorCode::NotFound, "\"NOT_FOUND\""),
        (ErrorCode::SseFailed, "\"SSE_FAILED\""),
    ];
    for (code, wire) in cases {
        assert_eq!(serde_json::to_string(&code).expect("encode"), wire);
        let decoded: ErrorCode = serde_json::from_str(wire).expect("decode");
        assert_eq!(decoded, code);
    }
}

#[test]
fn display_matches_wire_form() {
    assert_eq!(ErrorCode::WorkspaceTooLarge.to_string(), "WORKSPACE_TOO_LARGE");
    assert_eq!(ErrorCode::SseFailed.to_string(), "SSE_FAILED");
}

#[test]
fn protocol_error_display_includes_hint() {
    let err = ProtocolError::new(ErrorCode::Declined, "at capacity").with_hint("retry later");
    assert_eq!(err.to_string(), "DECLINED: at capacity (retry later)");
}

#[test]
fn hint_is_omitted_from_json_when_absent() {
    let err = ProtocolError::new(ErrorCode::TaskFailed, "boom");
    let json = serde_json::to_value(&err).expect("encode");
    assert!(json.get("hint").is_none());
}

#[test]
fn admission_failures_have_their_own_domain() {
    let err = AwcpError::Admission("source vanished".into());
    assert_eq!(err.to_string(), "admission: source vanished");
}

#[test]
fn into_protocol_preserves_typed_errors() {
    let original = AwcpError::protocol(ErrorCode::Expired, "lease up");
    let protocol = original.into_protocol(ErrorCode::TaskFailed);
    assert_eq!(protocol.code, ErrorCode::Expired);
}

#[test]
fn into_protocol_coerces_untyped_errors() {
    let original = AwcpError::Io("disk full".into());
    let protocol = original.into_protocol(ErrorCode::SetupFailed);
    assert_eq!(protocol.code, ErrorCode::SetupFailed);
    assert!(protocol.message.contains("disk full"));
}

#[test]
fn as_protocol_borrows_only_typed_variants() {
    let typed = AwcpError::protocol(ErrorCode::Cancelled, "stop");
    assert!(typed.as_protocol().is_some());
    let untyped = AwcpError::Config("bad".into());
    assert!(untyped.as_protocol().is_none());
}
