use app_updater::host::contract::{
    CommandEnvelope, CommandName, ContractErrorKind, EVENT_VERSION, EventEnvelope,
    ResponseEnvelope, UPDATE_STATE_EVENT,
};

#[test]
fn command_name_parse_known_and_unknown() {
    for command in CommandName::ALL {
        assert_eq!(CommandName::parse(command.as_str()), Some(command));
    }
    assert_eq!(
        CommandName::parse("install_update"),
        Some(CommandName::InstallUpdate)
    );
    assert_eq!(CommandName::parse("runtime.start"), None);
    assert_eq!(CommandName::parse(""), None);
}

#[test]
fn command_name_serializes_to_wire_name() {
    for command in CommandName::ALL {
        let json = serde_json::to_value(command).expect("serialize command");
        assert_eq!(json, command.as_str());
    }
}

#[test]
fn command_envelope_validation() {
    let valid = CommandEnvelope::new("req-1", CommandName::FetchUpdate, serde_json::json!({}));
    assert!(valid.validate().is_ok());

    let mut wrong_version = valid.clone();
    wrong_version.v = EVENT_VERSION + 1;
    let err = wrong_version.validate().expect_err("version must be rejected");
    assert_eq!(err.kind, ContractErrorKind::UnsupportedVersion);

    let blank = CommandEnvelope::new("  ", CommandName::Ping, serde_json::Value::Null);
    let err = blank.validate().expect_err("blank id must be rejected");
    assert_eq!(err.kind, ContractErrorKind::InvalidEnvelope);
}

#[test]
fn command_envelope_payload_is_optional_on_the_wire() {
    let parsed: CommandEnvelope =
        serde_json::from_str(r#"{"v":1,"request_id":"r","command":"update_status"}"#)
            .expect("parse envelope");
    assert_eq!(parsed.command, CommandName::UpdateStatus);
    assert!(parsed.payload.is_null());
}

#[test]
fn response_envelopes_carry_version_and_outcome() {
    let ok = ResponseEnvelope::ok("req-1", serde_json::json!({"pong": true}));
    assert!(ok.ok);
    assert_eq!(ok.v, EVENT_VERSION);
    assert!(ok.error.is_none());

    let err = ResponseEnvelope::error("req-2", "`install` is not allowed while idle");
    assert!(!err.ok);
    assert!(err.payload.is_null());
    assert_eq!(
        err.error.as_deref(),
        Some("`install` is not allowed while idle")
    );
}

#[test]
fn fresh_events_get_distinct_ids() {
    let a = EventEnvelope::fresh(UPDATE_STATE_EVENT, serde_json::json!({"state": "idle"}));
    let b = EventEnvelope::fresh(UPDATE_STATE_EVENT, serde_json::json!({"state": "idle"}));
    assert_ne!(a.event_id, b.event_id);
    assert_eq!(a.v, EVENT_VERSION);
    assert_eq!(a.event, "update_state");
}
