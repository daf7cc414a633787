#![allow(clippy::unwrap_used, clippy::expect_used)]

use fusion_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Event serialization keeps routing data intact
// ---------------------------------------------------------------------------

#[test]
fn event_serialization_roundtrip() {
    let task_id = Uuid::new_v4();
    let mut event = Event::new(
        topics::task(task_id, topics::COMPLETED),
        serde_json::json!({"summary": "done", "files": 3}),
    )
    .with_header(HEADER_ATTEMPT, 1);
    event.sequence = 17;

    let json = serde_json::to_string(&event).unwrap();
    let parsed: Event = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed, event);
    assert_eq!(parsed.entity_uuid(), Some(task_id));
    assert_eq!(parsed.kind(), Some(topics::COMPLETED));
    assert_eq!(parsed.header(HEADER_ATTEMPT), Some("1"));
}

#[test]
fn event_without_sequence_or_headers_deserializes() {
    let json = serde_json::json!({
        "id": Uuid::new_v4(),
        "topic": "agent.a1.heartbeat",
        "payload": null,
        "timestamp": "2026-01-01T00:00:00Z",
    });
    let parsed: Event = serde_json::from_value(json).unwrap();
    assert_eq!(parsed.sequence, 0);
    assert!(parsed.headers.is_empty());
    assert_eq!(parsed.entity(), Some(topics::AGENT));
}

// ---------------------------------------------------------------------------
// 2. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let err = FusionError::InvalidTransition {
        kind: "agent",
        id: "a1".into(),
        from: "error".into(),
        to: "idle".into(),
    };
    assert_eq!(err.to_string(), "agent a1: invalid transition error -> idle");

    let err = FusionError::InvalidState {
        kind: "task",
        id: "t1".into(),
        state: "completed".into(),
        operation: "cancel",
    };
    assert_eq!(err.to_string(), "task t1: cannot cancel while completed");

    let err = FusionError::DanglingDependency {
        task: "t2".into(),
        dependency: "t9".into(),
    };
    assert_eq!(err.to_string(), "task t2 depends on unknown task t9");

    let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: FusionError = json_err.into();
    assert!(matches!(err, FusionError::Json(_)));

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err: FusionError = io_err.into();
    assert!(err.to_string().starts_with("IO error"));
}
