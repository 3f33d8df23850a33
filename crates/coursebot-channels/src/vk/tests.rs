//! Tests for the VK channel module.

use super::polling::{decode_poll, session_from};
use super::send::inline_keyboard;
use super::types::*;
use coursebot_core::error::{DesyncScope, PollError};
use coursebot_core::message::{Button, EventKind};
use coursebot_core::traits::PollResponse;

fn answer(json: &str) -> VkPollAnswer {
    serde_json::from_str(json).unwrap()
}

fn desync_of(json: &str) -> (DesyncScope, Option<String>) {
    match decode_poll(answer(json)).unwrap() {
        PollResponse::Desync { scope, cursor, .. } => (scope, cursor),
        other => panic!("expected desync, got {other:?}"),
    }
}

#[test]
fn test_failed_codes_map_to_scopes() {
    assert_eq!(
        desync_of(r#"{"failed": 1, "ts": "30"}"#),
        (DesyncScope::Position, Some("30".to_string()))
    );
    assert_eq!(desync_of(r#"{"failed": 2}"#), (DesyncScope::Key, None));
    assert_eq!(
        desync_of(r#"{"failed": 3}"#),
        (DesyncScope::KeyAndPosition, None)
    );
}

#[test]
fn test_unknown_failed_code_is_unexpected() {
    let err = decode_poll(answer(r#"{"failed": 4, "min_version": 0, "max_version": 3}"#))
        .unwrap_err();
    assert!(matches!(err, PollError::Unexpected(_)));
}

#[test]
fn test_decode_updates_with_payloads() {
    let json = r#"{"ts": "45", "updates": [
        {"type": "message_new", "object": {"message": {
            "id": 1, "from_id": 555, "peer_id": 555, "text": "Upcoming courses",
            "payload": "{\"data\":\"future_courses\"}"
        }}},
        {"type": "message_new", "object": {"message": {
            "id": 2, "from_id": 555, "peer_id": 555, "text": "hello"
        }}},
        {"type": "message_new", "object": {"message": {
            "id": 3, "from_id": 555, "peer_id": 555, "text": "Start",
            "payload": "{\"command\":\"start\"}"
        }}},
        {"type": "message_typing_state", "object": {}},
        {"type": "message_new", "object": {"message": {
            "id": 4, "from_id": 555, "peer_id": 2000000001, "text": "group chat"
        }}},
        {"type": "message_new", "object": {"message": {
            "id": 5, "from_id": 556, "peer_id": 556, "text": ""
        }}}
    ]}"#;
    let PollResponse::Updates { cursor, events } = decode_poll(answer(json)).unwrap() else {
        panic!("expected updates");
    };
    assert_eq!(cursor.as_deref(), Some("45"));
    assert_eq!(events.len(), 4);
    assert_eq!(events[0].kind, EventKind::Callback);
    assert_eq!(events[0].text, "future_courses");
    assert_eq!(events[0].identity, "555");
    assert_eq!(events[1].kind, EventKind::Message);
    assert_eq!(events[1].text, "hello");
    assert_eq!(events[2].text, "start");
    assert_eq!(events[3].kind, EventKind::Other);
}

#[test]
fn test_numeric_ts_is_accepted() {
    let PollResponse::Updates { cursor, events } =
        decode_poll(answer(r#"{"ts": 1001, "updates": []}"#)).unwrap()
    else {
        panic!("expected updates");
    };
    assert_eq!(cursor.as_deref(), Some("1001"));
    assert!(events.is_empty());
}

#[test]
fn test_session_from_server_answer() {
    let ok: VkResponse<VkLongPollServer> = serde_json::from_str(
        r#"{"response": {"key": "k1", "server": "https://lp.vk.com/wh1", "ts": "7"}}"#,
    )
    .unwrap();
    let session = session_from(ok).unwrap();
    assert_eq!(session.key.as_deref(), Some("k1"));
    assert_eq!(session.server.as_deref(), Some("https://lp.vk.com/wh1"));
    assert_eq!(session.cursor.as_deref(), Some("7"));

    let err: VkResponse<VkLongPollServer> = serde_json::from_str(
        r#"{"error": {"error_code": 5, "error_msg": "User authorization failed"}}"#,
    )
    .unwrap();
    assert!(matches!(
        session_from(err),
        Err(PollError::Desync {
            scope: DesyncScope::KeyAndPosition,
            ..
        })
    ));
}

#[test]
fn test_inline_keyboard_payload_is_json_string() {
    let long = "x".repeat(60);
    let kb = inline_keyboard(&[vec![Button::new(long, "c:7:future_courses")]]);
    let action = &kb["buttons"][0][0]["action"];
    assert_eq!(action["label"].as_str().unwrap().chars().count(), 40);
    let payload: serde_json::Value =
        serde_json::from_str(action["payload"].as_str().unwrap()).unwrap();
    assert_eq!(payload["data"], "c:7:future_courses");
    assert_eq!(kb["inline"], true);
}
