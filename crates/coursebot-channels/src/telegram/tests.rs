//! Tests for the Telegram channel module.

use super::polling::decode_updates;
use super::send::inline_keyboard;
use super::types::*;
use super::TelegramChannel;
use coursebot_core::error::{DesyncScope, PollError};
use coursebot_core::message::{Button, EventKind};
use coursebot_core::traits::PollResponse;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn parse(json: &str) -> TgResponse<Vec<TgUpdate>> {
    serde_json::from_str(json).unwrap()
}

#[test]
fn test_decode_message_and_callback() {
    let body = parse(
        r#"{"ok": true, "result": [
            {"update_id": 10, "message": {
                "message_id": 1,
                "from": {"id": 42, "first_name": "Ivan", "username": "ivan"},
                "chat": {"id": 42, "type": "private"},
                "text": "/start"
            }},
            {"update_id": 11, "callback_query": {
                "id": "cb1",
                "from": {"id": 42, "first_name": "Ivan"},
                "message": {"message_id": 2, "chat": {"id": 42, "type": "private"}},
                "data": "en_7"
            }}
        ]}"#,
    );
    let (response, callbacks) = decode_updates(200, body, Some("10")).unwrap();
    assert_eq!(callbacks, vec!["cb1".to_string()]);
    match response {
        PollResponse::Updates { cursor, events } => {
            assert_eq!(cursor.as_deref(), Some("12"));
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].kind, EventKind::Message);
            assert_eq!(events[0].identity, "42");
            assert_eq!(events[0].text, "/start");
            assert_eq!(events[0].username.as_deref(), Some("ivan"));
            assert_eq!(events[1].kind, EventKind::Callback);
            assert_eq!(events[1].text, "en_7");
            assert_eq!(events[1].message_id, Some(2));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_decode_empty_round_keeps_cursor() {
    let body = parse(r#"{"ok": true, "result": []}"#);
    let (response, _) = decode_updates(200, body, Some("77")).unwrap();
    match response {
        PollResponse::Updates { cursor, events } => {
            assert_eq!(cursor.as_deref(), Some("77"));
            assert!(events.is_empty());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_decode_advances_cursor_past_ignored_updates() {
    let body = parse(
        r#"{"ok": true, "result": [
            {"update_id": 5, "message": {
                "message_id": 9,
                "from": {"id": 1, "first_name": "G"},
                "chat": {"id": -100, "type": "group"},
                "text": "hi all"
            }},
            {"update_id": 6}
        ]}"#,
    );
    let (response, _) = decode_updates(200, body, None).unwrap();
    match response {
        PollResponse::Updates { cursor, events } => {
            assert_eq!(cursor.as_deref(), Some("7"));
            assert!(events.is_empty());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_decode_non_text_message_is_other() {
    let body = parse(
        r#"{"ok": true, "result": [{"update_id": 1, "message": {
            "message_id": 3,
            "from": {"id": 5, "first_name": "A"},
            "chat": {"id": 5, "type": "private"}
        }}]}"#,
    );
    let (response, _) = decode_updates(200, body, None).unwrap();
    let PollResponse::Updates { events, .. } = response else {
        panic!("expected updates");
    };
    assert_eq!(events[0].kind, EventKind::Other);
    assert!(events[0].text.is_empty());
}

#[test]
fn test_conflict_maps_to_key_desync() {
    let body = parse(
        r#"{"ok": false, "error_code": 409,
            "description": "Conflict: terminated by other getUpdates request"}"#,
    );
    let (response, _) = decode_updates(409, body, Some("3")).unwrap();
    assert!(matches!(
        response,
        PollResponse::Desync {
            scope: DesyncScope::Key,
            code: 409,
            ..
        }
    ));
}

#[test]
fn test_bad_request_maps_to_position_desync() {
    let body = parse(r#"{"ok": false, "error_code": 400, "description": "Bad Request"}"#);
    let (response, _) = decode_updates(400, body, Some("3")).unwrap();
    assert!(matches!(
        response,
        PollResponse::Desync {
            scope: DesyncScope::Position,
            cursor: None,
            ..
        }
    ));
}

#[test]
fn test_other_api_errors_are_client_responses() {
    let body = parse(r#"{"ok": false, "error_code": 401, "description": "Unauthorized"}"#);
    let err = decode_updates(401, body, None).unwrap_err();
    assert!(matches!(err, PollError::ClientResponse { status: 401 }));
}

#[test]
fn test_tg_chat_type_defaults_when_missing() {
    let chat: TgChat = serde_json::from_str(r#"{"id": 123}"#).unwrap();
    assert_eq!(chat.chat_type, "");
}

#[test]
fn test_inline_keyboard_layout() {
    let kb = inline_keyboard(&[
        vec![Button::new("Upcoming", "future_courses")],
        vec![Button::new("Yes", "phone_true"), Button::new("No", "phone_false")],
    ]);
    assert_eq!(kb["inline_keyboard"][0][0]["callback_data"], "future_courses");
    assert_eq!(kb["inline_keyboard"][1][1]["text"], "No");
}

/// Answer every request with `{"ok":true}`, recording its request line.
async fn serve_ok(listener: TcpListener, seen: Arc<Mutex<Vec<String>>>) {
    while let Ok((mut stream, _)) = listener.accept().await {
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&request).to_lowercase();
            if let Some(end) = text.find("\r\n\r\n") {
                let body_len = text
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + body_len {
                    break;
                }
            }
        }
        let line = String::from_utf8_lossy(&request)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
        seen.lock().unwrap().push(line);

        let body = r#"{"ok":true,"result":true}"#;
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
    }
}

#[tokio::test]
async fn test_callbacks_are_answered_before_returning() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(serve_ok(listener, seen.clone()));

    let channel = TelegramChannel {
        client: reqwest::Client::new(),
        base_url: format!("http://{addr}/botTOKEN"),
        long_poll_timeout: 25,
    };
    let ids = vec!["cb-1".to_string(), "cb-2".to_string()];
    assert_eq!(channel.answer_callbacks(&ids).await, 2);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen
        .iter()
        .all(|l| l.starts_with("POST /botTOKEN/answerCallbackQuery")));
}

#[tokio::test]
async fn test_failed_callback_answers_do_not_abort_the_round() {
    // Bind then drop so the port refuses connections.
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let channel = TelegramChannel {
        client: reqwest::Client::new(),
        base_url: format!("http://{addr}/botTOKEN"),
        long_poll_timeout: 25,
    };
    let ids = vec!["cb-1".to_string(), "cb-2".to_string()];
    assert_eq!(channel.answer_callbacks(&ids).await, 0);
}
