//! Long-poll rounds and the ChannelBackend implementation.

use super::types::{
    ts_string, VkEvent, VkLongPollServer, VkPollAnswer, VkResponse, VkUser,
};
use super::VkChannel;
use crate::classify::{check_status, classify};
use async_trait::async_trait;
use coursebot_core::{
    error::{BotError, DesyncScope, PollError},
    message::{ChannelKind, EventKind, InboundEvent, OutgoingMessage, Profile},
    traits::{ChannelBackend, PollResponse, SessionParams},
};
use serde_json::Value;
use tracing::{debug, info};

/// Button data carried in a message payload. Our own keyboards use `data`;
/// `button` and `command` come from older keyboards and VK's Start button.
fn payload_data(payload: Option<&str>) -> Option<String> {
    let value: Value = serde_json::from_str(payload?).ok()?;
    ["data", "button", "command"]
        .iter()
        .find_map(|k| value.get(k).and_then(Value::as_str))
        .map(String::from)
}

fn event_from(raw: VkEvent) -> Option<InboundEvent> {
    if raw.event_type != "message_new" {
        return None;
    }
    let msg = raw.object?.message?;
    // Only one-to-one dialogs are served.
    if msg.peer_id != msg.from_id {
        debug!("vk: ignoring message in peer {}", msg.peer_id);
        return None;
    }
    let (kind, text) = match payload_data(msg.payload.as_deref()) {
        Some(data) => (EventKind::Callback, data),
        None if msg.text.trim().is_empty() => (EventKind::Other, String::new()),
        None => (EventKind::Message, msg.text),
    };
    Some(InboundEvent {
        channel: ChannelKind::Vk,
        kind,
        identity: msg.from_id.to_string(),
        first_name: None,
        last_name: None,
        username: None,
        text,
        message_id: Some(msg.id),
    })
}

/// Interpret one `a_check` answer.
///
/// `failed: 1` carries a new `ts`; `failed: 2` means the key expired;
/// `failed: 3` means both key and `ts` are lost.
pub(crate) fn decode_poll(answer: VkPollAnswer) -> Result<PollResponse, PollError> {
    match answer {
        VkPollAnswer::Failed { failed, ts } => {
            let scope = match failed {
                1 => DesyncScope::Position,
                2 => DesyncScope::Key,
                3 => DesyncScope::KeyAndPosition,
                other => {
                    return Err(PollError::Unexpected(format!(
                        "vk long poll failed with code {other}"
                    )))
                }
            };
            Ok(PollResponse::Desync {
                scope,
                cursor: ts.as_ref().and_then(ts_string),
                code: failed,
            })
        }
        VkPollAnswer::Updates { ts, updates } => Ok(PollResponse::Updates {
            cursor: ts_string(&ts),
            events: updates.into_iter().filter_map(event_from).collect(),
        }),
    }
}

/// Turn a `getLongPollServer` answer into session params.
pub(crate) fn session_from(
    answer: VkResponse<VkLongPollServer>,
) -> Result<SessionParams, PollError> {
    if let Some(err) = answer.error {
        return Err(PollError::Desync {
            scope: DesyncScope::KeyAndPosition,
            reason: format!("vk api error {}: {}", err.error_code, err.error_msg),
        });
    }
    let server = answer
        .response
        .ok_or_else(|| PollError::Unexpected("empty getLongPollServer answer".into()))?;
    Ok(SessionParams {
        cursor: ts_string(&server.ts),
        server: Some(server.server),
        key: Some(server.key),
    })
}

#[async_trait]
impl ChannelBackend for VkChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Vk
    }

    async fn acquire_session(&self) -> Result<SessionParams, PollError> {
        let group_id = self.group_id.to_string();
        let resp = self
            .client
            .get(Self::method_url("groups.getLongPollServer"))
            .query(&[
                ("access_token", self.token.as_str()),
                ("v", self.api_version.as_str()),
                ("group_id", group_id.as_str()),
            ])
            .timeout(self.request_timeout())
            .send()
            .await
            .map_err(classify)?;
        check_status(&resp)?;
        let answer: VkResponse<VkLongPollServer> = resp.json().await.map_err(classify)?;
        let session = session_from(answer)?;
        info!("vk long poll session acquired for group {}", self.group_id);
        Ok(session)
    }

    async fn poll(&self, session: &SessionParams) -> Result<PollResponse, PollError> {
        let (Some(server), Some(key), Some(ts)) = (&session.server, &session.key, &session.cursor)
        else {
            return Err(PollError::Unexpected("vk session is incomplete".into()));
        };

        let wait = self.long_poll_timeout.to_string();
        let resp = self
            .client
            .get(server)
            .query(&[
                ("act", "a_check"),
                ("key", key.as_str()),
                ("ts", ts.as_str()),
                ("wait", wait.as_str()),
            ])
            .timeout(self.request_timeout())
            .send()
            .await
            .map_err(classify)?;
        check_status(&resp)?;
        let answer: VkPollAnswer = resp.json().await.map_err(classify)?;
        decode_poll(answer)
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), BotError> {
        self.send_text(&message.identity, &message.text, &message.keyboard)
            .await
    }

    async fn lookup_profile(&self, identity: &str) -> Result<Option<Profile>, BotError> {
        let resp = self
            .client
            .get(Self::method_url("users.get"))
            .query(&[
                ("access_token", self.token.as_str()),
                ("v", self.api_version.as_str()),
                ("user_ids", identity),
                ("fields", "screen_name"),
            ])
            .send()
            .await
            .map_err(|e| BotError::Channel(format!("vk users.get failed: {e}")))?;
        let answer: VkResponse<Vec<VkUser>> = resp
            .json()
            .await
            .map_err(|e| BotError::Channel(format!("vk users.get parse failed: {e}")))?;
        if let Some(err) = answer.error {
            return Err(BotError::Channel(format!(
                "vk users.get error {}: {}",
                err.error_code, err.error_msg
            )));
        }
        Ok(answer
            .response
            .and_then(|users| users.into_iter().next())
            .map(|u| Profile {
                first_name: u.first_name,
                last_name: u.last_name,
                username: u.screen_name,
            }))
    }
}
