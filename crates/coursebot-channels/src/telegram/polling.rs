//! Long-poll rounds and the ChannelBackend implementation.

use super::types::{TgBotInfo, TgResponse, TgUpdate};
use super::TelegramChannel;
use crate::classify::classify;
use async_trait::async_trait;
use coursebot_core::{
    error::{BotError, DesyncScope, PollError},
    message::{ChannelKind, EventKind, InboundEvent, OutgoingMessage},
    traits::{ChannelBackend, PollResponse, SessionParams},
};
use tracing::{debug, info, warn};

/// Interpret one `getUpdates` answer.
///
/// Returns the poll response and the ids of callback queries to acknowledge.
/// `409 Conflict` means another consumer holds the update stream (the session
/// key is stale); `400` means our offset was rejected.
pub(crate) fn decode_updates(
    status: u16,
    body: TgResponse<Vec<TgUpdate>>,
    cursor: Option<&str>,
) -> Result<(PollResponse, Vec<String>), PollError> {
    if !body.ok {
        let code = body.error_code.unwrap_or(i64::from(status));
        let reason = body.description.unwrap_or_default();
        let scope = match code {
            409 => DesyncScope::Key,
            400 => DesyncScope::Position,
            _ => {
                return Err(PollError::ClientResponse {
                    status: u16::try_from(code).unwrap_or(status),
                })
            }
        };
        debug!("telegram desync {code}: {reason}");
        return Ok((
            PollResponse::Desync {
                scope,
                cursor: None,
                code,
            },
            Vec::new(),
        ));
    }

    let updates = body.result.unwrap_or_default();
    let next = updates
        .iter()
        .map(|u| u.update_id)
        .max()
        .map(|id| (id + 1).to_string())
        .or_else(|| cursor.map(String::from));

    let mut events = Vec::with_capacity(updates.len());
    let mut callback_ids = Vec::new();

    for update in updates {
        if let Some(query) = update.callback_query {
            callback_ids.push(query.id.clone());
            let Some(data) = query.data else {
                continue;
            };
            events.push(InboundEvent {
                channel: ChannelKind::Telegram,
                kind: EventKind::Callback,
                identity: query.from.id.to_string(),
                first_name: Some(query.from.first_name),
                last_name: query.from.last_name,
                username: query.from.username,
                text: data,
                message_id: query.message.map(|m| m.message_id),
            });
            continue;
        }

        let Some(msg) = update.message else {
            continue;
        };

        // Only one-to-one chats are served.
        if matches!(msg.chat.chat_type.as_str(), "group" | "supergroup" | "channel") {
            debug!("telegram: ignoring message from chat {}", msg.chat.id);
            continue;
        }

        let Some(user) = msg.from else {
            continue;
        };

        let (kind, text) = match msg.text {
            Some(t) => (EventKind::Message, t),
            None => (EventKind::Other, String::new()),
        };

        events.push(InboundEvent {
            channel: ChannelKind::Telegram,
            kind,
            identity: user.id.to_string(),
            first_name: Some(user.first_name),
            last_name: user.last_name,
            username: user.username,
            text,
            message_id: Some(msg.message_id),
        });
    }

    Ok((
        PollResponse::Updates {
            cursor: next,
            events,
        },
        callback_ids,
    ))
}

impl TelegramChannel {
    /// Acknowledge pressed buttons before the round's events are handed out.
    /// Returns how many acknowledgements went through.
    pub(crate) async fn answer_callbacks(&self, ids: &[String]) -> usize {
        let mut answered = 0;
        for id in ids {
            match super::send::answer_callback(&self.client, &self.base_url, id).await {
                Ok(()) => answered += 1,
                Err(e) => warn!("telegram answerCallbackQuery failed: {e}"),
            }
        }
        answered
    }
}

#[async_trait]
impl ChannelBackend for TelegramChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    /// Telegram has no server-assigned key; `getMe` validates the token.
    async fn acquire_session(&self) -> Result<SessionParams, PollError> {
        let resp = self
            .client
            .get(format!("{}/getMe", self.base_url))
            .timeout(self.request_timeout())
            .send()
            .await
            .map_err(classify)?;
        let status = resp.status().as_u16();
        let body: TgResponse<TgBotInfo> = resp.json().await.map_err(classify)?;
        match body.result {
            Some(bot) if body.ok => {
                info!(
                    "telegram session acquired for @{}",
                    bot.username.unwrap_or_default()
                );
                Ok(SessionParams::default())
            }
            _ => Err(PollError::ClientResponse {
                status: body
                    .error_code
                    .and_then(|c| u16::try_from(c).ok())
                    .unwrap_or(status),
            }),
        }
    }

    async fn poll(&self, session: &SessionParams) -> Result<PollResponse, PollError> {
        let mut url = format!(
            "{}/getUpdates?timeout={}",
            self.base_url, self.long_poll_timeout
        );
        if let Some(offset) = &session.cursor {
            url.push_str(&format!("&offset={offset}"));
        }

        let resp = self
            .client
            .get(&url)
            .timeout(self.request_timeout())
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        let body: TgResponse<Vec<TgUpdate>> = match resp.json().await {
            Ok(b) => b,
            Err(_) if !status.is_success() => {
                return Err(PollError::ClientResponse {
                    status: status.as_u16(),
                })
            }
            Err(e) => return Err(classify(e)),
        };

        let (response, callback_ids) =
            decode_updates(status.as_u16(), body, session.cursor.as_deref())?;

        self.answer_callbacks(&callback_ids).await;
        Ok(response)
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), BotError> {
        let chat_id: i64 = message.identity.parse().map_err(|e| {
            BotError::Channel(format!(
                "invalid telegram chat_id '{}': {e}",
                message.identity
            ))
        })?;
        self.send_text(chat_id, &message.text, &message.keyboard)
            .await
    }
}
