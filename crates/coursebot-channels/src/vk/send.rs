//! Message sending.

use super::types::VkResponse;
use super::VkChannel;
use crate::utils::split_message;
use coursebot_core::{error::BotError, message::Button};
use serde_json::{json, Value};

const MAX_MESSAGE_LEN: usize = 4096;
/// VK rejects button labels longer than this.
const MAX_LABEL_CHARS: usize = 40;

/// Render rows of buttons as an inline keyboard with text buttons whose
/// payload carries the button data.
pub(crate) fn inline_keyboard(rows: &[Vec<Button>]) -> Value {
    let buttons: Vec<Vec<Value>> = rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| {
                    let label: String = b.label.chars().take(MAX_LABEL_CHARS).collect();
                    json!({
                        "action": {
                            "type": "text",
                            "label": label,
                            "payload": json!({ "data": b.data }).to_string(),
                        },
                        "color": "secondary",
                    })
                })
                .collect()
        })
        .collect();
    json!({ "inline": true, "buttons": buttons })
}

impl VkChannel {
    /// Send a text message to a peer. The keyboard is attached to the last chunk.
    pub(crate) async fn send_text(
        &self,
        peer_id: &str,
        text: &str,
        keyboard: &[Vec<Button>],
    ) -> Result<(), BotError> {
        let chunks = split_message(text, MAX_MESSAGE_LEN);
        let last = chunks.len().saturating_sub(1);

        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut params = vec![
                ("access_token", self.token.clone()),
                ("v", self.api_version.clone()),
                ("peer_id", peer_id.to_string()),
                ("random_id", rand::random::<i32>().to_string()),
                ("message", chunk.to_string()),
            ];
            if i == last && !keyboard.is_empty() {
                params.push(("keyboard", inline_keyboard(keyboard).to_string()));
            }

            let resp = self
                .client
                .post(Self::method_url("messages.send"))
                .form(&params)
                .send()
                .await
                .map_err(|e| BotError::Channel(format!("vk send failed: {e}")))?;

            let status = resp.status();
            if !status.is_success() {
                let error_text = resp.text().await.unwrap_or_default();
                return Err(BotError::Channel(format!(
                    "vk send failed ({status}): {error_text}"
                )));
            }

            // VK reports method errors with HTTP 200.
            let answer: VkResponse<Value> = resp
                .json()
                .await
                .map_err(|e| BotError::Channel(format!("vk send parse failed: {e}")))?;
            if let Some(err) = answer.error {
                return Err(BotError::Channel(format!(
                    "vk send error {}: {}",
                    err.error_code, err.error_msg
                )));
            }
        }

        Ok(())
    }
}
