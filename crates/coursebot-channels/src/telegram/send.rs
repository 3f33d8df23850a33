//! Message sending and callback acknowledgement.

use super::TelegramChannel;
use crate::utils::split_message;
use coursebot_core::{error::BotError, message::Button};
use serde_json::{json, Value};
use std::time::Duration;

/// Telegram's hard limit on message length.
const MAX_MESSAGE_LEN: usize = 4096;

/// Acknowledgements hold up the poll round, so they get a short deadline.
const ANSWER_TIMEOUT: Duration = Duration::from_secs(5);

/// Render rows of buttons as an inline keyboard.
pub(crate) fn inline_keyboard(rows: &[Vec<Button>]) -> Value {
    let rows: Vec<Vec<Value>> = rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| json!({ "text": b.label, "callback_data": b.data }))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

impl TelegramChannel {
    /// Send a text message. The keyboard is attached to the last chunk.
    pub(crate) async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: &[Vec<Button>],
    ) -> Result<(), BotError> {
        let chunks = split_message(text, MAX_MESSAGE_LEN);
        let last = chunks.len().saturating_sub(1);

        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut body = json!({
                "chat_id": chat_id,
                "text": chunk,
            });
            if i == last && !keyboard.is_empty() {
                body["reply_markup"] = inline_keyboard(keyboard);
            }

            let resp = self
                .client
                .post(format!("{}/sendMessage", self.base_url))
                .json(&body)
                .send()
                .await
                .map_err(|e| BotError::Channel(format!("telegram send failed: {e}")))?;

            let status = resp.status();
            if !status.is_success() {
                let error_text = resp.text().await.unwrap_or_default();
                return Err(BotError::Channel(format!(
                    "telegram send failed ({status}): {error_text}"
                )));
            }
        }

        Ok(())
    }
}

/// Stop the client's "loading" spinner on a pressed button.
pub(crate) async fn answer_callback(
    client: &reqwest::Client,
    base_url: &str,
    callback_id: &str,
) -> Result<(), BotError> {
    let resp = client
        .post(format!("{base_url}/answerCallbackQuery"))
        .json(&json!({ "callback_query_id": callback_id }))
        .timeout(ANSWER_TIMEOUT)
        .send()
        .await
        .map_err(|e| BotError::Channel(format!("answerCallbackQuery failed: {e}")))?;
    if !resp.status().is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(BotError::Channel(format!(
            "answerCallbackQuery failed: {body}"
        )));
    }
    Ok(())
}
