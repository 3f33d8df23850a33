//! Telegram Bot API channel.
//!
//! Uses long polling via `getUpdates` and `sendMessage` for responses.
//! Docs: <https://core.telegram.org/bots/api>

mod polling;
pub(crate) mod send;
pub(crate) mod types;

#[cfg(test)]
mod tests;

use coursebot_core::config::TelegramConfig;
use std::time::Duration;

/// Telegram channel using the Bot API with long polling.
pub struct TelegramChannel {
    client: reqwest::Client,
    base_url: String,
    /// Seconds the server may hold `getUpdates` open.
    long_poll_timeout: u64,
}

impl TelegramChannel {
    /// Create a new Telegram channel from config.
    pub fn new(config: &TelegramConfig, long_poll_timeout: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("https://api.telegram.org/bot{}", config.bot_token),
            long_poll_timeout,
        }
    }

    /// Client-side deadline for one poll: the server hold time plus slack.
    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.long_poll_timeout + 10)
    }
}
