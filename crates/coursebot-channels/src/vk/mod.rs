//! VK community bot channel.
//!
//! Uses the Bots Long Poll API (`groups.getLongPollServer` + `a_check`) and
//! `messages.send` for responses.
//! Docs: <https://dev.vk.com/ru/api/bots-long-poll/getting-started>

mod polling;
pub(crate) mod send;
pub(crate) mod types;

#[cfg(test)]
mod tests;

use coursebot_core::config::VkConfig;
use std::time::Duration;

const API_BASE: &str = "https://api.vk.com/method";

/// VK channel using a community token with long polling.
pub struct VkChannel {
    client: reqwest::Client,
    token: String,
    group_id: i64,
    api_version: String,
    /// Seconds the long-poll server may hold `a_check` open.
    long_poll_timeout: u64,
}

impl VkChannel {
    /// Create a new VK channel from config.
    pub fn new(config: &VkConfig, long_poll_timeout: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: config.group_token.clone(),
            group_id: config.group_id,
            api_version: config.api_version.clone(),
            long_poll_timeout,
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.long_poll_timeout + 10)
    }

    fn method_url(method: &str) -> String {
        format!("{API_BASE}/{method}")
    }
}
