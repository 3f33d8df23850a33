use serde::{Deserialize, Serialize};

use super::defaults::*;
use crate::message::ChannelKind;

/// Channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelConfig {
    pub telegram: Option<TelegramConfig>,
    pub vk: Option<VkConfig>,
}

impl ChannelConfig {
    /// Channels that are configured and enabled.
    pub fn enabled(&self) -> Vec<ChannelKind> {
        let mut out = Vec::new();
        if self.telegram.as_ref().is_some_and(|c| c.enabled) {
            out.push(ChannelKind::Telegram);
        }
        if self.vk.as_ref().is_some_and(|c| c.enabled) {
            out.push(ChannelKind::Vk);
        }
        out
    }

    /// Reset keywords for a channel, lowercased. Falls back to the built-in
    /// defaults when the channel section is absent.
    pub fn reset_keywords(&self, kind: ChannelKind) -> Vec<String> {
        let words = match kind {
            ChannelKind::Telegram => self
                .telegram
                .as_ref()
                .map(|c| c.reset_keywords.clone())
                .unwrap_or_else(default_telegram_reset_keywords),
            ChannelKind::Vk => self
                .vk
                .as_ref()
                .map(|c| c.reset_keywords.clone())
                .unwrap_or_else(default_vk_reset_keywords),
        };
        words.into_iter().map(|w| w.trim().to_lowercase()).collect()
    }

    /// Identity that receives forwarded free-text messages, if any.
    pub fn admin_identity(&self, kind: ChannelKind) -> Option<String> {
        match kind {
            ChannelKind::Telegram => self.telegram.as_ref()?.admin_identity.clone(),
            ChannelKind::Vk => self.vk.as_ref()?.admin_identity.clone(),
        }
        .filter(|id| !id.is_empty())
    }
}

/// Telegram bot config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Overridden by `TELEGRAM_BOT_TOKEN` when set.
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_telegram_reset_keywords")]
    pub reset_keywords: Vec<String>,
    /// Chat id that receives messages clients type into the menu.
    #[serde(default)]
    pub admin_identity: Option<String>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            reset_keywords: default_telegram_reset_keywords(),
            admin_identity: None,
        }
    }
}

/// VK community bot config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VkConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Community access token. Overridden by `VK_GROUP_TOKEN` when set.
    #[serde(default)]
    pub group_token: String,
    #[serde(default)]
    pub group_id: i64,
    #[serde(default = "default_vk_api_version")]
    pub api_version: String,
    #[serde(default = "default_vk_reset_keywords")]
    pub reset_keywords: Vec<String>,
    /// Peer id that receives messages clients type into the menu.
    #[serde(default)]
    pub admin_identity: Option<String>,
}

impl Default for VkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group_token: String::new(),
            group_id: 0,
            api_version: default_vk_api_version(),
            reset_keywords: default_vk_reset_keywords(),
            admin_identity: None,
        }
    }
}
