mod channels;
mod defaults;

#[cfg(test)]
mod tests;

pub use channels::*;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::BotError;
use defaults::*;

/// Top-level coursebot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub school: SchoolConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
}

/// General process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// SQLite store config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Reminder scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Hours of day at which the task store is fully reconciled.
    #[serde(default = "default_reconcile_hours")]
    pub reconcile_hours: Vec<u32>,
    /// Hours of day at which enrollments and broadcasts are swept into tasks.
    #[serde(default = "default_entity_sweep_hours")]
    pub entity_sweep_hours: Vec<u32>,
    /// Added to the delay until the next reconcile to form the horizon.
    #[serde(default = "default_horizon_margin_secs")]
    pub horizon_margin_secs: u64,
    /// Shift applied to the wall clock when matching sweep hours.
    #[serde(default)]
    pub clock_offset_hours: i64,
    /// Age limit of the `fresh_register` broadcast audience.
    #[serde(default = "default_fresh_register_days")]
    pub fresh_register_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_hours: default_reconcile_hours(),
            entity_sweep_hours: default_entity_sweep_hours(),
            horizon_margin_secs: default_horizon_margin_secs(),
            clock_offset_hours: 0,
            fresh_register_days: default_fresh_register_days(),
        }
    }
}

impl SchedulerConfig {
    pub fn horizon_margin(&self) -> Duration {
        Duration::from_secs(self.horizon_margin_secs)
    }

    pub fn clock_offset(&self) -> chrono::Duration {
        chrono::Duration::hours(self.clock_offset_hours)
    }
}

/// Long-poll session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds the server may hold one poll open.
    #[serde(default = "default_long_poll_timeout_secs")]
    pub long_poll_timeout_secs: u64,
    /// Delay before retrying after a repeated connection failure.
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout_secs: default_long_poll_timeout_secs(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
        }
    }
}

/// School details used in replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchoolConfig {
    #[serde(default = "default_school_name")]
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub admin_contact: String,
}

impl Default for SchoolConfig {
    fn default() -> Self {
        Self {
            name: default_school_name(),
            address: String::new(),
            admin_contact: String::new(),
        }
    }
}

impl Config {
    /// Apply `TELEGRAM_BOT_TOKEN` / `VK_GROUP_TOKEN` from the environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            std::env::var("VK_GROUP_TOKEN").ok(),
        );
    }

    fn apply_overrides(&mut self, telegram: Option<String>, vk: Option<String>) {
        if let Some(token) = telegram.filter(|t| !t.is_empty()) {
            self.channel
                .telegram
                .get_or_insert_with(TelegramConfig::default)
                .bot_token = token;
        }
        if let Some(token) = vk.filter(|t| !t.is_empty()) {
            self.channel.vk.get_or_insert_with(VkConfig::default).group_token = token;
        }
    }
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file does not exist. Environment token
/// overrides are applied in both cases.
pub fn load(path: &str) -> Result<Config, BotError> {
    let path = Path::new(path);
    let mut config = if !path.exists() {
        tracing::info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        Config::default()
    } else {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BotError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| BotError::Config(format!("failed to parse config: {}", e)))?
    };
    config.apply_env();
    Ok(config)
}
