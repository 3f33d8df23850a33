use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The messaging backends coursebot talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Telegram,
    Vk,
}

impl ChannelKind {
    /// Short prefix used in task names and firing keys.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Telegram => "tg",
            Self::Vk => "vk",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Vk => "vk",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "telegram" | "tg" => Ok(Self::Telegram),
            "vk" => Ok(Self::Vk),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

/// What kind of inbound event a backend delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A typed text message.
    Message,
    /// A button press. `text` carries the button data.
    Callback,
    /// Something the conversation layer cannot route (stickers, joins, ...).
    Other,
}

/// A channel-neutral inbound event.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub channel: ChannelKind,
    pub kind: EventKind,
    /// Platform user id, as a string.
    pub identity: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    /// Message text or callback data.
    pub text: String,
    /// Platform message id, when the backend provides one.
    pub message_id: Option<i64>,
}

impl InboundEvent {
    /// Lowercased, trimmed text for keyword matching.
    pub fn normalized_text(&self) -> String {
        self.text.trim().to_lowercase()
    }

    pub fn is_callback(&self) -> bool {
        self.kind == EventKind::Callback
    }
}

/// A button on an inline keyboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    /// Data delivered back as a callback when the button is pressed.
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// An outgoing message. Each backend renders the keyboard in its own format.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub identity: String,
    pub text: String,
    /// Rows of buttons. Empty = no keyboard.
    pub keyboard: Vec<Vec<Button>>,
}

impl OutgoingMessage {
    pub fn text(identity: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            text: text.into(),
            keyboard: Vec::new(),
        }
    }

    pub fn with_keyboard(mut self, keyboard: Vec<Vec<Button>>) -> Self {
        self.keyboard = keyboard;
        self
    }
}

/// Public profile of a platform user.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}
