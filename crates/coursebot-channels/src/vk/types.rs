//! VK API deserialization types.

use serde::Deserialize;
use serde_json::Value;

/// Envelope of a regular API method call.
#[derive(Debug, Deserialize)]
pub(crate) struct VkResponse<T> {
    pub response: Option<T>,
    pub error: Option<VkApiError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VkApiError {
    pub error_code: i64,
    #[serde(default)]
    pub error_msg: String,
}

/// `groups.getLongPollServer` result.
#[derive(Debug, Deserialize)]
pub(crate) struct VkLongPollServer {
    pub key: String,
    pub server: String,
    pub ts: Value,
}

/// One `a_check` answer. `failed` is tried first since a failure answer may
/// also carry `ts`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum VkPollAnswer {
    Failed {
        failed: i64,
        #[serde(default)]
        ts: Option<Value>,
    },
    Updates {
        ts: Value,
        #[serde(default)]
        updates: Vec<VkEvent>,
    },
}

#[derive(Debug, Deserialize)]
pub(crate) struct VkEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub object: Option<VkEventObject>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VkEventObject {
    pub message: Option<VkMessage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VkMessage {
    #[serde(default)]
    pub id: i64,
    pub from_id: i64,
    pub peer_id: i64,
    #[serde(default)]
    pub text: String,
    /// JSON-encoded button payload, as a string.
    pub payload: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VkUser {
    pub first_name: String,
    pub last_name: Option<String>,
    pub screen_name: Option<String>,
}

/// `ts` arrives as a string or a number depending on the endpoint.
pub(crate) fn ts_string(ts: &Value) -> Option<String> {
    match ts {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
