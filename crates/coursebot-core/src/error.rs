use thiserror::Error;

/// Top-level error type for coursebot.
#[derive(Debug, Error)]
pub enum BotError {
    /// Error from a messaging channel.
    #[error("channel error: {0}")]
    Channel(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Durable store error.
    #[error("store error: {0}")]
    Store(String),

    /// A scheduled action could not be carried out.
    #[error("action error: {0}")]
    Action(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How much of a long-poll session must be reacquired after the backend
/// reports that our view of the session is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesyncScope {
    /// Only the position (cursor / `ts`) is stale.
    Position,
    /// Only the server-assigned key is stale.
    Key,
    /// Both the key and the position are stale.
    KeyAndPosition,
}

/// Classified failure of a single long-poll round.
#[derive(Debug, Error)]
pub enum PollError {
    /// The connection was reset or could not be established.
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// The read timed out. Expected now and then under long polling.
    #[error("read timeout")]
    ReadTimeout,

    /// The server answered with a non-success HTTP status.
    #[error("client response error: HTTP {status}")]
    ClientResponse { status: u16 },

    /// The backend reported that the session is out of sync.
    #[error("session desync ({scope:?}): {reason}")]
    Desync { scope: DesyncScope, reason: String },

    /// Anything else. Triggers a full session reset.
    #[error("unexpected poll failure: {0}")]
    Unexpected(String),
}
