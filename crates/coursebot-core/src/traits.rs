use crate::{
    domain::{Broadcast, Client, ClientDefaults, Course, InvalidationPayload, SignalKey},
    error::{BotError, DesyncScope, PollError},
    message::{ChannelKind, InboundEvent, OutgoingMessage, Profile},
    schedule::{EntityRef, MarkOutcome, ScheduledTask},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Server-assigned long-poll session handle.
///
/// Telegram only uses `cursor` (the update offset). VK uses all three.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionParams {
    pub server: Option<String>,
    pub key: Option<String>,
    pub cursor: Option<String>,
}

/// Decoded answer of one long-poll round.
#[derive(Debug)]
pub enum PollResponse {
    /// Zero or more events and the position to poll from next.
    Updates {
        cursor: Option<String>,
        events: Vec<InboundEvent>,
    },
    /// The backend says our session is stale.
    Desync {
        scope: DesyncScope,
        /// New position when the backend hands one out with the desync.
        cursor: Option<String>,
        code: i64,
    },
}

/// Messaging backend contract, implemented once per platform.
#[async_trait]
pub trait ChannelBackend: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Acquire a fresh session handle.
    async fn acquire_session(&self) -> Result<SessionParams, PollError>;

    /// One blocking long-poll round.
    async fn poll(&self, session: &SessionParams) -> Result<PollResponse, PollError>;

    /// Deliver a message.
    async fn send(&self, message: OutgoingMessage) -> Result<(), BotError>;

    /// Look up a user's public profile. Backends whose events already carry
    /// names need not implement it.
    async fn lookup_profile(&self, _identity: &str) -> Result<Option<Profile>, BotError> {
        Ok(None)
    }
}

/// Durable table of reminder definitions.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<ScheduledTask>, BotError>;

    /// Tasks owned by any of the given entities.
    async fn get_by_entities(&self, entities: &[EntityRef])
        -> Result<Vec<ScheduledTask>, BotError>;

    /// Insert `defaults` unless a task with the same name exists. Returns the
    /// stored task and whether it was created.
    async fn get_or_create(&self, defaults: ScheduledTask)
        -> Result<(ScheduledTask, bool), BotError>;

    async fn save(&self, task: &ScheduledTask) -> Result<(), BotError>;

    async fn delete(&self, name: &str) -> Result<(), BotError>;

    /// Atomic check-and-increment of a trigger's completion mark.
    async fn mark_completed(&self, name: &str, trigger_id: &str)
        -> Result<MarkOutcome, BotError>;
}

/// Durable per-identity records.
#[async_trait]
pub trait ClientDirectory: Send + Sync {
    async fn get_or_create(
        &self,
        channel: ChannelKind,
        identity: &str,
        defaults: ClientDefaults,
    ) -> Result<(Client, bool), BotError>;

    async fn save(&self, client: &Client) -> Result<(), BotError>;

    async fn clients(&self, channel: ChannelKind) -> Result<Vec<Client>, BotError>;

    async fn add_completed_task(
        &self,
        channel: ChannelKind,
        identity: &str,
        task_name: &str,
    ) -> Result<(), BotError>;
}

/// Courses, enrollments, and broadcasts.
#[async_trait]
pub trait CourseCatalog: Send + Sync {
    async fn course(&self, id: i64) -> Result<Option<Course>, BotError>;

    /// Published courses starting after `now`, soonest first.
    async fn future_courses(&self, now: DateTime<Utc>) -> Result<Vec<Course>, BotError>;

    /// Published courses that started at or before `now`, latest first.
    async fn past_courses(&self, now: DateTime<Utc>) -> Result<Vec<Course>, BotError>;

    /// Published courses the client is enrolled in.
    async fn client_courses(&self, client_id: i64) -> Result<Vec<Course>, BotError>;

    /// Returns `false` if the client was already enrolled.
    async fn enroll(&self, client_id: i64, course_id: i64) -> Result<bool, BotError>;

    /// Returns `false` if the client was not enrolled.
    async fn unenroll(&self, client_id: i64, course_id: i64) -> Result<bool, BotError>;

    /// (identity, course) for every enrollment of a client on `channel` in a
    /// published course starting after `now`.
    async fn upcoming_enrollments(
        &self,
        channel: ChannelKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, Course)>, BotError>;

    async fn broadcasts(&self) -> Result<Vec<Broadcast>, BotError>;
}

/// Resolves the anchor time of the entity owning a task.
#[async_trait]
pub trait AnchorSource: Send + Sync {
    /// `None` when the entity no longer exists.
    async fn anchor_time(
        &self,
        channel: ChannelKind,
        entity: &EntityRef,
    ) -> Result<Option<DateTime<Utc>>, BotError>;
}

/// Shared ephemeral "recompute now" notices.
#[async_trait]
pub trait InvalidationSignal: Send + Sync {
    async fn get(&self, key: SignalKey) -> Result<Option<InvalidationPayload>, BotError>;

    async fn set(&self, key: SignalKey, payload: &InvalidationPayload) -> Result<(), BotError>;

    async fn delete(&self, key: SignalKey) -> Result<(), BotError>;

    /// Read and clear in one step. A written payload is returned at most once.
    async fn take(&self, key: SignalKey) -> Result<Option<InvalidationPayload>, BotError>;
}
