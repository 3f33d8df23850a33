//! Durable records the conversation and scheduling layers read and write.

use crate::message::ChannelKind;
use crate::schedule::{
    course_reminder_task_name, reminder_trigger, EntityRef, ScheduledTask, TaskAction, Trigger,
};
use crate::state::ConversationState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Reminder lead time for courses that define none.
pub const DEFAULT_REMINDER_HOURS: u32 = 18;

/// A client as known on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: i64,
    pub channel: ChannelKind,
    pub identity: String,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub phone: Option<String>,
    pub state: ConversationState,
    /// Anchor time for registration-relative broadcasts.
    pub registered_at: DateTime<Utc>,
    /// Names of broadcast tasks that were fully delivered.
    pub completed_tasks: BTreeSet<String>,
    /// Course the client is enrolling in while in `PHONE`.
    pub pending_course: Option<i64>,
}

/// Values used when a client record is created on first contact.
#[derive(Debug, Clone, Default)]
pub struct ClientDefaults {
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

/// A course clients can enroll in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Course {
    pub id: i64,
    pub name: String,
    pub scheduled_at: DateTime<Utc>,
    pub duration_days: Option<u32>,
    pub description: Option<String>,
    /// Hours before the start at which to remind enrolled clients.
    pub reminder_hours: Vec<u32>,
    pub published: bool,
}

impl Course {
    /// Reminder triggers, ordered from the earliest fire time.
    pub fn reminder_triggers(&self) -> Vec<Trigger> {
        let mut hours = if self.reminder_hours.is_empty() {
            vec![DEFAULT_REMINDER_HOURS]
        } else {
            self.reminder_hours.clone()
        };
        hours.sort_unstable_by(|a, b| b.cmp(a));
        hours.dedup();
        hours.into_iter().map(reminder_trigger).collect()
    }

    /// The reminder task for one enrolled client.
    pub fn reminder_task(&self, channel: ChannelKind, identity: &str) -> ScheduledTask {
        ScheduledTask {
            name: course_reminder_task_name(channel, identity, self.id),
            channel,
            entity: EntityRef::Course(self.id),
            triggers: self.reminder_triggers(),
            completed: BTreeSet::new(),
            call_counter: 0,
            action: TaskAction::CourseReminder {
                identity: identity.to_string(),
                course_id: self.id,
            },
        }
    }
}

/// Who a broadcast is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    All,
    NoCourses,
    PastCourses,
    FutureCourses,
    /// Registered within the last few days.
    FreshRegister,
    /// One specific client, by identity.
    Client(String),
}

impl Audience {
    /// Name segment used in broadcast task names.
    pub fn slug(&self) -> &str {
        match self {
            Self::All => "all",
            Self::NoCourses => "no_courses",
            Self::PastCourses => "past_courses",
            Self::FutureCourses => "future_courses",
            Self::FreshRegister => "fresh_register",
            Self::Client(_) => "client",
        }
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client(identity) => write!(f, "client:{identity}"),
            other => f.write_str(other.slug()),
        }
    }
}

impl FromStr for Audience {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "no_courses" => Ok(Self::NoCourses),
            "past_courses" => Ok(Self::PastCourses),
            "future_courses" => Ok(Self::FutureCourses),
            "fresh_register" => Ok(Self::FreshRegister),
            other => match other.strip_prefix("client:") {
                Some(identity) if !identity.is_empty() => Ok(Self::Client(identity.to_string())),
                _ => Err(format!("unknown audience '{other}'")),
            },
        }
    }
}

/// A message the back office wants delivered at a fixed time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub id: i64,
    pub audience: Audience,
    /// Template; `{first_name}` is substituted per client.
    pub text: String,
    pub scheduled_at: DateTime<Utc>,
}

impl Broadcast {
    /// Task name for one recipient.
    pub fn task_name(&self, channel: ChannelKind, identity: &str) -> String {
        format!(
            "{}_{}_{identity}_{}",
            channel.prefix(),
            self.audience.slug(),
            self.scheduled_at.timestamp()
        )
    }

    /// The broadcast task for one client, anchored on their registration.
    pub fn task_for(&self, client: &Client) -> ScheduledTask {
        let offset = (self.scheduled_at - client.registered_at).num_seconds();
        ScheduledTask {
            name: self.task_name(client.channel, &client.identity),
            channel: client.channel,
            entity: EntityRef::Client(client.identity.clone()),
            triggers: vec![Trigger::new("at", offset)],
            completed: BTreeSet::new(),
            call_counter: 0,
            action: TaskAction::SendMessage {
                identity: client.identity.clone(),
                text: render_template(&self.text, &[("first_name", &client.first_name)]),
            },
        }
    }
}

/// Substitute `{key}` placeholders, tolerating inner spaces (`{ key }`).
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        for placeholder in [
            format!("{{{key}}}"),
            format!("{{ {key}}}"),
            format!("{{{key} }}"),
            format!("{{ {key} }}"),
        ] {
            out = out.replace(&placeholder, value);
        }
    }
    out
}

/// Why a cross-process invalidation was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalPurpose {
    /// Cancel deleted reminders and recompute the listed courses.
    UpdateTasks,
}

impl SignalPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateTasks => "update_tasks",
        }
    }
}

/// Key of one invalidation slot: `{channel}_{purpose}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalKey {
    pub channel: ChannelKind,
    pub purpose: SignalPurpose,
}

impl SignalKey {
    pub fn new(channel: ChannelKind, purpose: SignalPurpose) -> Self {
        Self { channel, purpose }
    }
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.channel.prefix(), self.purpose.as_str())
    }
}

/// Payload of an invalidation notice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationPayload {
    #[serde(default)]
    pub deleted_firing_keys: Vec<String>,
    /// Course ids whose reminder schedule must be recomputed.
    #[serde(default)]
    pub entity_ids: Vec<i64>,
}

impl InvalidationPayload {
    pub fn is_empty(&self) -> bool {
        self.deleted_firing_keys.is_empty() && self.entity_ids.is_empty()
    }
}
