//! Durable reminder definitions and the pure scheduling arithmetic around them.
//!
//! A [`ScheduledTask`] owns an ordered list of [`Trigger`]s. Each trigger is an
//! offset from the anchor time of the entity that owns the task (course start,
//! client registration). One concrete firing is addressed by a [`FiringKey`].

use crate::message::ChannelKind;
use chrono::{DateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

const SECS_PER_DAY: i64 = 86_400;

/// One trigger of a task: an id unique within the task and an offset in
/// seconds from the owning entity's anchor time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub offset_secs: i64,
}

impl Trigger {
    pub fn new(id: impl Into<String>, offset_secs: i64) -> Self {
        Self {
            id: id.into(),
            offset_secs,
        }
    }

    /// Absolute fire time for the given anchor.
    pub fn fire_at(&self, anchor: DateTime<Utc>) -> DateTime<Utc> {
        anchor + chrono::Duration::seconds(self.offset_secs)
    }
}

/// The durable entity a task is anchored to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    /// Anchored to the course start time.
    Course(i64),
    /// Anchored to the client's registration time.
    Client(String),
}

/// What runs when a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "args", rename_all = "snake_case")]
pub enum TaskAction {
    /// Deliver a fixed text.
    SendMessage { identity: String, text: String },
    /// Render and deliver a reminder from the current course record.
    CourseReminder { identity: String, course_id: i64 },
}

impl TaskAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::CourseReminder { .. } => "course_reminder",
        }
    }

    pub fn identity(&self) -> &str {
        match self {
            Self::SendMessage { identity, .. } | Self::CourseReminder { identity, .. } => identity,
        }
    }
}

/// A durable reminder definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub name: String,
    pub channel: ChannelKind,
    pub entity: EntityRef,
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub completed: BTreeSet<String>,
    #[serde(default)]
    pub call_counter: u32,
    pub action: TaskAction,
}

impl ScheduledTask {
    /// True once every trigger has been accounted for. Exhausted tasks are
    /// purged and never rescheduled.
    pub fn is_exhausted(&self) -> bool {
        self.call_counter as usize >= self.triggers.len()
    }

    /// Triggers that have neither fired nor been skipped yet.
    pub fn pending_triggers(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers
            .iter()
            .filter(|t| !self.completed.contains(&t.id))
    }

    pub fn firing_key(&self, trigger: &Trigger) -> FiringKey {
        FiringKey::new(&self.name, &trigger.id)
    }

    /// Record a completion in memory. Returns `false` if it was already there.
    pub fn mark_completed(&mut self, trigger_id: &str) -> bool {
        if !self.triggers.iter().any(|t| t.id == trigger_id) {
            return false;
        }
        if self.completed.insert(trigger_id.to_string()) {
            self.call_counter += 1;
            true
        } else {
            false
        }
    }
}

/// Address of one concrete firing: `{task}:{trigger}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FiringKey {
    pub task: String,
    pub trigger: String,
}

impl FiringKey {
    pub fn new(task: impl Into<String>, trigger: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            trigger: trigger.into(),
        }
    }

    /// Parse `{task}:{trigger}`. Task names may not contain `:`, trigger ids may.
    pub fn parse(key: &str) -> Option<Self> {
        let (task, trigger) = key.split_once(':')?;
        if task.is_empty() || trigger.is_empty() {
            return None;
        }
        Some(Self::new(task, trigger))
    }
}

impl fmt::Display for FiringKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.task, self.trigger)
    }
}

/// Result of the durable check-and-increment completion mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The trigger was pending and is now completed.
    Marked { call_counter: u32 },
    /// Someone already completed it. The action must be skipped.
    AlreadyCompleted,
}

/// What to do with one pending trigger right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPlan {
    /// The fire time has passed: mark completed without firing.
    CatchUp,
    /// Due within the horizon: arm a timer for this delay.
    Schedule(Duration),
    /// Too far ahead; a later sweep will pick it up.
    Defer,
}

/// Decide what to do with `trigger` given the entity anchor, the current time
/// and the scheduling horizon.
pub fn plan_trigger(
    anchor: DateTime<Utc>,
    trigger: &Trigger,
    now: DateTime<Utc>,
    horizon: Duration,
) -> TriggerPlan {
    let remaining = (trigger.fire_at(anchor) - now).num_milliseconds();
    if remaining < 0 {
        return TriggerPlan::CatchUp;
    }
    let remaining = Duration::from_millis(remaining as u64);
    if remaining <= horizon {
        TriggerPlan::Schedule(remaining)
    } else {
        TriggerPlan::Defer
    }
}

/// Seconds until the next configured hour of day, wrapping past midnight.
///
/// Always strictly positive: when `now` sits exactly on a configured hour the
/// next occurrence is chosen. Hours outside `0..24` are ignored; with no valid
/// hours the sweep runs once a day.
pub fn next_bypass_delay(hours: &[u32], now: NaiveTime) -> u64 {
    let now_secs = i64::from(now.num_seconds_from_midnight());
    hours
        .iter()
        .filter(|h| **h < 24)
        .map(|h| {
            let delta = i64::from(*h) * 3600 - now_secs;
            if delta <= 0 {
                delta + SECS_PER_DAY
            } else {
                delta
            }
        })
        .min()
        .unwrap_or(SECS_PER_DAY) as u64
}

/// Task name of the course reminder for one enrollment. Deterministic so that
/// unenrollment can recompute the firing keys it has to cancel.
pub fn course_reminder_task_name(channel: ChannelKind, identity: &str, course_id: i64) -> String {
    format!("{}_remind_{identity}_{course_id}", channel.prefix())
}

/// Trigger id for a reminder sent `hours` before the course starts.
pub fn reminder_trigger(hours: u32) -> Trigger {
    Trigger::new(format!("{hours}h"), -(i64::from(hours) * 3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn task(triggers: &[(&str, i64)]) -> ScheduledTask {
        ScheduledTask {
            name: "tg_remind_42_7".into(),
            channel: ChannelKind::Telegram,
            entity: EntityRef::Course(7),
            triggers: triggers.iter().map(|(id, o)| Trigger::new(*id, *o)).collect(),
            completed: BTreeSet::new(),
            call_counter: 0,
            action: TaskAction::CourseReminder {
                identity: "42".into(),
                course_id: 7,
            },
        }
    }

    #[test]
    fn test_next_bypass_delay_same_day() {
        let now = NaiveTime::from_hms_opt(7, 30, 0).unwrap();
        assert_eq!(next_bypass_delay(&[2, 10, 18], now), 2 * 3600 + 1800);
    }

    #[test]
    fn test_next_bypass_delay_wraps_past_midnight() {
        let now = NaiveTime::from_hms_opt(23, 0, 0).unwrap();
        assert_eq!(next_bypass_delay(&[2, 10], now), 3 * 3600);
    }

    #[test]
    fn test_next_bypass_delay_on_the_hour_picks_next_occurrence() {
        let now = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        assert_eq!(next_bypass_delay(&[10], now), 86_400);
        assert_eq!(next_bypass_delay(&[10, 12], now), 2 * 3600);
    }

    #[test]
    fn test_next_bypass_delay_without_hours_is_daily() {
        let now = NaiveTime::from_hms_opt(5, 0, 0).unwrap();
        assert_eq!(next_bypass_delay(&[], now), 86_400);
        assert_eq!(next_bypass_delay(&[24, 99], now), 86_400);
    }

    #[test]
    fn test_plan_trigger_cases() {
        let anchor = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let horizon = Duration::from_secs(3600);
        let trigger = Trigger::new("a", 600);

        let before = anchor + chrono::Duration::seconds(100);
        assert_eq!(
            plan_trigger(anchor, &trigger, before, horizon),
            TriggerPlan::Schedule(Duration::from_secs(500))
        );

        let after = anchor + chrono::Duration::seconds(601);
        assert_eq!(plan_trigger(anchor, &trigger, after, horizon), TriggerPlan::CatchUp);

        let far = Trigger::new("b", 7200);
        assert_eq!(plan_trigger(anchor, &far, anchor, horizon), TriggerPlan::Defer);
    }

    #[test]
    fn test_reminder_trigger_is_before_anchor() {
        let t = reminder_trigger(18);
        assert_eq!(t.id, "18h");
        assert_eq!(t.offset_secs, -18 * 3600);
    }

    #[test]
    fn test_mark_completed_counts_once() {
        let mut t = task(&[("24h", -86_400), ("2h", -7200)]);
        assert!(t.mark_completed("24h"));
        assert!(!t.mark_completed("24h"));
        assert!(!t.mark_completed("nope"));
        assert_eq!(t.call_counter, 1);
        assert!(!t.is_exhausted());
        assert!(t.mark_completed("2h"));
        assert!(t.is_exhausted());
        assert_eq!(t.pending_triggers().count(), 0);
    }

    #[test]
    fn test_firing_key_format_and_parse() {
        let t = task(&[("24h", -86_400)]);
        let key = t.firing_key(&t.triggers[0]);
        assert_eq!(key.to_string(), "tg_remind_42_7:24h");
        assert_eq!(FiringKey::parse("tg_remind_42_7:24h"), Some(key));
        assert_eq!(FiringKey::parse("no-separator"), None);
        assert_eq!(FiringKey::parse(":x"), None);
    }

    #[test]
    fn test_action_serializes_as_tagged_union() {
        let action = TaskAction::SendMessage {
            identity: "1".into(),
            text: "hi".into(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "send_message");
        assert_eq!(json["args"]["text"], "hi");
    }
}
