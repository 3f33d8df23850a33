//! Fire-time actions of scheduled tasks.

use chrono::{DateTime, Utc};
use coursebot_core::{
    domain::Course,
    error::BotError,
    message::OutgoingMessage,
    schedule::TaskAction,
    traits::{ChannelBackend, CourseCatalog},
};
use std::sync::Arc;
use tracing::warn;

/// Resolves a [`TaskAction`] to its effect on the channel backend.
pub struct ActionRegistry {
    backend: Arc<dyn ChannelBackend>,
    catalog: Arc<dyn CourseCatalog>,
    clock_offset: chrono::Duration,
}

impl ActionRegistry {
    pub fn new(
        backend: Arc<dyn ChannelBackend>,
        catalog: Arc<dyn CourseCatalog>,
        clock_offset: chrono::Duration,
    ) -> Self {
        Self {
            backend,
            catalog,
            clock_offset,
        }
    }

    pub async fn run(&self, action: &TaskAction) -> Result<(), BotError> {
        match action {
            TaskAction::SendMessage { identity, text } => {
                self.backend
                    .send(OutgoingMessage::text(identity, text))
                    .await
            }
            TaskAction::CourseReminder {
                identity,
                course_id,
            } => {
                // Read at fire time so edits made after enrollment show up.
                let Some(course) = self.catalog.course(*course_id).await? else {
                    warn!("reminder for course {course_id} skipped, course was deleted");
                    return Ok(());
                };
                let text = reminder_text(&course, self.clock_offset);
                self.backend.send(OutgoingMessage::text(identity, text)).await
            }
        }
    }
}

/// Course start rendered in the school's wall-clock time.
pub fn format_start(at: DateTime<Utc>, clock_offset: chrono::Duration) -> String {
    (at + clock_offset).format("%d.%m.%Y %H:%M").to_string()
}

fn reminder_text(course: &Course, clock_offset: chrono::Duration) -> String {
    format!(
        "Reminder: \"{}\" starts on {}. See you there!",
        course.name,
        format_start(course.scheduled_at, clock_offset)
    )
}
