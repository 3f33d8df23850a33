//! Entity sweep: turns enrollments and broadcasts into task definitions.

use chrono::{DateTime, Utc};
use coursebot_core::{
    domain::{Audience, Broadcast, Client, Course},
    error::BotError,
    message::ChannelKind,
    traits::{ClientDirectory, CourseCatalog, TaskStore},
};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub reminders_created: usize,
    pub broadcasts_created: usize,
}

impl SweepReport {
    pub fn created(&self) -> usize {
        self.reminders_created + self.broadcasts_created
    }
}

pub struct EntitySweep {
    channel: ChannelKind,
    tasks: Arc<dyn TaskStore>,
    clients: Arc<dyn ClientDirectory>,
    catalog: Arc<dyn CourseCatalog>,
    fresh_register_days: i64,
}

impl EntitySweep {
    pub fn new(
        channel: ChannelKind,
        tasks: Arc<dyn TaskStore>,
        clients: Arc<dyn ClientDirectory>,
        catalog: Arc<dyn CourseCatalog>,
        fresh_register_days: i64,
    ) -> Self {
        Self {
            channel,
            tasks,
            clients,
            catalog,
            fresh_register_days,
        }
    }

    /// Create missing task rows. Timers are armed by the next reconcile.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<SweepReport, BotError> {
        let mut report = SweepReport::default();

        for (identity, course) in self.catalog.upcoming_enrollments(self.channel, now).await? {
            let (_, created) = self
                .tasks
                .get_or_create(course.reminder_task(self.channel, &identity))
                .await?;
            if created {
                debug!("sweep: reminder task for {identity} on course {}", course.id);
                report.reminders_created += 1;
            }
        }

        let broadcasts: Vec<Broadcast> = self
            .catalog
            .broadcasts()
            .await?
            .into_iter()
            .filter(|b| b.scheduled_at > now)
            .collect();
        if !broadcasts.is_empty() {
            let clients = self.clients.clients(self.channel).await?;
            for client in &clients {
                let mut courses: Option<Vec<Course>> = None;
                for broadcast in &broadcasts {
                    let name = broadcast.task_name(self.channel, &client.identity);
                    if client.completed_tasks.contains(&name) {
                        continue;
                    }
                    if !self
                        .matches(&broadcast.audience, client, &mut courses, now)
                        .await?
                    {
                        continue;
                    }
                    let (_, created) = self.tasks.get_or_create(broadcast.task_for(client)).await?;
                    if created {
                        report.broadcasts_created += 1;
                    }
                }
            }
        }

        info!(
            "{} sweep: {} reminder and {} broadcast task(s) created",
            self.channel, report.reminders_created, report.broadcasts_created
        );
        Ok(report)
    }

    /// Whether `client` belongs to `audience`. The client's courses are loaded
    /// at most once per client.
    async fn matches(
        &self,
        audience: &Audience,
        client: &Client,
        courses: &mut Option<Vec<Course>>,
        now: DateTime<Utc>,
    ) -> Result<bool, BotError> {
        let needs_courses = matches!(
            audience,
            Audience::NoCourses | Audience::PastCourses | Audience::FutureCourses
        );
        if needs_courses && courses.is_none() {
            *courses = Some(self.catalog.client_courses(client.id).await?);
        }
        let enrolled = courses.as_deref().unwrap_or_default();

        Ok(match audience {
            Audience::All => true,
            Audience::NoCourses => enrolled.is_empty(),
            Audience::PastCourses => enrolled.iter().any(|c| c.scheduled_at <= now),
            Audience::FutureCourses => enrolled.iter().any(|c| c.scheduled_at > now),
            Audience::FreshRegister => {
                client.registered_at >= now - chrono::Duration::days(self.fresh_register_days)
            }
            Audience::Client(identity) => *identity == client.identity,
        })
    }
}
