//! Per-identity conversation state machine.
//!
//! Each inbound event is routed by the client's persisted state (or forced to
//! `START` by a reset keyword). The route replies, may arm or cancel reminders
//! through the scheduler, and returns the next state, which is saved once at
//! the end.

use super::actions::format_start;
use super::routing::{self, normalize_phone, Callback};
use super::scheduler::Scheduler;
use chrono::{DateTime, Utc};
use coursebot_core::{
    config::{Config, SchoolConfig},
    domain::{Client, ClientDefaults, Course},
    error::BotError,
    message::{Button, ChannelKind, EventKind, InboundEvent, OutgoingMessage},
    schedule::{course_reminder_task_name, EntityRef},
    state::ConversationState,
    traits::{ChannelBackend, ClientDirectory, CourseCatalog},
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct ConversationDispatcher {
    channel: ChannelKind,
    backend: Arc<dyn ChannelBackend>,
    clients: Arc<dyn ClientDirectory>,
    catalog: Arc<dyn CourseCatalog>,
    scheduler: Arc<Scheduler>,
    reset_keywords: Vec<String>,
    admin_identity: Option<String>,
    school: SchoolConfig,
    clock_offset: chrono::Duration,
    /// Serialises events of one identity so state saves cannot interleave.
    active: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationDispatcher {
    pub fn new(
        backend: Arc<dyn ChannelBackend>,
        clients: Arc<dyn ClientDirectory>,
        catalog: Arc<dyn CourseCatalog>,
        scheduler: Arc<Scheduler>,
        config: &Config,
    ) -> Self {
        let channel = backend.kind();
        Self {
            channel,
            backend,
            clients,
            catalog,
            scheduler,
            reset_keywords: config.channel.reset_keywords(channel),
            admin_identity: config.channel.admin_identity(channel),
            school: config.school.clone(),
            clock_offset: config.scheduler.clock_offset(),
            active: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Handle one event, logging instead of propagating failures.
    pub async fn handle(&self, event: InboundEvent) {
        let identity = event.identity.clone();
        match self.dispatch(event, Utc::now()).await {
            Ok(Some(state)) => debug!("{}:{identity} -> {state}", self.channel),
            Ok(None) => {}
            Err(e) => error!("{}: event from {identity} failed: {e}", self.channel),
        }
    }

    /// Route one event. Returns the new state, or `None` for events that
    /// cannot be routed (state untouched).
    pub async fn dispatch(
        &self,
        event: InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<ConversationState>, BotError> {
        let text = event.normalized_text();
        if event.kind == EventKind::Other || text.is_empty() {
            debug!(
                "{}: dropped unroutable event from {}",
                self.channel, event.identity
            );
            return Ok(None);
        }

        let lock = self.identity_lock(&event.identity);
        let routed = {
            let _guard = lock.lock().await;
            self.route(&event, text, now).await
        };
        self.release_identity(&event.identity, lock);
        routed.map(Some)
    }

    async fn route(
        &self,
        event: &InboundEvent,
        text: String,
        now: DateTime<Utc>,
    ) -> Result<ConversationState, BotError> {
        let (mut client, created) = self.load_client(event).await?;
        let route = if self.reset_keywords.contains(&text) {
            ConversationState::Start
        } else {
            client.state
        };

        let next = match route {
            ConversationState::Start => self.start(&client, &text, created).await,
            ConversationState::MainMenu => self.main_menu(&mut client, event, now).await?,
            ConversationState::Course => self.course(&mut client, event, now).await?,
            ConversationState::Phone => self.phone(&mut client, event, now).await?,
        };

        client.state = next;
        self.clients.save(&client).await?;
        Ok(next)
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn identity_lock(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.active().entry(identity.to_string()).or_default().clone()
    }

    /// Forget the identity's lock once no other event holds or awaits it.
    fn release_identity(&self, identity: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut active = self.active();
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            active.remove(identity);
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_identities(&self) -> usize {
        self.active().len()
    }

    async fn load_client(&self, event: &InboundEvent) -> Result<(Client, bool), BotError> {
        let defaults = ClientDefaults {
            first_name: event.first_name.clone().unwrap_or_default(),
            last_name: event.last_name.clone(),
            username: event.username.clone(),
        };
        let (mut client, created) = self
            .clients
            .get_or_create(self.channel, &event.identity, defaults)
            .await?;
        if created {
            if client.first_name.is_empty() {
                match self.backend.lookup_profile(&event.identity).await {
                    Ok(Some(profile)) => {
                        client.first_name = profile.first_name;
                        client.last_name = profile.last_name;
                        client.username = profile.username;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("{}: profile lookup for {} failed: {e}", self.channel, event.identity),
                }
            }
            info!("{}: new client {} ({})", self.channel, event.identity, client.first_name);
        }
        Ok((client, created))
    }

    async fn reply(&self, client: &Client, text: impl Into<String>, keyboard: Vec<Vec<Button>>) {
        let message = OutgoingMessage::text(&client.identity, text).with_keyboard(keyboard);
        if let Err(e) = self.backend.send(message).await {
            warn!("{}: reply to {} failed: {e}", self.channel, client.identity);
        }
    }

    async fn show_menu(&self, client: &Client, text: &str) -> ConversationState {
        self.reply(client, text, routing::main_menu()).await;
        ConversationState::MainMenu
    }

    // --- routes ---

    async fn start(&self, client: &Client, text: &str, created: bool) -> ConversationState {
        if created || text == "/start" {
            let name = if client.first_name.is_empty() {
                "there"
            } else {
                client.first_name.as_str()
            };
            let greeting = format!("Hello, {name}! Welcome to {}.", self.school.name);
            self.show_menu(client, &greeting).await
        } else {
            self.show_menu(client, "Main menu").await
        }
    }

    async fn main_menu(
        &self,
        client: &mut Client,
        event: &InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<ConversationState, BotError> {
        if event.is_callback() {
            self.menu_answer(client, &event.text, now).await
        } else {
            Ok(self.forward_to_admin(client, &event.text).await)
        }
    }

    async fn course(
        &self,
        client: &mut Client,
        event: &InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<ConversationState, BotError> {
        if !event.is_callback() {
            return Ok(self.forward_to_admin(client, &event.text).await);
        }
        match Callback::parse(&event.text) {
            Some(Callback::CourseInfo { id, back }) => self.course_info(client, id, &back, now).await,
            _ => self.menu_answer(client, &event.text, now).await,
        }
    }

    async fn phone(
        &self,
        client: &mut Client,
        event: &InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<ConversationState, BotError> {
        if event.is_callback() {
            return match Callback::parse(&event.text) {
                Some(Callback::PhoneConfirmed) => match (client.phone.clone(), client.pending_course) {
                    (Some(_), Some(course_id)) => self.complete_enrollment(client, course_id, now).await,
                    _ => Ok(self.ask_phone(client).await),
                },
                Some(Callback::PhoneRejected) => Ok(self.ask_phone(client).await),
                _ => {
                    client.pending_course = None;
                    self.menu_answer(client, &event.text, now).await
                }
            };
        }

        let Some(phone) = normalize_phone(&event.text) else {
            self.reply(
                client,
                "That does not look like a mobile number. Please send it as +7 XXX XXX-XX-XX.",
                Vec::new(),
            )
            .await;
            return Ok(ConversationState::Phone);
        };
        client.phone = Some(phone);
        match client.pending_course {
            Some(course_id) => self.complete_enrollment(client, course_id, now).await,
            None => Ok(self.show_menu(client, "Your phone number is saved.").await),
        }
    }

    async fn menu_answer(
        &self,
        client: &mut Client,
        data: &str,
        now: DateTime<Utc>,
    ) -> Result<ConversationState, BotError> {
        let Some(callback) = Callback::parse(data) else {
            debug!("{}: unknown callback '{data}'", self.channel);
            return Ok(self.show_menu(client, "Main menu").await);
        };

        match callback {
            Callback::FutureCourses => {
                let courses = self.catalog.future_courses(now).await?;
                Ok(self
                    .list_courses(client, &courses, &callback, "Upcoming courses:", "No upcoming courses yet.")
                    .await)
            }
            Callback::PastCourses => {
                let courses = self.catalog.past_courses(now).await?;
                Ok(self
                    .list_courses(client, &courses, &callback, "Past courses:", "No past courses yet.")
                    .await)
            }
            Callback::ClientCourses => {
                let courses = self.catalog.client_courses(client.id).await?;
                Ok(self
                    .list_courses(client, &courses, &callback, "Your courses:", "You are not enrolled in any course.")
                    .await)
            }
            Callback::SearchUs => {
                let text = if self.school.address.is_empty() {
                    format!("Contact us: {}", self.school.admin_contact)
                } else {
                    format!("{} is at {}", self.school.name, self.school.address)
                };
                Ok(self.show_menu(client, &text).await)
            }
            Callback::AdminMsg => {
                self.reply(client, "Type your message and the administrator will read it.", Vec::new())
                    .await;
                Ok(ConversationState::MainMenu)
            }
            Callback::Enroll(course_id) => self.start_enrollment(client, course_id, now).await,
            Callback::CancelEnrollment(course_id) => self.cancel_enrollment(client, course_id).await,
            Callback::CourseInfo { id, back } => self.course_info(client, id, &back, now).await,
            Callback::Menu | Callback::PhoneConfirmed | Callback::PhoneRejected => {
                Ok(self.show_menu(client, "Main menu").await)
            }
        }
    }

    async fn list_courses(
        &self,
        client: &Client,
        courses: &[Course],
        source: &Callback,
        title: &str,
        empty: &str,
    ) -> ConversationState {
        if courses.is_empty() {
            return self.show_menu(client, empty).await;
        }
        let offset = self.clock_offset;
        let keyboard = routing::course_list(courses, source, |c| format_start(c.scheduled_at, offset));
        self.reply(client, title, keyboard).await;
        ConversationState::Course
    }

    async fn course_info(
        &self,
        client: &Client,
        course_id: i64,
        back: &str,
        now: DateTime<Utc>,
    ) -> Result<ConversationState, BotError> {
        let Some(course) = self.catalog.course(course_id).await? else {
            return Ok(self.show_menu(client, "This course is no longer available.").await);
        };
        let enrolled = self.is_enrolled(client, course_id).await?;
        let open = is_open(&course, now);

        let mut text = format!(
            "{}\nStarts: {}",
            course.name,
            format_start(course.scheduled_at, self.clock_offset)
        );
        if let Some(days) = course.duration_days {
            text.push_str(&format!("\nDuration: {days} day(s)"));
        }
        if let Some(description) = &course.description {
            text.push_str(&format!("\n\n{description}"));
        }
        self.reply(client, text, routing::course_actions(course_id, open, enrolled, back))
            .await;
        Ok(ConversationState::MainMenu)
    }

    async fn start_enrollment(
        &self,
        client: &mut Client,
        course_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ConversationState, BotError> {
        let course = match self.catalog.course(course_id).await? {
            Some(course) if is_open(&course, now) => course,
            _ => {
                return Ok(self
                    .show_menu(client, "Enrollment for this course is closed.")
                    .await)
            }
        };
        if self.is_enrolled(client, course_id).await? {
            return Ok(self
                .show_menu(client, &format!("You are already enrolled in \"{}\".", course.name))
                .await);
        }

        client.pending_course = Some(course_id);
        match &client.phone {
            Some(phone) => {
                let text = format!("Enroll in \"{}\" with phone {phone}?", course.name);
                self.reply(client, text, routing::confirm_phone()).await;
                Ok(ConversationState::Phone)
            }
            None => Ok(self.ask_phone(client).await),
        }
    }

    async fn ask_phone(&self, client: &Client) -> ConversationState {
        self.reply(client, "Please send your mobile phone number.", Vec::new())
            .await;
        ConversationState::Phone
    }

    async fn complete_enrollment(
        &self,
        client: &mut Client,
        course_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ConversationState, BotError> {
        client.pending_course = None;
        let course = match self.catalog.course(course_id).await? {
            Some(course) if is_open(&course, now) => course,
            _ => {
                return Ok(self
                    .show_menu(client, "Enrollment for this course is closed.")
                    .await)
            }
        };

        self.catalog.enroll(client.id, course_id).await?;
        let report = self
            .scheduler
            .arm(course.reminder_task(self.channel, &client.identity), now)
            .await?;
        info!(
            "{}: {} enrolled in course {course_id}, {} reminder(s) armed",
            self.channel, client.identity, report.scheduled
        );

        let text = format!(
            "You are enrolled in \"{}\" on {}. We will remind you beforehand.",
            course.name,
            format_start(course.scheduled_at, self.clock_offset)
        );
        Ok(self.show_menu(client, &text).await)
    }

    async fn cancel_enrollment(
        &self,
        client: &Client,
        course_id: i64,
    ) -> Result<ConversationState, BotError> {
        let removed = self.catalog.unenroll(client.id, course_id).await?;
        let current_triggers: Vec<String> = match self.catalog.course(course_id).await? {
            Some(course) => course.reminder_triggers().into_iter().map(|t| t.id).collect(),
            None => Vec::new(),
        };
        let name = course_reminder_task_name(self.channel, &client.identity, course_id);
        self.scheduler
            .disarm(&EntityRef::Course(course_id), &name, &current_triggers)
            .await?;

        let text = if removed {
            info!("{}: {} left course {course_id}", self.channel, client.identity);
            "Your enrollment is cancelled."
        } else {
            "You were not enrolled in this course."
        };
        Ok(self.show_menu(client, text).await)
    }

    async fn forward_to_admin(&self, client: &Client, text: &str) -> ConversationState {
        let mut from = client.first_name.clone();
        if let Some(last) = &client.last_name {
            from.push(' ');
            from.push_str(last);
        }
        if let Some(username) = &client.username {
            from.push_str(&format!(" @{username}"));
        }
        if let Some(phone) = &client.phone {
            from.push_str(&format!(" {phone}"));
        }
        info!("{}: message for admin from {} ({from}): {text}", self.channel, client.identity);

        if let Some(admin) = &self.admin_identity {
            let note = format!("Message from {from} [{} {}]:\n{text}", self.channel, client.identity);
            if let Err(e) = self.backend.send(OutgoingMessage::text(admin, note)).await {
                warn!("{}: forwarding to admin failed: {e}", self.channel);
            }
        }
        self.show_menu(client, "Thank you! The administrator will get back to you.")
            .await
    }

    async fn is_enrolled(&self, client: &Client, course_id: i64) -> Result<bool, BotError> {
        Ok(self
            .catalog
            .client_courses(client.id)
            .await?
            .iter()
            .any(|c| c.id == course_id))
    }
}

fn is_open(course: &Course, now: DateTime<Utc>) -> bool {
    course.published && course.scheduled_at > now
}
