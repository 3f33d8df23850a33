//! Process-resident registry of cancellable reminder timers, kept consistent
//! with the durable task store.

use super::actions::ActionRegistry;
use chrono::{DateTime, Utc};
use coursebot_core::{
    config::SchedulerConfig,
    error::BotError,
    message::ChannelKind,
    schedule::{
        next_bypass_delay, plan_trigger, EntityRef, FiringKey, MarkOutcome, ScheduledTask,
        TaskAction, Trigger, TriggerPlan,
    },
    traits::{AnchorSource, ClientDirectory, CourseCatalog, TaskStore},
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Handle of one armed timer. Dropping or firing `cancel` stops the sleep.
struct LiveTimer {
    id: u64,
    cancel: oneshot::Sender<()>,
}

type Registry = Arc<Mutex<HashMap<FiringKey, LiveTimer>>>;

/// Counters from one planning pass, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scheduled: usize,
    pub kept: usize,
    pub caught_up: usize,
    pub deferred: usize,
    pub cancelled: usize,
    pub purged: usize,
    pub orphaned: usize,
}

/// Owns the live timers of one channel.
pub struct Scheduler {
    channel: ChannelKind,
    tasks: Arc<dyn TaskStore>,
    clients: Arc<dyn ClientDirectory>,
    anchors: Arc<dyn AnchorSource>,
    catalog: Arc<dyn CourseCatalog>,
    actions: Arc<ActionRegistry>,
    config: SchedulerConfig,
    registry: Registry,
    next_id: AtomicU64,
}

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<FiringKey, LiveTimer>> {
    // A panic while holding the lock cannot leave the map half-updated.
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Scheduler {
    pub fn new(
        channel: ChannelKind,
        tasks: Arc<dyn TaskStore>,
        clients: Arc<dyn ClientDirectory>,
        anchors: Arc<dyn AnchorSource>,
        catalog: Arc<dyn CourseCatalog>,
        actions: Arc<ActionRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            channel,
            tasks,
            clients,
            anchors,
            catalog,
            actions,
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn channel(&self) -> ChannelKind {
        self.channel
    }

    /// Arm a timer for `key`. An existing timer for the same key is cancelled
    /// and replaced. When `durable`, the trigger is marked completed in the
    /// task store right before the action runs, and a failed mark skips it.
    pub fn schedule(&self, key: FiringKey, delay: Duration, action: TaskAction, durable: bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel, mut cancelled) = oneshot::channel();

        if let Some(old) = lock(&self.registry).insert(key.clone(), LiveTimer { id, cancel }) {
            let _ = old.cancel.send(());
            debug!("scheduler: replaced timer {key}");
        }

        let registry = self.registry.clone();
        let tasks = self.tasks.clone();
        let actions = self.actions.clone();
        debug!("scheduler: {key} armed, fires in {}s", delay.as_secs());

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut cancelled => {
                    debug!("scheduler: {key} cancelled");
                    return;
                }
            }

            fire(&tasks, &actions, &key, action, durable).await;

            let mut reg = lock(&registry);
            if reg.get(&key).is_some_and(|t| t.id == id) {
                reg.remove(&key);
            }
        });
    }

    /// Cancel the timer for `key`. Returns `false` if none was armed.
    pub fn cancel(&self, key: &FiringKey) -> bool {
        match lock(&self.registry).remove(key) {
            Some(timer) => {
                let _ = timer.cancel.send(());
                debug!("scheduler: cancelled {key}");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: &FiringKey) -> bool {
        lock(&self.registry).contains_key(key)
    }

    /// Keys of all armed timers, sorted.
    pub fn live_keys(&self) -> Vec<FiringKey> {
        let mut keys: Vec<_> = lock(&self.registry).keys().cloned().collect();
        keys.sort_by_key(|k| k.to_string());
        keys
    }

    /// Cancel every armed timer. Durable state is untouched.
    pub fn shutdown(&self) {
        let timers: Vec<_> = lock(&self.registry).drain().collect();
        let count = timers.len();
        for (_, timer) in timers {
            let _ = timer.cancel.send(());
        }
        info!("{} scheduler: shut down, {count} timer(s) dropped", self.channel);
    }

    /// Wall-clock time used for matching sweep hours.
    pub fn local_time(&self, now: DateTime<Utc>) -> chrono::NaiveTime {
        (now + self.config.clock_offset()).time()
    }

    /// Delay until the next configured hour in `hours`.
    pub fn delay_until(&self, hours: &[u32], now: DateTime<Utc>) -> Duration {
        Duration::from_secs(next_bypass_delay(hours, self.local_time(now)))
    }

    /// How far ahead triggers are armed: up to the next reconcile plus margin.
    pub fn horizon(&self, now: DateTime<Utc>) -> Duration {
        self.delay_until(&self.config.reconcile_hours, now) + self.config.horizon_margin()
    }

    /// Full pass over this channel's tasks. Already armed keys are left alone.
    pub async fn reconcile_from_store(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, BotError> {
        let horizon = self.horizon(now);
        let mut report = ReconcileReport::default();
        for task in self.tasks.get_all().await? {
            if task.channel != self.channel {
                continue;
            }
            self.plan_task(task, now, horizon, false, &mut report).await?;
        }
        info!(
            "{} scheduler: reconciled, {} scheduled, {} kept, {} caught up, {} deferred, {} purged, {} orphaned",
            self.channel,
            report.scheduled,
            report.kept,
            report.caught_up,
            report.deferred,
            report.purged,
            report.orphaned
        );
        Ok(report)
    }

    /// Re-plan tasks owned by the given courses, replacing armed timers.
    /// Triggers are rebuilt from the course's current reminder hours first.
    pub async fn recompute_entities(
        &self,
        course_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, BotError> {
        let entities: Vec<EntityRef> = course_ids.iter().copied().map(EntityRef::Course).collect();
        let horizon = self.horizon(now);
        let mut report = ReconcileReport::default();
        for mut task in self.tasks.get_by_entities(&entities).await? {
            if task.channel != self.channel {
                continue;
            }
            if let EntityRef::Course(id) = task.entity {
                if let Some(course) = self.catalog.course(id).await? {
                    report.cancelled += self.retrigger(&mut task, course.reminder_triggers()).await?;
                }
            }
            self.plan_task(task, now, horizon, true, &mut report).await?;
        }
        info!(
            "{} scheduler: recomputed courses {course_ids:?}, {} scheduled, {} cancelled, {} caught up",
            self.channel, report.scheduled, report.cancelled, report.caught_up
        );
        Ok(report)
    }

    /// Store a new task (or reuse the existing one) and arm what is due.
    pub async fn arm(
        &self,
        task: ScheduledTask,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, BotError> {
        let (task, _) = self.tasks.get_or_create(task).await?;
        let mut report = ReconcileReport::default();
        self.plan_task(task, now, self.horizon(now), true, &mut report)
            .await?;
        Ok(report)
    }

    /// Cancel every timer of a task and delete it. `extra_triggers` adds
    /// trigger ids to cancel even if the stored task no longer lists them.
    pub async fn disarm(
        &self,
        entity: &EntityRef,
        name: &str,
        extra_triggers: &[String],
    ) -> Result<(), BotError> {
        let stored = self
            .tasks
            .get_by_entities(std::slice::from_ref(entity))
            .await?
            .into_iter()
            .find(|t| t.name == name);

        let mut trigger_ids: Vec<String> = extra_triggers.to_vec();
        if let Some(task) = &stored {
            trigger_ids.extend(task.triggers.iter().map(|t| t.id.clone()));
        }
        for trigger in trigger_ids {
            self.cancel(&FiringKey::new(name, trigger));
        }
        self.tasks.delete(name).await
    }

    /// Swap in a new trigger list. Timers and completion marks of triggers
    /// that went away are dropped; returns how many timers were cancelled.
    async fn retrigger(
        &self,
        task: &mut ScheduledTask,
        triggers: Vec<Trigger>,
    ) -> Result<usize, BotError> {
        if task.triggers == triggers {
            return Ok(0);
        }

        let kept: BTreeSet<String> = triggers.iter().map(|t| t.id.clone()).collect();
        let mut cancelled = 0;
        for old in task.triggers.iter().filter(|t| !kept.contains(&t.id)) {
            if self.cancel(&task.firing_key(old)) {
                cancelled += 1;
            }
        }
        task.triggers = triggers;
        task.completed.retain(|id| kept.contains(id));
        task.call_counter = task.completed.len() as u32;
        self.tasks.save(task).await?;
        info!(
            "scheduler: {} now has triggers {:?}",
            task.name,
            kept.iter().collect::<Vec<_>>()
        );
        Ok(cancelled)
    }

    async fn plan_task(
        &self,
        task: ScheduledTask,
        now: DateTime<Utc>,
        horizon: Duration,
        replace: bool,
        report: &mut ReconcileReport,
    ) -> Result<(), BotError> {
        if task.is_exhausted() {
            self.purge(&task).await?;
            report.purged += 1;
            return Ok(());
        }

        let Some(anchor) = self.anchors.anchor_time(self.channel, &task.entity).await? else {
            for trigger in &task.triggers {
                self.cancel(&task.firing_key(trigger));
            }
            self.tasks.delete(&task.name).await?;
            info!("scheduler: {} dropped, its owner is gone", task.name);
            report.orphaned += 1;
            return Ok(());
        };

        let mut counter = task.call_counter;
        let pending: Vec<_> = task.pending_triggers().cloned().collect();
        for trigger in &pending {
            let key = task.firing_key(trigger);
            if !replace && self.is_scheduled(&key) {
                report.kept += 1;
                continue;
            }
            match plan_trigger(anchor, trigger, now, horizon) {
                TriggerPlan::CatchUp => {
                    self.cancel(&key);
                    if let MarkOutcome::Marked { call_counter } =
                        self.tasks.mark_completed(&task.name, &trigger.id).await?
                    {
                        counter = call_counter;
                    }
                    debug!("scheduler: {key} is past due, marked without firing");
                    report.caught_up += 1;
                }
                TriggerPlan::Schedule(delay) => {
                    self.schedule(key, delay, task.action.clone(), true);
                    report.scheduled += 1;
                }
                TriggerPlan::Defer => {
                    if self.cancel(&key) {
                        report.cancelled += 1;
                    }
                    report.deferred += 1;
                }
            }
        }

        if counter as usize >= task.triggers.len() {
            self.purge(&task).await?;
            report.purged += 1;
        }
        Ok(())
    }

    /// Delete an exhausted task. Client-anchored tasks are remembered on the
    /// client so the entity sweep never recreates them.
    async fn purge(&self, task: &ScheduledTask) -> Result<(), BotError> {
        for trigger in &task.triggers {
            self.cancel(&task.firing_key(trigger));
        }
        if let EntityRef::Client(identity) = &task.entity {
            self.clients
                .add_completed_task(self.channel, identity, &task.name)
                .await?;
        }
        self.tasks.delete(&task.name).await?;
        debug!("scheduler: purged {}", task.name);
        Ok(())
    }
}

/// Fire one trigger: guard, run, log. Never propagates.
async fn fire(
    tasks: &Arc<dyn TaskStore>,
    actions: &Arc<ActionRegistry>,
    key: &FiringKey,
    action: TaskAction,
    durable: bool,
) {
    if durable {
        match tasks.mark_completed(&key.task, &key.trigger).await {
            Ok(MarkOutcome::Marked { call_counter }) => {
                debug!("scheduler: {key} marked ({call_counter})");
            }
            Ok(MarkOutcome::AlreadyCompleted) => {
                info!("scheduler: {key} already completed, skipping");
                return;
            }
            Err(e) => {
                error!("scheduler: {key} could not be marked, skipping: {e}");
                return;
            }
        }
    }

    let actions = actions.clone();
    let kind = action.kind();
    match tokio::spawn(async move { actions.run(&action).await }).await {
        Ok(Ok(())) => info!("scheduler: fired {key} ({kind})"),
        Ok(Err(e)) => warn!("scheduler: {key} ({kind}) failed: {e}"),
        Err(e) => error!("scheduler: {key} ({kind}) panicked: {e}"),
    }
}
