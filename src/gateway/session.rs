//! Long-poll session driver for one channel backend.
//!
//! `INITIALIZING -> POLLING <-> RECOVERING`, never terminal. Every successful
//! or recovered round ends with a heartbeat that consumes invalidation notices
//! and runs the periodic sweeps when their hour has come.

use super::dispatcher::ConversationDispatcher;
use super::invalidation;
use super::scheduler::Scheduler;
use super::sweep::EntitySweep;
use chrono::{DateTime, Utc};
use coursebot_core::{
    config::{SchedulerConfig, SessionConfig},
    error::{DesyncScope, PollError},
    message::ChannelKind,
    traits::{ChannelBackend, InvalidationSignal, PollResponse, SessionParams},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Acquire the session, then reconcile and sweep once.
    Initializing,
    Polling,
    /// Reacquire the full session handle after a failure.
    Recovering,
}

pub struct ChannelSession {
    channel: ChannelKind,
    backend: Arc<dyn ChannelBackend>,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<ConversationDispatcher>,
    sweep: EntitySweep,
    signals: Arc<dyn InvalidationSignal>,
    scheduler_config: SchedulerConfig,
    backoff: Duration,
    state: SessionState,
    params: SessionParams,
    /// Whether the next connection reset is the first since the session
    /// (re)started; that one is retried without waiting.
    first_connect: bool,
    next_reconcile: Option<DateTime<Utc>>,
    next_entity_sweep: Option<DateTime<Utc>>,
    handlers: JoinSet<()>,
}

impl ChannelSession {
    pub fn new(
        backend: Arc<dyn ChannelBackend>,
        scheduler: Arc<Scheduler>,
        dispatcher: Arc<ConversationDispatcher>,
        sweep: EntitySweep,
        signals: Arc<dyn InvalidationSignal>,
        scheduler_config: SchedulerConfig,
        session_config: &SessionConfig,
    ) -> Self {
        Self {
            channel: backend.kind(),
            backend,
            scheduler,
            dispatcher,
            sweep,
            signals,
            scheduler_config,
            backoff: Duration::from_secs(session_config.reconnect_backoff_secs),
            state: SessionState::Initializing,
            params: SessionParams::default(),
            first_connect: true,
            next_reconcile: None,
            next_entity_sweep: None,
            handlers: JoinSet::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Poll until `shutdown` flips, then drain handlers and drop all timers.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("{} session: started", self.channel);
        loop {
            tokio::select! {
                _ = self.step() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            "{} session: stopping, draining {} handler(s)",
            self.channel,
            self.handlers.len()
        );
        self.drain_handlers().await;
        self.scheduler.shutdown();
    }

    /// One unit of work in the current state.
    pub async fn step(&mut self) {
        self.reap_handlers();
        match self.state {
            SessionState::Initializing => self.initialize().await,
            SessionState::Recovering => self.recover().await,
            SessionState::Polling => self.poll_round().await,
        }
    }

    async fn initialize(&mut self) {
        match self.backend.acquire_session().await {
            Ok(params) => {
                self.params = params;
                self.first_connect = true;
                info!("{} session: acquired", self.channel);
                let now = Utc::now();
                self.run_reconcile(now).await;
                self.run_entity_sweep(now).await;
                self.state = SessionState::Polling;
            }
            Err(e) => {
                warn!(
                    "{} session: acquisition failed, retrying in {}s: {e}",
                    self.channel,
                    self.backoff.as_secs()
                );
                tokio::time::sleep(self.backoff).await;
            }
        }
    }

    async fn recover(&mut self) {
        match self.backend.acquire_session().await {
            Ok(params) => {
                self.params = params;
                self.state = SessionState::Polling;
                info!("{} session: reacquired", self.channel);
            }
            Err(e) => {
                warn!(
                    "{} session: reacquisition failed, retrying in {}s: {e}",
                    self.channel,
                    self.backoff.as_secs()
                );
                tokio::time::sleep(self.backoff).await;
            }
        }
    }

    async fn poll_round(&mut self) {
        match self.backend.poll(&self.params).await {
            Ok(PollResponse::Updates { cursor, events }) => {
                if cursor.is_some() {
                    self.params.cursor = cursor;
                }
                if !events.is_empty() {
                    debug!("{} session: {} event(s)", self.channel, events.len());
                }
                for event in events {
                    let dispatcher = self.dispatcher.clone();
                    self.handlers.spawn(async move { dispatcher.handle(event).await });
                }
            }
            Ok(PollResponse::Desync {
                scope,
                cursor,
                code,
            }) => {
                info!("{} session: desync {scope:?} (code {code})", self.channel);
                self.refresh(scope, cursor).await;
            }
            Err(e) => self.on_poll_error(e).await,
        }

        if self.state == SessionState::Polling {
            self.update_tasks(Utc::now()).await;
        }
    }

    async fn on_poll_error(&mut self, error: PollError) {
        match error {
            PollError::ConnectionReset(reason) => {
                let delay = if self.first_connect {
                    Duration::ZERO
                } else {
                    self.backoff
                };
                self.first_connect = false;
                warn!(
                    "{} session: connection reset, retrying in {}s: {reason}",
                    self.channel,
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            }
            PollError::ReadTimeout => {
                debug!("{} session: read timeout, polling again", self.channel);
            }
            PollError::ClientResponse { status } => {
                warn!("{} session: HTTP {status}, reacquiring session", self.channel);
                self.state = SessionState::Recovering;
            }
            PollError::Desync { scope, reason } => {
                info!("{} session: desync {scope:?}: {reason}", self.channel);
                self.refresh(scope, None).await;
            }
            PollError::Unexpected(reason) => {
                error!("{} session: {reason}; resetting session", self.channel);
                self.params = SessionParams::default();
                self.first_connect = true;
                self.state = SessionState::Recovering;
            }
        }
    }

    /// Refresh exactly the stale part of the session. A position handed out
    /// with the desync is used as is.
    async fn refresh(&mut self, scope: DesyncScope, position: Option<String>) {
        if scope == DesyncScope::Position {
            if let Some(cursor) = position {
                self.params.cursor = Some(cursor);
                return;
            }
        }

        let fresh = match self.backend.acquire_session().await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("{} session: refresh failed, reacquiring: {e}", self.channel);
                self.state = SessionState::Recovering;
                return;
            }
        };
        // Telegram never rotates its key, so a refresh after a 409 leaves it unchanged.
        let stale_key = scope != DesyncScope::Position && fresh.key == self.params.key;
        match scope {
            DesyncScope::Position => self.params.cursor = fresh.cursor,
            DesyncScope::Key => self.params.key = fresh.key,
            DesyncScope::KeyAndPosition => {
                self.params.key = fresh.key;
                self.params.cursor = fresh.cursor;
            }
        }
        if stale_key {
            warn!(
                "{} session: key unchanged after refresh, retrying in {}s",
                self.channel,
                self.backoff.as_secs()
            );
            tokio::time::sleep(self.backoff).await;
        }
    }

    /// Heartbeat: apply a pending invalidation notice, then run each sweep
    /// whose hour has come.
    pub async fn update_tasks(&mut self, now: DateTime<Utc>) {
        if let Err(e) =
            invalidation::consume(self.signals.as_ref(), &self.scheduler, now).await
        {
            warn!("{} heartbeat: invalidation failed: {e}", self.channel);
        }
        if self.next_reconcile.is_none_or(|at| now >= at) {
            self.run_reconcile(now).await;
        }
        if self.next_entity_sweep.is_none_or(|at| now >= at) {
            self.run_entity_sweep(now).await;
        }
    }

    async fn run_reconcile(&mut self, now: DateTime<Utc>) {
        if let Err(e) = self.scheduler.reconcile_from_store(now).await {
            error!("{} reconcile failed: {e}", self.channel);
        }
        let delay = self
            .scheduler
            .delay_until(&self.scheduler_config.reconcile_hours, now);
        self.next_reconcile = Some(after(now, delay));
    }

    async fn run_entity_sweep(&mut self, now: DateTime<Utc>) {
        match self.sweep.run(now).await {
            // New rows are armed right away rather than at the next reconcile.
            Ok(report) if report.created() > 0 => {
                if let Err(e) = self.scheduler.reconcile_from_store(now).await {
                    error!("{} reconcile after sweep failed: {e}", self.channel);
                }
            }
            Ok(_) => {}
            Err(e) => error!("{} entity sweep failed: {e}", self.channel),
        }
        let delay = self
            .scheduler
            .delay_until(&self.scheduler_config.entity_sweep_hours, now);
        self.next_entity_sweep = Some(after(now, delay));
    }

    fn reap_handlers(&mut self) {
        while let Some(result) = self.handlers.try_join_next() {
            if let Err(e) = result {
                error!("{} handler panicked: {e}", self.channel);
            }
        }
    }

    async fn drain_handlers(&mut self) {
        while let Some(result) = self.handlers.join_next().await {
            if let Err(e) = result {
                error!("{} handler panicked: {e}", self.channel);
            }
        }
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::seconds(delay.as_secs() as i64)
}
