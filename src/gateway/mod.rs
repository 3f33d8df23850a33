//! Gateway: one long-poll session per channel, each with its own reminder
//! scheduler and conversation dispatcher.

mod actions;
mod dispatcher;
mod invalidation;
mod routing;
mod scheduler;
mod session;
mod sweep;


pub use invalidation::notify;
pub use session::{ChannelSession, SessionState};

use actions::ActionRegistry;
use coursebot_core::{
    config::Config,
    traits::{AnchorSource, ChannelBackend, ClientDirectory, CourseCatalog, InvalidationSignal, TaskStore},
};
use coursebot_memory::Store;
use dispatcher::ConversationDispatcher;
use scheduler::Scheduler;
use std::sync::Arc;
use sweep::EntitySweep;
use tokio::sync::watch;
use tracing::{error, info};

/// The durable collaborators of a session, behind their traits.
#[derive(Clone)]
pub struct Stores {
    pub tasks: Arc<dyn TaskStore>,
    pub clients: Arc<dyn ClientDirectory>,
    pub catalog: Arc<dyn CourseCatalog>,
    pub anchors: Arc<dyn AnchorSource>,
    pub signals: Arc<dyn InvalidationSignal>,
}

impl Stores {
    /// Every role served by the one SQLite store.
    pub fn sqlite(store: Store) -> Self {
        let store = Arc::new(store);
        Self {
            tasks: store.clone(),
            clients: store.clone(),
            catalog: store.clone(),
            anchors: store.clone(),
            signals: store,
        }
    }
}

/// Wire scheduler, dispatcher and sweep for one backend.
pub fn build_session(
    backend: Arc<dyn ChannelBackend>,
    stores: &Stores,
    config: &Config,
) -> ChannelSession {
    let channel = backend.kind();
    let actions = Arc::new(ActionRegistry::new(
        backend.clone(),
        stores.catalog.clone(),
        config.scheduler.clock_offset(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        channel,
        stores.tasks.clone(),
        stores.clients.clone(),
        stores.anchors.clone(),
        stores.catalog.clone(),
        actions,
        config.scheduler.clone(),
    ));
    let dispatcher = Arc::new(ConversationDispatcher::new(
        backend.clone(),
        stores.clients.clone(),
        stores.catalog.clone(),
        scheduler.clone(),
        config,
    ));
    let sweep = EntitySweep::new(
        channel,
        stores.tasks.clone(),
        stores.clients.clone(),
        stores.catalog.clone(),
        config.scheduler.fresh_register_days,
    );
    ChannelSession::new(
        backend,
        scheduler,
        dispatcher,
        sweep,
        stores.signals.clone(),
        config.scheduler.clone(),
        &config.session,
    )
}

/// Runs every configured channel session until ctrl-c.
pub struct Gateway {
    sessions: Vec<ChannelSession>,
}

impl Gateway {
    pub fn new(backends: Vec<Arc<dyn ChannelBackend>>, stores: &Stores, config: &Config) -> Self {
        let sessions = backends
            .into_iter()
            .map(|backend| build_session(backend, stores, config))
            .collect();
        Self { sessions }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        if self.sessions.is_empty() {
            anyhow::bail!("no channel enabled; configure [channel.telegram] or [channel.vk]");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
        for session in self.sessions {
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(session.run(rx)));
        }
        info!("coursebot gateway running | {} channel(s)", handles.len());

        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);

        for handle in handles {
            if let Err(e) = handle.await {
                error!("session task failed: {e}");
            }
        }
        info!("coursebot gateway stopped");
        Ok(())
    }
}
