//! Consuming and writing cross-process "recompute now" notices.

use super::scheduler::Scheduler;
use chrono::{DateTime, Utc};
use coursebot_core::{
    domain::{InvalidationPayload, SignalKey, SignalPurpose},
    error::BotError,
    message::ChannelKind,
    schedule::FiringKey,
    traits::InvalidationSignal,
};
use tracing::{info, warn};

/// Take this channel's pending notice, if any, and apply it. Only the listed
/// keys and courses are touched.
pub async fn consume(
    signals: &dyn InvalidationSignal,
    scheduler: &Scheduler,
    now: DateTime<Utc>,
) -> Result<bool, BotError> {
    let key = SignalKey::new(scheduler.channel(), SignalPurpose::UpdateTasks);
    let Some(payload) = signals.take(key).await? else {
        return Ok(false);
    };
    apply(scheduler, payload, now).await?;
    Ok(true)
}

pub async fn apply(
    scheduler: &Scheduler,
    payload: InvalidationPayload,
    now: DateTime<Utc>,
) -> Result<(), BotError> {
    info!(
        "{} signal: {} deleted key(s), courses {:?}",
        scheduler.channel(),
        payload.deleted_firing_keys.len(),
        payload.entity_ids
    );
    for raw in &payload.deleted_firing_keys {
        match FiringKey::parse(raw) {
            Some(key) => {
                scheduler.cancel(&key);
            }
            None => warn!("signal: malformed firing key '{raw}'"),
        }
    }
    if !payload.entity_ids.is_empty() {
        scheduler
            .recompute_entities(&payload.entity_ids, now)
            .await?;
    }
    Ok(())
}

/// Write a notice for `channel`. Merges with one that is still pending.
pub async fn notify(
    signals: &dyn InvalidationSignal,
    channel: ChannelKind,
    payload: &InvalidationPayload,
) -> Result<(), BotError> {
    signals
        .set(SignalKey::new(channel, SignalPurpose::UpdateTasks), payload)
        .await
}
