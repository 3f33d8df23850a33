//! Invalidation notices shared between the back office and the bots.

use super::Store;
use async_trait::async_trait;
use coursebot_core::{
    domain::{InvalidationPayload, SignalKey},
    error::BotError,
    traits::InvalidationSignal,
};

#[async_trait]
impl InvalidationSignal for Store {
    async fn get(&self, key: SignalKey) -> Result<Option<InvalidationPayload>, BotError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM invalidation_signals WHERE key = ?")
                .bind(key.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BotError::Store(format!("get signal failed: {e}")))?;
        row.map(|(p,)| serde_json::from_str(&p).map_err(BotError::from))
            .transpose()
    }

    /// Merges into a pending notice instead of replacing it, so a second
    /// write before the first is consumed loses nothing.
    async fn set(&self, key: SignalKey, payload: &InvalidationPayload) -> Result<(), BotError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BotError::Store(format!("begin failed: {e}")))?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM invalidation_signals WHERE key = ?")
                .bind(key.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| BotError::Store(format!("get signal failed: {e}")))?;

        let mut merged: InvalidationPayload = match existing {
            Some((p,)) => serde_json::from_str(&p)?,
            None => InvalidationPayload::default(),
        };
        for k in &payload.deleted_firing_keys {
            if !merged.deleted_firing_keys.contains(k) {
                merged.deleted_firing_keys.push(k.clone());
            }
        }
        for id in &payload.entity_ids {
            if !merged.entity_ids.contains(id) {
                merged.entity_ids.push(*id);
            }
        }

        sqlx::query(
            "INSERT INTO invalidation_signals (key, payload) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, \
             written_at = datetime('now')",
        )
        .bind(key.to_string())
        .bind(serde_json::to_string(&merged)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| BotError::Store(format!("set signal failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| BotError::Store(format!("commit failed: {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: SignalKey) -> Result<(), BotError> {
        sqlx::query("DELETE FROM invalidation_signals WHERE key = ?")
            .bind(key.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| BotError::Store(format!("delete signal failed: {e}")))?;
        Ok(())
    }

    async fn take(&self, key: SignalKey) -> Result<Option<InvalidationPayload>, BotError> {
        let row: Option<(String,)> =
            sqlx::query_as("DELETE FROM invalidation_signals WHERE key = ? RETURNING payload")
                .bind(key.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BotError::Store(format!("take signal failed: {e}")))?;
        row.map(|(p,)| serde_json::from_str(&p).map_err(BotError::from))
            .transpose()
    }
}
