//! Per-identity client records.

use super::{from_db_time, to_db_time, Store};
use async_trait::async_trait;
use chrono::Utc;
use coursebot_core::{
    domain::{Client, ClientDefaults},
    error::BotError,
    message::ChannelKind,
    state::ConversationState,
    traits::ClientDirectory,
};
use std::collections::BTreeSet;

type ClientRow = (
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<i64>,
    String,
);

const CLIENT_COLUMNS: &str = "id, channel, identity, first_name, last_name, username, phone, \
                              state, pending_course, registered_at";

impl Store {
    async fn client_from_row(&self, row: ClientRow) -> Result<Client, BotError> {
        let (
            id,
            channel,
            identity,
            first_name,
            last_name,
            username,
            phone,
            state,
            pending_course,
            registered_at,
        ) = row;

        let completed: Vec<(String,)> =
            sqlx::query_as("SELECT task_name FROM client_completed_tasks WHERE client_id = ?")
                .bind(id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| BotError::Store(format!("load completed tasks failed: {e}")))?;

        // An unknown state (e.g. written by an older release) restarts the dialog.
        let state = state.parse().unwrap_or_else(|e| {
            tracing::warn!("client {identity}: {e}, resetting to START");
            ConversationState::Start
        });

        Ok(Client {
            id,
            channel: channel.parse().map_err(BotError::Store)?,
            identity,
            first_name,
            last_name,
            username,
            phone,
            state,
            registered_at: from_db_time(&registered_at)?,
            completed_tasks: completed.into_iter().map(|(n,)| n).collect::<BTreeSet<_>>(),
            pending_course,
        })
    }

    /// Look up a client without creating one.
    pub async fn find_client(
        &self,
        channel: ChannelKind,
        identity: &str,
    ) -> Result<Option<Client>, BotError> {
        let row: Option<ClientRow> = sqlx::query_as(&format!(
            "SELECT {CLIENT_COLUMNS} FROM clients WHERE channel = ? AND identity = ?"
        ))
        .bind(channel.as_str())
        .bind(identity)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BotError::Store(format!("get client failed: {e}")))?;

        match row {
            Some(row) => self.client_from_row(row).await.map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ClientDirectory for Store {
    async fn get_or_create(
        &self,
        channel: ChannelKind,
        identity: &str,
        defaults: ClientDefaults,
    ) -> Result<(Client, bool), BotError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO clients \
             (channel, identity, first_name, last_name, username, state, registered_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(channel.as_str())
        .bind(identity)
        .bind(&defaults.first_name)
        .bind(&defaults.last_name)
        .bind(&defaults.username)
        .bind(ConversationState::Start.as_str())
        .bind(to_db_time(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| BotError::Store(format!("create client failed: {e}")))?;

        let client = self
            .find_client(channel, identity)
            .await?
            .ok_or_else(|| BotError::Store(format!("client {channel}/{identity} vanished")))?;
        Ok((client, result.rows_affected() == 1))
    }

    /// Persist profile, phone, state, and pending course. `completed_tasks`
    /// is append-only and goes through `add_completed_task`.
    async fn save(&self, client: &Client) -> Result<(), BotError> {
        sqlx::query(
            "UPDATE clients SET first_name = ?, last_name = ?, username = ?, phone = ?, \
             state = ?, pending_course = ? WHERE id = ?",
        )
        .bind(&client.first_name)
        .bind(&client.last_name)
        .bind(&client.username)
        .bind(&client.phone)
        .bind(client.state.as_str())
        .bind(client.pending_course)
        .bind(client.id)
        .execute(&self.pool)
        .await
        .map_err(|e| BotError::Store(format!("save client failed: {e}")))?;
        Ok(())
    }

    async fn clients(&self, channel: ChannelKind) -> Result<Vec<Client>, BotError> {
        let rows: Vec<ClientRow> = sqlx::query_as(&format!(
            "SELECT {CLIENT_COLUMNS} FROM clients WHERE channel = ? ORDER BY id"
        ))
        .bind(channel.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BotError::Store(format!("list clients failed: {e}")))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.client_from_row(row).await?);
        }
        Ok(out)
    }

    async fn add_completed_task(
        &self,
        channel: ChannelKind,
        identity: &str,
        task_name: &str,
    ) -> Result<(), BotError> {
        sqlx::query(
            "INSERT OR IGNORE INTO client_completed_tasks (client_id, task_name) \
             SELECT id, ? FROM clients WHERE channel = ? AND identity = ?",
        )
        .bind(task_name)
        .bind(channel.as_str())
        .bind(identity)
        .execute(&self.pool)
        .await
        .map_err(|e| BotError::Store(format!("add completed task failed: {e}")))?;
        Ok(())
    }
}
