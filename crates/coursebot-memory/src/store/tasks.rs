//! Scheduled task definitions and the durable completion guard.

use super::Store;
use async_trait::async_trait;
use coursebot_core::{
    error::BotError,
    message::ChannelKind,
    schedule::{EntityRef, MarkOutcome, ScheduledTask, TaskAction, Trigger},
    traits::TaskStore,
};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

type TaskRow = (String, String, String, String, String, String, i64);

const TASK_COLUMNS: &str =
    "name, channel, entity_type, entity_id, triggers, action, call_counter";

fn entity_columns(entity: &EntityRef) -> (&'static str, String) {
    match entity {
        EntityRef::Course(id) => ("course", id.to_string()),
        EntityRef::Client(identity) => ("client", identity.clone()),
    }
}

fn parse_entity(kind: &str, id: &str) -> Result<EntityRef, BotError> {
    match kind {
        "course" => id
            .parse()
            .map(EntityRef::Course)
            .map_err(|e| BotError::Store(format!("invalid course id '{id}': {e}"))),
        "client" => Ok(EntityRef::Client(id.to_string())),
        other => Err(BotError::Store(format!("unknown entity type '{other}'"))),
    }
}

fn task_from_row(row: TaskRow, completed: BTreeSet<String>) -> Result<ScheduledTask, BotError> {
    let (name, channel, entity_type, entity_id, triggers, action, call_counter) = row;
    let channel: ChannelKind = channel.parse().map_err(BotError::Store)?;
    let triggers: Vec<Trigger> = serde_json::from_str(&triggers)?;
    let action: TaskAction = serde_json::from_str(&action)?;
    Ok(ScheduledTask {
        name,
        channel,
        entity: parse_entity(&entity_type, &entity_id)?,
        triggers,
        completed,
        call_counter: call_counter.max(0) as u32,
        action,
    })
}

impl Store {
    async fn completions_for(&self, name: &str) -> Result<BTreeSet<String>, BotError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT trigger_id FROM task_completions WHERE task_name = ?")
                .bind(name)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| BotError::Store(format!("load completions failed: {e}")))?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    async fn task_by_name(&self, name: &str) -> Result<Option<ScheduledTask>, BotError> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BotError::Store(format!("get task failed: {e}")))?;

        match row {
            Some(row) => {
                let completed = self.completions_for(name).await?;
                task_from_row(row, completed).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn tasks_from_rows(&self, rows: Vec<TaskRow>) -> Result<Vec<ScheduledTask>, BotError> {
        let pairs: Vec<(String, String)> =
            sqlx::query_as("SELECT task_name, trigger_id FROM task_completions")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| BotError::Store(format!("load completions failed: {e}")))?;

        let mut completions: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (task, trigger) in pairs {
            completions.entry(task).or_default().insert(trigger);
        }

        rows.into_iter()
            .map(|row| {
                let completed = completions.remove(&row.0).unwrap_or_default();
                task_from_row(row, completed)
            })
            .collect()
    }
}

#[async_trait]
impl TaskStore for Store {
    async fn get_all(&self) -> Result<Vec<ScheduledTask>, BotError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY created_at, name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BotError::Store(format!("get tasks failed: {e}")))?;
        self.tasks_from_rows(rows).await
    }

    async fn get_by_entities(
        &self,
        entities: &[EntityRef],
    ) -> Result<Vec<ScheduledTask>, BotError> {
        let mut rows = Vec::new();
        for entity in entities {
            let (kind, id) = entity_columns(entity);
            let mut found: Vec<TaskRow> = sqlx::query_as(&format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks \
                 WHERE entity_type = ? AND entity_id = ? ORDER BY name"
            ))
            .bind(kind)
            .bind(&id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BotError::Store(format!("get tasks by entity failed: {e}")))?;
            rows.append(&mut found);
        }
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        self.tasks_from_rows(rows).await
    }

    async fn get_or_create(
        &self,
        defaults: ScheduledTask,
    ) -> Result<(ScheduledTask, bool), BotError> {
        let (kind, id) = entity_columns(&defaults.entity);
        let result = sqlx::query(
            "INSERT OR IGNORE INTO scheduled_tasks \
             (name, channel, entity_type, entity_id, triggers, action, call_counter) \
             VALUES (?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&defaults.name)
        .bind(defaults.channel.as_str())
        .bind(kind)
        .bind(&id)
        .bind(serde_json::to_string(&defaults.triggers)?)
        .bind(serde_json::to_string(&defaults.action)?)
        .execute(&self.pool)
        .await
        .map_err(|e| BotError::Store(format!("create task failed: {e}")))?;

        let created = result.rows_affected() == 1;
        if created {
            debug!("task {} created", defaults.name);
        }
        let stored = self
            .task_by_name(&defaults.name)
            .await?
            .ok_or_else(|| BotError::Store(format!("task {} vanished", defaults.name)))?;
        Ok((stored, created))
    }

    /// Upsert the definition. Completion marks for triggers that no longer
    /// exist are dropped and `call_counter` is recounted from the marks.
    async fn save(&self, task: &ScheduledTask) -> Result<(), BotError> {
        let (kind, id) = entity_columns(&task.entity);
        let triggers = serde_json::to_string(&task.triggers)?;
        let action = serde_json::to_string(&task.action)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BotError::Store(format!("begin failed: {e}")))?;

        sqlx::query(
            "INSERT INTO scheduled_tasks \
             (name, channel, entity_type, entity_id, triggers, action, call_counter) \
             VALUES (?, ?, ?, ?, ?, ?, 0) \
             ON CONFLICT(name) DO UPDATE SET channel = excluded.channel, \
             entity_type = excluded.entity_type, entity_id = excluded.entity_id, \
             triggers = excluded.triggers, action = excluded.action",
        )
        .bind(&task.name)
        .bind(task.channel.as_str())
        .bind(kind)
        .bind(&id)
        .bind(&triggers)
        .bind(&action)
        .execute(&mut *tx)
        .await
        .map_err(|e| BotError::Store(format!("save task failed: {e}")))?;

        sqlx::query(
            "DELETE FROM task_completions WHERE task_name = ? \
             AND trigger_id NOT IN (SELECT json_extract(value, '$.id') FROM json_each(?))",
        )
        .bind(&task.name)
        .bind(&triggers)
        .execute(&mut *tx)
        .await
        .map_err(|e| BotError::Store(format!("prune completions failed: {e}")))?;

        sqlx::query(
            "UPDATE scheduled_tasks SET call_counter = \
             (SELECT COUNT(*) FROM task_completions WHERE task_name = ?) WHERE name = ?",
        )
        .bind(&task.name)
        .bind(&task.name)
        .execute(&mut *tx)
        .await
        .map_err(|e| BotError::Store(format!("recount task failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| BotError::Store(format!("commit failed: {e}")))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BotError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BotError::Store(format!("begin failed: {e}")))?;
        sqlx::query("DELETE FROM task_completions WHERE task_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| BotError::Store(format!("delete completions failed: {e}")))?;
        sqlx::query("DELETE FROM scheduled_tasks WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| BotError::Store(format!("delete task failed: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| BotError::Store(format!("commit failed: {e}")))?;
        Ok(())
    }

    /// Check-and-increment in one transaction. A task that was deleted, or a
    /// trigger it does not define, counts as already completed so the action
    /// is skipped.
    async fn mark_completed(
        &self,
        name: &str,
        trigger_id: &str,
    ) -> Result<MarkOutcome, BotError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BotError::Store(format!("begin failed: {e}")))?;

        let defines: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM scheduled_tasks, json_each(scheduled_tasks.triggers) \
             WHERE scheduled_tasks.name = ? AND json_extract(json_each.value, '$.id') = ?",
        )
        .bind(name)
        .bind(trigger_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| BotError::Store(format!("check trigger failed: {e}")))?;

        if defines.is_none() {
            return Ok(MarkOutcome::AlreadyCompleted);
        }

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO task_completions (task_name, trigger_id) VALUES (?, ?)",
        )
        .bind(name)
        .bind(trigger_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| BotError::Store(format!("mark completion failed: {e}")))?;

        if inserted.rows_affected() == 0 {
            return Ok(MarkOutcome::AlreadyCompleted);
        }

        let (call_counter,): (i64,) = sqlx::query_as(
            "UPDATE scheduled_tasks SET call_counter = call_counter + 1 \
             WHERE name = ? RETURNING call_counter",
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BotError::Store(format!("increment counter failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| BotError::Store(format!("commit failed: {e}")))?;

        Ok(MarkOutcome::Marked {
            call_counter: call_counter.max(0) as u32,
        })
    }
}
