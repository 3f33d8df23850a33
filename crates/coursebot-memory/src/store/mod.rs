//! SQLite-backed durable store.
//!
//! Split into focused submodules:
//! - `tasks`: scheduled task definitions and the completion guard
//! - `clients`: per-identity records and conversation state
//! - `courses`: courses, enrollments, broadcasts, and anchor times
//! - `signals`: invalidation notices

mod clients;
mod courses;
mod signals;
mod tasks;

use chrono::{DateTime, NaiveDateTime, Utc};
use coursebot_core::{config::shellexpand, config::StoreConfig, error::BotError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

/// Timestamp layout used in every TEXT time column. Sorts lexically.
const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Durable store backed by SQLite.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new store, running migrations on first use.
    pub async fn new(config: &StoreConfig) -> Result<Self, BotError> {
        let db_path = shellexpand(&config.db_path);

        if let Some(parent) = std::path::Path::new(&db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BotError::Store(format!("failed to create data dir: {e}")))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))
            .map_err(|e| BotError::Store(format!("invalid db path: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| BotError::Store(format!("failed to connect to sqlite: {e}")))?;

        Self::run_migrations(&pool).await?;

        info!("Store initialized at {db_path}");

        Ok(Self { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run SQL migrations, tracking which have already been applied.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), BotError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| BotError::Store(format!("failed to create migrations table: {e}")))?;

        let migrations: &[(&str, &str)] = &[
            ("001_init", include_str!("../../migrations/001_init.sql")),
            (
                "002_scheduled_tasks",
                include_str!("../../migrations/002_scheduled_tasks.sql"),
            ),
            (
                "003_invalidation_signals",
                include_str!("../../migrations/003_invalidation_signals.sql"),
            ),
        ];

        for (name, sql) in migrations {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM _migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| {
                        BotError::Store(format!("failed to check migration {name}: {e}"))
                    })?;

            if applied.is_some() {
                continue;
            }

            sqlx::raw_sql(sql)
                .execute(pool)
                .await
                .map_err(|e| BotError::Store(format!("migration {name} failed: {e}")))?;

            sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
                .bind(name)
                .execute(pool)
                .await
                .map_err(|e| BotError::Store(format!("failed to record migration {name}: {e}")))?;
        }
        Ok(())
    }
}

pub(crate) fn to_db_time(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

/// Parse a stored timestamp. Accepts the native layout and RFC 3339, since the
/// back office may write either.
pub(crate) fn from_db_time(s: &str) -> Result<DateTime<Utc>, BotError> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, DB_TIME_FORMAT) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BotError::Store(format!("invalid timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests;
