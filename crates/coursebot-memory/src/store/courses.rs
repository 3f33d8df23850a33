//! Courses, enrollments, broadcasts, and anchor-time lookups.

use super::{from_db_time, to_db_time, Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coursebot_core::{
    domain::{Broadcast, Course},
    error::BotError,
    message::ChannelKind,
    schedule::EntityRef,
    traits::{AnchorSource, CourseCatalog},
};
use tracing::warn;

type CourseRow = (
    i64,
    String,
    String,
    Option<i64>,
    Option<String>,
    String,
    i64,
);

const COURSE_COLUMNS: &str =
    "c.id, c.name, c.scheduled_at, c.duration_days, c.description, c.reminder_hours, c.published";

fn course_from_row(row: CourseRow) -> Result<Course, BotError> {
    let (id, name, scheduled_at, duration_days, description, reminder_hours, published) = row;
    let reminder_hours: Vec<u32> = serde_json::from_str(&reminder_hours).unwrap_or_else(|e| {
        warn!("course {id}: bad reminder_hours '{reminder_hours}': {e}");
        Vec::new()
    });
    Ok(Course {
        id,
        name,
        scheduled_at: from_db_time(&scheduled_at)?,
        duration_days: duration_days.and_then(|d| u32::try_from(d).ok()),
        description,
        reminder_hours,
        published: published != 0,
    })
}

impl Store {
    async fn courses_where(
        &self,
        clause: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Course>, BotError> {
        let rows: Vec<CourseRow> =
            sqlx::query_as(&format!("SELECT {COURSE_COLUMNS} FROM courses c WHERE {clause}"))
                .bind(to_db_time(now))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| BotError::Store(format!("list courses failed: {e}")))?;
        rows.into_iter().map(course_from_row).collect()
    }

    /// Insert a course and return its id. The back office normally owns this
    /// table; the method serves tooling and tests.
    pub async fn add_course(&self, course: &Course) -> Result<i64, BotError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO courses \
             (name, scheduled_at, duration_days, description, reminder_hours, published) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&course.name)
        .bind(to_db_time(course.scheduled_at))
        .bind(course.duration_days.map(i64::from))
        .bind(&course.description)
        .bind(serde_json::to_string(&course.reminder_hours)?)
        .bind(course.published)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BotError::Store(format!("add course failed: {e}")))?;
        Ok(id)
    }

    /// Move a course to a new start time.
    pub async fn reschedule_course(
        &self,
        id: i64,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), BotError> {
        sqlx::query("UPDATE courses SET scheduled_at = ? WHERE id = ?")
            .bind(to_db_time(scheduled_at))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| BotError::Store(format!("reschedule course failed: {e}")))?;
        Ok(())
    }

    pub async fn delete_course(&self, id: i64) -> Result<(), BotError> {
        sqlx::query("DELETE FROM enrollments WHERE course_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| BotError::Store(format!("delete enrollments failed: {e}")))?;
        sqlx::query("DELETE FROM courses WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| BotError::Store(format!("delete course failed: {e}")))?;
        Ok(())
    }

    /// Insert a broadcast and return its id.
    pub async fn add_broadcast(&self, broadcast: &Broadcast) -> Result<i64, BotError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO broadcasts (audience, text, scheduled_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(broadcast.audience.to_string())
        .bind(&broadcast.text)
        .bind(to_db_time(broadcast.scheduled_at))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BotError::Store(format!("add broadcast failed: {e}")))?;
        Ok(id)
    }
}

#[async_trait]
impl CourseCatalog for Store {
    async fn course(&self, id: i64) -> Result<Option<Course>, BotError> {
        let row: Option<CourseRow> =
            sqlx::query_as(&format!("SELECT {COURSE_COLUMNS} FROM courses c WHERE c.id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BotError::Store(format!("get course failed: {e}")))?;
        row.map(course_from_row).transpose()
    }

    async fn future_courses(&self, now: DateTime<Utc>) -> Result<Vec<Course>, BotError> {
        self.courses_where(
            "c.published = 1 AND datetime(c.scheduled_at) > datetime(?) \
             ORDER BY datetime(c.scheduled_at) ASC",
            now,
        )
        .await
    }

    async fn past_courses(&self, now: DateTime<Utc>) -> Result<Vec<Course>, BotError> {
        self.courses_where(
            "c.published = 1 AND datetime(c.scheduled_at) <= datetime(?) \
             ORDER BY datetime(c.scheduled_at) DESC",
            now,
        )
        .await
    }

    async fn client_courses(&self, client_id: i64) -> Result<Vec<Course>, BotError> {
        let rows: Vec<CourseRow> = sqlx::query_as(&format!(
            "SELECT {COURSE_COLUMNS} FROM courses c \
             JOIN enrollments e ON e.course_id = c.id \
             WHERE e.client_id = ? AND c.published = 1 \
             ORDER BY datetime(c.scheduled_at) ASC"
        ))
        .bind(client_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BotError::Store(format!("list client courses failed: {e}")))?;
        rows.into_iter().map(course_from_row).collect()
    }

    async fn enroll(&self, client_id: i64, course_id: i64) -> Result<bool, BotError> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO enrollments (client_id, course_id) VALUES (?, ?)")
                .bind(client_id)
                .bind(course_id)
                .execute(&self.pool)
                .await
                .map_err(|e| BotError::Store(format!("enroll failed: {e}")))?;
        Ok(result.rows_affected() == 1)
    }

    async fn unenroll(&self, client_id: i64, course_id: i64) -> Result<bool, BotError> {
        let result = sqlx::query("DELETE FROM enrollments WHERE client_id = ? AND course_id = ?")
            .bind(client_id)
            .bind(course_id)
            .execute(&self.pool)
            .await
            .map_err(|e| BotError::Store(format!("unenroll failed: {e}")))?;
        Ok(result.rows_affected() == 1)
    }

    async fn upcoming_enrollments(
        &self,
        channel: ChannelKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, Course)>, BotError> {
        let rows: Vec<(String, i64, String, String, Option<i64>, Option<String>, String, i64)> =
            sqlx::query_as(&format!(
                "SELECT cl.identity, {COURSE_COLUMNS} FROM enrollments e \
                 JOIN clients cl ON cl.id = e.client_id \
                 JOIN courses c ON c.id = e.course_id \
                 WHERE cl.channel = ? AND c.published = 1 \
                 AND datetime(c.scheduled_at) > datetime(?) \
                 ORDER BY datetime(c.scheduled_at) ASC, cl.identity"
            ))
            .bind(channel.as_str())
            .bind(to_db_time(now))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BotError::Store(format!("list enrollments failed: {e}")))?;

        rows.into_iter()
            .map(|(identity, id, name, at, days, desc, hours, published)| {
                course_from_row((id, name, at, days, desc, hours, published))
                    .map(|course| (identity, course))
            })
            .collect()
    }

    async fn broadcasts(&self) -> Result<Vec<Broadcast>, BotError> {
        let rows: Vec<(i64, String, String, String)> = sqlx::query_as(
            "SELECT id, audience, text, scheduled_at FROM broadcasts ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BotError::Store(format!("list broadcasts failed: {e}")))?;

        let mut out = Vec::with_capacity(rows.len());
        for (id, audience, text, scheduled_at) in rows {
            let audience = match audience.parse() {
                Ok(a) => a,
                Err(e) => {
                    warn!("broadcast {id} skipped: {e}");
                    continue;
                }
            };
            out.push(Broadcast {
                id,
                audience,
                text,
                scheduled_at: from_db_time(&scheduled_at)?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl AnchorSource for Store {
    async fn anchor_time(
        &self,
        channel: ChannelKind,
        entity: &EntityRef,
    ) -> Result<Option<DateTime<Utc>>, BotError> {
        let raw: Option<(String,)> = match entity {
            EntityRef::Course(id) => sqlx::query_as("SELECT scheduled_at FROM courses WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BotError::Store(format!("course anchor failed: {e}")))?,
            EntityRef::Client(identity) => sqlx::query_as(
                "SELECT registered_at FROM clients WHERE channel = ? AND identity = ?",
            )
            .bind(channel.as_str())
            .bind(identity)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BotError::Store(format!("client anchor failed: {e}")))?,
        };
        raw.map(|(t,)| from_db_time(&t)).transpose()
    }
}
