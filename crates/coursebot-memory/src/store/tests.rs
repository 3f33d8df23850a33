use super::Store;
use chrono::{Duration, TimeZone, Utc};
use coursebot_core::domain::{
    Audience, Broadcast, Client, ClientDefaults, Course, InvalidationPayload, SignalKey, SignalPurpose,
};
use coursebot_core::message::ChannelKind;
use coursebot_core::schedule::{EntityRef, MarkOutcome, ScheduledTask, TaskAction, Trigger};
use coursebot_core::state::ConversationState;
use coursebot_core::traits::{
    AnchorSource, ClientDirectory, CourseCatalog, InvalidationSignal, TaskStore,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Create an in-memory store for testing.
async fn test_store() -> Store {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await
        .unwrap();
    Store::run_migrations(&pool).await.unwrap();
    Store { pool }
}

fn reminder_task(name: &str, course_id: i64) -> ScheduledTask {
    ScheduledTask {
        name: name.to_string(),
        channel: ChannelKind::Telegram,
        entity: EntityRef::Course(course_id),
        triggers: vec![Trigger::new("24h", -86_400), Trigger::new("2h", -7_200)],
        completed: BTreeSet::new(),
        call_counter: 0,
        action: TaskAction::CourseReminder {
            identity: "42".into(),
            course_id,
        },
    }
}

fn course(name: &str, scheduled_at: chrono::DateTime<Utc>) -> Course {
    Course {
        id: 0,
        name: name.to_string(),
        scheduled_at,
        duration_days: Some(1),
        description: Some("Lash lift basics".into()),
        reminder_hours: vec![24, 2],
        published: true,
    }
}

async fn create_task(store: &Store, task: ScheduledTask) -> (ScheduledTask, bool) {
    TaskStore::get_or_create(store, task).await.unwrap()
}

async fn create_client(
    store: &Store,
    channel: ChannelKind,
    identity: &str,
    first_name: &str,
) -> (Client, bool) {
    let defaults = ClientDefaults {
        first_name: first_name.to_string(),
        last_name: None,
        username: None,
    };
    ClientDirectory::get_or_create(store, channel, identity, defaults)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let store = test_store().await;
    Store::run_migrations(store.pool()).await.unwrap();
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 3);
}

#[tokio::test]
async fn test_get_or_create_task_only_creates_once() {
    let store = test_store().await;
    let (task, created) = create_task(&store, reminder_task("tg_remind_42_7", 7)).await;
    assert!(created);
    assert_eq!(task.triggers.len(), 2);
    assert_eq!(task.call_counter, 0);

    let mut changed = reminder_task("tg_remind_42_7", 7);
    changed.triggers.pop();
    let (task, created) = create_task(&store, changed).await;
    assert!(!created);
    assert_eq!(task.triggers.len(), 2, "existing definition wins");
    assert_eq!(store.get_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_mark_completed_refuses_second_mark() {
    let store = test_store().await;
    create_task(&store, reminder_task("tg_remind_42_7", 7)).await;

    assert_eq!(
        store.mark_completed("tg_remind_42_7", "24h").await.unwrap(),
        MarkOutcome::Marked { call_counter: 1 }
    );
    assert_eq!(
        store.mark_completed("tg_remind_42_7", "24h").await.unwrap(),
        MarkOutcome::AlreadyCompleted
    );
    assert_eq!(
        store.mark_completed("tg_remind_42_7", "2h").await.unwrap(),
        MarkOutcome::Marked { call_counter: 2 }
    );

    let task = &store.get_all().await.unwrap()[0];
    assert!(task.is_exhausted());
    assert_eq!(task.completed.len(), 2);
}

#[tokio::test]
async fn test_mark_completed_on_missing_task_or_trigger_skips() {
    let store = test_store().await;
    assert_eq!(
        store.mark_completed("nope", "24h").await.unwrap(),
        MarkOutcome::AlreadyCompleted
    );
    create_task(&store, reminder_task("tg_remind_42_7", 7)).await;
    assert_eq!(
        store.mark_completed("tg_remind_42_7", "5h").await.unwrap(),
        MarkOutcome::AlreadyCompleted
    );
}

#[tokio::test]
async fn test_concurrent_marks_yield_one_winner() {
    let store = test_store().await;
    create_task(&store, reminder_task("tg_remind_42_7", 7)).await;
    let (a, b) = tokio::join!(
        store.mark_completed("tg_remind_42_7", "2h"),
        store.mark_completed("tg_remind_42_7", "2h")
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    let marked = outcomes
        .iter()
        .filter(|o| matches!(o, MarkOutcome::Marked { .. }))
        .count();
    assert_eq!(marked, 1);
}

#[tokio::test]
async fn test_save_prunes_completions_of_removed_triggers() {
    let store = test_store().await;
    let (mut task, _) = create_task(&store, reminder_task("tg_remind_42_7", 7)).await;
    store.mark_completed(&task.name, "24h").await.unwrap();

    task.triggers = vec![Trigger::new("2h", -7_200), Trigger::new("1h", -3_600)];
    TaskStore::save(&store, &task).await.unwrap();

    let reloaded = &store.get_all().await.unwrap()[0];
    assert_eq!(reloaded.triggers.len(), 2);
    assert_eq!(reloaded.call_counter, 0);
    assert!(reloaded.completed.is_empty());
}

#[tokio::test]
async fn test_get_by_entities_and_delete() {
    let store = test_store().await;
    create_task(&store, reminder_task("a", 1)).await;
    create_task(&store, reminder_task("b", 2)).await;
    create_task(&store, reminder_task("c", 2)).await;
    store.mark_completed("b", "2h").await.unwrap();

    let found = store
        .get_by_entities(&[EntityRef::Course(2)])
        .await
        .unwrap();
    let names: Vec<_> = found.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["b", "c"]);
    assert!(found[0].completed.contains("2h"));

    TaskStore::delete(&store, "b").await.unwrap();
    assert_eq!(store.get_all().await.unwrap().len(), 2);

    // Recreating a deleted task starts from a clean completion record.
    let (fresh, created) = create_task(&store, reminder_task("b", 2)).await;
    assert!(created);
    assert!(fresh.completed.is_empty());
}

#[tokio::test]
async fn test_client_get_or_create_and_save() {
    let store = test_store().await;
    let (mut client, created) = create_client(&store, ChannelKind::Vk, "555", "Anna").await;
    assert!(created);
    assert_eq!(client.state, ConversationState::Start);
    assert_eq!(client.first_name, "Anna");

    client.state = ConversationState::Phone;
    client.phone = Some("+79991234567".into());
    client.pending_course = Some(3);
    ClientDirectory::save(&store, &client).await.unwrap();

    let (again, created) = create_client(&store, ChannelKind::Vk, "555", "Other").await;
    assert!(!created);
    assert_eq!(again.first_name, "Anna");
    assert_eq!(again.state, ConversationState::Phone);
    assert_eq!(again.pending_course, Some(3));

    // Same identity on another channel is a different client.
    let (tg, created) = create_client(&store, ChannelKind::Telegram, "555", "Anna").await;
    assert!(created);
    assert_ne!(tg.id, again.id);
    assert_eq!(store.clients(ChannelKind::Vk).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_add_completed_task_is_idempotent() {
    let store = test_store().await;
    create_client(&store, ChannelKind::Telegram, "42", "Ivan").await;
    for _ in 0..2 {
        store
            .add_completed_task(ChannelKind::Telegram, "42", "tg_all_42_100")
            .await
            .unwrap();
    }
    let client = store
        .find_client(ChannelKind::Telegram, "42")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.completed_tasks.len(), 1);
    assert!(client.completed_tasks.contains("tg_all_42_100"));
}

#[tokio::test]
async fn test_course_listing_and_enrollment() {
    let store = test_store().await;
    let now = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
    let past = store
        .add_course(&course("Old", now - Duration::days(3)))
        .await
        .unwrap();
    let soon = store
        .add_course(&course("Soon", now + Duration::days(1)))
        .await
        .unwrap();
    let later = store
        .add_course(&course("Later", now + Duration::days(9)))
        .await
        .unwrap();
    let mut hidden = course("Hidden", now + Duration::days(2));
    hidden.published = false;
    store.add_course(&hidden).await.unwrap();

    let future: Vec<_> = store
        .future_courses(now)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(future, vec![soon, later]);
    let past_ids: Vec<_> = store
        .past_courses(now)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(past_ids, vec![past]);

    let (client, _) = create_client(&store, ChannelKind::Telegram, "42", "Ivan").await;
    assert!(store.enroll(client.id, soon).await.unwrap());
    assert!(!store.enroll(client.id, soon).await.unwrap());
    assert!(store.enroll(client.id, past).await.unwrap());

    assert_eq!(store.client_courses(client.id).await.unwrap().len(), 2);
    let upcoming = store
        .upcoming_enrollments(ChannelKind::Telegram, now)
        .await
        .unwrap();
    assert_eq!(upcoming.len(), 1);
    assert_eq!(upcoming[0].0, "42");
    assert_eq!(upcoming[0].1.id, soon);
    assert_eq!(upcoming[0].1.reminder_hours, vec![24, 2]);
    assert!(store
        .upcoming_enrollments(ChannelKind::Vk, now)
        .await
        .unwrap()
        .is_empty());

    assert!(store.unenroll(client.id, soon).await.unwrap());
    assert!(!store.unenroll(client.id, soon).await.unwrap());
}

#[tokio::test]
async fn test_anchor_times() {
    let store = test_store().await;
    let start = Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap();
    let id = store.add_course(&course("Classic", start)).await.unwrap();
    let (client, _) = create_client(&store, ChannelKind::Vk, "555", "Anna").await;

    assert_eq!(
        store
            .anchor_time(ChannelKind::Vk, &EntityRef::Course(id))
            .await
            .unwrap(),
        Some(start)
    );
    assert_eq!(
        store
            .anchor_time(ChannelKind::Vk, &EntityRef::Client("555".into()))
            .await
            .unwrap(),
        Some(client.registered_at)
    );
    assert_eq!(
        store
            .anchor_time(ChannelKind::Telegram, &EntityRef::Client("555".into()))
            .await
            .unwrap(),
        None
    );

    let moved = start + Duration::hours(3);
    store.reschedule_course(id, moved).await.unwrap();
    assert_eq!(
        store
            .anchor_time(ChannelKind::Vk, &EntityRef::Course(id))
            .await
            .unwrap(),
        Some(moved)
    );

    store.delete_course(id).await.unwrap();
    assert_eq!(
        store
            .anchor_time(ChannelKind::Vk, &EntityRef::Course(id))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_rfc3339_timestamps_from_back_office() {
    let store = test_store().await;
    sqlx::query("INSERT INTO courses (name, scheduled_at) VALUES ('Imported', '2026-07-01T09:30:00+00:00')")
        .execute(store.pool())
        .await
        .unwrap();
    let courses = store
        .future_courses(Utc.with_ymd_and_hms(2026, 6, 30, 0, 0, 0).unwrap())
        .await
        .unwrap();
    assert_eq!(courses.len(), 1);
    assert_eq!(
        courses[0].scheduled_at,
        Utc.with_ymd_and_hms(2026, 7, 1, 9, 30, 0).unwrap()
    );
    assert_eq!(courses[0].reminder_hours, vec![18]);
}

#[tokio::test]
async fn test_broadcasts_skip_unknown_audience() {
    let store = test_store().await;
    let at = Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap();
    store
        .add_broadcast(&Broadcast {
            id: 0,
            audience: Audience::Client("42".into()),
            text: "Hi {first_name}".into(),
            scheduled_at: at,
        })
        .await
        .unwrap();
    sqlx::query("INSERT INTO broadcasts (audience, text, scheduled_at) VALUES ('martians', 'x', '2026-06-01 10:00:00')")
        .execute(store.pool())
        .await
        .unwrap();

    let all = store.broadcasts().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].audience, Audience::Client("42".into()));
    assert_eq!(all[0].scheduled_at, at);
}

#[tokio::test]
async fn test_signal_take_returns_payload_once() {
    let store = test_store().await;
    let key = SignalKey::new(ChannelKind::Telegram, SignalPurpose::UpdateTasks);
    let payload = InvalidationPayload {
        deleted_firing_keys: vec!["tg_remind_42_7:24h".into()],
        entity_ids: vec![7],
    };

    assert_eq!(store.take(key).await.unwrap(), None);
    store.set(key, &payload).await.unwrap();
    assert_eq!(store.get(key).await.unwrap(), Some(payload.clone()));
    assert_eq!(store.take(key).await.unwrap(), Some(payload));
    assert_eq!(store.take(key).await.unwrap(), None);
}

#[tokio::test]
async fn test_signal_set_merges_pending_payloads() {
    let store = test_store().await;
    let key = SignalKey::new(ChannelKind::Vk, SignalPurpose::UpdateTasks);
    let other = SignalKey::new(ChannelKind::Telegram, SignalPurpose::UpdateTasks);
    store
        .set(
            key,
            &InvalidationPayload {
                deleted_firing_keys: vec!["a:1".into()],
                entity_ids: vec![1],
            },
        )
        .await
        .unwrap();
    store
        .set(
            key,
            &InvalidationPayload {
                deleted_firing_keys: vec!["a:1".into(), "b:2".into()],
                entity_ids: vec![2],
            },
        )
        .await
        .unwrap();

    assert_eq!(store.get(other).await.unwrap(), None);
    let merged = store.take(key).await.unwrap().unwrap();
    assert_eq!(merged.deleted_firing_keys, vec!["a:1", "b:2"]);
    assert_eq!(merged.entity_ids, vec![1, 2]);

    store.set(key, &merged).await.unwrap();
    InvalidationSignal::delete(&store, key).await.unwrap();
    assert_eq!(store.get(key).await.unwrap(), None);
}
