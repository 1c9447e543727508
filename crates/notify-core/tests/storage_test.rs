//! Repository behavior against a live PostgreSQL.
//!
//! These tests run when `DATABASE_URL` points at a database the tests may
//! create tables in, and return early otherwise. Topics and consumer groups
//! are unique per test so runs do not interfere.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::time::Duration;

use chrono::Utc;
use notify_core::{
    storage::{schema, Storage},
    Notification, NotificationType,
};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("test database should be reachable");
    schema::ensure_schema(&pool).await.expect("schema should apply");
    Some(pool)
}

fn unique(prefix: &str) -> String {
    format!("{prefix}.{}", Uuid::new_v4())
}

#[tokio::test]
async fn appends_to_one_topic_become_visible_in_offset_order() {
    let Some(pool) = test_pool().await else { return };
    let storage = Storage::new(pool.clone());
    let topic = unique("test.send");
    let group = unique("group");
    let now = Utc::now();

    let mut open = pool.begin().await.unwrap();
    let first =
        storage.bus_messages.append_in_tx(&mut open, &topic, None, b"first", now).await.unwrap();

    let log = storage.bus_messages.clone();
    let later_topic = topic.clone();
    let second =
        tokio::spawn(async move { log.append(&later_topic, None, b"second", now).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!second.is_finished(), "append must wait for the open append on the same topic");
    assert!(storage.bus_messages.fetch_from_cursor(&group, &topic, 10).await.unwrap().is_empty());

    open.commit().await.unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(second, first + 1);

    let read = storage.bus_messages.fetch_from_cursor(&group, &topic, 10).await.unwrap();
    let offsets: Vec<i64> = read.iter().map(|m| m.message_offset).collect();
    assert_eq!(offsets, vec![first, second]);
    assert_eq!(read[0].payload, b"first");
}

#[tokio::test]
async fn topics_have_independent_offsets() {
    let Some(pool) = test_pool().await else { return };
    let storage = Storage::new(pool);
    let (a, b) = (unique("test.a"), unique("test.b"));
    let now = Utc::now();

    assert_eq!(storage.bus_messages.append(&a, None, b"1", now).await.unwrap(), 0);
    assert_eq!(storage.bus_messages.append(&b, None, b"1", now).await.unwrap(), 0);
    assert_eq!(storage.bus_messages.append(&a, None, b"2", now).await.unwrap(), 1);
}

#[tokio::test]
async fn consumed_messages_are_pruned_without_reusing_offsets() {
    let Some(pool) = test_pool().await else { return };
    let storage = Storage::new(pool);
    let topic = unique("test.retry");
    let (fast, slow) = (unique("fast"), unique("slow"));
    let now = Utc::now();
    let earlier = now - chrono::Duration::hours(1);
    let later = now + chrono::Duration::hours(1);

    for payload in [b"0", b"1", b"2"] {
        storage.bus_messages.append(&topic, None, payload, now).await.unwrap();
    }
    assert_eq!(storage.bus_messages.delete_consumed(&topic, later).await.unwrap(), 0);

    storage.bus_messages.commit(&fast, &topic, 0, 3).await.unwrap();
    storage.bus_messages.commit(&slow, &topic, 0, 1).await.unwrap();
    assert_eq!(storage.bus_messages.delete_consumed(&topic, earlier).await.unwrap(), 0);
    assert_eq!(storage.bus_messages.delete_consumed(&topic, later).await.unwrap(), 1);

    let remaining = storage.bus_messages.fetch_from_cursor(&slow, &topic, 10).await.unwrap();
    assert_eq!(remaining.iter().map(|m| m.message_offset).collect::<Vec<_>>(), vec![1, 2]);

    storage.bus_messages.commit(&slow, &topic, 0, 3).await.unwrap();
    assert_eq!(storage.bus_messages.delete_consumed(&topic, later).await.unwrap(), 2);
    assert_eq!(storage.bus_messages.append(&topic, None, b"3", now).await.unwrap(), 3);
}

#[tokio::test]
async fn only_published_outbox_events_are_pruned() {
    let Some(pool) = test_pool().await else { return };
    let storage = Storage::new(pool.clone());
    let now = Utc::now();
    let notification = |key: String| {
        Notification::new(NotificationType::Webhook, "https://example.com", "c1", "{}", key, now)
    };

    let published = storage
        .save_with_outbox(&notification(unique("key")), "echo.notify.send", now)
        .await
        .unwrap();
    let pending = storage
        .save_with_outbox(&notification(unique("key")), "echo.notify.send", now)
        .await
        .unwrap();
    storage.outbox.mark_published(published.id, now).await.unwrap();

    let deleted = storage
        .outbox
        .delete_published_before(now + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert!(deleted >= 1);

    let remaining: Vec<Uuid> =
        sqlx::query_scalar("SELECT id FROM notification_outbox WHERE id = ANY($1)")
            .bind(vec![published.id.0, pending.id.0])
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(remaining, vec![pending.id.0]);
}
