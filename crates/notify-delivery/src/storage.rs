//! Storage abstraction layer for the delivery pipeline.
//!
//! The use cases only see [`NotificationStore`]. Production wires the
//! PostgreSQL adapter over `notify_core::storage::Storage`; tests use the
//! in-memory [`mock::MockNotificationStore`], which enforces the same
//! uniqueness rules and allows injecting failures.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use notify_core::{
    error::Result, Clock, Notification, NotificationId, NotificationStatus, OutboxEvent,
    OutboxEventId,
};

/// Persistence operations required by the pipeline.
pub trait NotificationStore: Send + Sync + 'static {
    /// Inserts or updates a notification by id.
    ///
    /// Fails with `CoreError::ConstraintViolation` if the idempotency key
    /// belongs to another notification.
    fn save(
        &self,
        notification: &Notification,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Saves a notification and enqueues a `PENDING` outbox event for
    /// `topic` atomically.
    fn save_with_outbox(
        &self,
        notification: &Notification,
        topic: &str,
    ) -> Pin<Box<dyn Future<Output = Result<OutboxEvent>> + Send + '_>>;

    /// Finds a notification by id.
    fn find_by_id(
        &self,
        id: NotificationId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Notification>>> + Send + '_>>;

    /// Finds every existing notification among `ids`. Missing ids are
    /// skipped.
    fn find_by_ids(
        &self,
        ids: Vec<NotificationId>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Notification>>> + Send + '_>>;

    /// Finds the notification owning an idempotency key.
    fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Notification>>> + Send + '_>>;

    /// Lists up to `limit` notifications in `status`, least recently updated
    /// first.
    fn find_by_status(
        &self,
        status: NotificationStatus,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Notification>>> + Send + '_>>;

    /// Returns up to `limit` `PENDING` outbox events due at `now`, oldest
    /// first.
    fn fetch_due_outbox(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>>> + Send + '_>>;

    /// Marks an outbox event `PUBLISHED`.
    fn mark_outbox_published(
        &self,
        id: OutboxEventId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Records a failed publish: the event stays `PENDING`, `attempts` grows
    /// by one and the event becomes due again at `next_attempt_at`.
    fn mark_outbox_failed(
        &self,
        id: OutboxEventId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Deletes `PUBLISHED` outbox events last updated before `cutoff` and
    /// returns how many were removed.
    fn delete_published_outbox(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;
}

/// Production store backed by PostgreSQL.
pub struct PostgresNotificationStore {
    storage: Arc<notify_core::storage::Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresNotificationStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<notify_core::storage::Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

impl NotificationStore for PostgresNotificationStore {
    fn save(
        &self,
        notification: &Notification,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        let notification = notification.clone();
        Box::pin(async move { storage.notifications.upsert(&notification).await })
    }

    fn save_with_outbox(
        &self,
        notification: &Notification,
        topic: &str,
    ) -> Pin<Box<dyn Future<Output = Result<OutboxEvent>> + Send + '_>> {
        let storage = self.storage.clone();
        let notification = notification.clone();
        let topic = topic.to_string();
        let now = self.clock.now_utc();
        Box::pin(async move { storage.save_with_outbox(&notification, &topic, now).await })
    }

    fn find_by_id(
        &self,
        id: NotificationId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Notification>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.notifications.find_by_id(id).await })
    }

    fn find_by_ids(
        &self,
        ids: Vec<NotificationId>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Notification>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.notifications.find_by_ids(&ids).await })
    }

    fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Notification>>> + Send + '_>> {
        let storage = self.storage.clone();
        let key = key.to_string();
        Box::pin(async move { storage.notifications.find_by_idempotency_key(&key).await })
    }

    fn find_by_status(
        &self,
        status: NotificationStatus,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Notification>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.notifications.find_by_status(status, limit).await })
    }

    fn fetch_due_outbox(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbox.fetch_due(now, limit).await })
    }

    fn mark_outbox_published(
        &self,
        id: OutboxEventId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        let now = self.clock.now_utc();
        Box::pin(async move { storage.outbox.mark_published(id, now).await })
    }

    fn mark_outbox_failed(
        &self,
        id: OutboxEventId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        let error = error.to_string();
        let now = self.clock.now_utc();
        Box::pin(async move { storage.outbox.mark_failed(id, &error, next_attempt_at, now).await })
    }

    fn delete_published_outbox(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbox.delete_published_before(cutoff).await })
    }
}

/// In-memory store for tests.
pub mod mock {
    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use chrono::{DateTime, Utc};
    use notify_core::{
        error::Result, Clock, CoreError, Notification, NotificationId, NotificationStatus,
        OutboxEvent, OutboxEventId, OutboxStatus, RealClock,
    };
    use tokio::sync::RwLock;

    use super::NotificationStore;

    #[derive(Debug, Default)]
    struct Tables {
        notifications: HashMap<NotificationId, Notification>,
        outbox: Vec<OutboxEvent>,
    }

    impl Tables {
        fn check_idempotency_key(&self, notification: &Notification) -> Result<()> {
            let taken = self.notifications.values().any(|existing| {
                existing.idempotency_key == notification.idempotency_key
                    && existing.id != notification.id
            });
            if taken {
                return Err(CoreError::ConstraintViolation(format!(
                    "idempotency key {} already exists",
                    notification.idempotency_key
                )));
            }
            Ok(())
        }

        fn outbox_mut(&mut self, id: OutboxEventId) -> Result<&mut OutboxEvent> {
            self.outbox
                .iter_mut()
                .find(|event| event.id == id)
                .ok_or_else(|| CoreError::NotFound(format!("outbox event {id} not found")))
        }
    }

    /// Mock store keeping notifications and outbox events in memory.
    ///
    /// Both tables live behind one lock so `save_with_outbox` is atomic.
    /// Injected errors are consumed by the next matching operation.
    #[derive(Clone)]
    pub struct MockNotificationStore {
        tables: Arc<RwLock<Tables>>,
        save_error: Arc<RwLock<Option<String>>>,
        outbox_error: Arc<RwLock<Option<String>>>,
        clock: Arc<dyn Clock>,
    }

    impl MockNotificationStore {
        /// Creates an empty store reading time from the system clock.
        pub fn new() -> Self {
            Self::with_clock(Arc::new(RealClock::new()))
        }

        /// Creates an empty store stamping updates with `clock`.
        pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
            Self {
                tables: Arc::new(RwLock::new(Tables::default())),
                save_error: Arc::new(RwLock::new(None)),
                outbox_error: Arc::new(RwLock::new(None)),
                clock,
            }
        }

        /// Seeds a notification without an outbox event.
        pub async fn insert(&self, notification: Notification) {
            self.tables.write().await.notifications.insert(notification.id, notification);
        }

        /// Deletes a notification but keeps its outbox events, leaving them
        /// dangling.
        pub async fn remove_notification(&self, id: NotificationId) {
            self.tables.write().await.notifications.remove(&id);
        }

        /// Fails the next `save` or `save_with_outbox`.
        pub async fn inject_save_error(&self, error: impl Into<String>) {
            *self.save_error.write().await = Some(error.into());
        }

        /// Fails the next outbox fetch or update.
        pub async fn inject_outbox_error(&self, error: impl Into<String>) {
            *self.outbox_error.write().await = Some(error.into());
        }

        /// All stored notifications, in no particular order.
        pub async fn notifications(&self) -> Vec<Notification> {
            self.tables.read().await.notifications.values().cloned().collect()
        }

        /// All outbox events in insertion order.
        pub async fn outbox_events(&self) -> Vec<OutboxEvent> {
            self.tables.read().await.outbox.clone()
        }

        /// Current state of one notification.
        pub async fn notification(&self, id: NotificationId) -> Option<Notification> {
            self.tables.read().await.notifications.get(&id).cloned()
        }

        async fn take_error(slot: &RwLock<Option<String>>) -> Result<()> {
            match slot.write().await.take() {
                Some(error) => Err(CoreError::Database(error)),
                None => Ok(()),
            }
        }
    }

    impl Default for MockNotificationStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl NotificationStore for MockNotificationStore {
        fn save(
            &self,
            notification: &Notification,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let notification = notification.clone();
            Box::pin(async move {
                Self::take_error(&self.save_error).await?;

                let mut tables = self.tables.write().await;
                tables.check_idempotency_key(&notification)?;
                tables.notifications.insert(notification.id, notification);
                Ok(())
            })
        }

        fn save_with_outbox(
            &self,
            notification: &Notification,
            topic: &str,
        ) -> Pin<Box<dyn Future<Output = Result<OutboxEvent>> + Send + '_>> {
            let notification = notification.clone();
            let topic = topic.to_string();
            Box::pin(async move {
                Self::take_error(&self.save_error).await?;

                let event = OutboxEvent::pending(notification.id, topic, self.clock.now_utc());
                let mut tables = self.tables.write().await;
                tables.check_idempotency_key(&notification)?;
                tables.notifications.insert(notification.id, notification);
                tables.outbox.push(event.clone());
                Ok(event)
            })
        }

        fn find_by_id(
            &self,
            id: NotificationId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Notification>>> + Send + '_>> {
            Box::pin(async move { Ok(self.tables.read().await.notifications.get(&id).cloned()) })
        }

        fn find_by_ids(
            &self,
            ids: Vec<NotificationId>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Notification>>> + Send + '_>> {
            Box::pin(async move {
                let tables = self.tables.read().await;
                Ok(ids.iter().filter_map(|id| tables.notifications.get(id).cloned()).collect())
            })
        }

        fn find_by_idempotency_key(
            &self,
            key: &str,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Notification>>> + Send + '_>> {
            let key = key.to_string();
            Box::pin(async move {
                Ok(self
                    .tables
                    .read()
                    .await
                    .notifications
                    .values()
                    .find(|n| n.idempotency_key == key)
                    .cloned())
            })
        }

        fn find_by_status(
            &self,
            status: NotificationStatus,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Notification>>> + Send + '_>> {
            Box::pin(async move {
                let tables = self.tables.read().await;
                let mut matching: Vec<Notification> = tables
                    .notifications
                    .values()
                    .filter(|n| n.status == status)
                    .cloned()
                    .collect();
                matching.sort_by_key(|n| (n.updated_at, n.id));
                matching.truncate(limit);
                Ok(matching)
            })
        }

        fn fetch_due_outbox(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>>> + Send + '_>> {
            Box::pin(async move {
                Self::take_error(&self.outbox_error).await?;

                let tables = self.tables.read().await;
                let mut due: Vec<OutboxEvent> =
                    tables.outbox.iter().filter(|event| event.is_due(now)).cloned().collect();
                due.sort_by_key(|event| event.created_at);
                due.truncate(limit);
                Ok(due)
            })
        }

        fn mark_outbox_published(
            &self,
            id: OutboxEventId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                Self::take_error(&self.outbox_error).await?;

                let now = self.clock.now_utc();
                let mut tables = self.tables.write().await;
                let event = tables.outbox_mut(id)?;
                event.status = OutboxStatus::Published;
                event.updated_at = now;
                Ok(())
            })
        }

        fn mark_outbox_failed(
            &self,
            id: OutboxEventId,
            error: &str,
            next_attempt_at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let error = error.to_string();
            Box::pin(async move {
                Self::take_error(&self.outbox_error).await?;

                let now = self.clock.now_utc();
                let mut tables = self.tables.write().await;
                let event = tables.outbox_mut(id)?;
                event.attempts = event.attempts.saturating_add(1);
                event.last_error = Some(error);
                event.next_attempt_at = Some(next_attempt_at);
                event.updated_at = now;
                Ok(())
            })
        }

        fn delete_published_outbox(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            Box::pin(async move {
                Self::take_error(&self.outbox_error).await?;

                let mut tables = self.tables.write().await;
                let before = tables.outbox.len();
                tables.outbox.retain(|event| {
                    event.status != OutboxStatus::Published || event.updated_at >= cutoff
                });
                Ok(u64::try_from(before - tables.outbox.len()).unwrap_or(u64::MAX))
            })
        }
    }

}
