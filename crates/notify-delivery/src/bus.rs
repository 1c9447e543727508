//! Message bus ports.
//!
//! The pipeline publishes raw bytes to named topics and consumes them through
//! per-group cursors with explicit commits. A record is redelivered until its
//! offset is committed, which gives at-least-once processing.
//!
//! Two implementations exist: [`PostgresMessageBus`], an append-only message
//! log in the same database as the notifications, and
//! [`mock::InMemoryBus`] for tests.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use notify_core::{
    storage::bus_messages::StoredMessage, Clock, Notification, NotificationMessage,
};
use tracing::debug;

use crate::error::{DeliveryError, Result};

/// One record read from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: i32,
    /// Position within the partition.
    pub offset: i64,
    /// Routing key, the notification id for notification envelopes.
    pub key: Option<String>,
    /// Raw payload.
    pub payload: Vec<u8>,
}

impl From<StoredMessage> for BusRecord {
    fn from(message: StoredMessage) -> Self {
        Self {
            topic: message.topic,
            partition: message.partition_id,
            offset: message.message_offset,
            key: message.message_key,
            payload: message.payload,
        }
    }
}

/// Raw topic publisher.
pub trait MessagePublisher: Send + Sync + 'static {
    /// Appends `payload` to `topic`.
    fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Cursor over one topic for one consumer group.
pub trait MessageConsumer: Send + Sync + 'static {
    /// Topic this consumer reads.
    fn topic(&self) -> &str;

    /// Returns up to `max` records starting at the committed position.
    fn poll(&self, max: usize) -> Pin<Box<dyn Future<Output = Result<Vec<BusRecord>>> + Send + '_>>;

    /// Marks `record` and everything before it as processed.
    fn commit(&self, record: &BusRecord) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Drops records of this topic appended before `cutoff` that every
    /// consumer group with a committed position has read. Returns how many
    /// were dropped.
    fn prune_consumed(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;
}

/// Publishes notification envelopes.
///
/// Wraps each notification in a [`NotificationMessage`] stamped with the
/// current time and keys it by the notification id.
#[derive(Clone)]
pub struct NotificationPublisher {
    publisher: Arc<dyn MessagePublisher>,
    clock: Arc<dyn Clock>,
}

impl NotificationPublisher {
    /// Creates a publisher over a raw bus.
    pub fn new(publisher: Arc<dyn MessagePublisher>, clock: Arc<dyn Clock>) -> Self {
        Self { publisher, clock }
    }

    /// Publishes `notification` to `topic`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Publish` if encoding or the bus fails.
    pub async fn publish(&self, topic: &str, notification: &Notification) -> Result<()> {
        let payload = NotificationMessage::new(notification, self.clock.now_utc())
            .encode()
            .map_err(|e| DeliveryError::publish(topic, e.to_string()))?;
        let key = notification.id.to_string();

        self.publisher.publish(topic, Some(&key), payload).await?;
        debug!(notification_id = %notification.id, topic = %topic, "notification published");
        Ok(())
    }
}

/// Message log stored in PostgreSQL.
#[derive(Clone)]
pub struct PostgresMessageBus {
    storage: Arc<notify_core::storage::Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresMessageBus {
    /// Creates a bus over the shared storage.
    pub fn new(storage: Arc<notify_core::storage::Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Creates a consumer for `topic` in `consumer_group`.
    pub fn consumer(
        &self,
        consumer_group: impl Into<String>,
        topic: impl Into<String>,
    ) -> PostgresConsumer {
        PostgresConsumer {
            storage: self.storage.clone(),
            consumer_group: consumer_group.into(),
            topic: topic.into(),
        }
    }
}

impl MessagePublisher for PostgresMessageBus {
    fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        let topic = topic.to_string();
        let key = key.map(str::to_string);
        let now = self.clock.now_utc();
        Box::pin(async move {
            storage
                .bus_messages
                .append(&topic, key.as_deref(), &payload, now)
                .await
                .map(|_| ())
                .map_err(|e| DeliveryError::publish(&topic, e.to_string()))
        })
    }
}

/// Consumer group cursor over the PostgreSQL message log.
pub struct PostgresConsumer {
    storage: Arc<notify_core::storage::Storage>,
    consumer_group: String,
    topic: String,
}

impl MessageConsumer for PostgresConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn poll(&self, max: usize) -> Pin<Box<dyn Future<Output = Result<Vec<BusRecord>>> + Send + '_>> {
        Box::pin(async move {
            let messages = self
                .storage
                .bus_messages
                .fetch_from_cursor(&self.consumer_group, &self.topic, max)
                .await?;
            Ok(messages.into_iter().map(BusRecord::from).collect())
        })
    }

    fn commit(&self, record: &BusRecord) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let partition = record.partition;
        let next_offset = record.offset.saturating_add(1);
        Box::pin(async move {
            self.storage
                .bus_messages
                .commit(&self.consumer_group, &self.topic, partition, next_offset)
                .await?;
            Ok(())
        })
    }

    fn prune_consumed(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        Box::pin(async move {
            Ok(self.storage.bus_messages.delete_consumed(&self.topic, cutoff).await?)
        })
    }
}

/// In-memory bus for tests.
pub mod mock {
    use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc};

    use chrono::{DateTime, Utc};
    use notify_core::{Clock, NotificationMessage, RealClock};
    use tokio::sync::Mutex;

    use super::{BusRecord, MessageConsumer, MessagePublisher};
    use crate::error::{DeliveryError, Result};

    #[derive(Debug)]
    struct LogEntry {
        record: BusRecord,
        appended_at: DateTime<Utc>,
    }

    #[derive(Debug, Default)]
    struct BusState {
        logs: HashMap<String, Vec<LogEntry>>,
        heads: HashMap<String, i64>,
        cursors: HashMap<(String, String), i64>,
        publish_failures: HashMap<String, u32>,
    }

    /// Per-topic logs with per-group cursors.
    #[derive(Clone)]
    pub struct InMemoryBus {
        state: Arc<Mutex<BusState>>,
        clock: Arc<dyn Clock>,
    }

    impl fmt::Debug for InMemoryBus {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("InMemoryBus").finish_non_exhaustive()
        }
    }

    impl Default for InMemoryBus {
        fn default() -> Self {
            Self::new()
        }
    }

    impl InMemoryBus {
        /// Creates an empty bus stamping appends with the system clock.
        pub fn new() -> Self {
            Self::with_clock(Arc::new(RealClock::new()))
        }

        /// Creates an empty bus stamping appends with `clock`.
        pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
            Self { state: Arc::new(Mutex::new(BusState::default())), clock }
        }

        /// Creates a consumer for `topic` in `consumer_group`.
        pub fn consumer(
            &self,
            consumer_group: impl Into<String>,
            topic: impl Into<String>,
        ) -> InMemoryConsumer {
            InMemoryConsumer {
                state: self.state.clone(),
                consumer_group: consumer_group.into(),
                topic: topic.into(),
            }
        }

        /// Makes the next `count` publishes to `topic` fail.
        pub async fn fail_next_publishes(&self, topic: &str, count: u32) {
            self.state.lock().await.publish_failures.insert(topic.to_string(), count);
        }

        /// Every record of `topic` that has not been pruned.
        pub async fn messages(&self, topic: &str) -> Vec<BusRecord> {
            self.state
                .lock()
                .await
                .logs
                .get(topic)
                .map(|log| log.iter().map(|entry| entry.record.clone()).collect())
                .unwrap_or_default()
        }

        /// Every notification envelope on `topic` that decodes.
        pub async fn notifications(&self, topic: &str) -> Vec<NotificationMessage> {
            self.messages(topic)
                .await
                .iter()
                .filter_map(|record| NotificationMessage::decode(&record.payload).ok())
                .collect()
        }

        /// Committed position of a group on a topic.
        pub async fn committed_offset(&self, consumer_group: &str, topic: &str) -> i64 {
            let state = self.state.lock().await;
            state
                .cursors
                .get(&(consumer_group.to_string(), topic.to_string()))
                .copied()
                .unwrap_or(0)
        }
    }

    impl MessagePublisher for InMemoryBus {
        fn publish(
            &self,
            topic: &str,
            key: Option<&str>,
            payload: Vec<u8>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let topic = topic.to_string();
            let key = key.map(str::to_string);
            let appended_at = self.clock.now_utc();
            Box::pin(async move {
                let mut state = self.state.lock().await;

                if let Some(remaining) = state.publish_failures.get_mut(&topic) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(DeliveryError::publish(&topic, "injected publish failure"));
                    }
                }

                let head = state.heads.entry(topic.clone()).or_insert(0);
                let offset = *head;
                *head += 1;

                let record = BusRecord { topic: topic.clone(), partition: 0, offset, key, payload };
                state.logs.entry(topic).or_default().push(LogEntry { record, appended_at });
                Ok(())
            })
        }
    }

    /// Consumer group cursor over an [`InMemoryBus`].
    #[derive(Debug, Clone)]
    pub struct InMemoryConsumer {
        state: Arc<Mutex<BusState>>,
        consumer_group: String,
        topic: String,
    }

    impl MessageConsumer for InMemoryConsumer {
        fn topic(&self) -> &str {
            &self.topic
        }

        fn poll(
            &self,
            max: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<BusRecord>>> + Send + '_>> {
            Box::pin(async move {
                let state = self.state.lock().await;
                let position = state
                    .cursors
                    .get(&(self.consumer_group.clone(), self.topic.clone()))
                    .copied()
                    .unwrap_or(0);

                Ok(state
                    .logs
                    .get(&self.topic)
                    .map(|log| {
                        log.iter()
                            .filter(|entry| entry.record.offset >= position)
                            .take(max)
                            .map(|entry| entry.record.clone())
                            .collect()
                    })
                    .unwrap_or_default())
            })
        }

        fn commit(
            &self,
            record: &BusRecord,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let next_offset = record.offset.saturating_add(1);
            Box::pin(async move {
                let mut state = self.state.lock().await;
                let cursor = state
                    .cursors
                    .entry((self.consumer_group.clone(), self.topic.clone()))
                    .or_insert(0);
                *cursor = (*cursor).max(next_offset);
                Ok(())
            })
        }

        fn prune_consumed(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                let low_water = state
                    .cursors
                    .iter()
                    .filter(|((_, topic), _)| *topic == self.topic)
                    .map(|(_, next_offset)| *next_offset)
                    .min()
                    .unwrap_or(0);

                let Some(log) = state.logs.get_mut(&self.topic) else {
                    return Ok(0);
                };
                let before = log.len();
                log.retain(|entry| {
                    entry.record.offset >= low_water || entry.appended_at >= cutoff
                });
                Ok(u64::try_from(before - log.len()).unwrap_or(u64::MAX))
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn uncommitted_records_are_redelivered() {
            let bus = InMemoryBus::new();
            let consumer = bus.consumer("send-group", "t");
            for i in 0..3u8 {
                bus.publish("t", None, vec![i]).await.unwrap();
            }

            let first = consumer.poll(2).await.unwrap();
            assert_eq!(first.len(), 2);
            assert_eq!(consumer.poll(2).await.unwrap(), first);

            consumer.commit(&first[0]).await.unwrap();
            let second = consumer.poll(10).await.unwrap();
            assert_eq!(second.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1, 2]);
        }

        #[tokio::test]
        async fn groups_have_independent_cursors() {
            let bus = InMemoryBus::new();
            bus.publish("t", Some("k"), b"x".to_vec()).await.unwrap();
            let a = bus.consumer("a", "t");
            let b = bus.consumer("b", "t");

            let record = a.poll(1).await.unwrap().remove(0);
            a.commit(&record).await.unwrap();

            assert!(a.poll(1).await.unwrap().is_empty());
            assert_eq!(b.poll(1).await.unwrap().len(), 1);
            assert_eq!(bus.committed_offset("a", "t").await, 1);
            assert_eq!(bus.committed_offset("b", "t").await, 0);
        }

        #[tokio::test]
        async fn injected_publish_failures_are_consumed() {
            let bus = InMemoryBus::new();
            bus.fail_next_publishes("t", 2).await;

            assert!(bus.publish("t", None, vec![1]).await.is_err());
            assert!(bus.publish("t", None, vec![2]).await.is_err());
            assert!(bus.publish("t", None, vec![3]).await.is_ok());
            assert_eq!(bus.messages("t").await.len(), 1);
        }

        #[tokio::test]
        async fn prune_keeps_unread_and_recent_records() {
            let clock = notify_core::TestClock::new();
            let bus = InMemoryBus::with_clock(Arc::new(clock.clone()));
            let fast = bus.consumer("fast", "t");
            let slow = bus.consumer("slow", "t");
            for i in 0..3u8 {
                bus.publish("t", None, vec![i]).await.unwrap();
            }
            let cutoff = clock.now_utc() + chrono::Duration::seconds(1);

            assert_eq!(fast.prune_consumed(cutoff).await.unwrap(), 0);

            let records = fast.poll(3).await.unwrap();
            fast.commit(&records[2]).await.unwrap();
            slow.commit(&records[0]).await.unwrap();
            assert_eq!(fast.prune_consumed(clock.now_utc()).await.unwrap(), 0);
            assert_eq!(fast.prune_consumed(cutoff).await.unwrap(), 1);

            let offsets: Vec<i64> = slow.poll(10).await.unwrap().iter().map(|r| r.offset).collect();
            assert_eq!(offsets, vec![1, 2]);

            bus.publish("t", None, vec![3]).await.unwrap();
            assert_eq!(bus.messages("t").await.last().unwrap().offset, 3);
        }

        #[tokio::test]
        async fn commit_never_moves_backwards() {
            let bus = InMemoryBus::new();
            let consumer = bus.consumer("g", "t");
            for i in 0..2u8 {
                bus.publish("t", None, vec![i]).await.unwrap();
            }
            let records = consumer.poll(2).await.unwrap();

            consumer.commit(&records[1]).await.unwrap();
            consumer.commit(&records[0]).await.unwrap();

            assert_eq!(bus.committed_offset("g", "t").await, 2);
        }
    }
}
