// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message bus integration for the message-bus transport.
//!
//! Each node publishes its content changes to a per-node topic
//! (`federation:updates:<address>`); followers subscribe to the topics of
//! the nodes they follow. The bus only carries [`UpdateMessage`] payloads —
//! it is a delivery channel, not a store, so losing a message is harmless
//! (historical sync and idempotent reconciliation cover gaps).
//!
//! Two implementations:
//!
//! - [`RedisMessageBus`]: production bus over Redis pub/sub. Subscriber
//!   discovery uses `PUBSUB NUMSUB`, which lets a publisher notice that
//!   nobody is listening before it shouts into the void.
//! - [`InMemoryBus`]: in-process bus for tests and standalone mode.
//!
//! [`UpdateMessage`]: crate::model::UpdateMessage

use crate::error::{FederationError, Result};
use crate::store::BoxFuture;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Capacity of per-subscription delivery buffers.
const SUBSCRIPTION_BUFFER: usize = 64;

/// The per-node update topic.
pub fn update_topic(address: &str) -> String {
    format!("federation:updates:{address}")
}

/// A publish/subscribe channel between federation nodes.
pub trait MessageBus: Send + Sync + 'static {
    /// Publish `payload` to `topic`.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> BoxFuture<'_, Result<()>>;

    /// Subscribe to `topic`. Messages arrive on the returned receiver until
    /// it is dropped.
    fn subscribe(&self, topic: &str) -> BoxFuture<'_, Result<mpsc::Receiver<Vec<u8>>>>;

    /// Number of current subscribers on `topic`.
    fn subscriber_count(&self, topic: &str) -> BoxFuture<'_, Result<usize>>;
}

// =============================================================================
// Redis implementation
// =============================================================================

/// Message bus over Redis pub/sub.
///
/// The publish connection is lazy and multiplexed
/// (`redis::aio::ConnectionManager` reconnects on loss; cloning shares the
/// underlying socket). Each subscription holds its own pub/sub connection,
/// which is how the redis protocol wants it.
pub struct RedisMessageBus {
    client: Client,
    publish_conn: RwLock<Option<ConnectionManager>>,
}

impl std::fmt::Debug for RedisMessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisMessageBus").finish_non_exhaustive()
    }
}

impl RedisMessageBus {
    /// Create a bus for the Redis instance at `url`. No connection is made
    /// until first use.
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| FederationError::Config(format!("Invalid bus URL: {e}")))?;
        Ok(Self {
            client,
            publish_conn: RwLock::new(None),
        })
    }

    async fn publish_connection(&self) -> Result<ConnectionManager> {
        if let Some(conn) = self.publish_conn.read().await.clone() {
            return Ok(conn);
        }

        let conn = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| FederationError::bus("CONNECT", e))?;
        *self.publish_conn.write().await = Some(conn.clone());
        Ok(conn)
    }
}

impl MessageBus for RedisMessageBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let mut conn = self.publish_connection().await?;
            let receivers: i64 = redis::cmd("PUBLISH")
                .arg(&topic)
                .arg(payload)
                .query_async(&mut conn)
                .await
                .map_err(|e| FederationError::bus("PUBLISH", e))?;

            crate::metrics::record_bus_publish(&topic, receivers as usize);
            Ok(())
        })
    }

    fn subscribe(&self, topic: &str) -> BoxFuture<'_, Result<mpsc::Receiver<Vec<u8>>>> {
        let topic = topic.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut pubsub = client
                .get_async_pubsub()
                .await
                .map_err(|e| FederationError::bus("SUBSCRIBE", e))?;
            pubsub
                .subscribe(&topic)
                .await
                .map_err(|e| FederationError::bus("SUBSCRIBE", e))?;

            let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
            tokio::spawn(async move {
                use futures::StreamExt;
                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    let payload = msg.get_payload_bytes().to_vec();
                    if tx.send(payload).await.is_err() {
                        // Receiver dropped: subscription torn down.
                        break;
                    }
                }
                debug!(topic = %topic, "Bus subscription stream ended");
            });

            Ok(rx)
        })
    }

    fn subscriber_count(&self, topic: &str) -> BoxFuture<'_, Result<usize>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let mut conn = self.publish_connection().await?;
            // NUMSUB replies with a flat [channel, count, ...] array.
            let counts: Vec<(String, i64)> = redis::cmd("PUBSUB")
                .arg("NUMSUB")
                .arg(&topic)
                .query_async(&mut conn)
                .await
                .map_err(|e| FederationError::bus("PUBSUB NUMSUB", e))?;

            Ok(counts
                .into_iter()
                .find(|(channel, _)| channel == &topic)
                .map(|(_, count)| count.max(0) as usize)
                .unwrap_or(0))
        })
    }
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// In-process bus for tests and standalone mode.
///
/// Delivery is per-subscriber FIFO; a subscriber whose buffer is full
/// blocks the publisher briefly rather than dropping, mirroring the
/// backpressure a real bus connection exerts.
pub struct InMemoryBus {
    topics: DashMap<String, Vec<mpsc::Sender<Vec<u8>>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    fn prune(&self, topic: &str) {
        if let Some(mut entry) = self.topics.get_mut(topic) {
            entry.value_mut().retain(|tx| !tx.is_closed());
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        let topic = topic.to_string();
        Box::pin(async move {
            // Clone the sender list first; holding the map entry across an
            // await would block subscribes on the same topic.
            let senders = self
                .topics
                .get(&topic)
                .map(|entry| entry.value().clone())
                .unwrap_or_default();

            let mut delivered = 0usize;
            for tx in senders {
                if tx.send(payload.clone()).await.is_ok() {
                    delivered += 1;
                }
            }
            self.prune(&topic);

            crate::metrics::record_bus_publish(&topic, delivered);
            if delivered == 0 {
                debug!(topic = %topic, "Published with no live subscribers");
            }
            Ok(())
        })
    }

    fn subscribe(&self, topic: &str) -> BoxFuture<'_, Result<mpsc::Receiver<Vec<u8>>>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
            self.topics.entry(topic).or_default().push(tx);
            Ok(rx)
        })
    }

    fn subscriber_count(&self, topic: &str) -> BoxFuture<'_, Result<usize>> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.prune(&topic);
            Ok(self
                .topics
                .get(&topic)
                .map(|entry| entry.value().len())
                .unwrap_or(0))
        })
    }
}

/// Wait until `topic` has at least one subscriber, polling
/// `subscriber_count` every `poll` for at most `window`.
///
/// Returns the observed count, or a [`FederationError::DiscoveryTimeout`]
/// if nobody appeared. Bus errors during polling are tolerated (counted as
/// zero) since discovery is best-effort.
pub async fn await_subscribers(
    bus: &dyn MessageBus,
    topic: &str,
    window: std::time::Duration,
    poll: std::time::Duration,
) -> Result<usize> {
    let deadline = tokio::time::Instant::now() + window;

    loop {
        match bus.subscriber_count(topic).await {
            Ok(count) if count > 0 => return Ok(count),
            Ok(_) => {}
            Err(e) => {
                warn!(topic = %topic, error = %e, "Subscriber discovery check failed");
            }
        }

        if tokio::time::Instant::now() + poll > deadline {
            return Err(FederationError::DiscoveryTimeout {
                topic: topic.to_string(),
            });
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_update_topic_format() {
        assert_eq!(update_topic("site-a"), "federation:updates:site-a");
    }

    #[tokio::test]
    async fn test_in_memory_publish_subscribe() {
        let bus = InMemoryBus::new();
        let mut rx = bus.subscribe("t1").await.unwrap();

        bus.publish("t1", b"hello".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_in_memory_multiple_subscribers() {
        let bus = InMemoryBus::new();
        let mut rx1 = bus.subscribe("t1").await.unwrap();
        let mut rx2 = bus.subscribe("t1").await.unwrap();

        bus.publish("t1", b"fanout".to_vec()).await.unwrap();
        assert_eq!(rx1.recv().await.unwrap(), b"fanout");
        assert_eq!(rx2.recv().await.unwrap(), b"fanout");
    }

    #[tokio::test]
    async fn test_in_memory_topics_are_isolated() {
        let bus = InMemoryBus::new();
        let mut rx1 = bus.subscribe("t1").await.unwrap();
        let _rx2 = bus.subscribe("t2").await.unwrap();

        bus.publish("t2", b"other".to_vec()).await.unwrap();
        bus.publish("t1", b"mine".to_vec()).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap(), b"mine");
    }

    #[tokio::test]
    async fn test_in_memory_subscriber_count() {
        let bus = InMemoryBus::new();
        assert_eq!(bus.subscriber_count("t1").await.unwrap(), 0);

        let rx1 = bus.subscribe("t1").await.unwrap();
        let rx2 = bus.subscribe("t1").await.unwrap();
        assert_eq!(bus.subscriber_count("t1").await.unwrap(), 2);

        drop(rx1);
        drop(rx2);
        assert_eq!(bus.subscriber_count("t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_in_memory_publish_no_subscribers_ok() {
        let bus = InMemoryBus::new();
        // Publishing into the void is not an error at this layer.
        bus.publish("t1", b"void".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_in_memory_dropped_subscriber_pruned() {
        let bus = InMemoryBus::new();
        let rx = bus.subscribe("t1").await.unwrap();
        drop(rx);

        bus.publish("t1", b"gone".to_vec()).await.unwrap();
        assert_eq!(bus.subscriber_count("t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_await_subscribers_immediate() {
        let bus = InMemoryBus::new();
        let _rx = bus.subscribe("t1").await.unwrap();

        let count = await_subscribers(
            &bus,
            "t1",
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_await_subscribers_times_out() {
        let bus = InMemoryBus::new();

        let err = await_subscribers(
            &bus,
            "t1",
            Duration::from_millis(100),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FederationError::DiscoveryTimeout { .. }));
    }

    #[tokio::test]
    async fn test_await_subscribers_late_arrival() {
        let bus = std::sync::Arc::new(InMemoryBus::new());
        let bus2 = std::sync::Arc::clone(&bus);

        let waiter = tokio::spawn(async move {
            await_subscribers(
                bus2.as_ref(),
                "t1",
                Duration::from_secs(2),
                Duration::from_millis(10),
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _rx = bus.subscribe("t1").await.unwrap();

        let count = waiter.await.unwrap().unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_redis_bus_invalid_url() {
        let err = RedisMessageBus::new("not a url").unwrap_err();
        assert!(matches!(err, FederationError::Config(_)));
    }
}
