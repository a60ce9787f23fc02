// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message-bus transport.
//!
//! Two phases per edge:
//!
//! 1. **Historical sync**: for a bounded wall-clock window (default 60s,
//!    polling every 3s), pull the followed node's current head state and
//!    run it through reconciliation. The window is a timeout abort, not a
//!    success condition — a huge remote just gets a partial catch-up that
//!    later passes finish.
//! 2. **Live phase**: subscribe to the node's update topic and convert
//!    each [`UpdateMessage`] into a delivery. Malformed payloads are
//!    dropped and logged; the subscription continues.
//!
//! The outbound half, [`UpdatePublisher`], publishes local changes to this
//! node's own topic — but first checks that anyone is subscribed, waiting
//! through a short discovery window before giving up, so nodes do not
//! publish into the void.
//!
//! Applied-update checkpoints are advisory: a restart without one simply
//! replays recent updates, which idempotent reconciliation absorbs.

use crate::bus::{await_subscribers, update_topic, MessageBus};
use crate::checkpoint::CheckpointStore;
use crate::config::{HistoricalSyncConfig, PublisherConfig, TransportKind};
use crate::error::{FederationError, Result};
use crate::model::{ContentItem, FollowEdge, UpdateMessage};
use crate::registry::StoreRegistry;
use crate::store::BoxFuture;
use crate::transport::{parse_content_items, Delivery, Transport, TransportHandle};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

/// Shared, late-bound checkpoint store handle.
///
/// The engine opens the SQLite store during `start()`; the transport is
/// constructed before that, so it holds the slot rather than the store.
pub type SharedCheckpoints = Arc<RwLock<Option<Arc<CheckpointStore>>>>;

/// Historical + live delivery over a pub/sub bus.
pub struct BusTransport {
    bus: Arc<dyn MessageBus>,
    registry: Arc<StoreRegistry>,
    checkpoints: SharedCheckpoints,
    historical: HistoricalSyncConfig,
}

impl BusTransport {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<StoreRegistry>,
        checkpoints: SharedCheckpoints,
        historical: HistoricalSyncConfig,
    ) -> Self {
        Self {
            bus,
            registry,
            checkpoints,
            historical,
        }
    }
}

impl Transport for BusTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::MessageBus
    }

    fn start(
        &self,
        edge: &FollowEdge,
        deliveries: mpsc::Sender<Delivery>,
    ) -> BoxFuture<'_, Result<TransportHandle>> {
        let edge = edge.clone();
        Box::pin(async move {
            // Subscribe before the historical phase starts so no update
            // falls between the two.
            let topic = update_topic(&edge.target_address);
            let subscription = self.bus.subscribe(&topic).await?;

            let mut handle = TransportHandle::new(TransportKind::MessageBus);

            info!(
                edge_id = %edge.id,
                target = %edge.target_address,
                topic = %topic,
                "Message-bus transport attached"
            );

            let checkpoints = {
                let slot = self.checkpoints.read().await;
                slot.clone()
            };

            handle.push(tokio::spawn(run_live_phase(
                edge.clone(),
                subscription,
                deliveries.clone(),
                checkpoints,
                handle.cancel_rx(),
            )));

            if self.historical.enabled {
                handle.push(tokio::spawn(run_historical_sync(
                    edge,
                    Arc::clone(&self.registry),
                    self.historical.clone(),
                    deliveries,
                    handle.cancel_rx(),
                )));
            }

            Ok(handle)
        })
    }
}

/// Live phase: decode update messages into deliveries until cancelled.
async fn run_live_phase(
    edge: FollowEdge,
    mut subscription: mpsc::Receiver<Vec<u8>>,
    deliveries: mpsc::Sender<Delivery>,
    checkpoints: Option<Arc<CheckpointStore>>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            payload = subscription.recv() => {
                let Some(payload) = payload else {
                    // Bus connection gone; the session's health check will
                    // notice the silence and reconnect.
                    warn!(edge_id = %edge.id, "Bus subscription ended");
                    break;
                };

                let message = match UpdateMessage::from_bytes(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(edge_id = %edge.id, error = %e, "Dropping malformed update message");
                        crate::metrics::record_bus_message_dropped(&edge.id, "format");
                        continue;
                    }
                };

                if message.site != edge.target_address {
                    debug!(
                        edge_id = %edge.id,
                        claimed = %message.site,
                        "Dropping update message from unexpected site"
                    );
                    crate::metrics::record_bus_message_dropped(&edge.id, "site_mismatch");
                    continue;
                }

                // Strictly-older messages were applied before a restart.
                // The boundary message replays; reconciliation de-dupes it.
                if let Some(store) = &checkpoints {
                    if let Some(applied) = store.get(&edge.id).await {
                        if message.timestamp < applied {
                            debug!(edge_id = %edge.id, ts = message.timestamp, "Skipping already-applied update");
                            crate::metrics::record_bus_message_dropped(&edge.id, "stale");
                            continue;
                        }
                    }
                }

                let timestamp = message.timestamp;
                let delivery = Delivery {
                    edge_id: edge.id.clone(),
                    added: message.added,
                    removed: message.removed,
                    realtime: true,
                };
                if delivery.is_empty() {
                    continue;
                }
                if deliveries.send(delivery).await.is_err() {
                    break;
                }

                if let Some(store) = &checkpoints {
                    store.set(&edge.id, timestamp).await;
                }
            }
        }
    }
}

/// Historical phase: poll the target's head state inside a bounded window.
async fn run_historical_sync(
    edge: FollowEdge,
    registry: Arc<StoreRegistry>,
    config: HistoricalSyncConfig,
    deliveries: mpsc::Sender<Delivery>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let deadline = tokio::time::Instant::now() + config.window();
    let mut polls = 0usize;

    info!(
        edge_id = %edge.id,
        window_sec = config.window_sec,
        "Historical sync started"
    );

    loop {
        match registry.fetch_head(&edge.target_address).await {
            Ok(docs) => {
                polls += 1;
                let added = parse_content_items(docs);
                crate::metrics::record_historical_poll(&edge.id, added.len());

                if !added.is_empty() {
                    let delivery = Delivery {
                        edge_id: edge.id.clone(),
                        added,
                        removed: vec![],
                        realtime: false,
                    };
                    if deliveries.send(delivery).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                // Transient by definition here; the next poll retries.
                warn!(edge_id = %edge.id, error = %e, "Historical poll failed");
            }
        }

        let next_poll = tokio::time::Instant::now() + config.poll_interval();
        if next_poll >= deadline {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep_until(next_poll) => {}
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    debug!(edge_id = %edge.id, "Historical sync cancelled");
                    return;
                }
            }
        }
    }

    info!(edge_id = %edge.id, polls, "Historical sync window closed");
}

// =============================================================================
// Outbound publishing
// =============================================================================

/// Publishes the local node's changes to its own update topic.
pub struct UpdatePublisher {
    bus: Arc<dyn MessageBus>,
    local_address: String,
    config: PublisherConfig,
}

impl UpdatePublisher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        local_address: impl Into<String>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            bus,
            local_address: local_address.into(),
            config,
        }
    }

    /// The topic this publisher writes to.
    pub fn topic(&self) -> String {
        update_topic(&self.local_address)
    }

    /// Publish one change batch.
    ///
    /// When nobody is subscribed, waits through the discovery window for a
    /// subscriber to appear, then gives up quietly — the update is not
    /// lost, followers catch it on their next historical sync.
    pub async fn publish(
        &self,
        added: Vec<ContentItem>,
        removed: Vec<ContentItem>,
    ) -> Result<()> {
        if !self.config.enabled || (added.is_empty() && removed.is_empty()) {
            return Ok(());
        }

        let topic = self.topic();
        match await_subscribers(
            self.bus.as_ref(),
            &topic,
            self.config.discovery_window(),
            self.config.discovery_poll(),
        )
        .await
        {
            Ok(subscribers) => {
                debug!(topic = %topic, subscribers, "Publishing update");
            }
            Err(FederationError::DiscoveryTimeout { .. }) => {
                debug!(topic = %topic, "No subscribers found, skipping publish");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let message = UpdateMessage {
            site: self.local_address.clone(),
            added,
            removed,
            timestamp: crate::model::epoch_millis(),
        };

        self.bus.publish(&topic, message.to_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::registry::InMemoryDirectory;
    use crate::store::{DocumentStore, MemoryDocumentStore};
    use serde_json::json;
    use std::time::Duration;

    fn empty_checkpoints() -> SharedCheckpoints {
        Arc::new(RwLock::new(None))
    }

    fn test_edge() -> FollowEdge {
        FollowEdge::new("site-b", "Site B", false)
    }

    fn content_doc(id: &str) -> serde_json::Value {
        json!({
            "id": id, "name": format!("name-{id}"),
            "category_id": "c", "content_locator": format!("loc-{id}")
        })
    }

    fn transport(bus: Arc<InMemoryBus>, directory: Arc<InMemoryDirectory>) -> BusTransport {
        BusTransport::new(
            bus,
            Arc::new(StoreRegistry::new(directory)),
            empty_checkpoints(),
            HistoricalSyncConfig::for_testing(),
        )
    }

    #[tokio::test]
    async fn test_live_phase_delivers_updates() {
        let bus = Arc::new(InMemoryBus::new());
        let directory = Arc::new(InMemoryDirectory::new());
        directory.register("site-b", MemoryDocumentStore::shared());

        let transport = transport(bus.clone(), directory);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = transport.start(&test_edge(), tx).await.unwrap();

        let message = UpdateMessage {
            site: "site-b".to_string(),
            added: vec![ContentItem::new("r1", "X", "c", "loc1")],
            removed: vec![],
            timestamp: 1,
        };
        bus.publish(&update_topic("site-b"), message.to_bytes())
            .await
            .unwrap();

        // The historical phase may deliver (empty remote head produces
        // nothing), so the first delivery is the live one.
        let delivery = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(delivery.realtime);
        assert_eq!(delivery.added[0].id, "r1");

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_live_phase_drops_malformed_and_continues() {
        let bus = Arc::new(InMemoryBus::new());
        let directory = Arc::new(InMemoryDirectory::new());
        directory.register("site-b", MemoryDocumentStore::shared());

        let transport = transport(bus.clone(), directory);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = transport.start(&test_edge(), tx).await.unwrap();

        let topic = update_topic("site-b");
        bus.publish(&topic, b"not json at all".to_vec()).await.unwrap();

        let message = UpdateMessage {
            site: "site-b".to_string(),
            added: vec![ContentItem::new("r2", "Y", "c", "loc2")],
            removed: vec![],
            timestamp: 2,
        };
        bus.publish(&topic, message.to_bytes()).await.unwrap();

        // The malformed payload is skipped; the good one arrives.
        let delivery = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.added[0].id, "r2");

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_live_phase_drops_site_mismatch() {
        let bus = Arc::new(InMemoryBus::new());
        let directory = Arc::new(InMemoryDirectory::new());
        directory.register("site-b", MemoryDocumentStore::shared());

        let transport = transport(bus.clone(), directory);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = transport.start(&test_edge(), tx).await.unwrap();

        let topic = update_topic("site-b");
        let spoofed = UpdateMessage {
            site: "site-z".to_string(),
            added: vec![ContentItem::new("bad", "X", "c", "loc")],
            removed: vec![],
            timestamp: 1,
        };
        bus.publish(&topic, spoofed.to_bytes()).await.unwrap();

        let genuine = UpdateMessage {
            site: "site-b".to_string(),
            added: vec![ContentItem::new("good", "X", "c", "loc")],
            removed: vec![],
            timestamp: 2,
        };
        bus.publish(&topic, genuine.to_bytes()).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.added[0].id, "good");

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_historical_sync_delivers_head_state() {
        let bus = Arc::new(InMemoryBus::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let remote = MemoryDocumentStore::shared();
        remote.put(content_doc("r1")).await.unwrap();
        remote.put(content_doc("r2")).await.unwrap();
        directory.register("site-b", remote);

        let transport = transport(bus, directory);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = transport.start(&test_edge(), tx).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!delivery.realtime);
        assert_eq!(delivery.added.len(), 2);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_historical_sync_window_closes() {
        let bus = Arc::new(InMemoryBus::new());
        let directory = Arc::new(InMemoryDirectory::new());
        directory.register("site-b", MemoryDocumentStore::shared());

        let transport = BusTransport::new(
            bus,
            Arc::new(StoreRegistry::new(directory)),
            empty_checkpoints(),
            HistoricalSyncConfig {
                enabled: true,
                window_sec: 1,
                poll_interval_sec: 1,
            },
        );

        let (tx, _rx) = mpsc::channel(16);
        let handle = transport.start(&test_edge(), tx).await.unwrap();

        // Give the window time to expire, then stop; the historical task
        // must already be finished (stop() would otherwise wait for it).
        tokio::time::sleep(Duration::from_millis(1500)).await;
        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("historical task should have ended with its window");
    }

    #[tokio::test]
    async fn test_checkpoint_skips_stale_updates() {
        let bus = Arc::new(InMemoryBus::new());
        let directory = Arc::new(InMemoryDirectory::new());
        directory.register("site-b", MemoryDocumentStore::shared());

        let dir = tempfile::tempdir().unwrap();
        let checkpoint_store = Arc::new(
            CheckpointStore::new(dir.path().join("cp.db")).await.unwrap(),
        );
        let edge = test_edge();
        checkpoint_store.set(&edge.id, 100).await;

        let transport = BusTransport::new(
            bus.clone(),
            Arc::new(StoreRegistry::new(directory)),
            Arc::new(RwLock::new(Some(checkpoint_store))),
            HistoricalSyncConfig {
                enabled: false,
                ..HistoricalSyncConfig::for_testing()
            },
        );

        let (tx, mut rx) = mpsc::channel(16);
        let handle = transport.start(&edge, tx).await.unwrap();

        let topic = update_topic("site-b");
        let stale = UpdateMessage {
            site: "site-b".to_string(),
            added: vec![ContentItem::new("old", "X", "c", "loc")],
            removed: vec![],
            timestamp: 50,
        };
        bus.publish(&topic, stale.to_bytes()).await.unwrap();

        let fresh = UpdateMessage {
            site: "site-b".to_string(),
            added: vec![ContentItem::new("new", "X", "c", "loc")],
            removed: vec![],
            timestamp: 200,
        };
        bus.publish(&topic, fresh.to_bytes()).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.added[0].id, "new");

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_publisher_publishes_with_subscriber() {
        let bus = Arc::new(InMemoryBus::new());
        let mut subscription = bus.subscribe(&update_topic("site-a")).await.unwrap();

        let publisher = UpdatePublisher::new(
            bus.clone(),
            "site-a",
            PublisherConfig::for_testing(),
        );

        publisher
            .publish(vec![ContentItem::new("r1", "X", "c", "loc1")], vec![])
            .await
            .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        let message = UpdateMessage::from_bytes(&payload).unwrap();
        assert_eq!(message.site, "site-a");
        assert_eq!(message.added.len(), 1);
        assert!(message.timestamp > 0);
    }

    #[tokio::test]
    async fn test_publisher_gives_up_quietly_without_subscribers() {
        let bus = Arc::new(InMemoryBus::new());
        let publisher = UpdatePublisher::new(
            bus,
            "site-a",
            PublisherConfig {
                enabled: true,
                discovery_window_sec: 1,
                discovery_poll_ms: 50,
            },
        );

        // No subscriber ever appears: publish returns Ok after the window.
        let started = std::time::Instant::now();
        publisher
            .publish(vec![ContentItem::new("r1", "X", "c", "loc1")], vec![])
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_publisher_skips_empty_batches() {
        let bus = Arc::new(InMemoryBus::new());
        let publisher = UpdatePublisher::new(bus, "site-a", PublisherConfig::default());

        // Returns immediately despite the default 5s discovery window.
        tokio::time::timeout(Duration::from_millis(100), publisher.publish(vec![], vec![]))
            .await
            .expect("empty publish should not wait for discovery")
            .unwrap();
    }

    #[tokio::test]
    async fn test_publisher_disabled() {
        let bus = Arc::new(InMemoryBus::new());
        let publisher = UpdatePublisher::new(
            bus,
            "site-a",
            PublisherConfig {
                enabled: false,
                ..PublisherConfig::default()
            },
        );

        tokio::time::timeout(
            Duration::from_millis(100),
            publisher.publish(vec![ContentItem::new("r1", "X", "c", "loc1")], vec![]),
        )
        .await
        .expect("disabled publisher should return immediately")
        .unwrap();
    }
}
