//! Shared test fixtures: an in-process federation network.
//!
//! Builds multiple "nodes" over one [`InMemoryDirectory`] and one
//! [`InMemoryBus`], so multi-hop federation scenarios run without any
//! external service.

#![allow(dead_code)] // Not every test file uses every helper.

use federation_engine::bus::InMemoryBus;
use federation_engine::config::{FederationConfig, TransportKind};
use federation_engine::engine::{Collaborators, FederationEngine};
use federation_engine::model::ContentItem;
use federation_engine::registry::InMemoryDirectory;
use federation_engine::store::{DocumentStore, MemoryDocumentStore};
use federation_engine::Identity;
use std::sync::Arc;
use std::time::Duration;

/// Opt-in test logging: `RUST_LOG=federation_engine=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The shared fabric every node plugs into.
pub struct TestNetwork {
    pub directory: Arc<InMemoryDirectory>,
    pub bus: Arc<InMemoryBus>,
}

impl TestNetwork {
    pub fn new() -> Self {
        init_tracing();
        Self {
            directory: Arc::new(InMemoryDirectory::new()),
            bus: Arc::new(InMemoryBus::new()),
        }
    }

    /// Spawn a started node on this network.
    pub async fn spawn_node(
        &self,
        address: &str,
        transport: TransportKind,
        with_index: bool,
    ) -> TestNode {
        let content = MemoryDocumentStore::shared();
        self.directory.register(address, content.clone());

        let index_store = with_index.then(MemoryDocumentStore::shared);

        let mut config = FederationConfig::for_testing(address);
        config.transport = transport;

        let engine = FederationEngine::new(
            config,
            Collaborators {
                content: content.clone(),
                follows: MemoryDocumentStore::shared(),
                index: index_store
                    .clone()
                    .map(|s| s as Arc<dyn DocumentStore>),
                directory: self.directory.clone(),
                bus: Some(self.bus.clone()),
                identity: Identity::new(address),
            },
        )
        .expect("engine construction");
        engine.start().await.expect("engine start");

        TestNode {
            address: address.to_string(),
            content,
            index_store,
            engine,
        }
    }
}

/// One federation participant.
pub struct TestNode {
    pub address: String,
    pub content: Arc<MemoryDocumentStore>,
    pub index_store: Option<Arc<MemoryDocumentStore>>,
    pub engine: FederationEngine,
}

impl TestNode {
    /// Author an item locally (no provenance).
    pub async fn publish(&self, item: ContentItem) {
        self.content
            .put(serde_json::to_value(&item).unwrap())
            .await
            .expect("local publish");
    }

    /// Delete an item from the local collection.
    pub async fn delete(&self, id: &str) {
        self.content.del(id).await.expect("local delete");
    }

    /// Fetch a typed local copy, if present.
    pub async fn item(&self, id: &str) -> Option<ContentItem> {
        self.content
            .get(id)
            .await
            .ok()
            .flatten()
            .and_then(|doc| serde_json::from_value(doc).ok())
    }
}

/// A locally authored content item.
pub fn item(id: &str, name: &str, category: &str) -> ContentItem {
    ContentItem::new(id, name, category, format!("loc-{id}"))
}

/// Poll until `predicate` returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Poll until the node holds an item with this id.
pub async fn wait_for_item(node: &TestNode, id: &str, timeout: Duration) -> bool {
    wait_until(timeout, || async { node.item(id).await.is_some() }).await
}

/// Poll until the node no longer holds an item with this id.
pub async fn wait_for_absence(node: &TestNode, id: &str, timeout: Duration) -> bool {
    wait_until(timeout, || async { node.item(id).await.is_none() }).await
}
