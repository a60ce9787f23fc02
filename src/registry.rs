//! Remote collection access: the node directory and the store registry.
//!
//! The directory is the boundary to transport-level peer discovery and
//! dialing, which this crate does not implement. Given a federation
//! address, the collaborator can:
//!
//! - [`open`](NodeDirectory::open) a remote node's collection so that its
//!   change events fire locally (the real-time transport's requirement),
//! - [`open_replica`](NodeDirectory::open_replica) a complete, durable local
//!   replica (the full-mirror transport's requirement), or
//! - [`fetch_head`](NodeDirectory::fetch_head) the node's current head state
//!   once (the message-bus historical sync and session initial sync).
//!
//! The [`StoreRegistry`] caches opened stores per address, constructed once
//! per node and passed by handle to every session. There is deliberately no
//! process-global instance; lifecycle is tied to the owning engine.

use crate::error::{FederationError, Result};
use crate::store::{BoxFuture, DocumentStore, MemoryDocumentStore, Query};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Boundary to the external peer discovery/dialing layer.
pub trait NodeDirectory: Send + Sync + 'static {
    /// Open (mirror) a remote node's content collection locally.
    ///
    /// The returned store fires `changes()` for remote writes. Expensive:
    /// the remote node's full state must be held open.
    fn open(&self, address: &str) -> BoxFuture<'_, Result<Arc<dyn DocumentStore>>>;

    /// Open a complete local replica of a remote node's collection.
    ///
    /// Like [`open`](Self::open) but with full durability: every record is
    /// pinned locally. Only replicator nodes should use this.
    fn open_replica(&self, address: &str) -> BoxFuture<'_, Result<Arc<dyn DocumentStore>>>;

    /// Fetch the node's current head state in one shot.
    fn fetch_head(&self, address: &str) -> BoxFuture<'_, Result<Vec<Value>>>;
}

/// Per-engine cache of opened remote stores, keyed by node address.
///
/// Opening a remote collection is expensive, and several components may
/// need the same one (a session's transport plus its initial sync). The
/// registry opens each address at most once and hands out shared handles;
/// [`evict`](Self::evict) drops the cached handle when an edge goes away.
pub struct StoreRegistry {
    directory: Arc<dyn NodeDirectory>,
    opened: DashMap<String, Arc<dyn DocumentStore>>,
    replicas: DashMap<String, Arc<dyn DocumentStore>>,
}

impl StoreRegistry {
    pub fn new(directory: Arc<dyn NodeDirectory>) -> Self {
        Self {
            directory,
            opened: DashMap::new(),
            replicas: DashMap::new(),
        }
    }

    /// Open (or reuse) the mirrored collection for `address`.
    pub async fn open(&self, address: &str) -> Result<Arc<dyn DocumentStore>> {
        if let Some(store) = self.opened.get(address) {
            return Ok(store.value().clone());
        }

        let store = self.directory.open(address).await?;
        debug!(address = %address, "Opened remote collection");
        self.opened.insert(address.to_string(), store.clone());
        Ok(store)
    }

    /// Open (or reuse) a full replica for `address`.
    pub async fn open_replica(&self, address: &str) -> Result<Arc<dyn DocumentStore>> {
        if let Some(store) = self.replicas.get(address) {
            return Ok(store.value().clone());
        }

        let store = self.directory.open_replica(address).await?;
        debug!(address = %address, "Opened full replica");
        self.replicas.insert(address.to_string(), store.clone());
        Ok(store)
    }

    /// Fetch `address`'s current head state without caching anything.
    pub async fn fetch_head(&self, address: &str) -> Result<Vec<Value>> {
        self.directory.fetch_head(address).await
    }

    /// Drop cached handles for `address` (after its edge is removed).
    pub fn evict(&self, address: &str) {
        self.opened.remove(address);
        self.replicas.remove(address);
    }

    /// Number of cached handles (mirrors + replicas).
    pub fn open_count(&self) -> usize {
        self.opened.len() + self.replicas.len()
    }
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// An in-memory directory for testing and standalone mode.
///
/// Every registered "node" is a [`MemoryDocumentStore`]; opening a node
/// simply hands back its store, which makes multi-node federation
/// scenarios runnable in-process.
pub struct InMemoryDirectory {
    nodes: DashMap<String, Arc<MemoryDocumentStore>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    /// Register `store` as the content collection at `address`.
    pub fn register(&self, address: &str, store: Arc<MemoryDocumentStore>) {
        self.nodes.insert(address.to_string(), store);
    }

    /// Remove a node (subsequent opens fail as unreachable).
    pub fn unregister(&self, address: &str) {
        self.nodes.remove(address);
    }

    fn lookup(&self, address: &str) -> Result<Arc<MemoryDocumentStore>> {
        self.nodes
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FederationError::connection(address, "unknown address"))
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeDirectory for InMemoryDirectory {
    fn open(&self, address: &str) -> BoxFuture<'_, Result<Arc<dyn DocumentStore>>> {
        let address = address.to_string();
        Box::pin(async move {
            let store = self.lookup(&address)?;
            Ok(store as Arc<dyn DocumentStore>)
        })
    }

    fn open_replica(&self, address: &str) -> BoxFuture<'_, Result<Arc<dyn DocumentStore>>> {
        // In-process there is no distinction between a mirror and a replica.
        self.open(address)
    }

    fn fetch_head(&self, address: &str) -> BoxFuture<'_, Result<Vec<Value>>> {
        let address = address.to_string();
        Box::pin(async move {
            let store = self.lookup(&address)?;
            Ok(store.search(Query::all()).await?)
        })
    }
}
