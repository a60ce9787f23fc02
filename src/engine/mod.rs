// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Federation engine orchestrator.
//!
//! The main coordinator that ties together:
//! - The follow graph via [`crate::graph::FollowGraph`]
//! - Per-edge sessions via [`crate::session::SessionManager`]
//! - Transport strategies via [`crate::transport`]
//! - The federation index via [`crate::index::FederationIndex`]
//! - Checkpoint persistence via [`crate::checkpoint::CheckpointStore`]
//!
//! # Lifecycle
//!
//! 1. `new()` wires the collaborators (content store, node directory, bus,
//!    identity) into the engine. Nothing runs yet.
//! 2. `start()` opens the checkpoint store, reloads persisted follow edges
//!    and rebuilds their sessions (session state is transient by design),
//!    then spawns the local update publisher.
//! 3. Operator calls (`add_follow_edge`, index queries, `health_check`)
//!    arrive while running.
//! 4. `shutdown()` drains sessions and background tasks.
//!
//! Nothing here may take down the host process: mutations return typed
//! errors, queries degrade, and background failures are logged and retried.

mod types;

pub use types::{EngineState, FederationHealth};

use crate::auth::{FollowListAuthorizer, Identity};
use crate::bus::MessageBus;
use crate::checkpoint::CheckpointStore;
use crate::config::{FederationConfig, TransportKind};
use crate::error::{FederationError, Result};
use crate::graph::FollowGraph;
use crate::index::{FederationIndex, IndexQuery, IndexStats};
use crate::model::{FederationIndexEntry, FollowEdge};
use crate::reconcile::Reconciler;
use crate::registry::{NodeDirectory, StoreRegistry};
use crate::session::{SessionManager, SessionStatus};
use crate::store::{ChangeBatch, DocumentStore};
use crate::transport::bus::{BusTransport, SharedCheckpoints, UpdatePublisher};
use crate::transport::mirror::MirrorTransport;
use crate::transport::realtime::RealtimeTransport;
use crate::transport::{parse_content_items, Transport};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, error, info, warn};

/// External collaborators handed to the engine by the host daemon.
pub struct Collaborators {
    /// The node's content collection.
    pub content: Arc<dyn DocumentStore>,
    /// Collection holding persisted follow edges.
    pub follows: Arc<dyn DocumentStore>,
    /// Collection backing the federation index, when this node keeps one.
    pub index: Option<Arc<dyn DocumentStore>>,
    /// Peer discovery/dialing boundary.
    pub directory: Arc<dyn NodeDirectory>,
    /// Message bus, required for the message-bus transport.
    pub bus: Option<Arc<dyn MessageBus>>,
    /// The local node's identity.
    pub identity: Identity,
}

/// The main federation engine.
///
/// One instance per node, owning every session, constructed once at node
/// startup and shut down with it.
pub struct FederationEngine {
    config: FederationConfig,
    identity: Identity,
    content: Arc<dyn DocumentStore>,
    graph: Arc<FollowGraph>,
    registry: Arc<StoreRegistry>,
    bus: Option<Arc<dyn MessageBus>>,
    index: Option<Arc<FederationIndex>>,
    sessions: Arc<SessionManager>,
    /// Addresses this node follows; shared with the index write policy.
    followed: Arc<RwLock<HashSet<String>>>,
    checkpoints: SharedCheckpoints,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    background: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for FederationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationEngine")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FederationEngine {
    /// Wire up an engine from config and collaborators.
    ///
    /// Fails fast on impossible configurations (message-bus transport with
    /// no bus collaborator).
    pub fn new(config: FederationConfig, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            content,
            follows,
            index,
            directory,
            bus,
            identity,
        } = collaborators;

        let followed = Arc::new(RwLock::new(HashSet::new()));
        let index = index.map(|store| {
            Arc::new(FederationIndex::new(
                store,
                Arc::new(FollowListAuthorizer::new(
                    identity.public_key.clone(),
                    Arc::clone(&followed),
                )),
            ))
        });

        let registry = Arc::new(StoreRegistry::new(directory));
        let graph = Arc::new(FollowGraph::new(config.local_address.clone(), follows));
        let reconciler = Arc::new(Reconciler::new(
            config.local_address.clone(),
            Arc::clone(&content),
            index.clone(),
            config.settings.reconcile.clone(),
        ));

        let checkpoints: SharedCheckpoints = Arc::new(RwLock::new(None));
        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Realtime => Arc::new(RealtimeTransport::new(Arc::clone(&registry))),
            TransportKind::FullMirror => Arc::new(MirrorTransport::new(Arc::clone(&registry))),
            TransportKind::MessageBus => {
                let Some(bus) = bus.clone() else {
                    return Err(FederationError::Config(
                        "message_bus transport requires a bus collaborator".to_string(),
                    ));
                };
                Arc::new(BusTransport::new(
                    bus,
                    Arc::clone(&registry),
                    Arc::clone(&checkpoints),
                    config.settings.historical.clone(),
                ))
            }
        };

        let sessions = Arc::new(SessionManager::new(
            config.settings.session.clone(),
            transport,
            reconciler,
            Arc::clone(&registry),
        ));

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            identity,
            content,
            graph,
            registry,
            bus,
            index,
            sessions,
            followed,
            checkpoints,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            background: RwLock::new(Vec::new()),
        })
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// A receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if the engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// The local node's federation address.
    pub fn local_address(&self) -> &str {
        &self.config.local_address
    }

    /// The local node's identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The store registry (for diagnostics).
    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the engine.
    ///
    /// 1. Opens the checkpoint store (message-bus transport only)
    /// 2. Reloads persisted follow edges and rebuilds their sessions
    /// 3. Spawns the local update publisher
    pub async fn start(&self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(FederationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            local_address = %self.config.local_address,
            transport = %self.config.transport,
            "Starting federation engine"
        );
        let _ = self.state_tx.send(EngineState::Starting);
        crate::metrics::set_engine_state("Starting");

        if self.config.transport == TransportKind::MessageBus {
            let store = match CheckpointStore::new(&self.config.checkpoint.sqlite_path).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!(error = %e, "Checkpoint store unusable");
                    let _ = self.state_tx.send(EngineState::Failed);
                    crate::metrics::set_engine_state("Failed");
                    return Err(e);
                }
            };
            *self.checkpoints.write().await = Some(Arc::clone(&store));
            self.spawn_checkpoint_flush_task(store).await;
        }

        // Session state is transient: rebuild every session from the
        // persisted follow edges.
        let edges = match self.graph.list().await {
            Ok(edges) => edges,
            Err(e) => {
                error!(error = %e, "Follow graph unreadable");
                let _ = self.state_tx.send(EngineState::Failed);
                crate::metrics::set_engine_state("Failed");
                return Err(e);
            }
        };
        {
            let mut followed = self.followed.write().await;
            followed.clear();
            for edge in &edges {
                followed.insert(edge.target_address.clone());
            }
        }
        let edge_count = edges.len();
        for edge in edges {
            self.sessions.start_session(edge);
        }

        if self.config.settings.publisher.enabled {
            if let Some(bus) = &self.bus {
                self.spawn_publisher_task(Arc::clone(bus)).await;
            }
        }

        let _ = self.state_tx.send(EngineState::Running);
        crate::metrics::set_engine_state("Running");
        info!(sessions = edge_count, "Federation engine running");
        Ok(())
    }

    /// Shutdown gracefully.
    ///
    /// 1. Signal background tasks to stop
    /// 2. Tear down all sessions (cancels timers, stops transports)
    /// 3. Drain background tasks with a bounded timeout
    /// 4. Flush and close the checkpoint store
    pub async fn shutdown(&self) {
        info!("Shutting down federation engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        crate::metrics::set_engine_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        self.sessions.stop_all().await;

        let handles: Vec<_> = {
            let mut guard = self.background.write().await;
            std::mem::take(&mut *guard)
        };
        let drain_timeout = std::time::Duration::from_secs(10);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Background task completed"),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Background task panicked"),
                Err(_) => warn!(task = i + 1, "Background task timed out during shutdown"),
            }
        }

        if let Some(store) = self.checkpoints.write().await.take() {
            store.close().await;
        }

        let _ = self.state_tx.send(EngineState::Stopped);
        crate::metrics::set_engine_state("Stopped");
        info!("Federation engine stopped");
    }

    /// Comprehensive health snapshot for monitoring endpoints.
    ///
    /// No network I/O; everything comes from cached internal state.
    pub fn health_check(&self) -> FederationHealth {
        let sessions = self.sessions.health();
        let sessions_total = sessions.len();
        let count = |status: SessionStatus| {
            sessions.iter().filter(|s| s.status == status).count()
        };

        FederationHealth {
            state: self.state(),
            ready: self.is_running(),
            sessions_total,
            sessions_active: count(SessionStatus::Active),
            sessions_degraded: count(SessionStatus::Degraded)
                + count(SessionStatus::Reconnecting),
            sessions_failed: count(SessionStatus::Failed),
            sessions,
        }
    }

    // =========================================================================
    // Follow graph operations
    // =========================================================================

    /// Follow another node.
    ///
    /// Persists the edge and, when the engine is running, opens its session
    /// immediately. Reports failures (self-follow, duplicate target, store
    /// trouble) as typed errors.
    pub async fn add_follow_edge(
        &self,
        target_address: &str,
        display_name: Option<&str>,
        recursive: bool,
    ) -> Result<FollowEdge> {
        let edge = self.graph.add(target_address, display_name, recursive).await?;

        self.followed
            .write()
            .await
            .insert(edge.target_address.clone());

        if self.is_running() {
            self.sessions.start_session(edge.clone());
        }

        Ok(edge)
    }

    /// Stop following by edge id.
    ///
    /// Tears the session down immediately; no further reconciliation for
    /// this edge. Content already imported stays (unfollow is not
    /// unimport).
    pub async fn remove_follow_edge(&self, id: &str) -> Result<()> {
        let edge = self.graph.remove(id).await?;

        self.followed.write().await.remove(&edge.target_address);
        self.sessions.remove_session(&edge.id).await;

        let checkpoints = self.checkpoints.read().await.clone();
        if let Some(store) = checkpoints {
            if let Err(e) = store.delete(&edge.id).await {
                warn!(edge_id = %edge.id, error = %e, "Checkpoint cleanup failed");
            }
        }

        Ok(())
    }

    /// All persisted follow edges.
    pub async fn follow_edges(&self) -> Result<Vec<FollowEdge>> {
        self.graph.list().await
    }

    /// Status of one edge's session, if it is live.
    pub fn session_status(&self, edge_id: &str) -> Option<SessionStatus> {
        self.sessions.session_status(edge_id)
    }

    // =========================================================================
    // Federation index queries
    // =========================================================================

    /// The index itself, when this node keeps one.
    pub fn federation_index(&self) -> Option<&Arc<FederationIndex>> {
        self.index.as_ref()
    }

    /// Newest index entries, windowed.
    pub async fn federation_index_recent(
        &self,
        limit: usize,
        offset: usize,
    ) -> Vec<FederationIndexEntry> {
        match &self.index {
            Some(index) => index.recent(limit, offset).await,
            None => self.no_index("recent"),
        }
    }

    /// Index entries in a category.
    pub async fn federation_index_by_category(
        &self,
        category_id: &str,
    ) -> Vec<FederationIndexEntry> {
        match &self.index {
            Some(index) => index.by_category(category_id).await,
            None => self.no_index("by_category"),
        }
    }

    /// Full-text search over index entry titles.
    pub async fn search_federation_index(&self, text: &str) -> Vec<FederationIndexEntry> {
        match &self.index {
            Some(index) => index.search_title(text).await,
            None => self.no_index("search"),
        }
    }

    /// Composite multi-predicate index query.
    pub async fn complex_federation_index_query(
        &self,
        query: IndexQuery,
    ) -> Vec<FederationIndexEntry> {
        match &self.index {
            Some(index) => index.query(query).await,
            None => self.no_index("complex"),
        }
    }

    /// Aggregate index statistics.
    pub async fn federation_index_stats(&self) -> IndexStats {
        match &self.index {
            Some(index) => index.stats().await,
            None => {
                debug!("No federation index configured");
                IndexStats::default()
            }
        }
    }

    fn no_index(&self, query: &str) -> Vec<FederationIndexEntry> {
        debug!(query, "No federation index configured");
        Vec::new()
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    /// Publish local content changes to this node's bus topic.
    async fn spawn_publisher_task(&self, bus: Arc<dyn MessageBus>) {
        let publisher = UpdatePublisher::new(
            bus,
            self.config.local_address.clone(),
            self.config.settings.publisher.clone(),
        );
        let changes = self.content.changes();
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(run_publisher(publisher, changes, shutdown_rx));
        info!("Spawned update publisher task");
        self.background.write().await.push(handle);
    }

    /// Periodically flush dirty checkpoints (debounced writes).
    async fn spawn_checkpoint_flush_task(&self, store: Arc<CheckpointStore>) {
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = store.flush_dirty().await {
                            warn!(error = %e, "Failed to flush checkpoints");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Checkpoint flush task stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!("Spawned checkpoint flush task");
        self.background.write().await.push(handle);
    }
}

/// Forward local change batches to the update publisher until shutdown.
async fn run_publisher(
    publisher: UpdatePublisher,
    mut changes: broadcast::Receiver<ChangeBatch>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            event = changes.recv() => match event {
                Ok(batch) => {
                    let added = parse_content_items(batch.added);
                    let removed = parse_content_items(batch.removed);
                    if added.is_empty() && removed.is_empty() {
                        continue;
                    }
                    if let Err(e) = publisher.publish(added, removed).await {
                        warn!(error = %e, "Update publish failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Publisher lagged behind local changes");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!("Update publisher task stopped");
}
