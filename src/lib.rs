//! # Federation Engine
//!
//! A federation synchronization engine for independently-owned content
//! nodes ("sites"): follow other nodes and continuously mirror their
//! published content — or pointers to it — into the local store, across
//! multiple hops, under churn, duplicate delivery and partial failure.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          federation-engine                               │
//! │                                                                          │
//! │  ┌──────────────┐    ┌────────────────┐    ┌──────────────────────────┐  │
//! │  │ FollowGraph  │───►│ SessionManager │───►│ Transport (one of three) │  │
//! │  │ (persisted   │    │ (per-edge      │    │ realtime / message bus / │  │
//! │  │  edges)      │    │  state machine)│    │ full mirror              │  │
//! │  └──────────────┘    └────────────────┘    └────────────┬─────────────┘  │
//! │                               │                         │ deliveries     │
//! │                               ▼                         ▼                │
//! │  ┌──────────────┐    ┌─────────────────────────────────────────────┐     │
//! │  │ Federation   │◄───│ Reconciler (filter, dedup, provenance,      │     │
//! │  │ Index        │    │ eviction guard — transport-agnostic)        │     │
//! │  └──────────────┘    └─────────────────────────────────────────────┘     │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Transport Strategies
//!
//! 1. **Real-time events**: change listener on the followed node's opened
//!    collection. Zero added latency, highest resource cost.
//! 2. **Message bus**: bounded historical catch-up plus a live per-node
//!    pub/sub topic. Cheap, eventually consistent.
//! 3. **Full mirror**: a complete local replica, for replicator nodes.
//!
//! All three feed the same reconciliation engine and converge on the same
//! store state.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use federation_engine::{Collaborators, FederationConfig, FederationEngine, Identity};
//! use federation_engine::registry::InMemoryDirectory;
//! use federation_engine::store::MemoryDocumentStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> federation_engine::Result<()> {
//!     let engine = FederationEngine::new(
//!         FederationConfig::for_testing("site-a"),
//!         Collaborators {
//!             content: MemoryDocumentStore::shared(),
//!             follows: MemoryDocumentStore::shared(),
//!             index: Some(MemoryDocumentStore::shared()),
//!             directory: Arc::new(InMemoryDirectory::new()),
//!             bus: None,
//!             identity: Identity::new("site-a"),
//!         },
//!     )?;
//!
//!     engine.start().await?;
//!     let edge = engine.add_follow_edge("site-b", Some("Site B"), false).await?;
//!     println!("following {}", edge.target_address);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod bus;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod index;
pub mod metrics;
pub mod model;
pub mod reconcile;
pub mod registry;
pub mod resilience;
pub mod session;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use auth::{Identity, WriteAuthorizer};
pub use bus::{InMemoryBus, MessageBus, RedisMessageBus};
pub use checkpoint::CheckpointStore;
pub use config::{FederationConfig, FederationSettings, SessionConfig, TransportKind};
pub use engine::{Collaborators, EngineState, FederationEngine, FederationHealth};
pub use error::{FederationError, Result};
pub use graph::FollowGraph;
pub use index::{FederationIndex, IndexQuery, IndexStats};
pub use model::{ContentItem, FederationIndexEntry, FollowEdge, UpdateMessage};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use registry::{NodeDirectory, StoreRegistry};
pub use session::{SessionManager, SessionStatus};
pub use store::{DocumentStore, MemoryDocumentStore};
pub use transport::{Delivery, Transport, TransportHandle};
