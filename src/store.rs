// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content store integration traits.
//!
//! Defines the interface this crate needs from the external replicated
//! document store. The store owns persistence, conflict resolution and the
//! access-control enforcement mechanism; we only need a handful of
//! operations at the boundary.
//!
//! The daemon provides an implementation of [`DocumentStore`], allowing us
//! to test with [`MemoryDocumentStore`] and decoupling us from the store's
//! internals.
//!
//! # Example
//!
//! ```rust
//! use federation_engine::store::{DocumentStore, MemoryDocumentStore, Query};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), federation_engine::store::StoreError> {
//! let store = MemoryDocumentStore::new();
//! store.put(json!({"id": "r1", "name": "X"})).await?;
//!
//! let hits = store.search(Query::all().field_eq("name", json!("X"))).await?;
//! assert_eq!(hits.len(), 1);
//! # Ok(())
//! # }
//! ```

use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors surfaced by the content-store collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Store unreachable or momentarily overloaded (retryable upstream).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Sentinel corruption detected on read.
    #[error("store corrupted: {0}")]
    Corrupted(String),
    /// The store's access-control engine rejected the write.
    #[error("write denied for {0}")]
    Denied(String),
    /// The document is structurally unusable (e.g. missing its id).
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

/// Receipt for a successful put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    /// Content hash of the stored document.
    pub hash: String,
}

/// One batch of change events from the store.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub added: Vec<Value>,
    pub removed: Vec<Value>,
}

/// A filter over documents.
///
/// Deliberately small: equality, presence and a limit. Anything richer
/// (tags, substring search, time ranges) belongs to the federation index,
/// which filters on its own typed records.
#[derive(Debug, Clone, Default)]
pub struct Query {
    clauses: Vec<Clause>,
    limit: Option<usize>,
}

#[derive(Debug, Clone)]
enum Clause {
    FieldEq(String, Value),
    FieldMissing(String),
    FieldPresent(String),
}

impl Query {
    /// Match every document.
    pub fn all() -> Self {
        Self::default()
    }

    /// Require `field == value`.
    pub fn field_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.clauses.push(Clause::FieldEq(field.into(), value));
        self
    }

    /// Require `field` to be absent or null.
    pub fn field_missing(mut self, field: impl Into<String>) -> Self {
        self.clauses.push(Clause::FieldMissing(field.into()));
        self
    }

    /// Require `field` to be present and non-null.
    pub fn field_present(mut self, field: impl Into<String>) -> Self {
        self.clauses.push(Clause::FieldPresent(field.into()));
        self
    }

    /// Cap the number of results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The configured result cap, if any.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Whether `doc` satisfies every clause.
    pub fn matches(&self, doc: &Value) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::FieldEq(field, value) => doc.get(field) == Some(value),
            Clause::FieldMissing(field) => {
                matches!(doc.get(field), None | Some(Value::Null))
            }
            Clause::FieldPresent(field) => {
                !matches!(doc.get(field), None | Some(Value::Null))
            }
        })
    }
}

/// Batched iteration over a query's results.
pub trait DocCursor: Send {
    /// Fetch up to `batch_size` more documents.
    fn next(&mut self, batch_size: usize) -> BoxFuture<'_, StoreResult<Vec<Value>>>;

    /// True once the cursor is exhausted.
    fn done(&self) -> bool;
}

/// Trait defining what we need from the content store.
///
/// All documents carry a string `id` field; `put` upserts by that id.
/// Change notifications are broadcast so any number of listeners (the
/// real-time transport, the update publisher) can observe the same stream.
pub trait DocumentStore: std::fmt::Debug + Send + Sync + 'static {
    /// Upsert a document. Returns the stored content hash.
    fn put(&self, doc: Value) -> BoxFuture<'_, StoreResult<PutReceipt>>;

    /// Delete by id. Returns whether a document existed.
    fn del(&self, id: &str) -> BoxFuture<'_, StoreResult<bool>>;

    /// Fetch a single document by id.
    fn get(&self, id: &str) -> BoxFuture<'_, StoreResult<Option<Value>>>;

    /// Fetch all documents matching `query`.
    fn search(&self, query: Query) -> BoxFuture<'_, StoreResult<Vec<Value>>>;

    /// Iterate documents matching `query` in batches.
    fn iterate(&self, query: Query) -> BoxFuture<'_, StoreResult<Box<dyn DocCursor>>>;

    /// Subscribe to change events.
    fn changes(&self) -> broadcast::Receiver<ChangeBatch>;
}

/// Extract the required string `id` field from a document.
pub fn doc_id(doc: &Value) -> StoreResult<String> {
    doc.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::InvalidDocument("document missing string id".to_string()))
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// An in-memory [`DocumentStore`] for testing and standalone mode.
///
/// Faults are injectable so callers' degraded paths are testable:
/// [`set_corrupted`](Self::set_corrupted) makes every read return the
/// corruption sentinel, and [`set_denying`](Self::set_denying) makes every
/// write come back as an access-control denial.
#[derive(Debug)]
pub struct MemoryDocumentStore {
    docs: RwLock<BTreeMap<String, Value>>,
    changes_tx: broadcast::Sender<ChangeBatch>,
    corrupted: AtomicBool,
    denying: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(256);
        Self {
            docs: RwLock::new(BTreeMap::new()),
            changes_tx,
            corrupted: AtomicBool::new(false),
            denying: AtomicBool::new(false),
        }
    }

    /// Convenience constructor returning an `Arc`.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make all reads fail with the corruption sentinel.
    pub fn set_corrupted(&self, corrupted: bool) {
        self.corrupted.store(corrupted, Ordering::SeqCst);
    }

    /// Make all writes fail as access-control denials.
    pub fn set_denying(&self, denying: bool) {
        self.denying.store(denying, Ordering::SeqCst);
    }

    /// Number of stored documents.
    pub async fn doc_count(&self) -> usize {
        self.docs.read().await.len()
    }

    fn check_read(&self) -> StoreResult<()> {
        if self.corrupted.load(Ordering::SeqCst) {
            Err(StoreError::Corrupted("corruption sentinel set".to_string()))
        } else {
            Ok(())
        }
    }

    fn check_write(&self) -> StoreResult<()> {
        if self.denying.load(Ordering::SeqCst) {
            Err(StoreError::Denied("denied-writer".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn content_hash(doc: &Value) -> String {
    use sha2::{Digest, Sha256};
    let bytes = serde_json::to_vec(doc).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

impl DocumentStore for MemoryDocumentStore {
    fn put(&self, doc: Value) -> BoxFuture<'_, StoreResult<PutReceipt>> {
        Box::pin(async move {
            self.check_write()?;
            let id = doc_id(&doc)?;
            let hash = content_hash(&doc);

            self.docs.write().await.insert(id, doc.clone());

            // No listeners is fine; send() only errors when empty.
            let _ = self.changes_tx.send(ChangeBatch {
                added: vec![doc],
                removed: vec![],
            });

            Ok(PutReceipt { hash })
        })
    }

    fn del(&self, id: &str) -> BoxFuture<'_, StoreResult<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            self.check_write()?;
            let removed = self.docs.write().await.remove(&id);

            match removed {
                Some(doc) => {
                    let _ = self.changes_tx.send(ChangeBatch {
                        added: vec![],
                        removed: vec![doc],
                    });
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn get(&self, id: &str) -> BoxFuture<'_, StoreResult<Option<Value>>> {
        let id = id.to_string();
        Box::pin(async move {
            self.check_read()?;
            Ok(self.docs.read().await.get(&id).cloned())
        })
    }

    fn search(&self, query: Query) -> BoxFuture<'_, StoreResult<Vec<Value>>> {
        Box::pin(async move {
            self.check_read()?;
            let docs = self.docs.read().await;
            let mut hits: Vec<Value> = docs
                .values()
                .filter(|doc| query.matches(doc))
                .cloned()
                .collect();
            if let Some(limit) = query.limit() {
                hits.truncate(limit);
            }
            Ok(hits)
        })
    }

    fn iterate(&self, query: Query) -> BoxFuture<'_, StoreResult<Box<dyn DocCursor>>> {
        Box::pin(async move {
            // Snapshot semantics: documents added mid-iteration arrive via
            // the change stream instead.
            let hits = self.search(query).await?;
            Ok(Box::new(MemoryCursor { remaining: hits }) as Box<dyn DocCursor>)
        })
    }

    fn changes(&self) -> broadcast::Receiver<ChangeBatch> {
        self.changes_tx.subscribe()
    }
}

struct MemoryCursor {
    remaining: Vec<Value>,
}

impl DocCursor for MemoryCursor {
    fn next(&mut self, batch_size: usize) -> BoxFuture<'_, StoreResult<Vec<Value>>> {
        Box::pin(async move {
            let take = batch_size.min(self.remaining.len());
            Ok(self.remaining.drain(..take).collect())
        })
    }

    fn done(&self) -> bool {
        self.remaining.is_empty()
    }
}
