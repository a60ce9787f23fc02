// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The follow graph: persisted directed subscription edges.
//!
//! Edges live as documents in the content-store collaborator's normal
//! persistence, so they survive restarts and replicate with the rest of
//! the node's state. Session state does not: it is rebuilt from these
//! records at startup.
//!
//! Edge ids derive from the target address, which makes "at most one edge
//! per target" structural: a duplicate add collides on id before it ever
//! reaches the store.

use crate::error::{FederationError, Result};
use crate::model::{edge_id, FollowEdge};
use crate::store::{DocumentStore, Query};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Persisted follow edges for the local node.
pub struct FollowGraph {
    local_address: String,
    store: Arc<dyn DocumentStore>,
}

impl FollowGraph {
    /// Create a graph over the given edge collection.
    pub fn new(local_address: impl Into<String>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            local_address: local_address.into(),
            store,
        }
    }

    /// Add a follow edge to `target_address`.
    ///
    /// Fails with [`FederationError::SelfFollow`] when the target is the
    /// local node and [`FederationError::EdgeExists`] when an edge to that
    /// target already exists.
    pub async fn add(
        &self,
        target_address: &str,
        display_name: Option<&str>,
        recursive: bool,
    ) -> Result<FollowEdge> {
        if target_address == self.local_address {
            return Err(FederationError::SelfFollow {
                address: target_address.to_string(),
            });
        }

        let id = edge_id(target_address);
        if self.store.get(&id).await?.is_some() {
            return Err(FederationError::EdgeExists {
                target: target_address.to_string(),
            });
        }

        let edge = FollowEdge::new(
            target_address,
            display_name.unwrap_or(target_address),
            recursive,
        );

        let doc = serde_json::to_value(&edge)
            .map_err(|e| FederationError::Internal(format!("edge serialization: {e}")))?;
        self.store.put(doc).await?;

        info!(
            edge_id = %edge.id,
            target = %edge.target_address,
            recursive,
            "Follow edge added"
        );
        Ok(edge)
    }

    /// Remove a follow edge by id, returning the removed edge.
    pub async fn remove(&self, id: &str) -> Result<FollowEdge> {
        let edge = self
            .get(id)
            .await?
            .ok_or_else(|| FederationError::EdgeNotFound { id: id.to_string() })?;

        self.store.del(id).await?;
        info!(edge_id = %id, target = %edge.target_address, "Follow edge removed");
        Ok(edge)
    }

    /// Fetch a single edge by id.
    pub async fn get(&self, id: &str) -> Result<Option<FollowEdge>> {
        match self.store.get(id).await? {
            Some(doc) => match serde_json::from_value::<FollowEdge>(doc) {
                Ok(edge) => Ok(Some(edge)),
                Err(e) => {
                    warn!(edge_id = %id, error = %e, "Skipping malformed follow edge record");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// All persisted edges. Malformed records are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<FollowEdge>> {
        let docs = self.store.search(Query::all()).await?;
        let mut edges = Vec::with_capacity(docs.len());
        for doc in docs {
            match serde_json::from_value::<FollowEdge>(doc) {
                Ok(edge) => edges.push(edge),
                Err(e) => warn!(error = %e, "Skipping malformed follow edge record"),
            }
        }
        Ok(edges)
    }

    /// The set of followed target addresses.
    pub async fn targets(&self) -> Result<HashSet<String>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .map(|edge| edge.target_address)
            .collect())
    }

    /// The local node's address.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }
}
