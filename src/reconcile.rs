// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The reconciliation engine.
//!
//! Pure policy: given a batch of remote additions and removals and the
//! follow edge they arrived on, decide what to import and what to evict.
//! Transport-agnostic by construction — all three transport strategies feed
//! the same entry point and produce the same store state.
//!
//! # Rules
//!
//! - **Recursion filter**: non-recursive edges import only items the target
//!   authored itself (`federated_from` unset); recursive edges import
//!   everything.
//! - **Self-loop guard**: an item whose origin is the local node is dropped,
//!   so content cannot boomerang home over a multi-hop path.
//! - **Idempotence**: an item that already exists locally is a no-op skip,
//!   never an error. Repeat and duplicate deliveries are expected under
//!   at-least-once transports.
//! - **Provenance**: imports preserve a non-empty `federated_from` across
//!   hops; otherwise the edge target is the origin. `federated_at` and
//!   `federated_realtime` are stamped at import time.
//! - **Eviction safety**: a remote removal evicts the local copy only when
//!   that copy's origin is the edge target. Locally authored content is
//!   never evicted by a remote removal, even on id collision.
//!
//! # Batching
//!
//! Items are processed in bounded batches: concurrent within a batch
//! (additionally capped by a shared [`Bulkhead`]), sequential across
//! batches. A single item's failure is recorded in the outcome and the
//! batch continues.

use crate::config::ReconcileConfig;
use crate::error::FederationError;
use crate::index::FederationIndex;
use crate::model::{epoch_millis, index_entry_id, ContentItem, FollowEdge};
use crate::resilience::Bulkhead;
use crate::store::{DocumentStore, StoreError};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Counts from one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Items newly written to the local store.
    pub imported: usize,
    /// Items removed from the local store.
    pub evicted: usize,
    /// Items dropped by policy or already present.
    pub skipped: usize,
    /// Items that failed and will be retried by later deliveries.
    pub errors: usize,
}

impl ReconcileOutcome {
    /// Total items considered.
    pub fn total(&self) -> usize {
        self.imported + self.evicted + self.skipped + self.errors
    }

    /// Whether anything changed in the store.
    pub fn changed(&self) -> bool {
        self.imported > 0 || self.evicted > 0
    }
}

enum ItemResult {
    Imported,
    Evicted,
    Skipped,
    Errored,
}

/// Transport-agnostic import/evict logic for one node.
pub struct Reconciler {
    local_address: String,
    store: Arc<dyn DocumentStore>,
    index: Option<Arc<FederationIndex>>,
    config: ReconcileConfig,
    bulkhead: Arc<Bulkhead>,
}

impl Reconciler {
    /// Create a reconciler writing into `store` (and `index`, when the node
    /// maintains one).
    pub fn new(
        local_address: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        index: Option<Arc<FederationIndex>>,
        config: ReconcileConfig,
    ) -> Self {
        let bulkhead = Arc::new(Bulkhead::new(config.max_concurrent_imports.max(1)));
        Self {
            local_address: local_address.into(),
            store,
            index,
            config,
            bulkhead,
        }
    }

    /// The local node's federation address.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Reconcile one delivery for `edge`.
    ///
    /// `realtime` records whether the items arrived over a live channel or
    /// a historical catch-up pass; it only affects the provenance stamp.
    pub async fn reconcile(
        &self,
        edge: &FollowEdge,
        added: Vec<ContentItem>,
        removed: Vec<ContentItem>,
        realtime: bool,
    ) -> ReconcileOutcome {
        let started = Instant::now();
        let mut outcome = ReconcileOutcome::default();

        // Policy filters are cheap and synchronous; run them up front so
        // batches only carry admissible work.
        let mut admissible = Vec::with_capacity(added.len());
        for item in added {
            if !edge.recursive && item.is_federated() {
                debug!(
                    edge_id = %edge.id,
                    item_id = %item.id,
                    "Skipping federated item on non-recursive edge"
                );
                outcome.skipped += 1;
                continue;
            }
            if item.origin() == Some(self.local_address.as_str()) {
                debug!(
                    edge_id = %edge.id,
                    item_id = %item.id,
                    "Skipping boomerang of locally authored item"
                );
                outcome.skipped += 1;
                continue;
            }
            admissible.push(item);
        }

        let now = epoch_millis();
        let batch_size = self.config.batch_size.max(1);

        let mut pending = admissible;
        while !pending.is_empty() {
            let take = batch_size.min(pending.len());
            let batch: Vec<ContentItem> = pending.drain(..take).collect();
            let mut tasks = JoinSet::new();

            for item in batch {
                let store = Arc::clone(&self.store);
                let index = self.index.clone();
                let bulkhead = Arc::clone(&self.bulkhead);
                let target = edge.target_address.clone();
                let display_name = edge.display_name.clone();

                tasks.spawn(import_one(
                    store, index, bulkhead, target, display_name, item, realtime, now,
                ));
            }

            collect(&mut tasks, &mut outcome).await;
        }

        let mut pending = removed;
        while !pending.is_empty() {
            let take = batch_size.min(pending.len());
            let batch: Vec<ContentItem> = pending.drain(..take).collect();
            let mut tasks = JoinSet::new();

            for item in batch {
                let store = Arc::clone(&self.store);
                let index = self.index.clone();
                let bulkhead = Arc::clone(&self.bulkhead);
                let target = edge.target_address.clone();

                tasks.spawn(evict_one(store, index, bulkhead, target, item));
            }

            collect(&mut tasks, &mut outcome).await;
        }

        crate::metrics::record_reconcile(
            &edge.id,
            outcome.imported,
            outcome.evicted,
            outcome.skipped,
            outcome.errors,
            started.elapsed(),
        );
        outcome
    }
}

async fn collect(tasks: &mut JoinSet<ItemResult>, outcome: &mut ReconcileOutcome) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(ItemResult::Imported) => outcome.imported += 1,
            Ok(ItemResult::Evicted) => outcome.evicted += 1,
            Ok(ItemResult::Skipped) => outcome.skipped += 1,
            Ok(ItemResult::Errored) => outcome.errors += 1,
            Err(e) => {
                warn!(error = %e, "Reconcile task panicked");
                outcome.errors += 1;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn import_one(
    store: Arc<dyn DocumentStore>,
    index: Option<Arc<FederationIndex>>,
    bulkhead: Arc<Bulkhead>,
    edge_target: String,
    edge_display_name: String,
    mut item: ContentItem,
    realtime: bool,
    now: u64,
) -> ItemResult {
    let _permit = match bulkhead.acquire().await {
        Ok(permit) => permit,
        Err(_) => return ItemResult::Errored,
    };

    // Idempotence: a repeat delivery of an existing item is a no-op. On a
    // failed read, assume absent and fall through to the upsert, which is
    // itself idempotent.
    match store.get(&item.id).await {
        Ok(Some(_)) => {
            debug!(item_id = %item.id, "Item already present, skipping");
            return ItemResult::Skipped;
        }
        Ok(None) => {}
        Err(e) => {
            debug!(item_id = %item.id, error = %e, "Existence check failed, importing anyway");
        }
    }

    // Preserve the true origin across hops; first hop stamps the edge target.
    let origin = item
        .origin()
        .map(str::to_string)
        .unwrap_or_else(|| edge_target.clone());
    item.federated_from = Some(origin.clone());
    item.federated_at = Some(now);
    item.federated_realtime = Some(realtime);

    let doc = match serde_json::to_value(&item) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(item_id = %item.id, error = %e, "Item serialization failed");
            return ItemResult::Errored;
        }
    };

    match store.put(doc).await {
        Ok(_) => {}
        Err(StoreError::Denied(actor)) => {
            debug!(item_id = %item.id, actor = %actor, "Import denied by write policy, skipping");
            return ItemResult::Skipped;
        }
        Err(e) => {
            warn!(item_id = %item.id, error = %e, "Import failed");
            return ItemResult::Errored;
        }
    }

    // Index upkeep is best-effort: a denied or failed pointer write never
    // fails the import itself.
    if let Some(index) = index {
        let source_name = if origin == edge_target {
            edge_display_name
        } else {
            origin.clone()
        };
        let entry = crate::model::FederationIndexEntry::for_item(&item, &origin, &source_name);
        match index.insert(entry, &edge_target).await {
            Ok(()) => {}
            Err(FederationError::WriteDenied { actor }) => {
                debug!(item_id = %item.id, actor = %actor, "Index insert denied");
            }
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Index insert failed");
            }
        }
    }

    ItemResult::Imported
}

async fn evict_one(
    store: Arc<dyn DocumentStore>,
    index: Option<Arc<FederationIndex>>,
    bulkhead: Arc<Bulkhead>,
    edge_target: String,
    item: ContentItem,
) -> ItemResult {
    let _permit = match bulkhead.acquire().await {
        Ok(permit) => permit,
        Err(_) => return ItemResult::Errored,
    };

    // Eviction must verify provenance on the *local* copy. When that copy
    // is missing, unreadable or unparseable, do not evict.
    let local: ContentItem = match store.get(&item.id).await {
        Ok(Some(doc)) => match serde_json::from_value(doc) {
            Ok(local) => local,
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Local copy unparseable, not evicting");
                return ItemResult::Skipped;
            }
        },
        Ok(None) => return ItemResult::Skipped,
        Err(e) => {
            warn!(item_id = %item.id, error = %e, "Local copy unreadable, not evicting");
            return ItemResult::Skipped;
        }
    };

    if local.origin() != Some(edge_target.as_str()) {
        debug!(
            item_id = %item.id,
            origin = local.origin().unwrap_or("<local>"),
            edge_target = %edge_target,
            "Removal provenance mismatch, keeping local copy"
        );
        return ItemResult::Skipped;
    }

    match store.del(&item.id).await {
        Ok(_) => {}
        Err(StoreError::Denied(actor)) => {
            debug!(item_id = %item.id, actor = %actor, "Eviction denied by write policy, skipping");
            return ItemResult::Skipped;
        }
        Err(e) => {
            warn!(item_id = %item.id, error = %e, "Eviction failed");
            return ItemResult::Errored;
        }
    }

    if let Some(index) = index {
        if let Some(origin) = local.origin() {
            let entry_id = index_entry_id(origin, &local.content_locator);
            if let Err(e) = index.remove(&entry_id).await {
                warn!(item_id = %item.id, error = %e, "Index entry removal failed");
            }
        }
    }

    ItemResult::Evicted
}
