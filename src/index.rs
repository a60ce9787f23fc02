// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The federation index: a pointer-only discovery cache.
//!
//! Followed nodes' content is announced here as [`FederationIndexEntry`]
//! records — title, category, tags, origin site — with no payload. Callers
//! query the index to discover what exists across the federation without
//! replicating anything.
//!
//! # Write Policy
//!
//! Inserts are accepted from the index owner and from sites on the owner's
//! follow list; everyone else is denied. The yes/no check is delegated to
//! the [`WriteAuthorizer`] collaborator, but the policy itself lives here.
//!
//! # Degraded Reads
//!
//! The index is a best-effort discovery aid, not a source of truth. Every
//! query tolerates an empty or corrupted underlying store by returning
//! empty results, and individually malformed entries are skipped rather
//! than failing the whole read.

use crate::auth::WriteAuthorizer;
use crate::error::{FederationError, Result};
use crate::model::{epoch_millis, FederationIndexEntry};
use crate::store::{DocumentStore, Query};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A composite, multi-predicate index query.
///
/// All set predicates must hold (AND); `tags` matches when *any* listed tag
/// is present. Results are time-sorted newest first, then windowed by
/// `offset`/`limit`.
#[derive(Debug, Clone, Default)]
pub struct IndexQuery {
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub source_site: Option<String>,
    pub title_contains: Option<String>,
    /// Inclusive lower bound on entry timestamp (epoch millis).
    pub after: Option<u64>,
    /// Inclusive upper bound on entry timestamp (epoch millis).
    pub before: Option<u64>,
    pub featured_only: bool,
    pub promoted_only: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl IndexQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn source_site(mut self, site: impl Into<String>) -> Self {
        self.source_site = Some(site.into());
        self
    }

    pub fn title_contains(mut self, text: impl Into<String>) -> Self {
        self.title_contains = Some(text.into());
        self
    }

    pub fn between(mut self, after: u64, before: u64) -> Self {
        self.after = Some(after);
        self.before = Some(before);
        self
    }

    pub fn featured_only(mut self) -> Self {
        self.featured_only = true;
        self
    }

    pub fn promoted_only(mut self) -> Self {
        self.promoted_only = true;
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    /// Whether `entry` satisfies every predicate at time `now`.
    fn matches(&self, entry: &FederationIndexEntry, now: u64) -> bool {
        if let Some(category) = &self.category {
            if &entry.category_id != category {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| entry.tags.contains(t)) {
            return false;
        }
        if let Some(site) = &self.source_site {
            if &entry.source_site_id != site {
                return false;
            }
        }
        if let Some(text) = &self.title_contains {
            if !entry
                .title
                .to_lowercase()
                .contains(&text.to_lowercase())
            {
                return false;
            }
        }
        if let Some(after) = self.after {
            if entry.timestamp < after {
                return false;
            }
        }
        if let Some(before) = self.before {
            if entry.timestamp > before {
                return false;
            }
        }
        if self.featured_only && !entry.featured_at(now) {
            return false;
        }
        if self.promoted_only && !entry.promoted_at(now) {
            return false;
        }
        true
    }
}

/// Aggregate statistics over the index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub total_entries: usize,
    pub entries_by_site: HashMap<String, usize>,
    pub entries_by_category: HashMap<String, usize>,
    /// Timestamp of the oldest entry (epoch millis).
    pub oldest: Option<u64>,
    /// Timestamp of the newest entry (epoch millis).
    pub newest: Option<u64>,
}

/// An access-controlled, pointer-only discovery collection.
pub struct FederationIndex {
    store: Arc<dyn DocumentStore>,
    authorizer: Arc<dyn WriteAuthorizer>,
}

impl FederationIndex {
    /// Create an index over the given collection with the given write
    /// authorization.
    pub fn new(store: Arc<dyn DocumentStore>, authorizer: Arc<dyn WriteAuthorizer>) -> Self {
        Self { store, authorizer }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert a pointer entry on behalf of `actor`.
    ///
    /// Denied unless `actor` is the index owner or a followed site. Entry
    /// ids are deterministic, so repeated inserts of the same pointer
    /// collapse to one record.
    pub async fn insert(&self, entry: FederationIndexEntry, actor: &str) -> Result<()> {
        if !self.authorizer.can_write(actor).await {
            crate::metrics::record_index_insert(false);
            return Err(FederationError::WriteDenied {
                actor: actor.to_string(),
            });
        }

        let doc = serde_json::to_value(&entry)
            .map_err(|e| FederationError::Internal(format!("index entry serialization: {e}")))?;
        self.store.put(doc).await?;

        crate::metrics::record_index_insert(true);
        debug!(id = %entry.id, source = %entry.source_site_id, "Index entry inserted");
        Ok(())
    }

    /// Remove an entry by id. Returns whether an entry existed.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let existed = self.store.del(id).await?;
        if existed {
            crate::metrics::record_index_remove();
        }
        Ok(existed)
    }

    // =========================================================================
    // Reads (all degrade to empty on store failure)
    // =========================================================================

    /// All parseable entries. The degraded-read primitive every query
    /// builds on: store errors yield an empty vec, malformed entries are
    /// skipped.
    pub async fn entries(&self) -> Vec<FederationIndexEntry> {
        let docs = match self.store.search(Query::all()).await {
            Ok(docs) => docs,
            Err(e) => {
                warn!(error = %e, "Index read degraded to empty results");
                crate::metrics::record_index_degraded_read("entries");
                return Vec::new();
            }
        };

        docs.into_iter()
            .filter_map(|doc| match serde_json::from_value(doc) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed index entry");
                    None
                }
            })
            .collect()
    }

    /// Entries in a category.
    pub async fn by_category(&self, category_id: &str) -> Vec<FederationIndexEntry> {
        self.query(IndexQuery::new().category(category_id)).await
    }

    /// Entries carrying any of the given tags.
    pub async fn by_tag(&self, tags: &[String]) -> Vec<FederationIndexEntry> {
        let mut query = IndexQuery::new();
        query.tags = tags.to_vec();
        self.query(query).await
    }

    /// Entries originating at a site.
    pub async fn by_source_site(&self, site_id: &str) -> Vec<FederationIndexEntry> {
        self.query(IndexQuery::new().source_site(site_id)).await
    }

    /// Case-insensitive substring search over titles.
    pub async fn search_title(&self, text: &str) -> Vec<FederationIndexEntry> {
        self.query(IndexQuery::new().title_contains(text)).await
    }

    /// Entries with timestamps in `[after, before]`.
    pub async fn time_range(&self, after: u64, before: u64) -> Vec<FederationIndexEntry> {
        self.query(IndexQuery::new().between(after, before)).await
    }

    /// Newest entries first, windowed by `limit`/`offset`.
    pub async fn recent(&self, limit: usize, offset: usize) -> Vec<FederationIndexEntry> {
        self.query(IndexQuery::new().page(limit, offset)).await
    }

    /// Entries whose featured flag is set and unexpired.
    pub async fn featured(&self) -> Vec<FederationIndexEntry> {
        self.query(IndexQuery::new().featured_only()).await
    }

    /// Entries whose promoted flag is set and unexpired.
    pub async fn promoted(&self) -> Vec<FederationIndexEntry> {
        self.query(IndexQuery::new().promoted_only()).await
    }

    /// Run a composite multi-predicate query.
    pub async fn query(&self, query: IndexQuery) -> Vec<FederationIndexEntry> {
        let now = epoch_millis();
        let mut hits: Vec<FederationIndexEntry> = self
            .entries()
            .await
            .into_iter()
            .filter(|entry| query.matches(entry, now))
            .collect();

        hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id)));

        let end = query
            .limit
            .map(|limit| (query.offset + limit).min(hits.len()))
            .unwrap_or(hits.len());
        let start = query.offset.min(end);
        hits[start..end].to_vec()
    }

    /// Aggregate statistics. Degrades to zeroed stats like every other read.
    pub async fn stats(&self) -> IndexStats {
        let entries = self.entries().await;

        let mut stats = IndexStats {
            total_entries: entries.len(),
            ..Default::default()
        };

        for entry in &entries {
            *stats
                .entries_by_site
                .entry(entry.source_site_id.clone())
                .or_insert(0) += 1;
            *stats
                .entries_by_category
                .entry(entry.category_id.clone())
                .or_insert(0) += 1;
            stats.oldest = Some(stats.oldest.map_or(entry.timestamp, |t: u64| t.min(entry.timestamp)));
            stats.newest = Some(stats.newest.map_or(entry.timestamp, |t: u64| t.max(entry.timestamp)));
        }

        stats
    }
}
