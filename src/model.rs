// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Core data types shared across the federation engine.
//!
//! Three record families live in the content-store collaborator:
//!
//! - [`ContentItem`]: a published piece of content (or a federated copy).
//! - [`FollowEdge`]: a persisted subscription to another node.
//! - [`FederationIndexEntry`]: a pointer-only discovery record.
//!
//! [`UpdateMessage`] is the wire payload exchanged over the message bus.
//!
//! # Provenance
//!
//! `federated_from` always names the *original* authoring node, not the
//! immediate relay. When an item travels A → B → C, the copy on C still says
//! `federated_from = "A"`. An item is never written back to the node in its
//! own `federated_from`.
//!
//! # Deterministic Ids
//!
//! Federation index entry ids are a pure function of
//! `(source_site_id, content_locator)`, so repeated delivery of the same
//! pointer collapses to one entry regardless of how many times it arrives.
//! Follow edge ids are likewise derived from the target address, which makes
//! "one edge per target" a structural property rather than a lookup.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A content record in a node's collection.
///
/// Locally authored items have no `federated_from`. The reconciliation
/// engine stamps provenance fields when importing a remote copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Stable content id (shared across all federated copies).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Category the item belongs to.
    pub category_id: String,
    /// Locator for the content payload (e.g. a content address).
    pub content_locator: String,
    /// Optional locator for a thumbnail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_locator: Option<String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Original authoring node, set only on federated copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federated_from: Option<String>,
    /// When this copy was imported (epoch millis).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federated_at: Option<u64>,
    /// Whether the import arrived over a live delivery rather than a
    /// historical catch-up pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federated_realtime: Option<bool>,
}

impl ContentItem {
    /// Create a locally authored item with no provenance.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category_id: impl Into<String>,
        content_locator: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category_id: category_id.into(),
            content_locator: content_locator.into(),
            thumbnail_locator: None,
            metadata: None,
            federated_from: None,
            federated_at: None,
            federated_realtime: None,
        }
    }

    /// True if this copy was imported from another node.
    pub fn is_federated(&self) -> bool {
        self.origin().is_some()
    }

    /// The original authoring node, if this is a federated copy.
    ///
    /// Treats an empty string the same as absent; some stores round-trip
    /// optional fields as `""`.
    pub fn origin(&self) -> Option<&str> {
        self.federated_from.as_deref().filter(|s| !s.is_empty())
    }
}

/// A persisted subscription to another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowEdge {
    /// Edge id, derived from the target address (see [`edge_id`]).
    pub id: String,
    /// Address of the followed node.
    pub target_address: String,
    /// Operator-facing display name.
    pub display_name: String,
    /// `false`: import only content the target authored itself.
    /// `true`: import everything the target holds, including content it
    /// federated from elsewhere.
    pub recursive: bool,
    /// Path of intermediaries, recorded for diagnosing multi-hop
    /// propagation. Not used for filtering.
    #[serde(default)]
    pub follow_chain: Vec<String>,
}

impl FollowEdge {
    /// Create a follow edge to `target_address`.
    pub fn new(target_address: impl Into<String>, display_name: impl Into<String>, recursive: bool) -> Self {
        let target_address = target_address.into();
        Self {
            id: edge_id(&target_address),
            target_address,
            display_name: display_name.into(),
            recursive,
            follow_chain: Vec::new(),
        }
    }
}

/// A pointer-only discovery record in the federation index.
///
/// Carries no content payload; `source_site_id` is the *origin* node of the
/// content it points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationIndexEntry {
    /// Deterministic id: [`index_entry_id`] of `(source_site_id, content_locator)`.
    pub id: String,
    /// Title for display and full-text search.
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_locator: Option<String>,
    pub category_id: String,
    /// Origin node of the content.
    pub source_site_id: String,
    /// Display name of the origin node.
    pub source_site_name: String,
    /// When the pointer was recorded (epoch millis).
    pub timestamp: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_featured: bool,
    #[serde(default)]
    pub is_promoted: bool,
    /// Featured flag expiry (epoch millis); `None` means no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub featured_until: Option<u64>,
    /// Promoted flag expiry (epoch millis); `None` means no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_until: Option<u64>,
}

impl FederationIndexEntry {
    /// Build an index entry pointing at `item`, attributed to
    /// `(source_site_id, source_site_name)`.
    pub fn for_item(item: &ContentItem, source_site_id: &str, source_site_name: &str) -> Self {
        Self {
            id: index_entry_id(source_site_id, &item.content_locator),
            title: item.name.clone(),
            thumbnail_locator: item.thumbnail_locator.clone(),
            category_id: item.category_id.clone(),
            source_site_id: source_site_id.to_string(),
            source_site_name: source_site_name.to_string(),
            timestamp: epoch_millis(),
            tags: Vec::new(),
            is_featured: false,
            is_promoted: false,
            featured_until: None,
            promoted_until: None,
        }
    }

    /// Whether the featured flag is set and unexpired at `now`.
    pub fn featured_at(&self, now: u64) -> bool {
        self.is_featured && self.featured_until.map_or(true, |until| until > now)
    }

    /// Whether the promoted flag is set and unexpired at `now`.
    pub fn promoted_at(&self, now: u64) -> bool {
        self.is_promoted && self.promoted_until.map_or(true, |until| until > now)
    }
}

/// The message-bus wire payload: one batch of changes from a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMessage {
    /// Address of the publishing node.
    pub site: String,
    /// Items added or updated since the last message.
    #[serde(default)]
    pub added: Vec<ContentItem>,
    /// Items removed since the last message.
    #[serde(default)]
    pub removed: Vec<ContentItem>,
    /// Publisher clock at send time (epoch millis).
    pub timestamp: u64,
}

impl UpdateMessage {
    /// Serialize to the wire encoding (JSON).
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serialization of these plain structs cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse from the wire encoding.
    pub fn from_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| crate::error::FederationError::MessageFormat(e.to_string()))
    }
}

/// Deterministic federation index entry id.
///
/// A pure function of `(source_site_id, content_locator)`, so inserting the
/// same pointer twice always yields the same id. The NUL separator keeps
/// `("ab", "c")` and `("a", "bc")` distinct.
pub fn index_entry_id(source_site_id: &str, content_locator: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_site_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(content_locator.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic follow edge id for a target address.
pub fn edge_id(target_address: &str) -> String {
    let digest = Sha256::digest(target_address.as_bytes());
    format!("edge-{}", hex::encode(&digest[..8]))
}

/// Current epoch milliseconds.
pub fn epoch_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
