// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests for the federation engine.
//!
//! Multi-node scenarios run over the in-memory directory and bus from
//! `tests/common`, so no external service is required.
//!
//! # Test Organization
//! - `scenario_*` - end-to-end federation flows between nodes
//! - `bus_*` - message-bus transport specifics
//! - `mirror_*` - full-mirror transport specifics
//! - `index_*` - federation index population and queries

mod common;

use common::{item, wait_for_absence, wait_for_item, wait_until, TestNetwork};
use federation_engine::config::TransportKind;
use federation_engine::index::IndexQuery;
use federation_engine::MessageBus;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Core federation scenarios
// =============================================================================

#[tokio::test]
async fn scenario_basic_federation_and_eviction() {
    let network = TestNetwork::new();
    let a = network.spawn_node("site-a", TransportKind::Realtime, false).await;
    let b = network.spawn_node("site-b", TransportKind::Realtime, false).await;

    a.publish(item("r1", "X", "music")).await;

    b.engine
        .add_follow_edge("site-a", Some("Site A"), false)
        .await
        .unwrap();

    // B ends up with exactly one copy, attributed to A.
    assert!(wait_for_item(&b, "r1", WAIT).await, "B should import r1");
    let copy = b.item("r1").await.unwrap();
    assert_eq!(copy.origin(), Some("site-a"));
    assert!(copy.federated_at.is_some());
    assert_eq!(b.content.doc_count().await, 1);

    // A deletes; B's copy is evicted.
    a.delete("r1").await;
    assert!(
        wait_for_absence(&b, "r1", WAIT).await,
        "B should evict r1 after A deletes it"
    );
    assert_eq!(b.content.doc_count().await, 0);

    b.engine.shutdown().await;
    a.engine.shutdown().await;
}

#[tokio::test]
async fn scenario_origin_preserved_across_two_hops() {
    let network = TestNetwork::new();
    let a = network.spawn_node("site-a", TransportKind::Realtime, false).await;
    let b = network.spawn_node("site-b", TransportKind::Realtime, false).await;
    let c = network.spawn_node("site-c", TransportKind::Realtime, false).await;

    b.engine.add_follow_edge("site-a", None, false).await.unwrap();
    c.engine.add_follow_edge("site-b", None, true).await.unwrap();

    a.publish(item("r2", "Y", "music")).await;

    assert!(wait_for_item(&b, "r2", WAIT).await, "B should import from A");
    assert_eq!(b.item("r2").await.unwrap().origin(), Some("site-a"));

    // C's recursive follow of B still records the true origin A, not the
    // relay B.
    assert!(wait_for_item(&c, "r2", WAIT).await, "C should import via B");
    assert_eq!(c.item("r2").await.unwrap().origin(), Some("site-a"));

    c.engine.shutdown().await;
    b.engine.shutdown().await;
    a.engine.shutdown().await;
}

#[tokio::test]
async fn scenario_non_recursive_follow_skips_relayed_content() {
    let network = TestNetwork::new();
    let a = network.spawn_node("site-a", TransportKind::Realtime, false).await;
    let b = network.spawn_node("site-b", TransportKind::Realtime, false).await;
    let c = network.spawn_node("site-c", TransportKind::Realtime, false).await;

    b.engine.add_follow_edge("site-a", None, false).await.unwrap();

    // B ends up holding an original plus a copy federated from A.
    b.publish(item("b-own", "B's own", "music")).await;
    a.publish(item("a-item", "From A", "music")).await;
    assert!(wait_for_item(&b, "a-item", WAIT).await);

    // A non-recursive follow of B imports only B's originals.
    c.engine.add_follow_edge("site-b", None, false).await.unwrap();
    assert!(wait_for_item(&c, "b-own", WAIT).await, "C should import B's original");

    // Give the pipeline time to (incorrectly) deliver the federated copy.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(c.item("a-item").await.is_none(), "relayed content must be skipped");
    assert_eq!(c.content.doc_count().await, 1);

    c.engine.shutdown().await;
    b.engine.shutdown().await;
    a.engine.shutdown().await;
}

#[tokio::test]
async fn scenario_mutual_follow_does_not_boomerang() {
    let network = TestNetwork::new();
    let a = network.spawn_node("site-a", TransportKind::Realtime, false).await;
    let b = network.spawn_node("site-b", TransportKind::Realtime, false).await;

    a.engine.add_follow_edge("site-b", None, true).await.unwrap();
    b.engine.add_follow_edge("site-a", None, true).await.unwrap();

    a.publish(item("rA", "from A", "music")).await;
    b.publish(item("rB", "from B", "music")).await;

    assert!(wait_for_item(&a, "rB", WAIT).await);
    assert!(wait_for_item(&b, "rA", WAIT).await);

    // Let the cycle churn; idempotence and the self-loop guard keep both
    // stores at exactly two items.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(a.content.doc_count().await, 2);
    assert_eq!(b.content.doc_count().await, 2);

    // A's own item never comes back marked as federated.
    assert!(a.item("rA").await.unwrap().origin().is_none());
    assert!(b.item("rB").await.unwrap().origin().is_none());
    assert_eq!(a.item("rB").await.unwrap().origin(), Some("site-b"));
    assert_eq!(b.item("rA").await.unwrap().origin(), Some("site-a"));

    a.engine.shutdown().await;
    b.engine.shutdown().await;
}

#[tokio::test]
async fn scenario_initial_sync_catches_up_preexisting_content() {
    let network = TestNetwork::new();
    let a = network.spawn_node("site-a", TransportKind::Realtime, false).await;
    let b = network.spawn_node("site-b", TransportKind::Realtime, false).await;

    // Published before B ever follows.
    a.publish(item("old1", "Old 1", "music")).await;
    a.publish(item("old2", "Old 2", "music")).await;

    b.engine.add_follow_edge("site-a", None, false).await.unwrap();

    assert!(wait_for_item(&b, "old1", WAIT).await);
    assert!(wait_for_item(&b, "old2", WAIT).await);

    b.engine.shutdown().await;
    a.engine.shutdown().await;
}

#[tokio::test]
async fn scenario_edge_removal_stops_federation() {
    let network = TestNetwork::new();
    let a = network.spawn_node("site-a", TransportKind::Realtime, false).await;
    let b = network.spawn_node("site-b", TransportKind::Realtime, false).await;

    let edge = b.engine.add_follow_edge("site-a", None, false).await.unwrap();

    a.publish(item("before", "Before removal", "music")).await;
    assert!(wait_for_item(&b, "before", WAIT).await);

    b.engine.remove_follow_edge(&edge.id).await.unwrap();
    assert!(b.engine.session_status(&edge.id).is_none());

    // Published after removal: never arrives.
    a.publish(item("after", "After removal", "music")).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(b.item("after").await.is_none());

    // Imported content stays; unfollow is not unimport.
    assert!(b.item("before").await.is_some());

    b.engine.shutdown().await;
    a.engine.shutdown().await;
}

// =============================================================================
// Message-bus transport
// =============================================================================

#[tokio::test]
async fn bus_transport_federates_live_updates() {
    let network = TestNetwork::new();
    let a = network.spawn_node("site-a", TransportKind::MessageBus, false).await;
    let b = network.spawn_node("site-b", TransportKind::MessageBus, false).await;

    b.engine.add_follow_edge("site-a", None, false).await.unwrap();

    // Wait until B's live subscription is up before A publishes, so A's
    // subscriber discovery finds it.
    assert!(
        wait_until(WAIT, || async {
            network
                .bus
                .subscriber_count("federation:updates:site-a")
                .await
                .unwrap()
                > 0
        })
        .await
    );

    a.publish(item("bus1", "Over the bus", "music")).await;

    assert!(wait_for_item(&b, "bus1", WAIT).await, "B should import over the bus");
    assert_eq!(b.item("bus1").await.unwrap().origin(), Some("site-a"));

    b.engine.shutdown().await;
    a.engine.shutdown().await;
}

#[tokio::test]
async fn bus_transport_historical_sync_covers_missed_content() {
    let network = TestNetwork::new();
    let a = network.spawn_node("site-a", TransportKind::MessageBus, false).await;

    // Content that existed before anyone subscribed; no live message will
    // ever carry it.
    a.publish(item("historic", "Published early", "music")).await;

    let b = network.spawn_node("site-b", TransportKind::MessageBus, false).await;
    b.engine.add_follow_edge("site-a", None, false).await.unwrap();

    // The bounded historical phase pulls the head state.
    assert!(
        wait_for_item(&b, "historic", WAIT).await,
        "historical sync should deliver pre-existing content"
    );

    b.engine.shutdown().await;
    a.engine.shutdown().await;
}

// =============================================================================
// Full-mirror transport
// =============================================================================

#[tokio::test]
async fn mirror_transport_replicates_everything() {
    let network = TestNetwork::new();
    let a = network.spawn_node("site-a", TransportKind::Realtime, false).await;

    for i in 0..60 {
        a.publish(item(&format!("bulk{i}"), &format!("Bulk {i}"), "archive"))
            .await;
    }

    let replicator = network
        .spawn_node("site-replicator", TransportKind::FullMirror, false)
        .await;
    replicator
        .engine
        .add_follow_edge("site-a", None, true)
        .await
        .unwrap();

    // Initial scan brings over the full backlog.
    assert!(
        wait_until(WAIT, || async {
            replicator.content.doc_count().await == 60
        })
        .await,
        "replicator should hold the full backlog"
    );

    // Live changes keep flowing afterwards.
    a.publish(item("fresh", "Fresh", "archive")).await;
    assert!(wait_for_item(&replicator, "fresh", WAIT).await);

    replicator.engine.shutdown().await;
    a.engine.shutdown().await;
}

// =============================================================================
// Federation index
// =============================================================================

#[tokio::test]
async fn index_populated_by_reconciliation_and_queryable() {
    let network = TestNetwork::new();
    let a = network.spawn_node("site-a", TransportKind::Realtime, false).await;
    let b = network.spawn_node("site-b", TransportKind::Realtime, true).await;

    b.engine
        .add_follow_edge("site-a", Some("Site A"), false)
        .await
        .unwrap();

    a.publish(item("m1", "First Album", "music")).await;
    a.publish(item("v1", "A Documentary", "video")).await;

    assert!(wait_for_item(&b, "m1", WAIT).await);
    assert!(wait_for_item(&b, "v1", WAIT).await);

    assert!(
        wait_until(WAIT, || async {
            b.engine.federation_index_recent(10, 0).await.len() == 2
        })
        .await,
        "index should hold one pointer per import"
    );

    let music = b.engine.federation_index_by_category("music").await;
    assert_eq!(music.len(), 1);
    assert_eq!(music[0].title, "First Album");
    assert_eq!(music[0].source_site_id, "site-a");
    assert_eq!(music[0].source_site_name, "Site A");

    let hits = b.engine.search_federation_index("documentary").await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].category_id, "video");

    let hits = b
        .engine
        .complex_federation_index_query(
            IndexQuery::new().category("music").title_contains("album"),
        )
        .await;
    assert_eq!(hits.len(), 1);

    let stats = b.engine.federation_index_stats().await;
    assert_eq!(stats.total_entries, 2);
    assert_eq!(stats.entries_by_site.get("site-a"), Some(&2));
    assert_eq!(stats.entries_by_category.get("music"), Some(&1));
    assert!(stats.oldest.is_some());

    // Eviction removes the pointer too.
    a.delete("m1").await;
    assert!(
        wait_until(WAIT, || async {
            b.engine.federation_index_recent(10, 0).await.len() == 1
        })
        .await,
        "evicted content should drop out of the index"
    );

    b.engine.shutdown().await;
    a.engine.shutdown().await;
}

#[tokio::test]
async fn index_entries_credit_origin_across_hops() {
    let network = TestNetwork::new();
    let a = network.spawn_node("site-a", TransportKind::Realtime, false).await;
    let b = network.spawn_node("site-b", TransportKind::Realtime, false).await;
    let c = network.spawn_node("site-c", TransportKind::Realtime, true).await;

    b.engine.add_follow_edge("site-a", None, false).await.unwrap();
    c.engine.add_follow_edge("site-b", None, true).await.unwrap();

    a.publish(item("deep", "Two hops away", "music")).await;

    assert!(wait_for_item(&c, "deep", WAIT).await);
    assert!(
        wait_until(WAIT, || async {
            !c.engine.federation_index_recent(10, 0).await.is_empty()
        })
        .await
    );

    let entries = c.engine.federation_index_recent(10, 0).await;
    assert_eq!(entries[0].source_site_id, "site-a");

    c.engine.shutdown().await;
    b.engine.shutdown().await;
    a.engine.shutdown().await;
}
