//! Full-mirror transport.
//!
//! Opens a *complete local replica* of the followed node's collection —
//! not just a subscription — and reconciles from an initial full scan plus
//! the replica's change stream. The most expensive strategy by far;
//! appropriate only for the small number of replicator nodes meant to
//! guarantee durability for the whole network.

use crate::config::TransportKind;
use crate::error::Result;
use crate::model::FollowEdge;
use crate::registry::StoreRegistry;
use crate::store::{BoxFuture, DocumentStore, Query};
use crate::transport::{
    forward_change_stream, parse_content_items, Delivery, Transport, TransportHandle,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// How many documents each scan batch carries.
const SCAN_BATCH_SIZE: usize = 50;

/// Replica-backed transport for replicator nodes.
pub struct MirrorTransport {
    registry: Arc<StoreRegistry>,
}

impl MirrorTransport {
    pub fn new(registry: Arc<StoreRegistry>) -> Self {
        Self { registry }
    }
}

impl Transport for MirrorTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::FullMirror
    }

    fn start(
        &self,
        edge: &FollowEdge,
        deliveries: mpsc::Sender<Delivery>,
    ) -> BoxFuture<'_, Result<TransportHandle>> {
        let edge = edge.clone();
        Box::pin(async move {
            let replica = self.registry.open_replica(&edge.target_address).await?;

            // Listener first, then scan: anything written mid-scan shows up
            // on the change stream, and duplicates are reconciliation no-ops.
            let changes = replica.changes();

            let mut handle = TransportHandle::new(TransportKind::FullMirror);

            info!(
                edge_id = %edge.id,
                target = %edge.target_address,
                "Full-mirror transport attached"
            );

            handle.push(tokio::spawn(run_initial_scan(
                edge.clone(),
                replica,
                deliveries.clone(),
                handle.cancel_rx(),
            )));

            handle.push(tokio::spawn(forward_change_stream(
                edge,
                changes,
                deliveries,
                handle.cancel_rx(),
            )));

            Ok(handle)
        })
    }
}

/// Walk the whole replica once in cursor batches.
async fn run_initial_scan(
    edge: FollowEdge,
    replica: Arc<dyn DocumentStore>,
    deliveries: mpsc::Sender<Delivery>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut cursor = match replica.iterate(Query::all()).await {
        Ok(cursor) => cursor,
        Err(e) => {
            // The live change stream still runs; the next session initial
            // sync covers whatever the scan would have found.
            warn!(edge_id = %edge.id, error = %e, "Replica scan could not start");
            return;
        }
    };

    let mut scanned = 0usize;
    while !cursor.done() {
        if *cancel_rx.borrow() {
            return;
        }

        let docs = match cursor.next(SCAN_BATCH_SIZE).await {
            Ok(docs) => docs,
            Err(e) => {
                warn!(edge_id = %edge.id, error = %e, "Replica scan failed mid-walk");
                return;
            }
        };
        if docs.is_empty() {
            break;
        }

        scanned += docs.len();
        let delivery = Delivery {
            edge_id: edge.id.clone(),
            added: parse_content_items(docs),
            removed: vec![],
            realtime: false,
        };
        if delivery.is_empty() {
            continue;
        }

        tokio::select! {
            sent = deliveries.send(delivery) => {
                if sent.is_err() {
                    return;
                }
            }
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    return;
                }
            }
        }
    }

    info!(edge_id = %edge.id, scanned, "Replica initial scan complete");
}
