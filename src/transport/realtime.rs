//! Real-time event transport.
//!
//! Opens the followed node's collection through the registry and forwards
//! its change events verbatim. Changes apply with zero added latency, but
//! the remote node's full state has to be held open locally for the
//! listener to fire — the highest-fidelity, highest-resource strategy.
//!
//! Historical catch-up is not this transport's job: the session manager's
//! initial sync covers "where I should already be", and lagged listeners
//! are repaired the same way.

use crate::config::TransportKind;
use crate::error::Result;
use crate::model::FollowEdge;
use crate::registry::StoreRegistry;
use crate::store::BoxFuture;
use crate::transport::{forward_change_stream, Delivery, Transport, TransportHandle};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Change-listener transport over locally opened remote collections.
pub struct RealtimeTransport {
    registry: Arc<StoreRegistry>,
}

impl RealtimeTransport {
    pub fn new(registry: Arc<StoreRegistry>) -> Self {
        Self { registry }
    }
}

impl Transport for RealtimeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Realtime
    }

    fn start(
        &self,
        edge: &FollowEdge,
        deliveries: mpsc::Sender<Delivery>,
    ) -> BoxFuture<'_, Result<TransportHandle>> {
        let edge = edge.clone();
        Box::pin(async move {
            let remote = self.registry.open(&edge.target_address).await?;
            let changes = remote.changes();

            let mut handle = TransportHandle::new(TransportKind::Realtime);
            let cancel_rx = handle.cancel_rx();

            info!(
                edge_id = %edge.id,
                target = %edge.target_address,
                "Real-time transport attached"
            );

            handle.push(tokio::spawn(forward_change_stream(
                edge, changes, deliveries, cancel_rx,
            )));

            Ok(handle)
        })
    }
}
