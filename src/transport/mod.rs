//! Transport strategies for subscription sessions.
//!
//! A transport's job is discovery and delivery: get the followed node's
//! content — live and historical — to the reconciliation engine. Three
//! interchangeable strategies implement the same [`Transport`] contract:
//!
//! | Strategy | Latency | Cost | Module |
//! |----------|---------|------|--------|
//! | Real-time events | zero added | remote state held open | [`realtime`] |
//! | Message bus | seconds | cheap | [`bus`] |
//! | Full mirror | zero added | complete replica | [`mirror`] |
//!
//! Transports never call the reconciliation engine directly. They enqueue
//! [`Delivery`] values on a per-edge channel owned by the session, which
//! preserves per-edge arrival order without any global locking. The
//! reconciliation engine makes the outcomes equivalent regardless of which
//! strategy produced the deliveries.

pub mod bus;
pub mod mirror;
pub mod realtime;

use crate::config::TransportKind;
use crate::error::Result;
use crate::model::{ContentItem, FollowEdge};
use crate::store::{BoxFuture, ChangeBatch};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long `TransportHandle::stop` waits for each task to drain.
const STOP_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// One batch of remote content handed to the reconciliation engine.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub edge_id: String,
    pub added: Vec<ContentItem>,
    pub removed: Vec<ContentItem>,
    /// Whether this arrived over a live channel (vs. historical catch-up).
    pub realtime: bool,
}

impl Delivery {
    /// True when there is nothing to reconcile.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Running state for one edge's transport: its tasks plus their cancel
/// signal.
#[derive(Debug)]
pub struct TransportHandle {
    kind: TransportKind,
    cancel_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportHandle {
    /// Create an empty handle; tasks subscribe to the cancel signal via
    /// [`cancel_rx`](Self::cancel_rx).
    pub fn new(kind: TransportKind) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            kind,
            cancel_tx,
            tasks: Vec::new(),
        }
    }

    /// The strategy that produced this handle.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// A receiver for the handle's cancel signal.
    pub fn cancel_rx(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Track a spawned task for drain-on-stop.
    pub fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Stop the transport: signal cancellation, then wait (bounded) for
    /// each task to drain. Tasks that outlive the drain window are aborted.
    pub async fn stop(mut self) {
        let _ = self.cancel_tx.send(true);

        for (i, task) in self.tasks.drain(..).enumerate() {
            match tokio::time::timeout(STOP_DRAIN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!(task = i + 1, "Transport task stopped"),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Transport task panicked"),
                Err(_) => {
                    warn!(task = i + 1, "Transport task did not drain in time, aborting");
                }
            }
        }
    }
}

/// A pluggable delivery strategy for one follow edge.
pub trait Transport: Send + Sync + 'static {
    /// The strategy this transport implements.
    fn kind(&self) -> TransportKind;

    /// Start delivering `edge`'s remote content onto `deliveries`.
    ///
    /// Returns a handle owning the spawned tasks. Errors are retryable
    /// connection problems unless marked otherwise; the session manager
    /// owns the retry schedule.
    fn start(
        &self,
        edge: &FollowEdge,
        deliveries: mpsc::Sender<Delivery>,
    ) -> BoxFuture<'_, Result<TransportHandle>>;
}

/// Decode store documents into content items, dropping malformed ones.
///
/// A malformed document is a single-item problem (error class: format);
/// it is logged and skipped so the rest of the batch proceeds.
pub fn parse_content_items(docs: Vec<Value>) -> Vec<ContentItem> {
    let mut items = Vec::with_capacity(docs.len());
    for doc in docs {
        match serde_json::from_value::<ContentItem>(doc) {
            Ok(item) => items.push(item),
            Err(e) => warn!(error = %e, "Dropping malformed content document"),
        }
    }
    items
}

/// Forward a store's change stream onto the delivery channel until
/// cancelled. Shared by the real-time and full-mirror transports.
pub(crate) async fn forward_change_stream(
    edge: FollowEdge,
    mut changes: tokio::sync::broadcast::Receiver<ChangeBatch>,
    deliveries: mpsc::Sender<Delivery>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            event = changes.recv() => match event {
                Ok(batch) => {
                    let delivery = Delivery {
                        edge_id: edge.id.clone(),
                        added: parse_content_items(batch.added),
                        removed: parse_content_items(batch.removed),
                        realtime: true,
                    };
                    if delivery.is_empty() {
                        continue;
                    }
                    if deliveries.send(delivery).await.is_err() {
                        // Session gone; nothing left to deliver to.
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    // Dropped events are repaired by the next initial sync;
                    // live flow continues from here.
                    warn!(edge_id = %edge.id, missed, "Change stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    debug!(edge_id = %edge.id, "Change stream closed");
                    break;
                }
            }
        }
    }
}
