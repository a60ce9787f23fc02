// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Subscription session management.
//!
//! One session per follow edge, owning the edge's transport, delivery
//! queue and health timer. Sessions are transient runtime state: they are
//! rebuilt from persisted [`FollowEdge`] records at startup and never
//! persisted themselves.
//!
//! # Session Lifecycle
//!
//! ```text
//! Connecting ──────→ Active ──────→ Degraded
//!      ↑               ↑ (delivery)     │ (next health tick)
//!      │               │                ↓
//!      │               └────────── Reconnecting
//!      │ (non-retryable error)          │ (backoff, retry)
//!      ↓                                │
//!   Failed ←────────────────────────────┘
//! ```
//!
//! - **Connecting**: transport attempts with shrinking per-attempt timeouts
//!   and a capped attempt count, falling back to a long-period background
//!   retry rather than giving up.
//! - **Active → Degraded**: no activity for the idle threshold. A liveness
//!   check, not a correctness failure.
//! - **Degraded → Reconnecting**: scheduled with exponential backoff,
//!   `min(base * 2^attempt, cap)` plus jitter; the attempt counter resets
//!   on any successful activity.
//! - Removal tears the session down immediately: transport stopped and the
//!   health timer cancelled before the session map entry disappears, and
//!   removing twice is a no-op.
//!
//! Within one edge, deliveries reconcile in arrival order. Different edges
//! run fully in parallel; there is no cross-edge ordering guarantee.

use crate::config::SessionConfig;
use crate::error::{FederationError, Result};
use crate::model::{epoch_millis, FollowEdge};
use crate::reconcile::Reconciler;
use crate::registry::StoreRegistry;
use crate::resilience::RateLimiter;
use crate::transport::{parse_content_items, Delivery, Transport, TransportHandle};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Status of one subscription session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Opening the transport (initial establishment).
    Connecting,
    /// Healthy and reconciling deliveries.
    Active,
    /// No activity past the idle threshold; reconnect pending.
    Degraded,
    /// Transport restart in progress (backoff or re-establishment).
    Reconnecting,
    /// Establishment hit a non-retryable error. Remove and re-add the
    /// edge to try again.
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Connecting => write!(f, "Connecting"),
            SessionStatus::Active => write!(f, "Active"),
            SessionStatus::Degraded => write!(f, "Degraded"),
            SessionStatus::Reconnecting => write!(f, "Reconnecting"),
            SessionStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Diagnostic snapshot of one session.
#[derive(Debug, Clone)]
pub struct SessionHealth {
    pub edge_id: String,
    pub target: String,
    pub status: SessionStatus,
    pub reconnect_attempts: u32,
    pub millis_since_activity: u64,
}

/// State shared between the manager and a session's driver task.
struct SessionShared {
    edge: FollowEdge,
    status_tx: watch::Sender<SessionStatus>,
    last_activity: AtomicU64,
    reconnect_attempts: AtomicU32,
}

impl SessionShared {
    fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    fn set_status(&self, status: SessionStatus) {
        if self.status() != status {
            debug!(edge_id = %self.edge.id, status = %status, "Session status");
            crate::metrics::record_session_state(&self.edge.id, &status.to_string());
            let _ = self.status_tx.send(status);
        }
    }

    fn touch(&self) {
        self.last_activity.store(epoch_millis(), Ordering::Relaxed);
    }

    fn millis_since_activity(&self) -> u64 {
        epoch_millis().saturating_sub(self.last_activity.load(Ordering::Relaxed))
    }
}

/// One live session entry in the manager's map.
struct SessionHandle {
    shared: Arc<SessionShared>,
    cancel_tx: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
    // Keeps the status watch alive for late status queries.
    _status_rx: watch::Receiver<SessionStatus>,
}

/// Owns every per-edge session for one node.
pub struct SessionManager {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    reconciler: Arc<Reconciler>,
    registry: Arc<StoreRegistry>,
    sessions: DashMap<String, Arc<SessionHandle>>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        reconciler: Arc<Reconciler>,
        registry: Arc<StoreRegistry>,
    ) -> Self {
        let rate_limiter = config.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for deliveries"
            );
            Arc::new(RateLimiter::new(cfg))
        });

        Self {
            config,
            transport,
            reconciler,
            registry,
            sessions: DashMap::new(),
            rate_limiter,
        }
    }

    /// Start a session for `edge`. Starting an already-running edge is a
    /// no-op.
    pub fn start_session(&self, edge: FollowEdge) {
        if self.sessions.contains_key(&edge.id) {
            debug!(edge_id = %edge.id, "Session already running");
            return;
        }

        let (status_tx, status_rx) = watch::channel(SessionStatus::Connecting);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let shared = Arc::new(SessionShared {
            edge: edge.clone(),
            status_tx,
            last_activity: AtomicU64::new(epoch_millis()),
            reconnect_attempts: AtomicU32::new(0),
        });

        let driver = tokio::spawn(run_session(
            self.config.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.reconciler),
            Arc::clone(&self.registry),
            Arc::clone(&shared),
            cancel_rx,
            self.rate_limiter.clone(),
        ));

        self.sessions.insert(
            edge.id.clone(),
            Arc::new(SessionHandle {
                shared,
                cancel_tx,
                driver: Mutex::new(Some(driver)),
                _status_rx: status_rx,
            }),
        );

        crate::metrics::set_session_count(self.sessions.len());
        info!(edge_id = %edge.id, target = %edge.target_address, "Session started");
    }

    /// Tear down the session for `edge_id` immediately.
    ///
    /// Stops the transport and cancels the health timer *before* the map
    /// entry is removed, so nothing can fire against a half-removed edge.
    /// Idempotent: removing a missing or already-removed session is a no-op.
    pub async fn remove_session(&self, edge_id: &str) {
        let Some(handle) = self.sessions.get(edge_id).map(|entry| entry.value().clone()) else {
            debug!(edge_id = %edge_id, "No session to remove");
            return;
        };

        let _ = handle.cancel_tx.send(true);

        // Wait for the driver to stop its transport and drop its timer.
        let driver = handle.driver.lock().await.take();
        if let Some(driver) = driver {
            let abort = driver.abort_handle();
            match tokio::time::timeout(Duration::from_secs(5), driver).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(edge_id = %edge_id, error = %e, "Session driver panicked"),
                Err(_) => {
                    warn!(edge_id = %edge_id, "Session driver did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        self.sessions.remove(edge_id);
        self.registry.evict(&handle.shared.edge.target_address);
        crate::metrics::set_session_count(self.sessions.len());
        info!(edge_id = %edge_id, "Session removed");
    }

    /// Tear down every session (process shutdown).
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.remove_session(&id).await;
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Current status of one session.
    pub fn session_status(&self, edge_id: &str) -> Option<SessionStatus> {
        self.sessions
            .get(edge_id)
            .map(|entry| entry.value().shared.status())
    }

    /// Diagnostic snapshot of every session. No network I/O.
    pub fn health(&self) -> Vec<SessionHealth> {
        self.sessions
            .iter()
            .map(|entry| {
                let shared = &entry.value().shared;
                SessionHealth {
                    edge_id: shared.edge.id.clone(),
                    target: shared.edge.target_address.clone(),
                    status: shared.status(),
                    reconnect_attempts: shared.reconnect_attempts.load(Ordering::Relaxed),
                    millis_since_activity: shared.millis_since_activity(),
                }
            })
            .collect()
    }
}

/// Sleep for `delay`, returning `true` if cancellation fired first.
async fn sleep_or_cancel(delay: Duration, cancel_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = cancel_rx.changed() => {
            if changed.is_ok() && *cancel_rx.borrow() {
                true
            } else {
                // Sender dropped or spurious wake: finish the wait.
                tokio::time::sleep(delay).await;
                false
            }
        }
    }
}

/// Open the transport with shrinking per-attempt timeouts.
///
/// After `max_connect_attempts`, drops to the long-period background retry
/// instead of failing — only a non-retryable error or cancellation ends
/// the loop.
async fn establish(
    config: &SessionConfig,
    transport: &dyn Transport,
    delivery_tx: mpsc::Sender<Delivery>,
    cancel_rx: &mut watch::Receiver<bool>,
    shared: &SessionShared,
    connecting_status: SessionStatus,
) -> Result<TransportHandle> {
    shared.set_status(connecting_status);
    let edge = &shared.edge;
    let retry = config.reconnect_retry_config();
    let mut attempt = 0usize;

    loop {
        if *cancel_rx.borrow() {
            return Err(FederationError::Shutdown);
        }

        attempt += 1;
        let per_attempt = config.connect_timeout_for_attempt(attempt);

        match tokio::time::timeout(per_attempt, transport.start(edge, delivery_tx.clone())).await {
            Ok(Ok(handle)) => {
                crate::metrics::record_session_connect(&edge.id, true);
                if attempt > 1 {
                    info!(edge_id = %edge.id, attempt, "Transport opened after retry");
                }
                return Ok(handle);
            }
            Ok(Err(e)) if !e.is_retryable() => {
                crate::metrics::record_session_connect(&edge.id, false);
                return Err(e);
            }
            Ok(Err(e)) => {
                warn!(edge_id = %edge.id, attempt, error = %e, "Transport open failed");
            }
            Err(_) => {
                warn!(
                    edge_id = %edge.id,
                    attempt,
                    timeout_ms = per_attempt.as_millis() as u64,
                    "Transport open timed out"
                );
            }
        }
        crate::metrics::record_session_connect(&edge.id, false);

        let delay = if attempt >= config.max_connect_attempts {
            if attempt == config.max_connect_attempts {
                info!(
                    edge_id = %edge.id,
                    period_sec = config.fallback_retry_sec,
                    "Connect attempts exhausted, falling back to background retry"
                );
            }
            config.fallback_retry()
        } else {
            retry.jittered_delay(attempt)
        };

        if sleep_or_cancel(delay, cancel_rx).await {
            return Err(FederationError::Shutdown);
        }
    }
}

/// One pass of "catch up to where I should already be": query the
/// target's existing content and reconcile it once, independent of live
/// delivery. The recursion rule is applied inside the reconciler.
async fn initial_sync(reconciler: &Reconciler, registry: &StoreRegistry, edge: &FollowEdge) {
    match registry.fetch_head(&edge.target_address).await {
        Ok(docs) => {
            let items = parse_content_items(docs);
            let fetched = items.len();
            let outcome = reconciler.reconcile(edge, items, vec![], false).await;
            info!(
                edge_id = %edge.id,
                fetched,
                imported = outcome.imported,
                skipped = outcome.skipped,
                "Initial sync complete"
            );
        }
        Err(e) => {
            // Not fatal: live delivery is running and the next reconnect
            // runs another initial sync.
            warn!(edge_id = %edge.id, error = %e, "Initial sync failed");
        }
    }
}

/// The per-edge driver task: connect, sync, then serve deliveries and
/// health ticks until cancelled.
async fn run_session(
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    reconciler: Arc<Reconciler>,
    registry: Arc<StoreRegistry>,
    shared: Arc<SessionShared>,
    mut cancel_rx: watch::Receiver<bool>,
    rate_limiter: Option<Arc<RateLimiter>>,
) {
    let edge = shared.edge.clone();
    let buffer = config.delivery_buffer.max(1);
    let (delivery_tx, mut delivery_rx) = mpsc::channel::<Delivery>(buffer);

    let mut transport_handle = match establish(
        &config,
        transport.as_ref(),
        delivery_tx,
        &mut cancel_rx,
        &shared,
        SessionStatus::Connecting,
    )
    .await
    {
        Ok(handle) => Some(handle),
        Err(FederationError::Shutdown) => return,
        Err(e) => {
            error!(edge_id = %edge.id, error = %e, "Session establishment failed");
            shared.set_status(SessionStatus::Failed);
            return;
        }
    };

    initial_sync(&reconciler, &registry, &edge).await;
    shared.touch();
    shared.set_status(SessionStatus::Active);

    let mut health = tokio::time::interval(config.health_interval());
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    health.tick().await; // the first tick is immediate; consume it

    let mut rx_open = true;

    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            delivery = delivery_rx.recv(), if rx_open => {
                let Some(delivery) = delivery else {
                    // Transport tasks are gone; the health check will
                    // notice the silence and drive a reconnect.
                    debug!(edge_id = %edge.id, "Delivery channel closed");
                    rx_open = false;
                    continue;
                };

                if let Some(limiter) = &rate_limiter {
                    limiter.acquire().await;
                }

                crate::metrics::record_delivery(
                    &edge.id,
                    delivery.added.len(),
                    delivery.removed.len(),
                    delivery.realtime,
                );
                reconciler
                    .reconcile(&edge, delivery.added, delivery.removed, delivery.realtime)
                    .await;

                // Any successful activity restores Active and resets the
                // reconnect attempt counter.
                shared.touch();
                shared.reconnect_attempts.store(0, Ordering::Relaxed);
                shared.set_status(SessionStatus::Active);
            }
            _ = health.tick() => {
                match shared.status() {
                    SessionStatus::Active
                        if shared.millis_since_activity()
                            >= config.idle_threshold().as_millis() as u64 =>
                    {
                        warn!(
                            edge_id = %edge.id,
                            idle_ms = shared.millis_since_activity(),
                            "Session degraded (idle past threshold)"
                        );
                        shared.set_status(SessionStatus::Degraded);
                    }
                    SessionStatus::Degraded => {
                        shared.set_status(SessionStatus::Reconnecting);
                        if let Some(handle) = transport_handle.take() {
                            handle.stop().await;
                        }

                        // Reconcile anything the old transport had already
                        // delivered before its channel is replaced.
                        while let Ok(delivery) = delivery_rx.try_recv() {
                            reconciler
                                .reconcile(
                                    &edge,
                                    delivery.added,
                                    delivery.removed,
                                    delivery.realtime,
                                )
                                .await;
                            shared.touch();
                        }

                        let attempt =
                            shared.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
                        let delay = config
                            .reconnect_retry_config()
                            .jittered_delay(attempt as usize);
                        info!(
                            edge_id = %edge.id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Reconnecting after backoff"
                        );

                        if sleep_or_cancel(delay, &mut cancel_rx).await {
                            break;
                        }

                        // Fresh channel for the fresh transport.
                        let (new_tx, new_rx) = mpsc::channel::<Delivery>(buffer);
                        delivery_rx = new_rx;
                        rx_open = true;

                        match establish(
                            &config,
                            transport.as_ref(),
                            new_tx,
                            &mut cancel_rx,
                            &shared,
                            SessionStatus::Reconnecting,
                        )
                        .await
                        {
                            Ok(handle) => {
                                transport_handle = Some(handle);
                                initial_sync(&reconciler, &registry, &edge).await;
                                shared.touch();
                                shared.reconnect_attempts.store(0, Ordering::Relaxed);
                                shared.set_status(SessionStatus::Active);
                            }
                            Err(FederationError::Shutdown) => break,
                            Err(e) => {
                                // Back to Degraded so the next tick retries
                                // with a larger backoff.
                                warn!(edge_id = %edge.id, error = %e, "Reconnect failed");
                                shared.set_status(SessionStatus::Degraded);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(handle) = transport_handle.take() {
        handle.stop().await;
    }
    debug!(edge_id = %edge.id, "Session driver stopped");
}
