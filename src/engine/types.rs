// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state types.
//!
//! Defines the state machine for the federation engine lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                             │
//!    │ (never started)             │ (sessions rebuilt)
//!    ↓                             ↓
//! Stopped                      Running
//!    ↑                             │
//!    │                   shutdown()│
//!    └─────────────── ShuttingDown ┘
//!
//! Starting ──(checkpoint store unusable)──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: after `FederationEngine::new()`. Nothing running.
//! - **Starting**: `start()` called; persisted follow edges are being
//!   loaded and their sessions rebuilt.
//! - **Running**: sessions live, deliveries reconciling, publisher
//!   announcing local changes.
//! - **ShuttingDown**: `shutdown()` called; sessions and background tasks
//!   draining.
//! - **Stopped**: clean shutdown complete. Safe to drop.
//! - **Failed**: `start()` hit an unrecoverable error (bad configuration,
//!   unusable checkpoint database).

use crate::session::SessionHealth;

/// State of the federation engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    Created,
    /// Rebuilding sessions from persisted follow edges.
    Starting,
    /// Running and federating.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
    /// Stopped cleanly. Safe to drop or recreate.
    Stopped,
    /// Failed to start. Check logs for details.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Health snapshot for monitoring endpoints.
///
/// Collected from cached internal state only — no network I/O.
#[derive(Debug, Clone)]
pub struct FederationHealth {
    /// Engine lifecycle state.
    pub state: EngineState,
    /// True when the engine is running (sessions may still be connecting).
    pub ready: bool,
    pub sessions_total: usize,
    pub sessions_active: usize,
    pub sessions_degraded: usize,
    pub sessions_failed: usize,
    /// Per-session detail.
    pub sessions: Vec<SessionHealth>,
}
