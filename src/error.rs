// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the federation engine.
//!
//! Errors are categorized by their source (message bus, content store,
//! checkpoint database, caller mistakes) and include context to help with
//! debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Connection` | Yes | Remote collection unreachable, open timed out |
//! | `Bus` | Yes | Message bus errors, timeouts, connection failures |
//! | `DiscoveryTimeout` | Yes | No subscriber found within the discovery window |
//! | `Store` | Yes | Content store temporarily unavailable |
//! | `StoreCorrupted` | No | Sentinel corruption detected on read |
//! | `MessageFormat` | No | Malformed inbound federation message |
//! | `WriteDenied` | No | Access control rejected a write |
//! | `Checkpoint` | No | Local SQLite errors (needs operator attention) |
//! | `SelfFollow` | No | Attempted follow edge to the local node |
//! | `EdgeExists` | No | A follow edge to that target already exists |
//! | `EdgeNotFound` | No | No follow edge with that id |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`FederationError::is_retryable()`] to determine if an operation
//! should be retried with backoff. Retryable errors indicate transient
//! network or availability issues. Non-retryable errors indicate bugs,
//! configuration problems, bad input, or policy denials.
//!
//! Nothing in this crate escalates an error into process termination:
//! retryable errors feed the backoff loops, per-message errors are dropped
//! and logged, and everything else is returned to the caller that requested
//! the mutation.

use thiserror::Error;

/// Result type alias for federation operations.
pub type Result<T> = std::result::Result<T, FederationError>;

/// Errors that can occur during federation.
///
/// Each variant includes context about where the error occurred.
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried.
#[derive(Error, Debug)]
pub enum FederationError {
    /// Remote collection could not be opened or the connection dropped.
    ///
    /// Retryable with exponential backoff; the session manager owns the
    /// retry schedule.
    #[error("Connection error ({address}): {message}")]
    Connection { address: String, message: String },

    /// Message bus command or connection error.
    ///
    /// Occurs when publishing or subscribing on the federation topic.
    /// Typically retryable (network timeouts, connection drops).
    #[error("Bus error ({operation}): {message}")]
    Bus {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// No subscriber appeared on a topic within the discovery window.
    ///
    /// The publish is abandoned quietly; the next update will try again.
    #[error("Subscriber discovery timed out for topic {topic}")]
    DiscoveryTimeout { topic: String },

    /// Content store communication failure.
    ///
    /// Retryable - the store may be temporarily overloaded.
    #[error("Store error: {0}")]
    Store(String),

    /// The content store returned its corruption sentinel on a read.
    ///
    /// Not retryable. Federation index queries degrade to empty results
    /// instead of propagating this.
    #[error("Store corrupted: {0}")]
    StoreCorrupted(String),

    /// An inbound federation message failed to deserialize.
    ///
    /// The single message is dropped and logged; the session continues.
    #[error("Message format error: {0}")]
    MessageFormat(String),

    /// Access control rejected a write on behalf of `actor`.
    ///
    /// The specific item is skipped; never treated as a session failure.
    #[error("Write denied for actor {actor}")]
    WriteDenied { actor: String },

    /// SQLite error during checkpoint persistence.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] sqlx::Error),

    /// A follow edge pointing at the local node was requested.
    ///
    /// A node must never follow itself.
    #[error("Cannot follow own address {address}")]
    SelfFollow { address: String },

    /// A follow edge to this target already exists.
    #[error("Follow edge to {target} already exists")]
    EdgeExists { target: String },

    /// No follow edge with the given id.
    #[error("No follow edge with id {id}")]
    EdgeNotFound { id: String },

    /// Invalid or missing configuration.
    ///
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running engine).
    /// Not retryable - indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    ///
    /// Catch-all for errors that shouldn't happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FederationError {
    /// Create a bus error from a redis::RedisError.
    pub fn bus(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Bus {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a bus error without source.
    pub fn bus_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Bus {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error.
    pub fn connection(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Bus { .. } => true,
            Self::DiscoveryTimeout { .. } => true,
            Self::Store(_) => true,
            Self::StoreCorrupted(_) => false,
            Self::MessageFormat(_) => false,
            Self::WriteDenied { .. } => false,
            Self::Checkpoint(_) => false,
            Self::SelfFollow { .. } => false,
            Self::EdgeExists { .. } => false,
            Self::EdgeNotFound { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<redis::RedisError> for FederationError {
    fn from(e: redis::RedisError) -> Self {
        Self::bus("unknown", e)
    }
}

impl From<crate::store::StoreError> for FederationError {
    fn from(e: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match e {
            StoreError::Unavailable(msg) => Self::Store(msg),
            StoreError::Corrupted(msg) => Self::StoreCorrupted(msg),
            StoreError::Denied(actor) => Self::WriteDenied { actor },
            StoreError::InvalidDocument(msg) => Self::MessageFormat(msg),
        }
    }
}
