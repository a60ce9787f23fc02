// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for applied bus updates.
//!
//! Stores the timestamp of the last applied [`UpdateMessage`] for each
//! follow edge in SQLite. This survives bus restarts and daemon restarts:
//! after a restart, the live phase can skip updates it has already applied
//! instead of re-running them through reconciliation.
//!
//! Checkpoints are strictly advisory. Reconciliation is idempotent, so a
//! lost or stale checkpoint only costs duplicate no-op work, never
//! correctness.
//!
//! # Debounced Writes
//!
//! To reduce SQLite write pressure, checkpoints are debounced:
//! - `set()` updates the in-memory cache immediately and marks the edge dirty
//! - `flush_dirty()` persists all dirty checkpoints to disk in a batch
//! - The engine calls `flush_dirty()` periodically (every few seconds)
//! - On shutdown, `flush_dirty()` is called to ensure no data loss
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes retry with exponential backoff (max 5 attempts), and
//! the cache is updated first so readers never block on a contended disk.
//!
//! [`UpdateMessage`]: crate::model::UpdateMessage

use crate::error::{FederationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error.
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED.
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_checkpoint_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Persistent checkpoint storage backed by SQLite.
///
/// Supports debounced writes: updates go to cache immediately,
/// and are flushed to disk periodically via `flush_dirty()`.
pub struct CheckpointStore {
    /// SQLite connection pool
    pool: SqlitePool,
    /// In-memory cache for fast reads
    cache: Arc<RwLock<HashMap<String, u64>>>,
    /// Edge ids with dirty (not yet persisted) checkpoints
    dirty: Arc<RwLock<HashSet<String>>>,
    /// Path to database file
    path: String,
}

impl CheckpointStore {
    /// Create a new checkpoint store at the given path.
    ///
    /// Creates the database and tables if they don't exist.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing checkpoint store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path_str}?mode=rwc"))
            .map_err(|e| FederationError::Config(format!("Invalid SQLite path: {e}")))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        // A :memory: database exists per connection; the pool must stay at
        // one so every operation sees the same tables.
        let max_connections = if path_str == ":memory:" { 1 } else { 2 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                edge_id TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        // Load existing checkpoints into cache
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT edge_id, applied_at FROM checkpoints")
            .fetch_all(&pool)
            .await?;

        let mut cache = HashMap::new();
        for (edge_id, applied_at) in rows {
            debug!(edge_id = %edge_id, applied_at, "Loaded checkpoint from disk");
            cache.insert(edge_id, applied_at.max(0) as u64);
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path: path_str,
        })
    }

    /// Get the checkpoint for an edge (from cache).
    ///
    /// Returns `None` if no update was ever applied for this edge.
    pub async fn get(&self, edge_id: &str) -> Option<u64> {
        self.cache.read().await.get(edge_id).copied()
    }

    /// Update the checkpoint for an edge (debounced).
    ///
    /// Only moves forward: a stale timestamp never overwrites a newer one,
    /// so out-of-order applies cannot roll the checkpoint back.
    pub async fn set(&self, edge_id: &str, applied_at: u64) {
        {
            let mut cache = self.cache.write().await;
            let entry = cache.entry(edge_id.to_string()).or_insert(0);
            if applied_at <= *entry {
                return;
            }
            *entry = applied_at;
        }

        self.dirty.write().await.insert(edge_id.to_string());
        debug!(edge_id = %edge_id, applied_at, "Checkpoint updated (pending flush)");
    }

    /// Flush all dirty checkpoints to disk.
    ///
    /// Call this periodically (e.g., every 5 seconds) and on shutdown.
    /// Returns the number of checkpoints flushed.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty_edges: Vec<String> = {
            let mut dirty = self.dirty.write().await;
            dirty.drain().collect()
        };

        if dirty_edges.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let cache = self.cache.read().await;
        let pool = &self.pool;

        let mut flushed = 0;
        let mut errors = 0;

        for edge_id in &dirty_edges {
            if let Some(&applied_at) = cache.get(edge_id) {
                let edge_id_owned = edge_id.clone();

                let result = execute_with_retry("checkpoint_flush", || async {
                    sqlx::query(
                        r#"
                        INSERT INTO checkpoints (edge_id, applied_at, updated_at)
                        VALUES (?, ?, ?)
                        ON CONFLICT(edge_id) DO UPDATE SET
                            applied_at = excluded.applied_at,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(&edge_id_owned)
                    .bind(applied_at as i64)
                    .bind(now)
                    .execute(pool)
                    .await
                })
                .await;

                match result {
                    Ok(_) => flushed += 1,
                    Err(e) => {
                        errors += 1;
                        warn!(edge_id = %edge_id, error = %e, "Failed to flush checkpoint");
                        // Re-mark as dirty so we retry next flush
                        self.dirty.write().await.insert(edge_id.clone());
                    }
                }
            }
        }

        if flushed > 0 {
            debug!(flushed, errors, "Flushed dirty checkpoints");
            crate::metrics::record_checkpoint_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(FederationError::Internal(format!(
                "Failed to flush {errors} checkpoints"
            )));
        }

        Ok(flushed)
    }

    /// Check if there are any dirty (unflushed) checkpoints.
    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    /// Delete the checkpoint for an edge (when the edge is removed).
    pub async fn delete(&self, edge_id: &str) -> Result<()> {
        self.cache.write().await.remove(edge_id);
        self.dirty.write().await.remove(edge_id);

        let pool = &self.pool;
        let edge_id_owned = edge_id.to_string();

        execute_with_retry("checkpoint_delete", || async {
            sqlx::query("DELETE FROM checkpoints WHERE edge_id = ?")
                .bind(&edge_id_owned)
                .execute(pool)
                .await
        })
        .await?;

        info!(edge_id = %edge_id, "Deleted checkpoint");
        Ok(())
    }

    /// Get all checkpoints (for diagnostics).
    pub async fn get_all(&self) -> HashMap<String, u64> {
        self.cache.read().await.clone()
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the connection pool gracefully.
    ///
    /// Flushes any dirty checkpoints and checkpoints WAL before closing.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) => {
                    if count > 0 {
                        info!(count, "Flushed dirty checkpoints on close");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to flush dirty checkpoints on close");
                }
            }
        }

        let result = execute_with_retry("wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&self.pool)
                .await
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }

        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}
