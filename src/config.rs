//! Configuration for the federation engine.
//!
//! This module defines all configuration types needed to run the federation
//! engine. Configuration is passed to
//! [`FederationEngine::new()`](crate::FederationEngine::new) and can be
//! constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use federation_engine::config::{FederationConfig, TransportKind};
//!
//! let config = FederationConfig {
//!     local_address: "site-a".into(),
//!     transport: TransportKind::MessageBus,
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! FederationConfig
//! ├── local_address: String        # This node's federation address
//! ├── transport: TransportKind     # realtime | message_bus | full_mirror
//! ├── settings: FederationSettings
//! │   ├── session: SessionConfig        # connect/health/backoff tuning
//! │   ├── historical: HistoricalSyncConfig  # bounded catch-up window
//! │   ├── reconcile: ReconcileConfig    # batch sizing
//! │   └── publisher: PublisherConfig    # outbound update publishing
//! └── checkpoint: CheckpointConfig # SQLite checkpoint persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local_address: "riff.site.london-1"
//! transport: message_bus
//!
//! settings:
//!   session:
//!     connect_timeout: "5s"
//!     max_connect_attempts: 5
//!     idle_threshold_sec: 300
//!   historical:
//!     window_sec: 60
//!     poll_interval_sec: 3
//!
//! checkpoint:
//!   sqlite_path: "/var/lib/app/federation_checkpoints.db"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed from daemon to FederationEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `FederationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// The federation address of the local node.
    /// Used for the self-loop guard and to name our own bus topic.
    pub local_address: String,

    /// Which transport strategy sessions use to reach followed nodes.
    #[serde(default)]
    pub transport: TransportKind,

    /// General settings for federation logic (timeouts, batch sizes, etc.)
    #[serde(default)]
    pub settings: FederationSettings,

    /// Checkpoint persistence settings.
    /// Checkpoints are stored in SQLite for restart catch-up.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            local_address: "local.dev.site.default".to_string(),
            transport: TransportKind::default(),
            settings: FederationSettings::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl FederationConfig {
    /// Create a minimal config for testing: fast timers, in-memory checkpoints.
    pub fn for_testing(local_address: &str) -> Self {
        Self {
            local_address: local_address.to_string(),
            transport: TransportKind::Realtime,
            settings: FederationSettings {
                session: SessionConfig::for_testing(),
                historical: HistoricalSyncConfig::for_testing(),
                reconcile: ReconcileConfig::default(),
                publisher: PublisherConfig::for_testing(),
            },
            checkpoint: CheckpointConfig::in_memory(),
        }
    }
}

/// Transport strategy used by subscription sessions.
///
/// All three produce the same reconciliation outcome; they differ in
/// latency, bandwidth and durability cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Change listener on the followed node's collection, opened locally.
    /// Zero added latency, highest resource cost.
    Realtime,
    /// Bounded historical catch-up plus a live pub/sub topic.
    #[default]
    MessageBus,
    /// Complete local replica of the followed node's collection.
    /// For dedicated replicator nodes only.
    FullMirror,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Realtime => write!(f, "realtime"),
            TransportKind::MessageBus => write!(f, "message_bus"),
            TransportKind::FullMirror => write!(f, "full_mirror"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FederationSettings: per-concern tuning sections
// ═══════════════════════════════════════════════════════════════════════════════

/// General settings for the federation logic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FederationSettings {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub historical: HistoricalSyncConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SessionConfig: per-edge session lifecycle tuning
// ═══════════════════════════════════════════════════════════════════════════════

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Timeout for the first connection attempt, as a duration string
    /// (e.g., "5s"). Later attempts shrink this (see
    /// [`connect_timeout_for_attempt`](Self::connect_timeout_for_attempt)).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Connection attempts before falling back to the background retry.
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: usize,

    /// Background retry period after connect attempts are exhausted (seconds).
    #[serde(default = "default_fallback_retry_sec")]
    pub fallback_retry_sec: u64,

    /// Consider a session idle after this long without activity (seconds).
    #[serde(default = "default_idle_threshold_sec")]
    pub idle_threshold_sec: u64,

    /// How often the per-edge health check runs (seconds).
    #[serde(default = "default_health_interval_sec")]
    pub health_interval_sec: u64,

    /// Base reconnect backoff in seconds.
    /// Actual backoff = min(base * 2^attempt, max) with jitter.
    #[serde(default = "default_reconnect_backoff_base_sec")]
    pub reconnect_backoff_base_sec: u64,

    /// Maximum reconnect backoff in seconds (ceiling).
    #[serde(default = "default_reconnect_backoff_max_sec")]
    pub reconnect_backoff_max_sec: u64,

    /// Capacity of the per-edge delivery queue.
    #[serde(default = "default_delivery_buffer")]
    pub delivery_buffer: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (thundering herd prevention)
    // ─────────────────────────────────────────────────────────────────────────

    /// Enable rate limiting for delivery processing.
    /// Prevents thundering herd when many edges reconnect simultaneously.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Maximum deliveries per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Maximum burst size for rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

fn default_max_connect_attempts() -> usize {
    5
}

fn default_fallback_retry_sec() -> u64 {
    30
}

fn default_idle_threshold_sec() -> u64 {
    300 // 5 minutes
}

fn default_health_interval_sec() -> u64 {
    60
}

fn default_reconnect_backoff_base_sec() -> u64 {
    1
}

fn default_reconnect_backoff_max_sec() -> u64 {
    60
}

fn default_delivery_buffer() -> usize {
    64
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: "5s".to_string(),
            max_connect_attempts: 5,
            fallback_retry_sec: 30,
            idle_threshold_sec: 300,
            health_interval_sec: 60,
            reconnect_backoff_base_sec: 1,
            reconnect_backoff_max_sec: 60,
            delivery_buffer: 64,
            rate_limit_enabled: false,
            rate_limit_per_sec: 1000,
            rate_limit_burst: 100,
        }
    }
}

impl SessionConfig {
    /// Fast timers for tests.
    pub fn for_testing() -> Self {
        Self {
            connect_timeout: "500ms".to_string(),
            max_connect_attempts: 3,
            fallback_retry_sec: 1,
            idle_threshold_sec: 1,
            health_interval_sec: 1,
            reconnect_backoff_base_sec: 1,
            reconnect_backoff_max_sec: 2,
            delivery_buffer: 16,
            rate_limit_enabled: false,
            rate_limit_per_sec: 1000,
            rate_limit_burst: 100,
        }
    }

    /// Parse the connect_timeout string to a Duration.
    pub fn connect_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(5))
    }

    /// Per-attempt connection timeout (1-indexed).
    ///
    /// Later attempts get more aggressive timeouts: the full budget on the
    /// first try, half on the second, a third on the third, floored at 500ms
    /// so a deep retry still has a usable window.
    pub fn connect_timeout_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.connect_timeout_duration();
        let shrunk = base / attempt.max(1) as u32;
        shrunk.max(Duration::from_millis(500).min(base))
    }

    /// Idle threshold as a Duration.
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_sec)
    }

    /// Health check interval as a Duration.
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_sec)
    }

    /// Background retry period as a Duration.
    pub fn fallback_retry(&self) -> Duration {
        Duration::from_secs(self.fallback_retry_sec)
    }

    /// Create rate limit configuration from session settings.
    ///
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(crate::resilience::RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }

    /// Reconnect retry config derived from the backoff fields.
    pub fn reconnect_retry_config(&self) -> crate::resilience::RetryConfig {
        crate::resilience::RetryConfig {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(self.reconnect_backoff_base_sec),
            max_delay: Duration::from_secs(self.reconnect_backoff_max_sec),
            backoff_factor: 2.0,
            jitter: 0.1,
            connection_timeout: self.connect_timeout_duration(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HistoricalSyncConfig: bounded catch-up window (message-bus transport)
// ═══════════════════════════════════════════════════════════════════════════════

/// Historical sync (bounded catch-up) configuration.
///
/// The message-bus transport polls the followed node's head state for a
/// fixed wall-clock window, then stops. The window is a timeout abort, not
/// a success condition: a slow or huge remote simply gets a partial
/// catch-up, and the live phase plus idempotent reconciliation absorb the
/// rest over time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalSyncConfig {
    /// Whether the historical phase is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Total wall-clock window in seconds.
    #[serde(default = "default_window_sec")]
    pub window_sec: u64,

    /// Interval between head-state polls in seconds.
    #[serde(default = "default_poll_interval_sec")]
    pub poll_interval_sec: u64,
}

fn default_window_sec() -> u64 {
    60
}

fn default_poll_interval_sec() -> u64 {
    3
}

impl Default for HistoricalSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_sec: 60,
            poll_interval_sec: 3,
        }
    }
}

impl HistoricalSyncConfig {
    /// Fast window for tests.
    pub fn for_testing() -> Self {
        Self {
            enabled: true,
            window_sec: 1,
            poll_interval_sec: 1,
        }
    }

    /// Window as a Duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_sec)
    }

    /// Poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReconcileConfig: import/evict batch sizing
// ═══════════════════════════════════════════════════════════════════════════════

/// Reconciliation batch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Items per batch. Batches run concurrently internally but
    /// sequentially with respect to each other, bounding resource use.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum concurrent store operations across all reconciliation.
    #[serde(default = "default_max_concurrent_imports")]
    pub max_concurrent_imports: usize,
}

fn default_batch_size() -> usize {
    20
}

fn default_max_concurrent_imports() -> usize {
    8
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_concurrent_imports: 8,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PublisherConfig: outbound update publishing (message-bus transport)
// ═══════════════════════════════════════════════════════════════════════════════

/// Outbound update publisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Whether local changes are published to the bus.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How long to wait for a subscriber to appear before giving up on a
    /// publish (seconds). Avoids publishing into the void.
    #[serde(default = "default_discovery_window_sec")]
    pub discovery_window_sec: u64,

    /// Interval between subscriber-count checks during discovery (millis).
    #[serde(default = "default_discovery_poll_ms")]
    pub discovery_poll_ms: u64,
}

fn default_discovery_window_sec() -> u64 {
    5
}

fn default_discovery_poll_ms() -> u64 {
    500
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            discovery_window_sec: 5,
            discovery_poll_ms: 500,
        }
    }
}

impl PublisherConfig {
    /// Fast discovery window for tests.
    pub fn for_testing() -> Self {
        Self {
            enabled: true,
            discovery_window_sec: 1,
            discovery_poll_ms: 50,
        }
    }

    /// Discovery window as a Duration.
    pub fn discovery_window(&self) -> Duration {
        Duration::from_secs(self.discovery_window_sec)
    }

    /// Discovery poll interval as a Duration.
    pub fn discovery_poll(&self) -> Duration {
        Duration::from_millis(self.discovery_poll_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig: checkpoint persistence (internal, not from daemon)
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence configuration.
///
/// Checkpoints track the last-applied bus update per edge. We persist to
/// SQLite because bus messages are ephemeral; a restart without a
/// checkpoint just re-applies recent updates, which reconciliation absorbs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to SQLite database for checkpoint storage.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "federation_checkpoints.db".to_string(),
            wal_mode: true,
        }
    }
}

impl CheckpointConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_federation_config_default() {
        let config = FederationConfig::default();
        assert_eq!(config.local_address, "local.dev.site.default");
        assert_eq!(config.transport, TransportKind::MessageBus);
        assert!(config.settings.historical.enabled);
        assert!(config.settings.publisher.enabled);
    }

    #[test]
    fn test_for_testing_config() {
        let config = FederationConfig::for_testing("test-site");
        assert_eq!(config.local_address, "test-site");
        assert_eq!(config.checkpoint.sqlite_path, ":memory:");
        assert_eq!(config.settings.session.idle_threshold_sec, 1);
    }

    #[test]
    fn test_transport_kind_serde() {
        let json = serde_json::to_string(&TransportKind::MessageBus).unwrap();
        assert_eq!(json, "\"message_bus\"");

        let kind: TransportKind = serde_json::from_str("\"full_mirror\"").unwrap();
        assert_eq!(kind, TransportKind::FullMirror);
    }

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::Realtime.to_string(), "realtime");
        assert_eq!(TransportKind::MessageBus.to_string(), "message_bus");
        assert_eq!(TransportKind::FullMirror.to_string(), "full_mirror");
    }

    #[test]
    fn test_session_connect_timeout_parsing() {
        let config = SessionConfig {
            connect_timeout: "10s".to_string(),
            ..Default::default()
        };
        assert_eq!(config.connect_timeout_duration(), Duration::from_secs(10));
    }

    #[test]
    fn test_session_connect_timeout_invalid_fallback() {
        let config = SessionConfig {
            connect_timeout: "invalid".to_string(),
            ..Default::default()
        };
        // Should fall back to 5 seconds
        assert_eq!(config.connect_timeout_duration(), Duration::from_secs(5));
    }

    #[test]
    fn test_connect_timeout_shrinks_across_attempts() {
        let config = SessionConfig {
            connect_timeout: "6s".to_string(),
            ..Default::default()
        };

        assert_eq!(
            config.connect_timeout_for_attempt(1),
            Duration::from_secs(6)
        );
        assert_eq!(
            config.connect_timeout_for_attempt(2),
            Duration::from_secs(3)
        );
        assert_eq!(
            config.connect_timeout_for_attempt(3),
            Duration::from_secs(2)
        );
        // Floored at 500ms no matter how deep the attempt counter goes.
        assert_eq!(
            config.connect_timeout_for_attempt(100),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_connect_timeout_floor_never_exceeds_base() {
        let config = SessionConfig {
            connect_timeout: "100ms".to_string(),
            ..Default::default()
        };
        // A tiny base timeout is not inflated by the floor.
        assert!(config.connect_timeout_for_attempt(10) <= Duration::from_millis(100));
    }

    #[test]
    fn test_session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_connect_attempts, 5);
        assert_eq!(config.fallback_retry_sec, 30);
        assert_eq!(config.idle_threshold_sec, 300);
        assert!(!config.rate_limit_enabled);
    }

    #[test]
    fn test_session_rate_limit_config() {
        let mut config = SessionConfig::default();
        assert!(config.rate_limit_config().is_none());

        config.rate_limit_enabled = true;
        config.rate_limit_per_sec = 500;
        config.rate_limit_burst = 50;

        let rate = config.rate_limit_config().unwrap();
        assert_eq!(rate.refill_rate, 500);
        assert_eq!(rate.burst_size, 50);
    }

    #[test]
    fn test_session_reconnect_retry_config() {
        let config = SessionConfig {
            reconnect_backoff_base_sec: 2,
            reconnect_backoff_max_sec: 30,
            ..Default::default()
        };
        let retry = config.reconnect_retry_config();
        assert_eq!(retry.initial_delay, Duration::from_secs(2));
        assert_eq!(retry.max_delay, Duration::from_secs(30));
        assert_eq!(retry.max_attempts, usize::MAX);
    }

    #[test]
    fn test_historical_defaults() {
        let config = HistoricalSyncConfig::default();
        assert!(config.enabled);
        assert_eq!(config.window(), Duration::from_secs(60));
        assert_eq!(config.poll_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_reconcile_defaults() {
        let config = ReconcileConfig::default();
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.max_concurrent_imports, 8);
    }

    #[test]
    fn test_publisher_defaults() {
        let config = PublisherConfig::default();
        assert!(config.enabled);
        assert_eq!(config.discovery_window(), Duration::from_secs(5));
        assert_eq!(config.discovery_poll(), Duration::from_millis(500));
    }

    #[test]
    fn test_checkpoint_config_in_memory() {
        let config = CheckpointConfig::in_memory();
        assert_eq!(config.sqlite_path, ":memory:");
        assert!(!config.wal_mode);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = FederationConfig {
            local_address: "site-roundtrip".to_string(),
            transport: TransportKind::FullMirror,
            settings: FederationSettings::default(),
            checkpoint: CheckpointConfig::default(),
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed: FederationConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.local_address, "site-roundtrip");
        assert_eq!(parsed.transport, TransportKind::FullMirror);
    }

    #[test]
    fn test_config_minimal_json() {
        // Every section has serde defaults; only the address is required.
        let parsed: FederationConfig =
            serde_json::from_str(r#"{"local_address": "site-min"}"#).unwrap();
        assert_eq!(parsed.local_address, "site-min");
        assert_eq!(parsed.transport, TransportKind::MessageBus);
        assert_eq!(parsed.settings.reconcile.batch_size, 20);
    }
}
