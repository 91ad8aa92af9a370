//! Sync-layer configuration.
//!
//! The thresholds and backoff parameters that govern compaction and history
//! loading are all explicit here; nothing in the coordinator hard-codes them.

use std::time::Duration;

/// How the classifier tells updates and snapshots apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassifierMode {
    /// One dedicated message type per kind.
    #[default]
    Dedicated,
    /// A single generic message type; the kind is carried as a body prefix.
    GenericPrefix,
}

/// Backoff parameters for transport calls during history loading.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Growth factor applied after each failed attempt
    pub multiplier: u32,
    /// Total attempts including the first (None = retry forever)
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            multiplier: 2,
            max_attempts: Some(8),
        }
    }
}

impl RetryConfig {
    /// Config for testing (millisecond delays, few attempts).
    pub fn for_testing() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2,
            max_attempts: Some(3),
        }
    }
}

/// Room sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Number of updates since the last snapshot that triggers compaction
    /// (0 disables automatic compaction)
    pub snapshot_interval_updates: usize,
    /// Classifier strategy
    pub classifier: ClassifierMode,
    /// Messages requested per history page
    pub history_page_size: usize,
    /// LZ4-compress snapshot state before text encoding
    pub compress_snapshots: bool,
    /// Backoff for history fetches
    pub retry: RetryConfig,
    /// Maximum local updates buffered while the transport is unreachable
    pub offline_queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_updates: 30,
            classifier: ClassifierMode::Dedicated,
            history_page_size: 50,
            compress_snapshots: true,
            retry: RetryConfig::default(),
            offline_queue_capacity: 10_000,
        }
    }
}

impl SyncConfig {
    /// Create config for testing (small pages, fast retries).
    pub fn for_testing() -> Self {
        Self {
            snapshot_interval_updates: 0,
            classifier: ClassifierMode::Dedicated,
            history_page_size: 4,
            compress_snapshots: true,
            retry: RetryConfig::for_testing(),
            offline_queue_capacity: 128,
        }
    }

    /// Select the classifier mode from the legacy boolean flag.
    pub fn use_messages_as_generic_type(mut self, generic: bool) -> Self {
        self.classifier = if generic {
            ClassifierMode::GenericPrefix
        } else {
            ClassifierMode::Dedicated
        };
        self
    }

    /// Set the compaction threshold.
    pub fn with_snapshot_interval(mut self, updates: usize) -> Self {
        self.snapshot_interval_updates = updates;
        self
    }
}
