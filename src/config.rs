/// Runtime-adjustable transport configuration.
///
/// Every component reads its tunables through a shared [`ConfigHandle`] on
/// each use, so changes take effect immediately without restarting the
/// transport stack. The handle is the single writer surface; components
/// never cache a stale copy beyond one operation.
use std::sync::{Arc, RwLock};

/// Default backoff schedule between retry attempts, in milliseconds.
pub const DEFAULT_BACKOFF_INTERVALS_MS: [u64; 4] = [1000, 2000, 4000, 8000];

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Default connectivity sampling cadence.
pub const DEFAULT_SAMPLING_INTERVAL_MS: u64 = 10_000;

/// Default maximum hop count before a gossip record stops being relayed.
pub const DEFAULT_MAX_HOP_COUNT: u8 = 5;

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Wait times between successive retry attempts. The last interval is
    /// reused if an operation retries more times than there are entries.
    pub backoff_intervals_ms: Vec<u64>,
    /// Retries after the initial attempt, for both direct and queued paths.
    pub max_retries: u32,
    /// Resilience queue capacity. `None` = unbounded.
    pub queue_capacity: Option<usize>,
    /// Error ledger capacity. `None` = unbounded until explicitly capped.
    pub error_log_capacity: Option<usize>,
    /// How often the mode controller samples connectivity.
    pub sampling_interval_ms: u64,
    /// Records whose hop count would exceed this are kept but not relayed.
    pub max_hop_count: u8,
    /// Age after which a pending gossip record gets a one-step priority
    /// boost, so low classes cannot starve behind a continuous urgent stream.
    pub priority_boost_after_ms: i64,
    /// Watermarks for peers unseen this long are pruned.
    pub watermark_ttl_ms: i64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            backoff_intervals_ms: DEFAULT_BACKOFF_INTERVALS_MS.to_vec(),
            max_retries: DEFAULT_MAX_RETRIES,
            queue_capacity: None,
            error_log_capacity: None,
            sampling_interval_ms: DEFAULT_SAMPLING_INTERVAL_MS,
            max_hop_count: DEFAULT_MAX_HOP_COUNT,
            priority_boost_after_ms: 30_000,
            watermark_ttl_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// Shared, runtime-adjustable view of [`TransportConfig`].
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<TransportConfig>>,
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl ConfigHandle {
    pub fn new(config: TransportConfig) -> Self {
        ConfigHandle {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Snapshot of the current configuration.
    pub fn get(&self) -> TransportConfig {
        self.inner.read().unwrap().clone()
    }

    /// Apply a mutation to the live configuration.
    pub fn update<F: FnOnce(&mut TransportConfig)>(&self, f: F) {
        let mut cfg = self.inner.write().unwrap();
        f(&mut cfg);
        log::debug!("transport config updated");
    }
}
