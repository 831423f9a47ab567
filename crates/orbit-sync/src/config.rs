//! Tunables for the sync components
//!
//! All knobs are constructor options with conservative defaults; there is no
//! configuration file. Per-collection listener settings live in
//! [`crate::listener::ListenerConfig`].

use std::time::Duration;

/// Rate limiting, batching, and retry policy for the write queue
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Minimum spacing between dispatched batches
    pub min_write_interval: Duration,
    /// Maximum operations dispatched concurrently per batch
    pub batch_size: usize,
    /// Quota retries per operation before the caller is rejected
    pub max_retries: u32,
    /// First backoff delay; doubles per consecutive failure
    pub initial_backoff: Duration,
    /// Upper bound for any backoff delay
    pub max_backoff: Duration,
    /// Queue capacity; overflow evicts the oldest pending operation
    pub max_queue_size: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            min_write_interval: Duration::from_millis(100),
            batch_size: 10,
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_queue_size: 100,
        }
    }
}

impl QueueOptions {
    #[must_use]
    pub const fn with_min_write_interval(mut self, interval: Duration) -> Self {
        self.min_write_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    #[must_use]
    pub const fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }
}

/// Trailing-edge debounce policy for per-entity writes
#[derive(Debug, Clone)]
pub struct DebounceOptions {
    /// Base flush delay after the first pending mutation
    pub base_delay: Duration,
    /// Delay growth per full second a key has been pending
    pub step: Duration,
    /// Hard cap on the flush delay from the first pending mutation
    pub max_delay: Duration,
}

impl Default for DebounceOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            step: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl DebounceOptions {
    #[must_use]
    pub const fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    #[must_use]
    pub const fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}

/// Freshness policy for the change-detection cache
#[derive(Debug, Clone)]
pub struct DetectorOptions {
    /// Age after which a synced fingerprint no longer suppresses a write
    pub ttl: Duration,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl DetectorOptions {
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Combined options for a [`crate::coordinator::SyncCoordinator`]
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub queue: QueueOptions,
    pub debounce: DebounceOptions,
    pub detector: DetectorOptions,
}

impl SyncOptions {
    #[must_use]
    pub fn with_queue(mut self, queue: QueueOptions) -> Self {
        self.queue = queue;
        self
    }

    #[must_use]
    pub fn with_debounce(mut self, debounce: DebounceOptions) -> Self {
        self.debounce = debounce;
        self
    }

    #[must_use]
    pub fn with_detector(mut self, detector: DetectorOptions) -> Self {
        self.detector = detector;
        self
    }
}
