//! Inbound snapshot throttling
//!
//! Remote snapshot listeners can fire far faster than the UI needs. Each
//! collection gets a trailing-edge throttle window and an optional
//! unchanged-signature filter so callbacks only run for materially fresh
//! data.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

/// Callback receiving a throttled snapshot
pub type SnapshotCallback = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Per-collection throttling policy
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Trailing-edge delivery window
    pub throttle: Duration,
    /// Suppress snapshots whose id/timestamp signature did not change
    pub skip_unchanged: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_secs(1),
            skip_unchanged: true,
        }
    }
}

impl ListenerConfig {
    #[must_use]
    pub const fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    #[must_use]
    pub const fn with_skip_unchanged(mut self, skip_unchanged: bool) -> Self {
        self.skip_unchanged = skip_unchanged;
        self
    }
}

/// A delivery waiting out its throttle window; only the newest snapshot
/// survives
struct PendingDelivery {
    snapshot: Vec<Value>,
    callback: SnapshotCallback,
    timer: JoinHandle<()>,
}

struct ListenerInner {
    configs: Mutex<HashMap<String, ListenerConfig>>,
    last_delivered: Mutex<HashMap<String, HashMap<String, Value>>>,
    pending: Mutex<HashMap<String, PendingDelivery>>,
}

/// Rate-limits and deduplicates inbound snapshot notifications per collection
pub struct ListenerThrottle {
    inner: Arc<ListenerInner>,
}

impl Default for ListenerThrottle {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerThrottle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                configs: Mutex::new(HashMap::new()),
                last_delivered: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Set the throttling policy for a collection
    pub fn configure(&self, collection: &str, config: ListenerConfig) {
        self.inner
            .configs
            .lock()
            .insert(collection.to_string(), config);
    }

    /// The configured policy for a collection, if any
    pub fn config(&self, collection: &str) -> Option<ListenerConfig> {
        self.inner.configs.lock().get(collection).cloned()
    }

    /// Hand a fresh snapshot to the callback, throttled per the collection's
    /// policy
    ///
    /// Unconfigured collections deliver immediately. While a window is open,
    /// newer snapshots replace the pending one; the timer delivers whatever
    /// is newest when it fires. Must be called from within a tokio runtime.
    pub fn deliver(&self, collection: &str, callback: SnapshotCallback, snapshot: Vec<Value>) {
        let Some(config) = self.config(collection) else {
            callback(&snapshot);
            return;
        };

        if config.skip_unchanged {
            let signature = snapshot_signature(&snapshot);
            if self.inner.last_delivered.lock().get(collection) == Some(&signature) {
                tracing::trace!(collection, "Snapshot signature unchanged, suppressed");
                return;
            }
        }

        let mut pending = self.inner.pending.lock();
        if let Some(entry) = pending.get_mut(collection) {
            entry.snapshot = snapshot;
            entry.callback = callback;
            return;
        }

        let inner = Arc::clone(&self.inner);
        let name = collection.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(config.throttle).await;
            let entry = inner.pending.lock().remove(&name);
            let Some(entry) = entry else {
                return;
            };
            if config.skip_unchanged {
                inner
                    .last_delivered
                    .lock()
                    .insert(name, snapshot_signature(&entry.snapshot));
            }
            (entry.callback)(&entry.snapshot);
        });
        pending.insert(
            collection.to_string(),
            PendingDelivery {
                snapshot,
                callback,
                timer,
            },
        );
    }

    /// Abort any pending delivery for the collection
    pub fn clear(&self, collection: &str) {
        if let Some(entry) = self.inner.pending.lock().remove(collection) {
            entry.timer.abort();
        }
    }

    /// Abort every pending delivery
    pub fn clear_all(&self) {
        let mut pending = self.inner.pending.lock();
        for (_, entry) in pending.drain() {
            entry.timer.abort();
        }
    }
}

/// Lightweight snapshot identity: document id mapped to its freshest
/// timestamp field
fn snapshot_signature(snapshot: &[Value]) -> HashMap<String, Value> {
    snapshot
        .iter()
        .filter_map(|document| {
            let id = document.get("id")?;
            let id = id
                .as_str()
                .map_or_else(|| id.to_string(), ToString::to_string);
            let stamp = document
                .get("updatedAt")
                .or_else(|| document.get("createdAt"))
                .cloned()
                .unwrap_or(Value::Null);
            Some((id, stamp))
        })
        .collect()
}
