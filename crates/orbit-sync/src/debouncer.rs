//! Trailing-edge debouncing of per-entity writes
//!
//! Rapid mutations of one entity collapse into a single delayed flush
//! carrying the latest value. The flush deadline is anchored to the first
//! pending mutation, so a key under continuous churn still flushes within
//! the configured cap.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::DebounceOptions;
use crate::error::Result;
use crate::key::EntityKey;

/// Latest pending state for one entity awaiting flush
struct DebounceEntry {
    entity: Value,
    first_seen: Instant,
    timer: JoinHandle<()>,
}

/// Collapses repeated mutations of the same entity into one delayed write
pub struct Debouncer {
    pending: Arc<Mutex<HashMap<EntityKey, DebounceEntry>>>,
    options: DebounceOptions,
}

impl Debouncer {
    /// Create a debouncer with the given delay policy
    pub fn new(options: DebounceOptions) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            options,
        }
    }

    /// Schedule a write for the entity, replacing any pending one
    ///
    /// Fire and forget: the flush runs on its own timer and reports failures
    /// through tracing. Only the newest entity value survives coalescing.
    /// Must be called from within a tokio runtime.
    pub fn debounce<F, Fut>(&self, collection: &str, entity_id: &str, entity: Value, write_fn: F)
    where
        F: FnOnce(String, String, Value) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let key = EntityKey::new(collection, entity_id);
        let now = Instant::now();

        let mut pending = self.pending.lock();
        let first_seen = match pending.get(&key) {
            Some(entry) => {
                entry.timer.abort();
                entry.first_seen
            }
            None => now,
        };
        let deadline = first_seen + self.delay_for(now.duration_since(first_seen));

        let pending_map = Arc::clone(&self.pending);
        let task_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // Remove before invoking: a failed write must not leave the key pending
            let entry = pending_map.lock().remove(&task_key);
            let Some(entry) = entry else {
                return;
            };
            if let Err(error) = write_fn(
                task_key.collection.clone(),
                task_key.entity_id.clone(),
                entry.entity,
            )
            .await
            {
                tracing::warn!(key = %task_key, %error, "Debounced write failed");
            }
        });

        pending.insert(
            key,
            DebounceEntry {
                entity,
                first_seen,
                timer,
            },
        );
    }

    /// Execute immediately, cancelling any pending flush for the key
    pub async fn flush_now<F, Fut>(
        &self,
        collection: &str,
        entity_id: &str,
        entity: Value,
        write_fn: F,
    ) -> Result<()>
    where
        F: FnOnce(String, String, Value) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.cancel(collection, entity_id);
        write_fn(collection.to_string(), entity_id.to_string(), entity).await
    }

    /// Discard any pending flush for the key
    pub fn cancel(&self, collection: &str, entity_id: &str) {
        let key = EntityKey::new(collection, entity_id);
        if let Some(entry) = self.pending.lock().remove(&key) {
            entry.timer.abort();
        }
    }

    /// Number of keys currently awaiting a flush
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Discard every pending flush
    pub fn clear_all(&self) {
        let mut pending = self.pending.lock();
        for (_, entry) in pending.drain() {
            entry.timer.abort();
        }
    }

    /// Delay from the first pending mutation: grows with pending age, capped
    fn delay_for(&self, elapsed: Duration) -> Duration {
        let steps = u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX);
        self.options
            .base_delay
            .saturating_add(self.options.step.saturating_mul(steps))
            .min(self.options.max_delay)
    }
}
