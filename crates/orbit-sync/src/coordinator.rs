//! Sync coordinator
//!
//! One facade over the four reliability components, wired the way the data
//! layer consumes them: change detection gates the debouncer, debounced
//! flushes feed the write queue, the queue drains into the injected remote
//! writer, and inbound snapshots pass through the listener throttle.

use std::sync::Arc;

use serde_json::Value;

use crate::change_detector::{ChangeDetector, DetectorStats};
use crate::config::SyncOptions;
use crate::debouncer::Debouncer;
use crate::error::Result;
use crate::listener::{ListenerConfig, ListenerThrottle, SnapshotCallback};
use crate::write_queue::{QueueStatus, WriteQueue, WriteTicket};
use crate::writer::RemoteWriter;

/// What `sync_entity` decided to do with a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDisposition {
    /// Content matches the last synced state; nothing was scheduled
    Unchanged,
    /// A debounced write was scheduled
    Scheduled,
}

/// Combined diagnostics across all components
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CoordinatorStatus {
    pub queue: QueueStatus,
    pub pending_debounces: usize,
    pub detector: DetectorStats,
}

/// Drives local mutations to a quota-limited remote store, politely
pub struct SyncCoordinator {
    detector: Arc<ChangeDetector>,
    debouncer: Debouncer,
    queue: WriteQueue,
    listeners: ListenerThrottle,
}

impl SyncCoordinator {
    /// Create a coordinator draining into the injected remote writer
    ///
    /// Each instance owns all of its state; independent instances never
    /// interfere with each other.
    pub fn new(writer: Arc<dyn RemoteWriter>, options: SyncOptions) -> Self {
        Self {
            detector: Arc::new(ChangeDetector::new(options.detector)),
            debouncer: Debouncer::new(options.debounce),
            queue: WriteQueue::new(writer, options.queue),
            listeners: ListenerThrottle::new(),
        }
    }

    /// Whether the entity's content changed since its last acknowledged sync
    pub fn should_sync(&self, collection: &str, entity_id: &str, entity: &Value) -> bool {
        self.detector.should_sync(collection, entity_id, entity)
    }

    /// Record the entity as synced in its current state
    pub fn mark_synced(&self, collection: &str, entity_id: &str, entity: &Value) {
        self.detector.mark_synced(collection, entity_id, entity);
    }

    /// Forget the synced state of one entity
    pub fn clear_synced(&self, collection: &str, entity_id: &str) {
        self.detector.clear(collection, entity_id);
    }

    /// Forget all synced state
    pub fn clear_all_synced(&self) {
        self.detector.clear_all();
    }

    /// Queue a write directly, skipping change detection and debouncing
    pub fn enqueue_write(&self, collection: &str, entity_id: &str, entity: Value) -> WriteTicket {
        self.queue.enqueue(collection, entity_id, entity)
    }

    /// Schedule a debounced write for the entity (fire and forget)
    ///
    /// The eventual flush goes through the write queue; success updates the
    /// change detector, failure is reported through tracing since no caller
    /// is left to notify.
    pub fn debounce_write(&self, collection: &str, entity_id: &str, entity: Value) {
        let queue = self.queue.clone();
        let detector = Arc::clone(&self.detector);
        self.debouncer.debounce(
            collection,
            entity_id,
            entity,
            move |collection, entity_id, entity| async move {
                queue.enqueue(&collection, &entity_id, entity.clone()).await?;
                detector.mark_synced(&collection, &entity_id, &entity);
                Ok(())
            },
        );
    }

    /// Route one mutation through the full pipeline
    ///
    /// Consults the change detector first; only materially changed entities
    /// are scheduled.
    pub fn sync_entity(
        &self,
        collection: &str,
        entity_id: &str,
        entity: Value,
    ) -> SyncDisposition {
        if !self.detector.should_sync(collection, entity_id, &entity) {
            tracing::trace!(collection, entity_id, "Entity unchanged, skipping sync");
            return SyncDisposition::Unchanged;
        }
        self.debounce_write(collection, entity_id, entity);
        SyncDisposition::Scheduled
    }

    /// Write immediately, bypassing debounce, queue spacing, and backoff
    ///
    /// Cancels any pending debounced flush for the key first.
    pub async fn flush_now(&self, collection: &str, entity_id: &str, entity: &Value) -> Result<()> {
        self.debouncer.cancel(collection, entity_id);
        self.queue.force_now(collection, entity_id, entity).await?;
        self.detector.mark_synced(collection, entity_id, entity);
        Ok(())
    }

    /// Drop the pending debounce and queued writes for one entity
    pub fn cancel(&self, collection: &str, entity_id: &str) {
        self.debouncer.cancel(collection, entity_id);
        self.queue.cancel(collection, entity_id);
    }

    /// Set the throttling policy for an inbound snapshot listener
    pub fn configure_listener(&self, collection: &str, config: ListenerConfig) {
        self.listeners.configure(collection, config);
    }

    /// The configured listener policy for a collection, if any
    pub fn listener_config(&self, collection: &str) -> Option<ListenerConfig> {
        self.listeners.config(collection)
    }

    /// Hand an inbound snapshot to the callback, throttled per collection
    pub fn deliver(&self, collection: &str, callback: SnapshotCallback, snapshot: Vec<Value>) {
        self.listeners.deliver(collection, callback, snapshot);
    }

    /// Abort any pending snapshot delivery for the collection
    pub fn clear_listener(&self, collection: &str) {
        self.listeners.clear(collection);
    }

    /// Combined diagnostics snapshot
    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            queue: self.queue.status(),
            pending_debounces: self.debouncer.pending_count(),
            detector: self.detector.stats(),
        }
    }
}
