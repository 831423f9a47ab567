//! Change detection for entity writes
//!
//! Keeps a fingerprint of every entity's content as of its last acknowledged
//! sync, so unchanged entities never reach the write queue. Fingerprints
//! ignore the bookkeeping timestamps the sync itself rewrites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::config::DetectorOptions;
use crate::key::EntityKey;

/// Top-level fields excluded from the fingerprint; they change on every sync
const VOLATILE_FIELDS: [&str; 3] = ["updatedAt", "syncedAt", "createdAt"];

/// Last known synced state of one entity
struct ChangeRecord {
    /// Deep snapshot of the entity as acknowledged by the remote
    snapshot: Value,
    fingerprint: i32,
    recorded_at: Instant,
}

#[derive(Default)]
struct DetectorMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Snapshot of detector state for diagnostics
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct DetectorStats {
    /// Records currently held
    pub total: usize,
    /// Records still within the freshness TTL
    pub valid: usize,
    /// Records past the TTL awaiting overwrite
    pub expired: usize,
    /// `should_sync` calls answered "unchanged"
    pub hits: u64,
    /// `should_sync` calls answered "needs sync"
    pub misses: u64,
}

/// Decides whether an entity's meaningful content changed since the last sync
pub struct ChangeDetector {
    records: Mutex<HashMap<EntityKey, ChangeRecord>>,
    ttl: Duration,
    metrics: DetectorMetrics,
}

impl ChangeDetector {
    /// Create a detector with the given freshness policy
    pub fn new(options: DetectorOptions) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl: options.ttl,
            metrics: DetectorMetrics::default(),
        }
    }

    /// Whether the entity needs to be written to the remote
    ///
    /// Returns true when no record exists, the record is older than the TTL,
    /// or the content fingerprint differs. An entity that cannot be
    /// fingerprinted always needs sync.
    pub fn should_sync(&self, collection: &str, entity_id: &str, entity: &Value) -> bool {
        let key = EntityKey::new(collection, entity_id);
        let needed = self.needs_sync(&key, entity);
        if needed {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        }
        needed
    }

    fn needs_sync(&self, key: &EntityKey, entity: &Value) -> bool {
        let Some(current) = fingerprint(entity) else {
            return true;
        };
        let records = self.records.lock();
        let Some(record) = records.get(key) else {
            return true;
        };
        if record.recorded_at.elapsed() > self.ttl {
            return true;
        }
        current != record.fingerprint
    }

    /// Record the entity as synced in its current state
    pub fn mark_synced(&self, collection: &str, entity_id: &str, entity: &Value) {
        let key = EntityKey::new(collection, entity_id);
        let Some(fingerprint) = fingerprint(entity) else {
            // Unfingerprintable entities must keep forcing a sync decision
            self.records.lock().remove(&key);
            return;
        };
        self.records.lock().insert(
            key,
            ChangeRecord {
                snapshot: entity.clone(),
                fingerprint,
                recorded_at: Instant::now(),
            },
        );
    }

    /// The entity state stored by the last `mark_synced`, if any
    pub fn synced_snapshot(&self, collection: &str, entity_id: &str) -> Option<Value> {
        let key = EntityKey::new(collection, entity_id);
        self.records
            .lock()
            .get(&key)
            .map(|record| record.snapshot.clone())
    }

    /// Drop the record for one entity
    pub fn clear(&self, collection: &str, entity_id: &str) {
        let key = EntityKey::new(collection, entity_id);
        self.records.lock().remove(&key);
    }

    /// Drop all records
    pub fn clear_all(&self) {
        self.records.lock().clear();
    }

    /// Current cache and hit/miss statistics
    pub fn stats(&self) -> DetectorStats {
        let records = self.records.lock();
        let mut valid = 0;
        let mut expired = 0;
        for record in records.values() {
            if record.recorded_at.elapsed() <= self.ttl {
                valid += 1;
            } else {
                expired += 1;
            }
        }
        DetectorStats {
            total: records.len(),
            valid,
            expired,
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
        }
    }
}

/// Fingerprint the entity's meaningful content, or `None` if it cannot be
/// serialized
fn fingerprint(entity: &Value) -> Option<i32> {
    let text = serde_json::to_string(&canonical_form(entity)).ok()?;
    Some(fold_hash(&text))
}

/// Entity with volatile bookkeeping fields stripped; `serde_json` object maps
/// are sorted by key, which keeps the serialization canonical
fn canonical_form(entity: &Value) -> Value {
    match entity {
        Value::Object(fields) => {
            let mut clean = fields.clone();
            for field in VOLATILE_FIELDS {
                clean.remove(field);
            }
            Value::Object(clean)
        }
        other => other.clone(),
    }
}

/// Cheap order-dependent 32-bit fold; not cryptographic
fn fold_hash(text: &str) -> i32 {
    let mut hash: i32 = 0;
    for ch in text.chars() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(ch as i32);
    }
    hash
}
