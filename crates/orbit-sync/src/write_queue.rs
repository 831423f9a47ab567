//! Rate-limited retrying write queue
//!
//! Serializes outgoing entity writes into a bounded FIFO drained by a single
//! task: batches are dispatched concurrently, batch starts are spaced by a
//! minimum interval, and quota errors trigger exponential backoff both for
//! the drain loop and for individual operation retries.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::config::QueueOptions;
use crate::error::{Result, SyncError};
use crate::key::EntityKey;
use crate::writer::RemoteWriter;

/// One pending remote write, owned by the queue until resolved
struct QueuedOperation {
    id: String,
    key: EntityKey,
    entity: Value,
    retries: u32,
    enqueued_at: Instant,
    completion: oneshot::Sender<Result<()>>,
}

/// A retry re-admission waiting out its backoff delay
struct RetryTimer {
    key: EntityKey,
    handle: JoinHandle<()>,
}

struct QueueState {
    queue: VecDeque<QueuedOperation>,
    draining: bool,
    last_dispatch: Option<Instant>,
    consecutive_errors: u32,
    retry_timers: HashMap<String, RetryTimer>,
}

struct QueueInner {
    writer: Arc<dyn RemoteWriter>,
    options: QueueOptions,
    state: Mutex<QueueState>,
}

/// Snapshot of queue state for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub is_draining: bool,
    pub consecutive_errors: u32,
}

/// Awaitable completion handle returned by [`WriteQueue::enqueue`]
///
/// Resolves when the operation succeeds, fails terminally, or is dropped.
pub struct WriteTicket {
    receiver: oneshot::Receiver<Result<()>>,
}

impl Future for WriteTicket {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(SyncError::Cancelled)))
    }
}

/// Bounded FIFO of outgoing writes with rate limiting and retry
#[derive(Clone)]
pub struct WriteQueue {
    inner: Arc<QueueInner>,
}

impl WriteQueue {
    /// Create a queue draining into the given remote writer
    pub fn new(writer: Arc<dyn RemoteWriter>, options: QueueOptions) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                writer,
                options,
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    draining: false,
                    last_dispatch: None,
                    consecutive_errors: 0,
                    retry_timers: HashMap::new(),
                }),
            }),
        }
    }

    /// Queue a write and return a ticket resolving with its terminal outcome
    ///
    /// Must be called from within a tokio runtime. On overflow the oldest
    /// queued operation is evicted and its ticket rejected; the new operation
    /// is still accepted.
    pub fn enqueue(&self, collection: &str, entity_id: &str, entity: Value) -> WriteTicket {
        let (completion, receiver) = oneshot::channel();
        let operation = QueuedOperation {
            id: operation_id(collection, entity_id),
            key: EntityKey::new(collection, entity_id),
            entity,
            retries: 0,
            enqueued_at: Instant::now(),
            completion,
        };
        tracing::debug!(operation = %operation.id, "Queued write");
        self.push_bounded(operation);
        self.kick();
        WriteTicket { receiver }
    }

    /// Write immediately, bypassing the queue, spacing, and backoff
    pub async fn force_now(
        &self,
        collection: &str,
        entity_id: &str,
        entity: &Value,
    ) -> Result<()> {
        self.inner
            .writer
            .write(collection, entity_id, entity)
            .await
            .map_err(|error| SyncError::Remote(error.message().to_string()))
    }

    /// Reject all queued operations for the key and abort its pending retries
    ///
    /// Operations already dispatched to the remote run to completion.
    pub fn cancel(&self, collection: &str, entity_id: &str) {
        let key = EntityKey::new(collection, entity_id);
        let removed: Vec<QueuedOperation> = {
            let mut state = self.inner.state.lock();
            let mut kept = VecDeque::with_capacity(state.queue.len());
            let mut removed = Vec::new();
            for operation in state.queue.drain(..) {
                if operation.key == key {
                    removed.push(operation);
                } else {
                    kept.push_back(operation);
                }
            }
            state.queue = kept;
            state.retry_timers.retain(|_, timer| {
                if timer.key == key {
                    timer.handle.abort();
                    false
                } else {
                    true
                }
            });
            removed
        };
        for operation in removed {
            tracing::debug!(operation = %operation.id, "Cancelled queued write");
            let _ = operation.completion.send(Err(SyncError::Cancelled));
        }
    }

    /// Reject every pending operation and abort all scheduled retries
    pub fn clear(&self) {
        let (pending, timers) = {
            let mut state = self.inner.state.lock();
            let pending: Vec<QueuedOperation> = state.queue.drain(..).collect();
            let timers: Vec<RetryTimer> = state.retry_timers.drain().map(|(_, t)| t).collect();
            (pending, timers)
        };
        for timer in timers {
            timer.handle.abort();
        }
        for operation in pending {
            let _ = operation.completion.send(Err(SyncError::Cleared));
        }
        tracing::debug!("Write queue cleared");
    }

    /// Current queue depth, drain state, and error streak
    pub fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock();
        QueueStatus {
            queue_length: state.queue.len(),
            is_draining: state.draining,
            consecutive_errors: state.consecutive_errors,
        }
    }

    /// Insert honoring capacity: overflow evicts and rejects the oldest
    fn push_bounded(&self, operation: QueuedOperation) {
        let evicted = {
            let mut state = self.inner.state.lock();
            let evicted = if state.queue.len() >= self.inner.options.max_queue_size {
                state.queue.pop_front()
            } else {
                None
            };
            state.queue.push_back(operation);
            evicted
        };
        if let Some(oldest) = evicted {
            tracing::warn!(
                operation = %oldest.id,
                age = ?oldest.enqueued_at.elapsed(),
                "Write queue full, dropping oldest operation"
            );
            let _ = oldest.completion.send(Err(SyncError::QueueFull));
        }
    }

    /// Start the drain task unless one is already active
    fn kick(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.draining || state.queue.is_empty() {
                return;
            }
            state.draining = true;
        }
        let queue = self.clone();
        tokio::spawn(async move { queue.drain().await });
    }

    /// The single drain loop: space, dispatch a batch, settle, back off
    async fn drain(self) {
        loop {
            let wait = {
                let mut state = self.inner.state.lock();
                if state.queue.is_empty() {
                    state.draining = false;
                    return;
                }
                state
                    .last_dispatch
                    .map(|last| self.inner.options.min_write_interval.saturating_sub(last.elapsed()))
            };
            if let Some(wait) = wait {
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }

            let batch: Vec<QueuedOperation> = {
                let mut state = self.inner.state.lock();
                let take = self.inner.options.batch_size.max(1).min(state.queue.len());
                state.queue.drain(..take).collect()
            };
            if batch.is_empty() {
                // Cleared or cancelled during the spacing wait
                continue;
            }

            let mut dispatches = JoinSet::new();
            for operation in batch {
                let queue = self.clone();
                dispatches.spawn(async move { queue.execute(operation).await });
            }
            while dispatches.join_next().await.is_some() {}

            let backoff = {
                let mut state = self.inner.state.lock();
                state.last_dispatch = Some(Instant::now());
                (state.consecutive_errors > 0).then(|| {
                    (
                        state.consecutive_errors,
                        self.backoff_delay(state.consecutive_errors),
                    )
                })
            };
            if let Some((consecutive_errors, delay)) = backoff {
                tracing::info!(consecutive_errors, ?delay, "Backing off after quota errors");
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Dispatch one operation and route its outcome
    async fn execute(&self, mut operation: QueuedOperation) {
        let result = self
            .inner
            .writer
            .write(
                &operation.key.collection,
                &operation.key.entity_id,
                &operation.entity,
            )
            .await;

        match result {
            Ok(()) => {
                self.inner.state.lock().consecutive_errors = 0;
                let _ = operation.completion.send(Ok(()));
            }
            Err(error) if error.is_quota() => {
                self.inner.state.lock().consecutive_errors += 1;
                if operation.retries < self.inner.options.max_retries {
                    operation.retries += 1;
                    let delay = self.backoff_delay(operation.retries);
                    tracing::warn!(
                        operation = %operation.id,
                        attempt = operation.retries,
                        max_retries = self.inner.options.max_retries,
                        ?delay,
                        "Quota error, scheduling retry"
                    );
                    self.schedule_retry(operation, delay);
                } else {
                    tracing::error!(operation = %operation.id, "Max retries reached");
                    let _ = operation
                        .completion
                        .send(Err(SyncError::RetriesExhausted(error.message().to_string())));
                }
            }
            Err(error) => {
                // Non-quota failures go straight back to the caller, never retried
                let _ = operation
                    .completion
                    .send(Err(SyncError::Remote(error.message().to_string())));
            }
        }
    }

    /// Re-admit the operation after its backoff delay, off the drain loop
    fn schedule_retry(&self, operation: QueuedOperation, delay: Duration) {
        let operation_id = operation.id.clone();
        let key = operation.key.clone();
        let queue = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.inner.state.lock().retry_timers.remove(&operation.id);
            queue.push_bounded(operation);
            queue.kick();
        });
        self.inner
            .state
            .lock()
            .retry_timers
            .insert(operation_id, RetryTimer { key, handle });
    }

    /// `min(initial * 2^(attempt - 1), max)`
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.inner
            .options
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.inner.options.max_backoff)
    }
}

/// Unique-enough id for logs and retry bookkeeping
fn operation_id(collection: &str, entity_id: &str) -> String {
    format!(
        "{collection}_{entity_id}_{}",
        chrono::Utc::now().timestamp_millis()
    )
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::time::sleep;

    use crate::writer::WriteError;

    use super::*;

    struct ScriptedWriter {
        calls: Mutex<Vec<(String, Instant)>>,
        script: Mutex<VecDeque<std::result::Result<(), WriteError>>>,
        latency: Duration,
    }

    impl ScriptedWriter {
        fn succeeding() -> Arc<Self> {
            Self::with_script(Vec::new())
        }

        fn with_script(script: Vec<std::result::Result<(), WriteError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                script: Mutex::new(script.into()),
                latency: Duration::ZERO,
            })
        }

        fn with_latency(latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                script: Mutex::new(VecDeque::new()),
                latency,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        fn call_instants(&self) -> Vec<Instant> {
            self.calls.lock().iter().map(|(_, at)| *at).collect()
        }

        fn quota() -> std::result::Result<(), WriteError> {
            Err(WriteError::QuotaExhausted("resource-exhausted".into()))
        }
    }

    #[async_trait]
    impl RemoteWriter for ScriptedWriter {
        async fn write(
            &self,
            collection: &str,
            entity_id: &str,
            _entity: &Value,
        ) -> std::result::Result<(), WriteError> {
            self.calls
                .lock()
                .push((format!("{collection}/{entity_id}"), Instant::now()));
            if !self.latency.is_zero() {
                sleep(self.latency).await;
            }
            self.script.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    fn queue_with(writer: Arc<ScriptedWriter>, options: QueueOptions) -> WriteQueue {
        WriteQueue::new(writer, options)
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_resolves_on_success() {
        let writer = ScriptedWriter::succeeding();
        let queue = queue_with(Arc::clone(&writer), QueueOptions::default());

        let ticket = queue.enqueue("tasks", "t1", json!({"id": "t1"}));
        assert_eq!(ticket.await, Ok(()));
        assert_eq!(writer.call_count(), 1);
        assert_eq!(queue.status().queue_length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_evicts_the_oldest_operation() {
        let writer = ScriptedWriter::succeeding();
        let queue = queue_with(
            Arc::clone(&writer),
            QueueOptions::default().with_max_queue_size(2),
        );

        let first = queue.enqueue("tasks", "t1", json!({"id": "t1"}));
        let second = queue.enqueue("tasks", "t2", json!({"id": "t2"}));
        let third = queue.enqueue("tasks", "t3", json!({"id": "t3"}));
        assert_eq!(queue.status().queue_length, 2);

        let (first, second, third) = tokio::join!(first, second, third);
        assert_eq!(first, Err(SyncError::QueueFull));
        assert_eq!(second, Ok(()));
        assert_eq!(third, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_starts_respect_min_write_interval() {
        let writer = ScriptedWriter::succeeding();
        let queue = queue_with(
            Arc::clone(&writer),
            QueueOptions::default()
                .with_batch_size(1)
                .with_min_write_interval(Duration::from_millis(100)),
        );

        let first = queue.enqueue("tasks", "t1", json!({}));
        let second = queue.enqueue("tasks", "t2", json!({}));
        let third = queue.enqueue("tasks", "t3", json!({}));
        let _ = tokio::join!(first, second, third);

        let instants = writer.call_instants();
        assert_eq!(instants.len(), 3);
        assert!(instants[1].duration_since(instants[0]) >= Duration::from_millis(100));
        assert!(instants[2].duration_since(instants[1]) >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn spacing_spans_separate_drain_runs() {
        let writer = ScriptedWriter::succeeding();
        let queue = queue_with(
            Arc::clone(&writer),
            QueueOptions::default().with_min_write_interval(Duration::from_millis(100)),
        );

        queue.enqueue("tasks", "t1", json!({})).await.unwrap();
        queue.enqueue("tasks", "t2", json!({})).await.unwrap();

        let instants = writer.call_instants();
        assert!(instants[1].duration_since(instants[0]) >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn a_batch_dispatches_concurrently() {
        let writer = ScriptedWriter::with_latency(Duration::from_millis(50));
        let queue = queue_with(Arc::clone(&writer), QueueOptions::default());

        let first = queue.enqueue("tasks", "t1", json!({}));
        let second = queue.enqueue("tasks", "t2", json!({}));
        let third = queue.enqueue("tasks", "t3", json!({}));
        let _ = tokio::join!(first, second, third);

        let instants = writer.call_instants();
        assert_eq!(instants.len(), 3);
        assert_eq!(instants[0], instants[1]);
        assert_eq!(instants[1], instants[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_errors_retry_with_growing_backoff() {
        let writer =
            ScriptedWriter::with_script(vec![ScriptedWriter::quota(), ScriptedWriter::quota(), Ok(())]);
        let queue = queue_with(Arc::clone(&writer), QueueOptions::default());

        let ticket = queue.enqueue("tasks", "t1", json!({"id": "t1"}));
        assert_eq!(ticket.await, Ok(()));

        let instants = writer.call_instants();
        assert_eq!(instants.len(), 3);
        assert_eq!(instants[1].duration_since(instants[0]), Duration::from_secs(1));
        assert_eq!(instants[2].duration_since(instants[1]), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_reject_the_caller() {
        let writer = ScriptedWriter::with_script(vec![
            ScriptedWriter::quota(),
            ScriptedWriter::quota(),
            ScriptedWriter::quota(),
            ScriptedWriter::quota(),
        ]);
        let queue = queue_with(Arc::clone(&writer), QueueOptions::default());

        let outcome = queue.enqueue("tasks", "t1", json!({})).await;
        assert_eq!(
            outcome,
            Err(SyncError::RetriesExhausted("resource-exhausted".into()))
        );
        assert_eq!(writer.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn non_quota_failure_rejects_immediately() {
        let writer =
            ScriptedWriter::with_script(vec![Err(WriteError::Failed("permission denied".into()))]);
        let queue = queue_with(Arc::clone(&writer), QueueOptions::default());

        let outcome = queue.enqueue("tasks", "t1", json!({})).await;
        assert_eq!(outcome, Err(SyncError::Remote("permission denied".into())));
        assert_eq!(writer.call_count(), 1);
        assert_eq!(queue.status().consecutive_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_rejects_every_pending_operation() {
        let writer = ScriptedWriter::succeeding();
        let queue = queue_with(Arc::clone(&writer), QueueOptions::default());

        let first = queue.enqueue("tasks", "t1", json!({}));
        let second = queue.enqueue("tasks", "t2", json!({}));
        queue.clear();

        let (first, second) = tokio::join!(first, second);
        assert_eq!(first, Err(SyncError::Cleared));
        assert_eq!(second, Err(SyncError::Cleared));
        assert_eq!(writer.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_rejects_only_the_matching_key() {
        let writer = ScriptedWriter::succeeding();
        let queue = queue_with(Arc::clone(&writer), QueueOptions::default());

        let doomed = queue.enqueue("tasks", "t1", json!({}));
        let kept = queue.enqueue("tasks", "t2", json!({}));
        queue.cancel("tasks", "t1");

        let (doomed, kept) = tokio::join!(doomed, kept);
        assert_eq!(doomed, Err(SyncError::Cancelled));
        assert_eq!(kept, Ok(()));
        assert_eq!(writer.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_a_scheduled_retry() {
        let writer = ScriptedWriter::with_script(vec![ScriptedWriter::quota()]);
        let queue = queue_with(Arc::clone(&writer), QueueOptions::default());

        let ticket = queue.enqueue("tasks", "t1", json!({}));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(writer.call_count(), 1);

        queue.cancel("tasks", "t1");
        assert_eq!(ticket.await, Err(SyncError::Cancelled));

        sleep(Duration::from_secs(5)).await;
        assert_eq!(writer.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn force_now_skips_the_queue() {
        let writer =
            ScriptedWriter::with_script(vec![Err(WriteError::Failed("offline".into()))]);
        let queue = queue_with(Arc::clone(&writer), QueueOptions::default());

        let outcome = queue.force_now("tasks", "t1", &json!({})).await;
        assert_eq!(outcome, Err(SyncError::Remote("offline".into())));
        assert_eq!(writer.call_count(), 1);
        assert_eq!(queue.status().queue_length, 0);
    }
}
