//! Error types for orbit-sync

use thiserror::Error;

/// Result type alias using orbit-sync's `SyncError`
pub type Result<T> = std::result::Result<T, SyncError>;

/// Terminal outcomes delivered to the caller of a sync operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The queue reached capacity and this operation was evicted
    #[error("Queue full, operation dropped")]
    QueueFull,

    /// Quota retries were exhausted for this operation
    #[error("Max retries reached: {0}")]
    RetriesExhausted(String),

    /// The operation was cancelled before dispatch
    #[error("Operation cancelled")]
    Cancelled,

    /// All pending operations were cleared
    #[error("Queue cleared")]
    Cleared,

    /// The remote store reported a non-retryable failure
    #[error("Remote write failed: {0}")]
    Remote(String),
}
