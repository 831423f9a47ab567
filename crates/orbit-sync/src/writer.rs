//! Injected remote-write collaborator
//!
//! The concrete remote client is provided at construction time; this crate
//! never imports it and treats entities as opaque JSON documents.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure reported by the remote store for a single write
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// The remote signalled resource exhaustion; the write may be retried
    #[error("Resource exhausted: {0}")]
    QuotaExhausted(String),

    /// Any other remote failure; never retried
    #[error("{0}")]
    Failed(String),
}

impl WriteError {
    /// Whether this failure is the retryable quota/backpressure class
    pub const fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExhausted(_))
    }

    /// The remote-provided failure message
    pub fn message(&self) -> &str {
        match self {
            Self::QuotaExhausted(message) | Self::Failed(message) => message,
        }
    }
}

/// Destination for outgoing entity writes
#[async_trait]
pub trait RemoteWriter: Send + Sync {
    /// Write one entity document into the named collection
    async fn write(
        &self,
        collection: &str,
        entity_id: &str,
        entity: &Value,
    ) -> Result<(), WriteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_class_is_machine_readable() {
        assert!(WriteError::QuotaExhausted("resource-exhausted".into()).is_quota());
        assert!(!WriteError::Failed("permission denied".into()).is_quota());
    }

    #[test]
    fn message_is_preserved() {
        let error = WriteError::Failed("permission denied".into());
        assert_eq!(error.message(), "permission denied");
        assert_eq!(error.to_string(), "permission denied");
    }
}
