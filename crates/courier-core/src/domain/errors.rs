//! Errors - エラー型と分類
//!
//! - `FailureKind`: handler / delivery の失敗分類（retry するか、即 dead-letter か）
//! - `HandlerError`: handler が返すエラー
//! - `StoreError`: backing store の失敗（`Unavailable` はサブシステム全体の停止）
//! - `CourierError`: crate 全体のエラー

use thiserror::Error;

use super::ids::WorkItemId;

/// Operational classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Timeout, 5xx, connection reset: retry with backoff.
    Transient,
    /// Validation fault, malformed payload, 4xx: dead-letter now.
    Permanent,
    /// Denied by the governance gate: dead-letter now, never auto-retried.
    GovernanceBlocked,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

/// Error returned by a handler. The kind decides what happens to the item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct HandlerError {
    pub kind: FailureKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Failure of a backing-store statement.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store cannot be reached. The loops back off and retry the whole
    /// poll cycle; this is reported apart from per-item failures.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A row exists but could not be decoded into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum CourierError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Registry(#[from] crate::typed::RegistryError),

    #[error(transparent)]
    Build(#[from] crate::app::BuildError),

    #[error("broker error: {0}")]
    Broker(String),

    /// Replay was asked for an item with no dead-letter record.
    #[error("no dead-letter record for {0}")]
    ReplayTargetMissing(WorkItemId),
}

impl From<crate::ports::ReplayError> for CourierError {
    fn from(err: crate::ports::ReplayError) -> Self {
        match err {
            crate::ports::ReplayError::NotDeadLettered(id) => CourierError::ReplayTargetMissing(id),
            crate::ports::ReplayError::Store(e) => CourierError::Store(e),
        }
    }
}

pub type Result<T, E = CourierError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(HandlerError::transient("timeout").is_retryable());
        assert!(!HandlerError::permanent("bad payload").is_retryable());
        assert!(!FailureKind::GovernanceBlocked.is_retryable());
    }

    #[test]
    fn handler_error_display_includes_kind() {
        let err = HandlerError::permanent("bad payload");
        assert_eq!(err.to_string(), "Permanent: bad payload");
    }
}
