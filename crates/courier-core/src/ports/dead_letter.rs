//! DeadLetterStore port - 終端アーカイブと idempotent な replay
//!
//! Archival itself happens inside `WorkQueue::fail` / `WorkQueue::dead_letter`
//! so that removing the active row and writing the archive row is one step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    DeadLetterFilter, DeadLetterRecord, DeadLetterView, PartitionKey, ReasonCount,
    ReplayOutcome, ReplayRecord, ReplayRequest, StoreError, WorkItemId,
};

/// Why a replay did not happen.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// Fail closed: nothing was archived under this id.
    #[error("no dead-letter record for {0}")]
    NotDeadLettered(WorkItemId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn get_dead_letter(
        &self,
        original_id: WorkItemId,
    ) -> Result<Option<DeadLetterRecord>, StoreError>;

    /// Newest first, with the replay flag resolved.
    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        limit: usize,
    ) -> Result<Vec<DeadLetterView>, StoreError>;

    /// The `n` most frequent archive reasons.
    async fn top_reasons(&self, n: usize) -> Result<Vec<ReasonCount>, StoreError>;

    /// First call for `original_id` re-enqueues the archived payload and
    /// records the replay (`was_duplicate = false`). Every later call returns
    /// the same `replay_id` with `was_duplicate = true` and enqueues nothing.
    async fn replay(
        &self,
        original_id: WorkItemId,
        request: ReplayRequest,
    ) -> Result<ReplayOutcome, ReplayError>;

    async fn get_replay(&self, original_id: WorkItemId)
    -> Result<Option<ReplayRecord>, StoreError>;

    /// Drop every partition whose rows are all older than `cutoff`.
    async fn drop_partitions_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PartitionKey>, StoreError>;
}
