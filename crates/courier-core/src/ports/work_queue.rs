//! WorkQueue port - claim ベースの永続キュー
//!
//! # 設計原則
//! - 各操作は store 上の 1 つの atomic な文として適用される
//! - claim は skip-on-conflict: 並行 claimer は互いを待たず、同じ行を取らない
//! - クラッシュした worker の claim は `reclaim_stale` で pending に戻る

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    DeadLetterId, DeadLetterReason, NewWorkItem, StoreError, WorkItem, WorkItemId, WorkerId,
};
use crate::observability::QueueCounts;

/// Result of releasing a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The item was not claimed (already terminal, released, or unknown).
    NotClaimed,
    /// Back in the pending pool with the new retry count.
    Requeued { retry_count: u32 },
    /// Retry budget exhausted; archived and removed from the active table.
    DeadLettered { dead_letter_id: DeadLetterId },
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Idempotent upsert. If an unprocessed item with the same dedup key
    /// exists, its priority and retry metadata are updated and its id is
    /// returned instead of inserting a new row.
    async fn enqueue(&self, item: NewWorkItem) -> Result<WorkItemId, StoreError>;

    /// Atomically claim up to `batch_size` claimable items for `worker_id`,
    /// ordered by priority desc, created_at asc, id asc.
    async fn claim(&self, worker_id: &WorkerId, batch_size: usize)
    -> Result<Vec<WorkItem>, StoreError>;

    /// `success` marks the item processed; failure returns it to the pending
    /// pool immediately with `retry_count + 1` (archiving it if that exhausts
    /// the budget). Returns `false` when the item is not currently claimed.
    async fn complete(
        &self,
        id: WorkItemId,
        success: bool,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        if success {
            self.mark_processed(id).await
        } else {
            let error = error.unwrap_or_else(|| "failed".to_string());
            let outcome = self.fail(id, error, None).await?;
            Ok(outcome != FailOutcome::NotClaimed)
        }
    }

    /// Terminal success. `false` if the item is not currently claimed.
    async fn mark_processed(&self, id: WorkItemId) -> Result<bool, StoreError>;

    /// Release a claimed item after a failed attempt. `not_before` delays the
    /// next claim (backoff); `None` makes it claimable at once.
    async fn fail(
        &self,
        id: WorkItemId,
        error: String,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<FailOutcome, StoreError>;

    /// Archive a claimed item now, without consuming retry budget.
    async fn dead_letter(
        &self,
        id: WorkItemId,
        reason: DeadLetterReason,
        message: String,
    ) -> Result<Option<DeadLetterId>, StoreError>;

    /// Release every claim older than `threshold`. Returns how many.
    async fn reclaim_stale(&self, threshold: Duration) -> Result<u64, StoreError>;

    /// Refresh `claimed_at` of items still claimed by `worker_id`.
    async fn heartbeat(&self, ids: &[WorkItemId], worker_id: &WorkerId)
    -> Result<u64, StoreError>;

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;

    /// Delete at most `limit` processed rows older than `older_than`.
    async fn purge_processed(&self, older_than: Duration, limit: usize)
    -> Result<u64, StoreError>;
}
