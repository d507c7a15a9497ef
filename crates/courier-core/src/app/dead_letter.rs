//! DeadLetterService - 運用者向けの dead-letter 照会と replay
//!
//! # 学習ポイント
//! - 「なぜ詰まったか」を reason / failure_reason / retry_count で説明する
//! - replay は original_id ごとに 1 回だけ（2 回目以降は同じ replay_id を返す）
//! - 存在しない original_id の replay は fail closed（`ReplayTargetMissing`）

use std::sync::Arc;

use tracing::info;

use crate::domain::{
    CourierError, DeadLetterFilter, DeadLetterRecord, DeadLetterView, ReasonCount,
    ReplayOutcome, ReplayRecord, ReplayRequest, WorkItemId,
};
use crate::ports::DeadLetterStore;

/// One archived item with its replay history.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterDetail {
    pub record: DeadLetterRecord,
    pub replay: Option<ReplayRecord>,
}

impl DeadLetterDetail {
    /// The archived payload, when it is JSON.
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.record.payload).ok()
    }
}

pub struct DeadLetterService {
    store: Arc<dyn DeadLetterStore>,
}

impl DeadLetterService {
    pub fn new(store: Arc<dyn DeadLetterStore>) -> Self {
        Self { store }
    }

    pub async fn inspect(&self, original_id: WorkItemId) -> Result<Option<DeadLetterDetail>, CourierError> {
        let Some(record) = self.store.get_dead_letter(original_id).await? else {
            return Ok(None);
        };
        let replay = self.store.get_replay(original_id).await?;
        Ok(Some(DeadLetterDetail { record, replay }))
    }

    pub async fn list(
        &self,
        filter: &DeadLetterFilter,
        limit: usize,
    ) -> Result<Vec<DeadLetterView>, CourierError> {
        Ok(self.store.list_dead_letters(filter, limit).await?)
    }

    pub async fn top_reasons(&self, n: usize) -> Result<Vec<ReasonCount>, CourierError> {
        Ok(self.store.top_reasons(n).await?)
    }

    pub async fn replay(
        &self,
        original_id: WorkItemId,
        request: ReplayRequest,
    ) -> Result<ReplayOutcome, CourierError> {
        let replayed_by = request.replayed_by.clone();
        let outcome = self.store.replay(original_id, request).await?;
        info!(
            item_id = %original_id,
            replay_id = %outcome.replay_id,
            was_duplicate = outcome.was_duplicate,
            replayed_by = %replayed_by,
            "dead letter replay"
        );
        Ok(outcome)
    }

    /// Replay every match of `filter` not replayed yet. Returns the new outcomes.
    pub async fn replay_matching(
        &self,
        filter: &DeadLetterFilter,
        limit: usize,
        request: &ReplayRequest,
    ) -> Result<Vec<(WorkItemId, ReplayOutcome)>, CourierError> {
        let mut replayed = Vec::new();
        for view in self.store.list_dead_letters(filter, limit).await? {
            if view.already_replayed {
                continue;
            }
            let id = view.record.original_id;
            replayed.push((id, self.replay(id, request.clone()).await?));
        }
        Ok(replayed)
    }
}
