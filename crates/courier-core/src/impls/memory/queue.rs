//! WorkQueue for the in-memory store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::InMemoryStore;
use crate::domain::{
    DeadLetterId, DeadLetterReason, ItemState, NewWorkItem, StoreError, WorkItem, WorkItemId,
    WorkerId,
};
use crate::observability::QueueCounts;
use crate::ports::{FailOutcome, WorkQueue, to_chrono};

#[async_trait]
impl WorkQueue for InMemoryStore {
    async fn enqueue(&self, item: NewWorkItem) -> Result<WorkItemId, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        Ok(state.lane(self.lane).upsert(item, now))
    }

    async fn claim(
        &self,
        worker_id: &WorkerId,
        batch_size: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let active = state.lane(self.lane);

        let mut candidates: Vec<&WorkItem> = active
            .items
            .values()
            .filter(|item| item.is_claimable(now))
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        let ids: Vec<WorkItemId> = candidates.iter().take(batch_size).map(|i| i.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = active.items.get_mut(&id) {
                item.claimed_at = Some(now);
                item.claimed_by = Some(worker_id.clone());
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, id: WorkItemId) -> Result<bool, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let active = state.lane(self.lane);
        let Some(item) = active.items.get_mut(&id) else {
            return Ok(false);
        };
        if item.state(now) != ItemState::Claimed {
            return Ok(false);
        }
        item.processed_at = Some(now);
        item.error_message = None;
        let done = item.clone();
        active.release_dedup(&done);
        Ok(true)
    }

    async fn fail(
        &self,
        id: WorkItemId,
        error: String,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<FailOutcome, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let Some(item) = state.lane(self.lane).items.get_mut(&id) else {
            return Ok(FailOutcome::NotClaimed);
        };
        if item.state(now) != ItemState::Claimed {
            return Ok(FailOutcome::NotClaimed);
        }

        item.retry_count += 1;
        item.claimed_at = None;
        item.claimed_by = None;
        item.error_message = Some(error.clone());
        item.next_retry_at = not_before;

        if item.retry_count > item.max_retries {
            let message = format!("retries exhausted after {} attempts: {error}", item.retry_count);
            return Ok(
                match state.archive(self.lane, id, DeadLetterReason::RetriesExhausted, message, now) {
                    Some(dead_letter_id) => FailOutcome::DeadLettered { dead_letter_id },
                    None => FailOutcome::NotClaimed,
                },
            );
        }
        Ok(FailOutcome::Requeued {
            retry_count: item.retry_count,
        })
    }

    async fn dead_letter(
        &self,
        id: WorkItemId,
        reason: DeadLetterReason,
        message: String,
    ) -> Result<Option<DeadLetterId>, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let claimed = state
            .lane_ref(self.lane)
            .and_then(|active| active.items.get(&id))
            .is_some_and(|item| item.state(now) == ItemState::Claimed);
        if !claimed {
            return Ok(None);
        }
        Ok(state.archive(self.lane, id, reason, message, now))
    }

    async fn reclaim_stale(&self, threshold: Duration) -> Result<u64, StoreError> {
        let now = self.now();
        let cutoff = now - to_chrono(threshold);
        let mut state = self.state.lock().await;
        let mut released = 0;
        for item in state.lane(self.lane).items.values_mut() {
            if item.processed_at.is_none() && item.claimed_at.is_some_and(|at| at < cutoff) {
                item.claimed_at = None;
                item.claimed_by = None;
                item.reclaim_count += 1;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn heartbeat(
        &self,
        ids: &[WorkItemId],
        worker_id: &WorkerId,
    ) -> Result<u64, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let active = state.lane(self.lane);
        let mut refreshed = 0;
        for id in ids {
            if let Some(item) = active.items.get_mut(id)
                && item.processed_at.is_none()
                && item.claimed_by.as_ref() == Some(worker_id)
            {
                item.claimed_at = Some(now);
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .lane_ref(self.lane)
            .and_then(|active| active.items.get(&id))
            .cloned())
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let now = self.now();
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        let items = state.lane_ref(self.lane).into_iter().flat_map(|a| a.items.values());
        for item in items {
            match item.state(now) {
                ItemState::Pending => counts.pending += 1,
                ItemState::Scheduled => counts.scheduled += 1,
                ItemState::Claimed => counts.claimed += 1,
                ItemState::Processed => counts.processed += 1,
            }
        }
        Ok(counts)
    }

    async fn purge_processed(
        &self,
        older_than: Duration,
        limit: usize,
    ) -> Result<u64, StoreError> {
        let cutoff = self.now() - to_chrono(older_than);
        let mut state = self.state.lock().await;
        let active = state.lane(self.lane);
        let mut expired: Vec<(DateTime<Utc>, WorkItemId)> = active
            .items
            .values()
            .filter_map(|item| item.processed_at.filter(|at| *at < cutoff).map(|at| (at, item.id)))
            .collect();
        expired.sort();
        expired.truncate(limit);
        for (_, id) in &expired {
            active.items.remove(id);
        }
        Ok(expired.len() as u64)
    }
}
