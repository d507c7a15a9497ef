//! DeadLetterStore for the in-memory store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::InMemoryStore;
use crate::domain::{
    DeadLetterFilter, DeadLetterReason, DeadLetterRecord, DeadLetterView, PartitionKey,
    ReasonCount, ReplayId, ReplayOutcome, ReplayRecord, ReplayRequest, StoreError, WorkItemId,
};
use crate::ports::{DeadLetterStore, ReplayError};

#[async_trait]
impl DeadLetterStore for InMemoryStore {
    async fn get_dead_letter(
        &self,
        original_id: WorkItemId,
    ) -> Result<Option<DeadLetterRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.dead_letter_record(original_id).cloned())
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        limit: usize,
    ) -> Result<Vec<DeadLetterView>, StoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<&DeadLetterRecord> = state
            .partitions
            .values()
            .flatten()
            .filter(|r| filter.matches(r))
            .collect();
        records.sort_by(|a, b| {
            b.archived_at
                .cmp(&a.archived_at)
                .then(b.dead_letter_id.cmp(&a.dead_letter_id))
        });

        Ok(records
            .into_iter()
            .take(limit)
            .map(|record| {
                let replay_id = state.replays.get(&record.original_id).map(|r| r.replay_id);
                DeadLetterView {
                    record: record.clone(),
                    already_replayed: replay_id.is_some(),
                    replay_id,
                }
            })
            .collect())
    }

    async fn top_reasons(&self, n: usize) -> Result<Vec<ReasonCount>, StoreError> {
        let state = self.state.lock().await;
        let mut counts: HashMap<DeadLetterReason, u64> = HashMap::new();
        for record in state.partitions.values().flatten() {
            *counts.entry(record.reason).or_default() += 1;
        }
        let mut top: Vec<ReasonCount> = counts
            .into_iter()
            .map(|(reason, count)| ReasonCount { reason, count })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then(a.reason.cmp(&b.reason)));
        top.truncate(n);
        Ok(top)
    }

    async fn replay(
        &self,
        original_id: WorkItemId,
        request: ReplayRequest,
    ) -> Result<ReplayOutcome, ReplayError> {
        let now = self.now();
        let mut state = self.state.lock().await;

        if let Some(existing) = state.replays.get(&original_id) {
            return Ok(ReplayOutcome {
                was_duplicate: true,
                replay_id: existing.replay_id,
            });
        }

        let (lane, new_item) = state
            .dead_letter_record(original_id)
            .map(|record| (record.lane, record.replay_item()))
            .ok_or(ReplayError::NotDeadLettered(original_id))?;
        let new_id = state.lane(lane).upsert(new_item, now);

        let replay_id = ReplayId::generate();
        state.replays.insert(
            original_id,
            ReplayRecord {
                original_id,
                replay_id,
                candidate_id: request.candidate_id,
                recovery_id: request.recovery_id,
                new_id,
                replayed_at: now,
                replayed_by: request.replayed_by,
            },
        );
        Ok(ReplayOutcome {
            was_duplicate: false,
            replay_id,
        })
    }

    async fn get_replay(
        &self,
        original_id: WorkItemId,
    ) -> Result<Option<ReplayRecord>, StoreError> {
        Ok(self.state.lock().await.replays.get(&original_id).cloned())
    }

    async fn drop_partitions_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PartitionKey>, StoreError> {
        let mut state = self.state.lock().await;
        let expired: Vec<PartitionKey> = state
            .partitions
            .keys()
            .copied()
            .filter(|key| key.is_entirely_before(cutoff))
            .collect();
        for key in &expired {
            if let Some(records) = state.partitions.remove(key) {
                for record in records {
                    state.archived.remove(&record.original_id);
                }
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone};

    use super::super::test_support::{new_item, store_at_noon};
    use super::*;
    use crate::domain::{Lane, WorkerId};
    use crate::ports::WorkQueue;

    async fn archived(store: &InMemoryStore, reason: DeadLetterReason, agg: &str) -> WorkItemId {
        let id = store.enqueue(new_item(agg)).await.unwrap();
        store.claim(&WorkerId::new("w1"), 1).await.unwrap();
        store.dead_letter(id, reason, format!("{reason}")).await.unwrap();
        id
    }

    #[tokio::test]
    async fn replay_is_idempotent_per_original_id() {
        let (store, _) = store_at_noon();
        let id = archived(&store, DeadLetterReason::PermanentFailure, "1").await;

        let mut flags = Vec::new();
        let mut replay_ids = Vec::new();
        for _ in 0..5 {
            let outcome = store.replay(id, ReplayRequest::by("ops@example.com")).await.unwrap();
            flags.push(outcome.was_duplicate);
            replay_ids.push(outcome.replay_id);
        }

        assert_eq!(flags, vec![false, true, true, true, true]);
        assert!(replay_ids.iter().all(|r| *r == replay_ids[0]));
        assert_eq!(store.counts().await.unwrap().pending, 1);

        let record = store.get_replay(id).await.unwrap().unwrap();
        assert_eq!(record.replay_id, replay_ids[0]);
        assert_eq!(record.replayed_by, "ops@example.com");
        let replayed = store.get(record.new_id).await.unwrap().unwrap();
        assert_eq!(replayed.payload, br#"{"ok":true}"#.to_vec());
        assert_eq!(replayed.retry_count, 0);
    }

    #[tokio::test]
    async fn replay_without_archive_row_fails_closed() {
        let (store, _) = store_at_noon();
        let live = store.enqueue(new_item("1")).await.unwrap();
        let err = store.replay(live, ReplayRequest::by("ops")).await.unwrap_err();
        assert!(matches!(err, ReplayError::NotDeadLettered(id) if id == live));
        assert_eq!(store.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn views_carry_replay_flag_and_filter() {
        let (store, clock) = store_at_noon();
        let a = archived(&store, DeadLetterReason::PermanentFailure, "1").await;
        clock.advance(ChronoDuration::seconds(1));
        let b = archived(&store, DeadLetterReason::GovernanceBlocked, "2").await;
        store.replay(a, ReplayRequest::by("ops")).await.unwrap();

        let all = store.list_dead_letters(&DeadLetterFilter::default(), 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].record.original_id, b);
        assert!(!all[0].already_replayed);
        assert!(all[1].already_replayed);
        assert!(all[1].replay_id.is_some());

        let blocked = DeadLetterFilter {
            reason: Some(DeadLetterReason::GovernanceBlocked),
            ..Default::default()
        };
        let only_b = store.list_dead_letters(&blocked, 10).await.unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].record.stream_key, "order:2");
    }

    #[tokio::test]
    async fn top_reasons_counts_descending() {
        let (store, _) = store_at_noon();
        for n in 0..3 {
            archived(&store, DeadLetterReason::PermanentFailure, &format!("p{n}")).await;
        }
        archived(&store, DeadLetterReason::UnknownEventType, "u").await;

        let top = store.top_reasons(1).await.unwrap();
        assert_eq!(
            top,
            vec![ReasonCount {
                reason: DeadLetterReason::PermanentFailure,
                count: 3
            }]
        );
    }

    #[tokio::test]
    async fn whole_partitions_are_dropped() {
        let (store, clock) = store_at_noon();
        let march = archived(&store, DeadLetterReason::PermanentFailure, "1").await;
        clock.set(Utc.with_ymd_and_hms(2026, 4, 2, 0, 0, 0).unwrap());
        let april = archived(&store, DeadLetterReason::PermanentFailure, "2").await;

        let cutoff = Utc.with_ymd_and_hms(2026, 4, 15, 0, 0, 0).unwrap();
        let dropped = store.drop_partitions_before(cutoff).await.unwrap();
        assert_eq!(dropped, vec![PartitionKey { year: 2026, month: 3 }]);
        assert!(store.get_dead_letter(march).await.unwrap().is_none());
        assert!(store.get_dead_letter(april).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn outbox_dead_letters_share_the_archive_and_replay_home() {
        let (jobs, _) = store_at_noon();
        let outbox = jobs.outbox_lane();
        let id = archived(&outbox, DeadLetterReason::UnknownEventType, "1").await;

        let record = jobs.get_dead_letter(id).await.unwrap().unwrap();
        assert_eq!(record.lane, Lane::Outbox);
        assert_eq!(jobs.top_reasons(10).await.unwrap()[0].count, 1);

        jobs.replay(id, ReplayRequest::by("ops")).await.unwrap();
        let new_id = jobs.get_replay(id).await.unwrap().unwrap().new_id;
        assert!(outbox.get(new_id).await.unwrap().is_some());
        assert!(jobs.get(new_id).await.unwrap().is_none());
        assert_eq!(jobs.counts().await.unwrap().unprocessed(), 0);
    }
}
