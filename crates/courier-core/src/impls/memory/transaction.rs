//! MemoryTransaction - outbox 追加用の transaction
//!
//! Holds the store lock for its whole lifetime and works on a copy of the
//! state. `commit` swaps the copy in; dropping it discards every write.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use super::MemoryState;
use crate::domain::{Lane, NewWorkItem, StoreError, WorkItemId};
use crate::ports::{Clock, OutboxTransaction};

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    lane: Lane,
    clock: Arc<dyn Clock>,
}

impl MemoryTransaction {
    pub(super) fn new(
        guard: OwnedMutexGuard<MemoryState>,
        lane: Lane,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let working = (*guard).clone();
        Self {
            guard,
            working,
            lane,
            clock,
        }
    }

    pub fn commit(mut self) {
        *self.guard = std::mem::take(&mut self.working);
    }

    pub fn rollback(self) {}
}

#[async_trait]
impl OutboxTransaction for MemoryTransaction {
    async fn append(&mut self, item: NewWorkItem) -> Result<WorkItemId, StoreError> {
        let now = self.clock.now();
        Ok(self.working.lane(self.lane).upsert(item, now))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{new_item, store_at_noon};
    use super::*;
    use crate::ports::WorkQueue;

    #[tokio::test]
    async fn committed_appends_become_visible_together() {
        let (store, _) = store_at_noon();
        let mut tx = store.transaction().await;
        let a = tx.append(new_item("1")).await.unwrap();
        let b = tx.append(new_item("2")).await.unwrap();
        tx.commit();

        assert!(store.get(a).await.unwrap().is_some());
        assert!(store.get(b).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_rows() {
        let (store, _) = store_at_noon();
        {
            let mut tx = store.transaction().await;
            tx.append(new_item("1")).await.unwrap();
            tx.rollback();
        }
        assert_eq!(store.counts().await.unwrap().unprocessed(), 0);
    }

    #[tokio::test]
    async fn dedup_applies_inside_the_transaction() {
        let (store, _) = store_at_noon();
        let existing = store.enqueue(new_item("1").with_dedup_key("k")).await.unwrap();
        let mut tx = store.transaction().await;
        let appended = tx.append(new_item("1").with_dedup_key("k")).await.unwrap();
        tx.commit();
        assert_eq!(existing, appended);
    }
}
