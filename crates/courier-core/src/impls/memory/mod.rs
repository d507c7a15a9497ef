//! InMemoryStore - 開発用・テスト用の backing store
//!
//! # 実装詳細
//! - 全状態を 1 つの `tokio::sync::Mutex<MemoryState>` に置く
//!   （1 操作 = 1 回の lock = 1 つの atomic な文）
//! - 時刻はすべて注入された `Clock` から取る（store 側の時計）
//! - `transaction()` は state を lock したまま作業コピーを持つ transaction を返す
//!
//! # 使用例
//! ```ignore
//! let clock = Arc::new(ManualClock::starting_now());
//! let store = InMemoryStore::with_clock(clock.clone());
//! let id = store.enqueue(NewWorkItem::new("order", "42", "order.shipped.v1", payload)).await?;
//! ```

mod archive;
mod idempotency;
mod locks;
mod queue;
mod transaction;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    DeadLetterId, DeadLetterReason, DeadLetterRecord, IdempotencyEntry, Lane, Lease,
    NewWorkItem, PartitionKey, ReplayRecord, WorkItem, WorkItemId,
};
use crate::ports::{Clock, SystemClock};

pub use self::transaction::MemoryTransaction;

/// Active table of one lane.
#[derive(Debug, Clone, Default)]
pub(crate) struct LaneState {
    /// Pending, claimed and processed rows.
    items: HashMap<WorkItemId, WorkItem>,
    /// dedup_key -> id of the unprocessed row holding it.
    dedup: HashMap<String, WorkItemId>,
}

impl LaneState {
    /// Insert, or upsert onto the unprocessed row sharing the dedup key.
    fn upsert(&mut self, new: NewWorkItem, now: DateTime<Utc>) -> WorkItemId {
        if let Some(key) = new.dedup_key.as_deref()
            && let Some(existing_id) = self.dedup.get(key).copied()
            && let Some(existing) = self.items.get_mut(&existing_id)
            && existing.processed_at.is_none()
        {
            existing.priority = existing.priority.max(new.priority);
            existing.max_retries = new.max_retries;
            return existing_id;
        }

        let id = WorkItemId::generate();
        if let Some(key) = new.dedup_key.clone() {
            self.dedup.insert(key, id);
        }
        self.items.insert(id, WorkItem::from_new(id, new, now));
        id
    }

    /// Drop the dedup reservation held by `item`, if it still owns it.
    fn release_dedup(&mut self, item: &WorkItem) {
        if let Some(key) = item.dedup_key.as_deref()
            && self.dedup.get(key) == Some(&item.id)
        {
            self.dedup.remove(key);
        }
    }
}

/// Everything the store owns. Cloned wholesale by transactions.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryState {
    lanes: HashMap<Lane, LaneState>,
    leases: HashMap<String, Lease>,
    /// Archive of every lane, grouped by month.
    partitions: BTreeMap<PartitionKey, Vec<DeadLetterRecord>>,
    /// original_id -> partition holding its archive row.
    archived: HashMap<WorkItemId, PartitionKey>,
    replays: HashMap<WorkItemId, ReplayRecord>,
    idempotency: HashMap<String, IdempotencyEntry>,
}

impl MemoryState {
    fn lane(&mut self, lane: Lane) -> &mut LaneState {
        self.lanes.entry(lane).or_default()
    }

    fn lane_ref(&self, lane: Lane) -> Option<&LaneState> {
        self.lanes.get(&lane)
    }

    /// Move an active row of `lane` into the archive. `None` if the row is gone.
    fn archive(
        &mut self,
        lane: Lane,
        id: WorkItemId,
        reason: DeadLetterReason,
        message: String,
        now: DateTime<Utc>,
    ) -> Option<DeadLetterId> {
        let active = self.lanes.get_mut(&lane)?;
        let mut item = active.items.remove(&id)?;
        active.release_dedup(&item);
        item.error_message = Some(message.clone());

        let record = DeadLetterRecord::archive(&item, lane, reason, message, now);
        let dead_letter_id = record.dead_letter_id;
        let partition = record.partition();
        self.archived.insert(item.id, partition);
        self.partitions.entry(partition).or_default().push(record);
        Some(dead_letter_id)
    }

    fn dead_letter_record(&self, original_id: WorkItemId) -> Option<&DeadLetterRecord> {
        let partition = self.archived.get(&original_id)?;
        self.partitions
            .get(partition)?
            .iter()
            .find(|r| r.original_id == original_id)
    }
}

/// Cloneable handle; clones share one state.
///
/// A handle serves one lane. `outbox_lane()` gives a handle on the same
/// state whose queue operations use the outbox lane.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
    lane: Lane,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock,
            lane: Lane::Jobs,
        }
    }

    /// Same state, serving the outbox lane.
    pub fn outbox_lane(&self) -> Self {
        Self {
            lane: Lane::Outbox,
            ..self.clone()
        }
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Open a transaction on this handle's lane. Other operations on the
    /// store wait until it commits or is dropped.
    pub async fn transaction(&self) -> MemoryTransaction {
        let guard = self.state.clone().lock_owned().await;
        MemoryTransaction::new(guard, self.lane, self.clock.clone())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("lane", &self.lane)
            .finish_non_exhaustive()
    }
}
