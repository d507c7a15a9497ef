//! RetentionSweep - 古い processed 行と dead-letter partition の削除
//!
//! # フロー
//! 1. retention lease を取る（fleet 全体で同時に 1 つだけ）
//! 2. lane ごとに processed 行を batch 単位で削除（batch 数に上限あり）
//! 3. 保持期間を過ぎた dead-letter partition を丸ごと DROP
//! 4. 件数を RetentionReport として返しログに出す

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::leadership::LeaseKeeper;
use super::worker_loop::pause;
use crate::config::RetentionConfig;
use crate::domain::{PartitionKey, StoreError, WorkerId};
use crate::ports::{Clock, DeadLetterStore, LockManager, SystemClock, WorkQueue, to_chrono};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Another process held the retention lease; nothing was touched.
    pub skipped: bool,
    pub processed_deleted: u64,
    pub batches: usize,
    pub partitions_dropped: Vec<PartitionKey>,
}

pub struct RetentionSweep {
    worker_id: WorkerId,
    locks: Arc<dyn LockManager>,
    lanes: Vec<Arc<dyn WorkQueue>>,
    archive: Arc<dyn DeadLetterStore>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
}

impl RetentionSweep {
    pub fn new(
        worker_id: WorkerId,
        locks: Arc<dyn LockManager>,
        archive: Arc<dyn DeadLetterStore>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            worker_id,
            locks,
            lanes: Vec::new(),
            archive,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Purge processed rows of `queue` too.
    pub fn lane(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.lanes.push(queue);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn run_once(&self) -> Result<RetentionReport, StoreError> {
        let Some(keeper) = LeaseKeeper::acquire(
            self.locks.clone(),
            self.clock.clone(),
            &self.config.lease_name,
            self.worker_id.clone(),
            self.config.lease_ttl(),
            self.config.lease_extend_every(),
        )
        .await?
        else {
            return Ok(RetentionReport {
                skipped: true,
                ..Default::default()
            });
        };

        let result = self.sweep(&keeper).await;
        if let Err(err) = keeper.release().await {
            warn!(error = %err, "retention lease release failed");
        }
        let report = result?;
        info!(
            processed_deleted = report.processed_deleted,
            batches = report.batches,
            partitions_dropped = report.partitions_dropped.len(),
            "retention sweep finished"
        );
        Ok(report)
    }

    async fn sweep(&self, keeper: &LeaseKeeper) -> Result<RetentionReport, StoreError> {
        let mut report = RetentionReport::default();
        let batch_size = self.config.batch_size as u64;

        'lanes: for lane in &self.lanes {
            for _ in 0..self.config.max_batches {
                if !keeper.is_held() {
                    warn!(lease = keeper.name(), "retention lease lost, stopping early");
                    break 'lanes;
                }
                let deleted = lane
                    .purge_processed(self.config.processed_retention(), self.config.batch_size)
                    .await?;
                report.batches += 1;
                report.processed_deleted += deleted;
                if deleted < batch_size {
                    break;
                }
            }
        }

        if keeper.is_held() {
            let cutoff = self.clock.now() - to_chrono(self.config.dead_letter_retention());
            report.partitions_dropped = self.archive.drop_partitions_before(cutoff).await?;
        }
        Ok(report)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.config.interval(), "retention sweep scheduled");
        while !cancel.is_cancelled() {
            if let Err(err) = self.run_once().await {
                error!(error = %err, unavailable = err.is_unavailable(), "retention sweep failed");
            }
            pause(&cancel, self.config.interval()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::domain::DeadLetterReason;
    use crate::impls::InMemoryStore;
    use crate::impls::memory::test_support::{new_item, store_at_noon};
    use crate::ports::ManualClock;

    fn sweep(store: &InMemoryStore, clock: &Arc<ManualClock>, config: RetentionConfig) -> RetentionSweep {
        RetentionSweep::new(
            WorkerId::new("sweeper"),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            config,
        )
        .lane(Arc::new(store.clone()))
        .with_clock(clock.clone())
    }

    async fn process(store: &InMemoryStore, n: usize) {
        let w = WorkerId::new("w");
        for i in 0..n {
            store.enqueue(new_item(&i.to_string())).await.unwrap();
        }
        for item in store.claim(&w, n).await.unwrap() {
            store.mark_processed(item.id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn purges_old_processed_rows_in_bounded_batches() {
        let (store, clock) = store_at_noon();
        process(&store, 5).await;
        clock.advance(ChronoDuration::hours(73));
        store.enqueue(new_item("fresh")).await.unwrap();

        let config = RetentionConfig {
            batch_size: 2,
            max_batches: 2,
            ..RetentionConfig::default()
        };
        let report = sweep(&store, &clock, config).run_once().await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.processed_deleted, 4);
        assert_eq!(report.batches, 2);
        assert_eq!(store.counts().await.unwrap().processed, 1);
        assert_eq!(store.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn drops_expired_dead_letter_partitions() {
        let (store, clock) = store_at_noon();
        let w = WorkerId::new("w");
        let id = store.enqueue(new_item("1")).await.unwrap();
        store.claim(&w, 1).await.unwrap();
        store
            .dead_letter(id, DeadLetterReason::PermanentFailure, "bad".into())
            .await
            .unwrap();

        clock.advance(ChronoDuration::days(150));
        let report = sweep(&store, &clock, RetentionConfig::default())
            .run_once()
            .await
            .unwrap();
        assert_eq!(report.partitions_dropped.len(), 1);
        assert!(store.get_dead_letter(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn skips_while_another_process_sweeps() {
        let (store, clock) = store_at_noon();
        store
            .acquire("retention-sweep", &WorkerId::new("other"), Duration::from_secs(300))
            .await
            .unwrap();
        process(&store, 1).await;
        clock.advance(ChronoDuration::hours(100));
        store
            .acquire("retention-sweep", &WorkerId::new("other"), Duration::from_secs(300))
            .await
            .unwrap();

        let report = sweep(&store, &clock, RetentionConfig::default())
            .run_once()
            .await
            .unwrap();
        assert!(report.skipped);
        assert_eq!(store.counts().await.unwrap().processed, 1);
    }
}
