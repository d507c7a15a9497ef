//! Reaper - stale claim の回収
//!
//! A worker that dies mid-item leaves its claim behind. The reaper returns
//! every claim older than the threshold to the pending pool. The statement is
//! idempotent, so every process may run a reaper without a lease.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::worker_loop::pause;
use crate::config::CourierConfig;
use crate::domain::StoreError;
use crate::ports::WorkQueue;

pub struct Reaper {
    queue: Arc<dyn WorkQueue>,
    threshold: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(queue: Arc<dyn WorkQueue>, threshold: Duration, interval: Duration) -> Self {
        Self {
            queue,
            threshold,
            interval,
        }
    }

    pub fn from_config(queue: Arc<dyn WorkQueue>, config: &CourierConfig) -> Self {
        Self::new(queue, config.queue.stale_claim(), config.reaper.interval())
    }

    pub async fn reap_once(&self) -> Result<u64, StoreError> {
        let reclaimed = self.queue.reclaim_stale(self.threshold).await?;
        if reclaimed > 0 {
            warn!(reclaimed, threshold = ?self.threshold, "stale claims returned to pending");
        } else {
            debug!("no stale claims");
        }
        Ok(reclaimed)
    }

    /// Total reclaimed over the run.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        info!(threshold = ?self.threshold, interval = ?self.interval, "reaper started");
        let mut total = 0;
        while !cancel.is_cancelled() {
            match self.reap_once().await {
                Ok(n) => total += n,
                Err(err) => {
                    error!(error = %err, unavailable = err.is_unavailable(), "stale reclaim failed")
                }
            }
            pause(&cancel, self.interval).await;
        }
        info!(total, "reaper stopped");
        total
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::domain::WorkerId;
    use crate::impls::memory::test_support::{new_item, store_at_noon};

    #[tokio::test]
    async fn reclaims_only_claims_past_the_threshold() {
        let (store, clock) = store_at_noon();
        let reaper = Reaper::new(
            Arc::new(store.clone()),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        let w1 = WorkerId::new("w1");
        let old = store.enqueue(new_item("1")).await.unwrap();
        store.claim(&w1, 1).await.unwrap();

        clock.advance(ChronoDuration::seconds(45));
        store.enqueue(new_item("2")).await.unwrap();
        store.claim(&w1, 1).await.unwrap();
        assert_eq!(reaper.reap_once().await.unwrap(), 0);

        clock.advance(ChronoDuration::seconds(30));
        assert_eq!(reaper.reap_once().await.unwrap(), 1);
        let item = store.get(old).await.unwrap().unwrap();
        assert!(item.claimed_by.is_none());
        assert_eq!(item.reclaim_count, 1);
        assert_eq!(item.retry_count, 0);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (store, _clock) = store_at_noon();
        let reaper = Reaper::new(Arc::new(store), Duration::from_secs(60), Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(reaper.run(cancel).await, 0);
    }
}
