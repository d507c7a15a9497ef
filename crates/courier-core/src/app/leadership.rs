//! LeaseKeeper - singleton role の lease を保持し続ける
//!
//! # フロー
//! 1. `acquire()` で 1 回だけ取得を試みる（取れなければ `None`、エラーではない）
//! 2. 背景タスクが `extend_every` ごとに延長する
//! 3. 延長が拒否されるか、最後の成功から TTL が過ぎたら `is_held()` が false になる
//! 4. `release()` で背景タスクを止めて lease を解放する
//!
//! Losing the lease is not an error: the caller checks `is_held()` before each
//! unit of lock-protected work and re-acquires on its next cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{StoreError, WorkerId};
use crate::ports::{Clock, LockManager, to_chrono};

pub struct LeaseKeeper {
    name: String,
    holder: WorkerId,
    locks: Arc<dyn LockManager>,
    held: Arc<AtomicBool>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LeaseKeeper {
    /// `Ok(None)` when another holder owns a live lease on `name`.
    ///
    /// Expiry after failed extensions is judged on `clock`, the same time
    /// source the caller's store uses.
    pub async fn acquire(
        locks: Arc<dyn LockManager>,
        clock: Arc<dyn Clock>,
        name: &str,
        holder: WorkerId,
        ttl: Duration,
        extend_every: Duration,
    ) -> Result<Option<Self>, StoreError> {
        if !locks.acquire(name, &holder, ttl).await? {
            debug!(lease = name, holder = %holder, "lease held elsewhere");
            return Ok(None);
        }
        info!(lease = name, holder = %holder, "leadership acquired");

        let held = Arc::new(AtomicBool::new(true));
        let stop = CancellationToken::new();
        let task = tokio::spawn(keep_alive(
            locks.clone(),
            clock,
            name.to_string(),
            holder.clone(),
            ttl,
            extend_every,
            held.clone(),
            stop.clone(),
        ));

        Ok(Some(Self {
            name: name.to_string(),
            holder,
            locks,
            held,
            stop,
            task: Some(task),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Stop extending and give the lease up. `true` if it was still ours.
    pub async fn release(mut self) -> Result<bool, StoreError> {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let released = self.locks.release(&self.name, &self.holder).await?;
        info!(lease = %self.name, holder = %self.holder, released, "leadership released");
        Ok(released)
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn keep_alive(
    locks: Arc<dyn LockManager>,
    clock: Arc<dyn Clock>,
    name: String,
    holder: WorkerId,
    ttl: Duration,
    extend_every: Duration,
    held: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    let ttl_span = to_chrono(ttl);
    let mut last_ok = clock.now();
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(extend_every) => {}
        }

        match locks.extend(&name, &holder, ttl).await {
            Ok(true) => {
                last_ok = clock.now();
                debug!(lease = %name, "lease extended");
            }
            Ok(false) => {
                warn!(lease = %name, holder = %holder, "lease lost to another holder");
                held.store(false, Ordering::Release);
                return;
            }
            Err(error) => {
                warn!(lease = %name, %error, "lease extension failed");
                if clock.now() - last_ok >= ttl_span {
                    warn!(lease = %name, "lease expired while the store was unreachable");
                    held.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::domain::Lease;
    use crate::impls::memory::test_support::store_at_noon;
    use crate::ports::ManualClock;

    /// Grants the lease, then cannot reach the store to extend it.
    struct UnreachableAfterAcquire;

    #[async_trait]
    impl LockManager for UnreachableAfterAcquire {
        async fn acquire(&self, _: &str, _: &WorkerId, _: Duration) -> Result<bool, StoreError> {
            Ok(true)
        }

        async fn extend(&self, _: &str, _: &WorkerId, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn release(&self, _: &str, _: &WorkerId) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn holder(&self, _: &str) -> Result<Option<Lease>, StoreError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn second_keeper_is_refused_while_first_holds() {
        let (store, clock) = store_at_noon();
        let locks: Arc<dyn LockManager> = Arc::new(store);

        let first = LeaseKeeper::acquire(
            locks.clone(),
            clock.clone(),
            "dispatcher",
            WorkerId::new("p1"),
            Duration::from_secs(30),
            Duration::from_secs(10),
        )
        .await
        .unwrap()
        .expect("first acquires");
        assert!(first.is_held());

        let second = LeaseKeeper::acquire(
            locks.clone(),
            clock.clone(),
            "dispatcher",
            WorkerId::new("p2"),
            Duration::from_secs(30),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(second.is_none());

        assert!(first.release().await.unwrap());
        assert!(locks.holder("dispatcher").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keeper_notices_a_takeover() {
        let (store, clock) = store_at_noon();
        let locks: Arc<dyn LockManager> = Arc::new(store);

        let keeper = LeaseKeeper::acquire(
            locks.clone(),
            clock.clone(),
            "sweep",
            WorkerId::new("p1"),
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await
        .unwrap()
        .unwrap();

        // Let the lease expire on the store clock and hand it to p2.
        clock.advance(ChronoDuration::seconds(6));
        assert!(
            locks
                .acquire("sweep", &WorkerId::new("p2"), Duration::from_secs(60))
                .await
                .unwrap()
        );

        for _ in 0..50 {
            if !keeper.is_held() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!keeper.is_held());
        assert!(!keeper.release().await.unwrap());
    }

    #[tokio::test]
    async fn unreachable_store_drops_the_lease_after_ttl_on_the_clock() {
        let clock = Arc::new(ManualClock::starting_now());
        let keeper = LeaseKeeper::acquire(
            Arc::new(UnreachableAfterAcquire),
            clock.clone(),
            "dispatcher",
            WorkerId::new("p1"),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
        .unwrap()
        .unwrap();

        // Failed extensions alone do not drop the lease while the clock stands still.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(keeper.is_held());

        clock.advance(ChronoDuration::seconds(5));
        for _ in 0..50 {
            if !keeper.is_held() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!keeper.is_held());
    }
}
