//! LockManager for the in-memory store.
//!
//! Each call is one check-and-set under the state lock, the in-memory
//! counterpart of the conditional upsert used by the PostgreSQL store.

use std::time::Duration;

use async_trait::async_trait;

use super::InMemoryStore;
use crate::domain::{Lease, StoreError, WorkerId};
use crate::ports::{LockManager, to_chrono};

#[async_trait]
impl LockManager for InMemoryStore {
    async fn acquire(
        &self,
        name: &str,
        holder: &WorkerId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let acquired_at = match state.leases.get(name) {
            Some(lease) if !lease.admits(holder, now) => return Ok(false),
            Some(lease) if lease.is_held_by(holder) && lease.is_live(now) => lease.acquired_at,
            _ => now,
        };
        state.leases.insert(
            name.to_string(),
            Lease {
                name: name.to_string(),
                holder_id: holder.clone(),
                acquired_at,
                expires_at: now + to_chrono(ttl),
            },
        );
        Ok(true)
    }

    async fn extend(
        &self,
        name: &str,
        holder: &WorkerId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        match state.leases.get_mut(name) {
            Some(lease) if lease.is_held_by(holder) && lease.is_live(now) => {
                lease.expires_at = now + to_chrono(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, holder: &WorkerId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.leases.get(name).is_some_and(|l| l.is_held_by(holder)) {
            state.leases.remove(name);
            return Ok(true);
        }
        Ok(false)
    }

    async fn holder(&self, name: &str) -> Result<Option<Lease>, StoreError> {
        let now = self.now();
        let state = self.state.lock().await;
        Ok(state.leases.get(name).filter(|l| l.is_live(now)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::super::test_support::store_at_noon;
    use super::*;

    const TTL: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn scenario_lease_expires_then_transfers() {
        let (store, clock) = store_at_noon();
        let (p1, p2) = (WorkerId::new("p1"), WorkerId::new("p2"));

        assert!(store.acquire("leader", &p1, TTL).await.unwrap());
        assert!(!store.acquire("leader", &p2, TTL).await.unwrap());

        clock.advance(ChronoDuration::seconds(6));
        assert!(store.acquire("leader", &p2, TTL).await.unwrap());
        assert_eq!(store.holder("leader").await.unwrap().unwrap().holder_id, p2);
    }

    #[tokio::test]
    async fn holder_can_reacquire_and_extend() {
        let (store, clock) = store_at_noon();
        let p1 = WorkerId::new("p1");
        assert!(store.acquire("dispatcher", &p1, TTL).await.unwrap());
        let first = store.holder("dispatcher").await.unwrap().unwrap();

        clock.advance(ChronoDuration::seconds(3));
        assert!(store.acquire("dispatcher", &p1, TTL).await.unwrap());
        assert!(store.extend("dispatcher", &p1, TTL).await.unwrap());
        let lease = store.holder("dispatcher").await.unwrap().unwrap();
        assert_eq!(lease.acquired_at, first.acquired_at);
        assert_eq!(lease.expires_at, first.expires_at + ChronoDuration::seconds(3));
    }

    #[tokio::test]
    async fn extend_fails_for_non_holder_or_after_expiry() {
        let (store, clock) = store_at_noon();
        let (p1, p2) = (WorkerId::new("p1"), WorkerId::new("p2"));
        store.acquire("sweep", &p1, TTL).await.unwrap();
        assert!(!store.extend("sweep", &p2, TTL).await.unwrap());

        clock.advance(ChronoDuration::seconds(5));
        assert!(!store.extend("sweep", &p1, TTL).await.unwrap());
        assert!(store.holder("sweep").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_only_by_holder() {
        let (store, _) = store_at_noon();
        let (p1, p2) = (WorkerId::new("p1"), WorkerId::new("p2"));
        store.acquire("leader", &p1, TTL).await.unwrap();
        assert!(!store.release("leader", &p2).await.unwrap());
        assert!(store.release("leader", &p1).await.unwrap());
        assert!(store.acquire("leader", &p2, TTL).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_has_one_winner() {
        for _ in 0..20 {
            let (store, _) = store_at_noon();
            let mut tasks = tokio::task::JoinSet::new();
            for n in 0..2 {
                let store = store.clone();
                tasks.spawn(async move {
                    store
                        .acquire("leader", &WorkerId::new(format!("p{n}")), TTL)
                        .await
                        .unwrap()
                });
            }
            let mut winners = 0;
            while let Some(won) = tasks.join_next().await {
                winners += usize::from(won.unwrap());
            }
            assert_eq!(winners, 1);
        }
    }
}
