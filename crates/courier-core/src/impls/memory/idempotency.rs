//! IdempotencyStore for the in-memory store.

use std::time::Duration;

use async_trait::async_trait;

use super::InMemoryStore;
use crate::domain::{IdempotencyCheck, IdempotencyEntry, IdempotencyStatus, StoreError};
use crate::ports::{IdempotencyStore, to_chrono};

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn begin(
        &self,
        key: &str,
        in_flight_ttl: Duration,
    ) -> Result<IdempotencyCheck, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        if let Some(entry) = state.idempotency.get(key) {
            let check = entry.check(now);
            if check != IdempotencyCheck::Fresh {
                return Ok(check);
            }
        }
        state.idempotency.insert(
            key.to_string(),
            IdempotencyEntry {
                key: key.to_string(),
                status: IdempotencyStatus::Pending,
                result: None,
                error: None,
                expires_at: now + to_chrono(in_flight_ttl),
            },
        );
        Ok(IdempotencyCheck::Fresh)
    }

    async fn mark_complete(
        &self,
        key: &str,
        result: Option<serde_json::Value>,
        retain: Duration,
    ) -> Result<(), StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        state.idempotency.insert(
            key.to_string(),
            IdempotencyEntry {
                key: key.to_string(),
                status: IdempotencyStatus::Complete,
                result,
                error: None,
                expires_at: now + to_chrono(retain),
            },
        );
        Ok(())
    }

    async fn mark_failed(&self, key: &str, error: &str) -> Result<(), StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let entry = state
            .idempotency
            .entry(key.to_string())
            .or_insert_with(|| IdempotencyEntry {
                key: key.to_string(),
                status: IdempotencyStatus::Failed,
                result: None,
                error: None,
                expires_at: now,
            });
        entry.status = IdempotencyStatus::Failed;
        entry.error = Some(error.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyEntry>, StoreError> {
        Ok(self.state.lock().await.idempotency.get(key).cloned())
    }
}
