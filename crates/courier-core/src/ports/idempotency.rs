//! IdempotencyStore port - 試行前に作成し、リトライごとに参照する
//!
//! Keys are item idempotency tokens. An entry is `pending` while an attempt
//! runs, `complete` once its effect is applied, `failed` after a transient
//! fault (which lets the next attempt in).

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{IdempotencyCheck, IdempotencyEntry, StoreError};

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically take the key for a new attempt, or report why not.
    /// `in_flight_ttl` bounds how long a crashed attempt blocks the key.
    async fn begin(&self, key: &str, in_flight_ttl: Duration)
    -> Result<IdempotencyCheck, StoreError>;

    /// Record success; the entry is kept for `retain`.
    async fn mark_complete(
        &self,
        key: &str,
        result: Option<serde_json::Value>,
        retain: Duration,
    ) -> Result<(), StoreError>;

    async fn mark_failed(&self, key: &str, error: &str) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<IdempotencyEntry>, StoreError>;
}
