//! LockManager port - 名前付き・TTL 付きの lease
//!
//! # 設計原則
//! - acquire は (holder, expiry) に対する単一の compare-and-swap
//!   （read-then-write の 2 段階にはしない）
//! - クラッシュした holder の lease は TTL で自然に失効する（能動的な排除はしない）
//! - フェイルオーバー中は最大 TTL の間、二重所有があり得る

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{Lease, StoreError, WorkerId};

#[async_trait]
pub trait LockManager: Send + Sync {
    /// `true` iff no live holder exists or `holder` already holds `name`.
    /// A successful call sets the expiry to now + `ttl`.
    async fn acquire(&self, name: &str, holder: &WorkerId, ttl: Duration)
    -> Result<bool, StoreError>;

    /// `true` only if `holder` currently owns a live lease on `name`.
    async fn extend(&self, name: &str, holder: &WorkerId, ttl: Duration)
    -> Result<bool, StoreError>;

    /// `true` if `holder` held `name` and it is now released.
    async fn release(&self, name: &str, holder: &WorkerId) -> Result<bool, StoreError>;

    /// The live lease on `name`, if any.
    async fn holder(&self, name: &str) -> Result<Option<Lease>, StoreError>;
}
