//! OutboxTransaction port - producer の transaction に outbox 行を追加する
//!
//! The row becomes visible to the dispatcher only when the producer's own
//! transaction commits, so the state change and its effect succeed or fail
//! together.

use async_trait::async_trait;

use crate::domain::{NewWorkItem, StoreError, WorkItemId};

#[async_trait]
pub trait OutboxTransaction: Send {
    /// Stage `item` inside this transaction. Dedup rules of
    /// `WorkQueue::enqueue` apply.
    async fn append(&mut self, item: NewWorkItem) -> Result<WorkItemId, StoreError>;
}
