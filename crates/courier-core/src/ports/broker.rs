//! FastPathBroker port - 低レイテンシの配送キュー（任意）
//!
//! Producers publish here first. On failure or known unavailability they fall
//! back to the durable work item (see `app::publisher`).

use async_trait::async_trait;

use crate::domain::NewWorkItem;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable")]
    Unavailable,

    #[error("publish failed: {0}")]
    PublishFailed(String),
}

#[async_trait]
pub trait FastPathBroker: Send + Sync {
    /// Cheap health hint; `false` skips the publish attempt entirely.
    fn is_available(&self) -> bool;

    async fn publish(&self, item: &NewWorkItem) -> Result<(), BrokerError>;
}
