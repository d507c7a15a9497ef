//! GovernanceGate port - handler 実行前の capability check（kill-switch）

use async_trait::async_trait;

use crate::domain::WorkItem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny { reason: String },
}

/// The gate could not answer. The runtime fails closed and retries later.
#[derive(Debug, Clone, thiserror::Error)]
#[error("governance gate unavailable: {0}")]
pub struct GateError(pub String);

#[async_trait]
pub trait GovernanceGate: Send + Sync {
    async fn check(&self, item: &WorkItem) -> Result<GateDecision, GateError>;
}

/// Gate that allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl GovernanceGate for AllowAll {
    async fn check(&self, _item: &WorkItem) -> Result<GateDecision, GateError> {
        Ok(GateDecision::Allow)
    }
}
