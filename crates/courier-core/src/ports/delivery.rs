//! DeliveryStrategy port - outbox item を外部へ届ける方法（HTTP, webhook, 通知）

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::domain::{IdempotencyToken, WorkItem, WorkItemId};

/// Header carrying the idempotency token on outbound calls.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
/// Header carrying the work item id on outbound calls.
pub const EVENT_ID_HEADER: &str = "X-Event-Id";

/// Everything a strategy needs to perform one delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRequest {
    pub event_id: WorkItemId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub idempotency_token: IdempotencyToken,
    pub attempt: u32,
    pub payload: Vec<u8>,
}

impl DeliveryRequest {
    pub fn for_item(item: &WorkItem) -> Self {
        Self {
            event_id: item.id,
            event_type: item.event_type.clone(),
            aggregate_type: item.aggregate_type.clone(),
            aggregate_id: item.aggregate_id.clone(),
            idempotency_token: item.idempotency_token(),
            attempt: item.retry_count + 1,
            payload: item.payload.clone(),
        }
    }

    /// The headers every outbound call must carry.
    pub fn headers(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            (IDEMPOTENCY_KEY_HEADER, self.idempotency_token.to_string()),
            (EVENT_ID_HEADER, self.event_id.to_storage()),
        ])
    }
}

/// Classified result of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx.
    Delivered,
    /// 409 / 422: the receiver already applied this token.
    AlreadyApplied,
    /// Timeout, transport error, 408, 429, 5xx.
    Transient(String),
    /// Other 4xx, malformed request, unroutable.
    Permanent(String),
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered | DeliveryOutcome::AlreadyApplied)
    }

    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => DeliveryOutcome::Delivered,
            409 | 422 => DeliveryOutcome::AlreadyApplied,
            408 | 429 | 500..=599 => DeliveryOutcome::Transient(format!("status {status}")),
            _ => DeliveryOutcome::Permanent(format!("status {status}")),
        }
    }
}

/// Fault raised inside a strategy before a response status exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

impl From<DeliveryError> for DeliveryOutcome {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Timeout | DeliveryError::Transport(_) => {
                DeliveryOutcome::Transient(err.to_string())
            }
            DeliveryError::InvalidRequest(_) | DeliveryError::UnknownChannel(_) => {
                DeliveryOutcome::Permanent(err.to_string())
            }
        }
    }
}

#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    /// Never returns an error: faults are folded into `DeliveryOutcome`.
    async fn deliver(&self, request: &DeliveryRequest) -> DeliveryOutcome;
}
