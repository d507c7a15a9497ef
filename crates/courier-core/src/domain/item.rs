//! Work item: the unit moved through the claim-based queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ids::{WorkItemId, WorkerId};

/// Derived lifecycle state of a work item.
///
/// State transitions:
/// - Pending -> Claimed -> Processed
/// - Pending -> Claimed -> Pending (retry_count + 1)
/// - Pending -> Claimed -> (archived to dead letter, row removed)
///
/// `Scheduled` is a pending item whose `next_retry_at` is still in the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Scheduled,
    Claimed,
    Processed,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Processed)
    }
}

/// Active table an item lives in. Both lanes share leases, idempotency keys
/// and the dead-letter archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Claimed by the worker runtime.
    #[default]
    Jobs,
    /// Claimed by the outbox dispatcher.
    Outbox,
}

impl Lane {
    pub fn as_code(self) -> &'static str {
        match self {
            Lane::Jobs => "jobs",
            Lane::Outbox => "outbox",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "jobs" => Some(Lane::Jobs),
            "outbox" => Some(Lane::Outbox),
            _ => None,
        }
    }
}

/// A row of the active work table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    /// Opaque bytes; typed handlers decode them with `PayloadCodec`.
    pub payload: Vec<u8>,
    pub priority: i32,
    pub dedup_key: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub reclaim_count: u32,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<WorkerId>,
    pub processed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl WorkItem {
    /// Materialize a new pending row.
    pub fn from_new(id: WorkItemId, new: NewWorkItem, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            aggregate_type: new.aggregate_type,
            aggregate_id: new.aggregate_id,
            event_type: new.event_type,
            payload: new.payload,
            priority: new.priority,
            dedup_key: new.dedup_key,
            retry_count: 0,
            max_retries: new.max_retries,
            reclaim_count: 0,
            created_at,
            claimed_at: None,
            claimed_by: None,
            processed_at: None,
            next_retry_at: None,
            error_message: None,
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> ItemState {
        if self.processed_at.is_some() {
            ItemState::Processed
        } else if self.claimed_at.is_some() {
            ItemState::Claimed
        } else if self.next_retry_at.is_some_and(|at| at > now) {
            ItemState::Scheduled
        } else {
            ItemState::Pending
        }
    }

    /// Claimable right now: unprocessed, unclaimed and past its backoff.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == ItemState::Pending
    }

    /// `"{aggregate_type}:{aggregate_id}"`, the ordering key of the item.
    pub fn stream_key(&self) -> String {
        format!("{}:{}", self.aggregate_type, self.aggregate_id)
    }

    /// Deterministic token a receiver uses to recognize a duplicate delivery.
    pub fn idempotency_token(&self) -> IdempotencyToken {
        IdempotencyToken::derive(
            self.id,
            &self.aggregate_type,
            &self.aggregate_id,
            &self.event_type,
        )
    }

    /// Would one more failure exhaust the retry budget?
    pub fn is_last_attempt(&self) -> bool {
        self.retry_count + 1 > self.max_retries
    }
}

/// Input to `enqueue` / outbox `append`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub priority: i32,
    pub dedup_key: Option<String>,
    pub max_retries: u32,
}

impl NewWorkItem {
    pub const DEFAULT_MAX_RETRIES: u32 = 5;

    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            priority: 0,
            dedup_key: None,
            max_retries: Self::DEFAULT_MAX_RETRIES,
        }
    }

    /// JSON-encode `value` as the payload.
    pub fn json<T: Serialize>(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(aggregate_type, aggregate_id, event_type, payload))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Hex SHA-256 of `id|aggregate_type|aggregate_id|event_type`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    pub fn derive(
        id: WorkItemId,
        aggregate_type: &str,
        aggregate_id: &str,
        event_type: &str,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(id.to_storage().as_bytes());
        for part in [aggregate_type, aggregate_id, event_type] {
            hasher.update(b"|");
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item() -> WorkItem {
        let new = NewWorkItem::new("order", "42", "order.shipped.v1", b"{}".to_vec());
        WorkItem::from_new(WorkItemId::generate(), new, Utc::now())
    }

    #[test]
    fn token_is_deterministic_and_field_sensitive() {
        let a = item();
        assert_eq!(a.idempotency_token(), a.idempotency_token());
        assert_eq!(a.idempotency_token().as_str().len(), 64);

        let mut b = a.clone();
        b.event_type = "order.cancelled.v1".to_string();
        assert_ne!(a.idempotency_token(), b.idempotency_token());
    }

    #[test]
    fn lane_codes_parse_back() {
        for lane in [Lane::Jobs, Lane::Outbox] {
            assert_eq!(Lane::from_code(lane.as_code()), Some(lane));
        }
        assert_eq!(Lane::from_code("dlq"), None);
        assert_eq!(Lane::default(), Lane::Jobs);
    }

    #[test]
    fn state_follows_timestamps() {
        let now = Utc::now();
        let mut it = item();
        assert_eq!(it.state(now), ItemState::Pending);

        it.next_retry_at = Some(now + Duration::seconds(10));
        assert_eq!(it.state(now), ItemState::Scheduled);
        assert!(!it.is_claimable(now));
        assert!(it.is_claimable(now + Duration::seconds(11)));

        it.claimed_at = Some(now);
        assert_eq!(it.state(now), ItemState::Claimed);

        it.processed_at = Some(now);
        assert!(it.state(now).is_terminal());
    }

    #[test]
    fn last_attempt_uses_post_increment_count() {
        let mut it = item();
        it.max_retries = 2;
        it.retry_count = 1;
        assert!(!it.is_last_attempt());
        it.retry_count = 2;
        assert!(it.is_last_attempt());
    }

    #[test]
    fn stream_key_joins_aggregate() {
        assert_eq!(item().stream_key(), "order:42");
    }
}
